#[cfg(test)]
mod rtp_stats_test;

use byteorder::{BigEndian, ByteOrder};

/// RTCP packet types this stack emits and reads.
pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_PSFB: u8 = 206;

const NO_SEQ: u32 = u32::MAX;

/// lostcalc classifies a sequence-number step. Returns the number of
/// packets lost since the previous one, -1 for a duplicate, -2 for a
/// reorder. A delta at or above 0xff9c means the packet is old and
/// reordered, never a 65k-packet loss.
pub struct LostCalc {
    pseq: u32,
    pub total_lost: u64,
}

impl Default for LostCalc {
    fn default() -> Self {
        LostCalc {
            pseq: NO_SEQ,
            total_lost: 0,
        }
    }
}

impl LostCalc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, seq: u16) -> i32 {
        let delta = seq.wrapping_sub(self.pseq as u16);

        let lost = if self.pseq == NO_SEQ {
            0
        } else if delta == 0 {
            return -1;
        } else if delta < 3000 {
            (delta - 1) as i32
        } else if delta < 0xff9c {
            0
        } else {
            return -2;
        };

        self.pseq = seq as u32;
        if lost > 0 {
            self.total_lost += lost as u64;
        }
        lost
    }
}

/// DirectionStats counts one direction of media.
#[derive(Default, Debug, Clone, Copy)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
}

/// RtpStats is the per-flow statistics block feeding the close
/// metrics: counters, loss estimation and round-trip times learned
/// from RTCP.
#[derive(Default)]
pub struct RtpStats {
    pub tx: DirectionStats,
    pub rx: DirectionStats,
    pub lost: LostCalc,
    rtt_sum_ms: u64,
    rtt_count: u64,
    pub max_rtt_ms: u64,
    loss_d_sum: u64,
    loss_d_count: u64,
    loss_u_sum: u64,
    loss_u_count: u64,
    pub bitrate_limit: Option<u64>,
}

impl RtpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_sent(&mut self, bytes: usize) {
        self.tx.packets += 1;
        self.tx.bytes += bytes as u64;
    }

    pub fn note_received(&mut self, bytes: usize, seq: u16) -> i32 {
        self.rx.packets += 1;
        self.rx.bytes += bytes as u64;
        self.lost.update(seq)
    }

    pub fn note_rtt(&mut self, rtt_ms: u64) {
        self.rtt_sum_ms += rtt_ms;
        self.rtt_count += 1;
        self.max_rtt_ms = self.max_rtt_ms.max(rtt_ms);
    }

    pub fn avg_rtt_ms(&self) -> u64 {
        if self.rtt_count == 0 {
            0
        } else {
            self.rtt_sum_ms / self.rtt_count
        }
    }

    /// fraction-lost observations from received report blocks (what
    /// the peer saw of our sending: uplink) and our own reports
    /// (downlink).
    pub fn note_loss_up(&mut self, fraction: u8) {
        self.loss_u_sum += fraction as u64;
        self.loss_u_count += 1;
    }

    pub fn note_loss_down(&mut self, fraction: u8) {
        self.loss_d_sum += fraction as u64;
        self.loss_d_count += 1;
    }

    pub fn avg_loss_up(&self) -> u64 {
        if self.loss_u_count == 0 {
            0
        } else {
            self.loss_u_sum / self.loss_u_count
        }
    }

    pub fn avg_loss_down(&self) -> u64 {
        if self.loss_d_count == 0 {
            0
        } else {
            self.loss_d_sum / self.loss_d_count
        }
    }
}

/// ReportBlock is one RTCP reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub total_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

impl ReportBlock {
    fn marshal_into(&self, out: &mut Vec<u8>) {
        let mut block = [0u8; 24];
        BigEndian::write_u32(&mut block[0..4], self.ssrc);
        block[4] = self.fraction_lost;
        block[5..8].copy_from_slice(&self.total_lost.to_be_bytes()[1..]);
        BigEndian::write_u32(&mut block[8..12], self.highest_seq);
        BigEndian::write_u32(&mut block[12..16], self.jitter);
        BigEndian::write_u32(&mut block[16..20], self.lsr);
        BigEndian::write_u32(&mut block[20..24], self.dlsr);
        out.extend_from_slice(&block);
    }

    fn parse(b: &[u8]) -> Option<ReportBlock> {
        if b.len() < 24 {
            return None;
        }
        Some(ReportBlock {
            ssrc: BigEndian::read_u32(&b[0..4]),
            fraction_lost: b[4],
            total_lost: BigEndian::read_u32(&[0, b[5], b[6], b[7]]),
            highest_seq: BigEndian::read_u32(&b[8..12]),
            jitter: BigEndian::read_u32(&b[12..16]),
            lsr: BigEndian::read_u32(&b[16..20]),
            dlsr: BigEndian::read_u32(&b[20..24]),
        })
    }
}

/// SenderReport is a compact RTCP SR with optional report blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        out.push(0x80 | (self.reports.len() as u8 & 0x1f));
        out.push(RTCP_SR);
        // length in 32-bit words minus one, header included
        let words = (24 + self.reports.len() * 24) / 4;
        out.extend_from_slice(&(words as u16).to_be_bytes());

        let mut body = [0u8; 24];
        BigEndian::write_u32(&mut body[0..4], self.ssrc);
        BigEndian::write_u64(&mut body[4..12], self.ntp);
        BigEndian::write_u32(&mut body[12..16], self.rtp_time);
        BigEndian::write_u32(&mut body[16..20], self.packet_count);
        BigEndian::write_u32(&mut body[20..24], self.octet_count);
        out.extend_from_slice(&body);

        for report in &self.reports {
            report.marshal_into(&mut out);
        }
        out
    }

    pub fn parse(b: &[u8]) -> Option<SenderReport> {
        if b.len() < 28 || b[1] != RTCP_SR {
            return None;
        }
        let count = (b[0] & 0x1f) as usize;
        let mut reports = vec![];
        for i in 0..count {
            reports.push(ReportBlock::parse(&b[28 + i * 24..])?);
        }
        Some(SenderReport {
            ssrc: BigEndian::read_u32(&b[4..8]),
            ntp: BigEndian::read_u64(&b[8..16]),
            rtp_time: BigEndian::read_u32(&b[16..20]),
            packet_count: BigEndian::read_u32(&b[20..24]),
            octet_count: BigEndian::read_u32(&b[24..28]),
            reports,
        })
    }
}

/// ReceiverReport is a compact RTCP RR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        out.push(0x80 | (self.reports.len() as u8 & 0x1f));
        out.push(RTCP_RR);
        let words = (4 + self.reports.len() * 24) / 4;
        out.extend_from_slice(&(words as u16).to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());

        for report in &self.reports {
            report.marshal_into(&mut out);
        }
        out
    }

    pub fn parse(b: &[u8]) -> Option<ReceiverReport> {
        if b.len() < 8 || b[1] != RTCP_RR {
            return None;
        }
        let count = (b[0] & 0x1f) as usize;
        let mut reports = vec![];
        for i in 0..count {
            reports.push(ReportBlock::parse(&b[8 + i * 24..])?);
        }
        Some(ReceiverReport {
            ssrc: BigEndian::read_u32(&b[4..8]),
            reports,
        })
    }
}

/// parse_remb extracts the bitrate from a REMB payload-specific
/// feedback packet (draft-alvestrand-rmcat-remb), used to cap the
/// video encoder.
pub fn parse_remb(b: &[u8]) -> Option<u64> {
    // PSFB, fmt 15, "REMB" magic at offset 12
    if b.len() < 20 || b[1] != RTCP_PSFB || (b[0] & 0x1f) != 15 {
        return None;
    }
    if &b[12..16] != b"REMB" {
        return None;
    }

    let exponent = (b[17] >> 2) as u32;
    let mantissa = (((b[17] & 0x03) as u64) << 16)
        | ((b[18] as u64) << 8)
        | b[19] as u64;
    Some(mantissa << exponent)
}
