use super::*;

#[test]
fn test_lostcalc_first_packet_is_clean() {
    let mut lc = LostCalc::new();
    assert_eq!(lc.update(100), 0);
    assert_eq!(lc.total_lost, 0);
}

#[test]
fn test_lostcalc_in_order_and_gap() {
    let mut lc = LostCalc::new();
    lc.update(100);
    assert_eq!(lc.update(101), 0);
    // 102..104 went missing
    assert_eq!(lc.update(105), 3);
    assert_eq!(lc.total_lost, 3);
}

#[test]
fn test_lostcalc_duplicate() {
    let mut lc = LostCalc::new();
    lc.update(100);
    assert_eq!(lc.update(100), -1);
}

#[test]
fn test_lostcalc_reorder_boundary() {
    // delta of exactly 0xff9c (i.e. 100 packets backwards) is a
    // reorder, not a 65435-packet loss
    let mut lc = LostCalc::new();
    lc.update(1000);
    assert_eq!(lc.update(1000u16.wrapping_add(0xff9c)), -2);
    assert_eq!(lc.total_lost, 0);

    // just below the boundary counts as an old-but-harmless packet
    let mut lc = LostCalc::new();
    lc.update(1000);
    assert_eq!(lc.update(1000u16.wrapping_add(0xff9b)), 0);
}

#[test]
fn test_lostcalc_wrap_around() {
    let mut lc = LostCalc::new();
    lc.update(65534);
    assert_eq!(lc.update(65535), 0);
    assert_eq!(lc.update(0), 0);
    assert_eq!(lc.update(2), 1); // seq 1 lost across the wrap
}

#[test]
fn test_sender_report_roundtrip() {
    let sr = SenderReport {
        ssrc: 0x1234,
        ntp: 0xdead_beef_cafe_f00d,
        rtp_time: 160,
        packet_count: 42,
        octet_count: 4200,
        reports: vec![ReportBlock {
            ssrc: 0x5678,
            fraction_lost: 12,
            total_lost: 3,
            highest_seq: 1000,
            jitter: 5,
            lsr: 7,
            dlsr: 9,
        }],
    };

    let raw = sr.marshal();
    assert_eq!(raw[1], RTCP_SR);
    let parsed = SenderReport::parse(&raw).unwrap();
    assert_eq!(parsed, sr);
}

#[test]
fn test_receiver_report_roundtrip() {
    let rr = ReceiverReport {
        ssrc: 7,
        reports: vec![],
    };
    let parsed = ReceiverReport::parse(&rr.marshal()).unwrap();
    assert_eq!(parsed, rr);
}

#[test]
fn test_remb_parse() {
    // REMB: mantissa 0x3_0000 (196608) << exponent 1 = 393216 bps
    let mut pkt = vec![0x8f, RTCP_PSFB, 0x00, 0x05];
    pkt.extend_from_slice(&[0, 0, 0, 1]); // sender ssrc
    pkt.extend_from_slice(&[0, 0, 0, 0]); // media ssrc
    pkt.extend_from_slice(b"REMB");
    pkt.push(1); // one ssrc entry
    pkt.push(0x07); // exponent 1, mantissa high bits 0b11
    pkt.push(0x00);
    pkt.push(0x00);
    pkt.extend_from_slice(&[0, 0, 0, 9]);

    let rate = parse_remb(&pkt).unwrap();
    assert_eq!(rate, (0x3_0000u64) << 1);

    // wrong magic word yields nothing
    let mut bad = pkt.clone();
    bad[12] = b'X';
    assert!(parse_remb(&bad).is_none());
}

#[test]
fn test_stats_averages() {
    let mut stats = RtpStats::new();
    stats.note_rtt(10);
    stats.note_rtt(30);
    assert_eq!(stats.avg_rtt_ms(), 20);
    assert_eq!(stats.max_rtt_ms, 30);

    stats.note_loss_up(10);
    stats.note_loss_up(20);
    stats.note_loss_down(4);
    assert_eq!(stats.avg_loss_up(), 15);
    assert_eq!(stats.avg_loss_down(), 4);
}
