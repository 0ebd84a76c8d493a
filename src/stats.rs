use serde_json::{json, Map, Value};

use econn::{EconnDir, PROTO_VERSION};
use mediaflow::MediaflowStats;

use crate::VERSION;

/// CallTimeline collects the coarse call timestamps the metrics
/// report; all values are set by the orchestrator as events land.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallTimeline {
    pub answered: bool,
    pub estab_time_ms: Option<u64>,
    pub audio_setup_time_ms: Option<u64>,
    pub media_time_ms: Option<u64>,
}

fn round_to(v: u64, step: u64) -> u64 {
    ((v + step / 2) / step) * step
}

/// prepare renders the close-metrics JSON handed to the close
/// handler together with the error code.
pub fn prepare(
    dir: EconnDir,
    timeline: &CallTimeline,
    mf: Option<&MediaflowStats>,
    has_video: bool,
    err_code: i32,
) -> String {
    let mut obj = Map::new();

    obj.insert("version".to_owned(), json!(VERSION));
    obj.insert("protocol-version".to_owned(), json!(PROTO_VERSION));
    obj.insert("direction".to_owned(), json!(dir.to_string()));
    obj.insert("answered".to_owned(), json!(timeline.answered));

    obj.insert(
        "estab_time_ms".to_owned(),
        json!(timeline.estab_time_ms.map(|v| round_to(v, 10)).unwrap_or(0)),
    );
    obj.insert(
        "audio_setup_time_ms".to_owned(),
        json!(timeline
            .audio_setup_time_ms
            .map(|v| round_to(v, 10))
            .unwrap_or(0)),
    );
    obj.insert(
        "media_time_s".to_owned(),
        json!(timeline.media_time_ms.map(|v| v / 1000).unwrap_or(0)),
    );

    let (dtls, ice) = mf
        .map(|s| (s.crypto_ready, s.ice_ready))
        .unwrap_or((false, false));
    obj.insert("dtls".to_owned(), json!(dtls));
    obj.insert("ice".to_owned(), json!(ice));
    obj.insert("video".to_owned(), json!(has_video));

    if let Some(mf) = mf {
        obj.insert("crypto".to_owned(), json!(mf.crypto_name));
        obj.insert("local_cand".to_owned(), json!(mf.local_cand));
        obj.insert("remote_cand".to_owned(), json!(mf.remote_cand));

        obj.insert("avg_rtt".to_owned(), json!(round_to(mf.avg_rtt_ms, 10)));
        obj.insert("max_rtt".to_owned(), json!(round_to(mf.max_rtt_ms, 10)));
        obj.insert("avg_loss_d".to_owned(), json!(mf.avg_loss_down));
        obj.insert("avg_loss_u".to_owned(), json!(mf.avg_loss_up));

        obj.insert("packets_sent".to_owned(), json!(mf.packets_sent));
        obj.insert("packets_recv".to_owned(), json!(mf.packets_recv));
        obj.insert("bytes_sent".to_owned(), json!(mf.bytes_sent));
        obj.insert("bytes_recv".to_owned(), json!(mf.bytes_recv));

        obj.insert("srtp_errors".to_owned(), json!(mf.srtp_errors));
        if let Some(t) = mf.nat_estab_ms {
            obj.insert("nat_estab".to_owned(), json!(round_to(t, 10)));
        }
        if let Some(t) = mf.dtls_estab_ms {
            obj.insert("dtls_estab".to_owned(), json!(round_to(t, 10)));
        }
    }

    obj.insert("ecall_error".to_owned(), json!(err_code));

    Value::Object(obj).to_string()
}

#[cfg(test)]
mod stats_test {
    use super::*;

    #[test]
    fn test_minimal_metrics_shape() {
        let json_str = prepare(EconnDir::Outgoing, &CallTimeline::default(), None, false, 0);
        let v: Value = serde_json::from_str(&json_str).unwrap();

        assert_eq!(v["protocol-version"], "3.0");
        assert_eq!(v["direction"], "Outgoing");
        assert_eq!(v["answered"], false);
        assert_eq!(v["ecall_error"], 0);
        assert_eq!(v["dtls"], false);
    }

    #[test]
    fn test_full_metrics_carry_transport_fields() {
        let mf = MediaflowStats {
            ice_ready: true,
            crypto_ready: true,
            crypto_name: "AES_CM_128_HMAC_SHA1_80".to_owned(),
            local_cand: "host".to_owned(),
            remote_cand: "relay".to_owned(),
            packets_sent: 10,
            packets_recv: 12,
            bytes_sent: 1000,
            bytes_recv: 1200,
            avg_rtt_ms: 23,
            max_rtt_ms: 101,
            avg_loss_up: 1,
            avg_loss_down: 2,
            srtp_errors: 0,
            srtp_dropped: 0,
            turn_alloc_ms: None,
            nat_estab_ms: Some(88),
            dtls_estab_ms: Some(140),
        };

        let timeline = CallTimeline {
            answered: true,
            estab_time_ms: Some(233),
            audio_setup_time_ms: Some(295),
            media_time_ms: Some(65_000),
        };

        let json_str = prepare(EconnDir::Incoming, &timeline, Some(&mf), true, 110);
        let v: Value = serde_json::from_str(&json_str).unwrap();

        assert_eq!(v["answered"], true);
        assert_eq!(v["estab_time_ms"], 230);
        assert_eq!(v["audio_setup_time_ms"], 300);
        assert_eq!(v["media_time_s"], 65);
        assert_eq!(v["crypto"], "AES_CM_128_HMAC_SHA1_80");
        assert_eq!(v["local_cand"], "host");
        assert_eq!(v["remote_cand"], "relay");
        assert_eq!(v["avg_rtt"], 20);
        assert_eq!(v["max_rtt"], 100);
        assert_eq!(v["video"], true);
        assert_eq!(v["ecall_error"], 110);
    }
}
