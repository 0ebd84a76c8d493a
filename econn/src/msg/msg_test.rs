use super::*;

fn roundtrip(msg: &EconnMessage) -> EconnMessage {
    let raw = encode(msg).unwrap();
    decode(&raw, 0, 0).unwrap()
}

#[test]
fn test_setup_roundtrip() {
    let mut props = Properties::new();
    props.add("videosend", "false");
    props.add("audiocbr", "true");

    let mut msg = EconnMessage::new(
        "sess1",
        MsgContent::Setup {
            sdp: "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n".to_owned(),
            props: Some(props),
        },
    );
    msg.src_userid = "alice".to_owned();
    msg.src_clientid = "client-a".to_owned();
    msg.dest_userid = "bob".to_owned();

    let decoded = roundtrip(&msg);
    assert_eq!(decoded, msg);
}

#[test]
fn test_cancel_and_hangup_roundtrip() {
    for content in [MsgContent::Cancel, MsgContent::Hangup, MsgContent::Reject] {
        let mut msg = EconnMessage::new("s", content);
        msg.resp = true;
        assert_eq!(roundtrip(&msg), msg);
    }
}

#[test]
fn test_propsync_requires_props() {
    let raw = r#"{"version":"3.0","type":"PROPSYNC","sessid":"x","resp":false}"#;
    assert!(matches!(decode(raw, 0, 0), Err(Error::ErrBadMessage(_))));
}

#[test]
fn test_propsync_roundtrip_preserves_order() {
    let raw = r#"{"version":"3.0","type":"PROPSYNC","sessid":"x","resp":true,"props":{"zzz":"1","aaa":"2","mmm":"3"}}"#;
    let msg = decode(raw, 0, 0).unwrap();

    let MsgContent::Propsync { props } = &msg.content else {
        panic!("wrong content");
    };
    let keys: Vec<&str> = props.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["zzz", "aaa", "mmm"]);

    // re-encode keeps the exact order
    let encoded = encode(&msg).unwrap();
    let z = encoded.find("zzz").unwrap();
    let a = encoded.find("aaa").unwrap();
    let m = encoded.find("mmm").unwrap();
    assert!(z < a && a < m);
}

#[test]
fn test_unknown_type_is_distinguished() {
    let raw = r#"{"version":"3.0","type":"WARPDRIVE","sessid":"x","resp":false}"#;
    assert!(matches!(
        decode(raw, 0, 0),
        Err(Error::ErrUnsupportedType(_))
    ));
}

#[test]
fn test_version_mismatch_rejected() {
    let raw = r#"{"version":"2.0","type":"CANCEL","sessid":"x","resp":false}"#;
    assert!(matches!(
        decode(raw, 0, 0),
        Err(Error::ErrVersionMismatch(_))
    ));
}

#[test]
fn test_age_computed_and_clamped() {
    let raw = r#"{"version":"3.0","type":"CANCEL","sessid":"x","resp":false}"#;

    let msg = decode(raw, 100, 60).unwrap();
    assert_eq!(msg.age, 40);
    assert_eq!(msg.time, 60);

    // sender clock ahead of ours: age clamps to zero
    let msg = decode(raw, 50, 60).unwrap();
    assert_eq!(msg.age, 0);
}

#[test]
fn test_alert_roundtrip() {
    let msg = EconnMessage::new(
        "s",
        MsgContent::Alert {
            level: 3,
            descr: "ringer".to_owned(),
        },
    );
    assert_eq!(roundtrip(&msg), msg);
}

#[test]
fn test_confconn_ice_servers() {
    let msg = EconnMessage::new(
        "s",
        MsgContent::ConfConn {
            ice_servers: vec![IceServer {
                urls: vec!["turn:turn.example.org:3478?transport=udp".to_owned()],
                username: Some("user".to_owned()),
                credential: Some("pass".to_owned()),
            }],
            update: false,
            tool: "peercall".to_owned(),
            toolver: "0.3.0".to_owned(),
        },
    );
    assert_eq!(roundtrip(&msg), msg);
}

#[test]
fn test_type_is_case_insensitive() {
    let raw = r#"{"version":"3.0","type":"setup","sessid":"x","resp":false,"sdp":"v=0"}"#;
    let msg = decode(raw, 0, 0).unwrap();
    assert_eq!(msg.msg_type(), MsgType::Setup);
}
