use super::*;

#[test]
fn test_open_message_roundtrip() {
    let open = OpenMessage::new("calling-3");
    let raw = open.marshal();

    assert_eq!(raw[0], FRAME_OPEN);
    let parsed = OpenMessage::parse(&raw[1..]).unwrap();
    assert_eq!(parsed, open);
}

#[test]
fn test_open_message_with_protocol() {
    let mut open = OpenMessage::new("data");
    open.protocol = "chat".to_owned();

    let raw = open.marshal();
    let parsed = OpenMessage::parse(&raw[1..]).unwrap();
    assert_eq!(parsed.label, "data");
    assert_eq!(parsed.protocol, "chat");
}

#[test]
fn test_truncated_open_rejected() {
    assert!(OpenMessage::parse(&[0x00, 0x00]).is_err());

    // claims an 8-byte label but carries none
    let mut raw = OpenMessage::new("").marshal();
    raw[7] = 0;
    raw[8] = 8;
    assert!(OpenMessage::parse(&raw[1..]).is_err());
}

#[tokio::test]
async fn test_send_requires_open() {
    let chan = DataChannel::new("calling-3");
    assert!(!chan.is_open());
    assert!(chan.send(b"early").await.is_err());
}
