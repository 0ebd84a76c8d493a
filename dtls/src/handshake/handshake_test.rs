use super::*;

#[test]
fn test_header_roundtrip() {
    let h = Header {
        typ: TYPE_CLIENT_HELLO,
        length: 300,
        message_seq: 2,
        fragment_offset: 0,
        fragment_length: 300,
    };
    let raw = h.marshal();
    let parsed = Header::unmarshal(&raw).unwrap();
    assert_eq!(parsed, h);
}

#[test]
fn test_client_hello_roundtrip() {
    let hello = ClientHello {
        random: [3u8; RANDOM_LENGTH],
        cookie: vec![1, 2, 3, 4],
    };
    let parsed = ClientHello::unmarshal(&hello.marshal()).unwrap();
    assert_eq!(parsed, hello);
}

#[test]
fn test_server_hello_roundtrip() {
    let hello = ServerHello {
        random: [9u8; RANDOM_LENGTH],
    };
    let parsed = ServerHello::unmarshal(&hello.marshal()).unwrap();
    assert_eq!(parsed, hello);
}

#[test]
fn test_certificate_roundtrip() {
    let msg = CertificateMsg {
        certificate: vec![0x30, 0x82, 0x01, 0x00],
    };
    let parsed = CertificateMsg::unmarshal(&msg.marshal()).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_empty_certificate_rejected() {
    let mut raw = vec![];
    raw.extend_from_slice(&[0, 0, 0]); // zero total length
    assert!(matches!(
        CertificateMsg::unmarshal(&raw),
        Err(Error::ErrNoCertificate)
    ));
}

#[test]
fn test_server_key_exchange_roundtrip() {
    let ske = ServerKeyExchange {
        public_key: vec![4; 65],
        signature: vec![0x30, 0x06, 2, 1, 1, 2, 1, 1],
    };
    let parsed = ServerKeyExchange::unmarshal(&ske.marshal()).unwrap();
    assert_eq!(parsed, ske);
}

#[test]
fn test_message_unmarshal_all() {
    let a = Message {
        typ: TYPE_SERVER_HELLO_DONE,
        message_seq: 4,
        body: vec![],
    };
    let b = Message {
        typ: TYPE_FINISHED,
        message_seq: 5,
        body: vec![0u8; 12],
    };

    let mut payload = a.marshal();
    payload.extend_from_slice(&b.marshal());

    let msgs = Message::unmarshal_all(&payload).unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].typ, TYPE_SERVER_HELLO_DONE);
    assert_eq!(msgs[1].message_seq, 5);
}

#[test]
fn test_wrong_version_client_hello_rejected() {
    let hello = ClientHello {
        random: [0u8; RANDOM_LENGTH],
        cookie: vec![],
    };
    let mut raw = hello.marshal();
    raw[0] = 0xfe;
    raw[1] = 0xff; // DTLS 1.0
    assert!(matches!(
        ClientHello::unmarshal(&raw),
        Err(Error::ErrUnsupportedProtocolVersion)
    ));
}
