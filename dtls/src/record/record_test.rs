use super::*;

#[test]
fn test_record_marshal_roundtrip() {
    let r = Record::new(ContentType::Handshake, 0, 7, vec![1, 2, 3, 4]);
    let raw = r.marshal();

    let records = Record::unmarshal_all(&raw).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content_type, ContentType::Handshake);
    assert_eq!(records[0].epoch, 0);
    assert_eq!(records[0].sequence, 7);
    assert_eq!(records[0].payload, vec![1, 2, 3, 4]);
}

#[test]
fn test_unmarshal_coalesced_records() {
    let a = Record::new(ContentType::Handshake, 0, 1, vec![0xaa]);
    let b = Record::new(ContentType::ChangeCipherSpec, 0, 2, vec![0x01]);

    let mut datagram = a.marshal();
    datagram.extend_from_slice(&b.marshal());

    let records = Record::unmarshal_all(&datagram).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].content_type, ContentType::ChangeCipherSpec);
}

#[test]
fn test_gcm_roundtrip_and_tamper() {
    let key = [7u8; 16];
    let iv = [9u8; 4];
    let tx = CipherState::new(&key, &iv).unwrap();
    let rx = CipherState::new(&key, &iv).unwrap();

    let mut record = Record::new(ContentType::ApplicationData, 1, 42, b"secret".to_vec());
    tx.encrypt(&mut record).unwrap();
    assert_ne!(record.payload, b"secret");

    let mut tampered = record.clone();
    let last = tampered.payload.len() - 1;
    tampered.payload[last] ^= 1;
    assert!(rx.decrypt(&mut tampered).is_err());

    rx.decrypt(&mut record).unwrap();
    assert_eq!(record.payload, b"secret");
}

#[test]
fn test_is_dtls_record_range() {
    assert!(is_dtls_record(&[20]));
    assert!(is_dtls_record(&[22]));
    assert!(is_dtls_record(&[63]));
    assert!(!is_dtls_record(&[19]));
    assert!(!is_dtls_record(&[64]));
    assert!(!is_dtls_record(&[0]));
    assert!(!is_dtls_record(&[128]));
}
