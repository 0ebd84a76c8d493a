use super::*;

#[test]
fn test_prf_deterministic_and_sized() {
    let a = prf(b"secret", "test label", b"seed", 48);
    let b = prf(b"secret", "test label", b"seed", 48);
    assert_eq!(a, b);
    assert_eq!(a.len(), 48);

    let c = prf(b"secret", "test label", b"other seed", 48);
    assert_ne!(a, c);

    // truncation of a longer run must agree with a shorter run
    let long = prf(b"secret", "test label", b"seed", 100);
    assert_eq!(&long[..48], &a[..]);
}

#[test]
fn test_key_block_split() {
    let master = [0x0b; MASTER_SECRET_LENGTH];
    let kb = key_block(&master, &[1u8; 32], &[2u8; 32]);

    // all four segments pairwise distinct
    assert_ne!(kb.client_write_key, kb.server_write_key);
    assert_ne!(kb.client_write_iv, kb.server_write_iv);
}

#[test]
fn test_exporter_symmetry() {
    let master = [0x42; MASTER_SECRET_LENGTH];
    let cr = [1u8; 32];
    let sr = [2u8; 32];

    let a = export_keying_material(&master, "EXTRACTOR-dtls_srtp", &cr, &sr, 60);
    let b = export_keying_material(&master, "EXTRACTOR-dtls_srtp", &cr, &sr, 60);
    assert_eq!(a, b);
    assert_eq!(a.len(), 60);
}

#[test]
fn test_ecdsa_sign_verify() {
    let key = SigningKey::random(&mut rand::rngs::OsRng);
    let public = key.verifying_key().to_encoded_point(false);

    let sig = sign_ecdsa(&key, b"signed bytes");
    verify_ecdsa(public.as_bytes(), b"signed bytes", &sig).unwrap();

    assert!(verify_ecdsa(public.as_bytes(), b"other bytes", &sig).is_err());
}

#[test]
fn test_fingerprint_format() {
    let fp = format_fingerprint(&[0x01, 0xab, 0xff]);
    assert_eq!(fp, "01:AB:FF");
}
