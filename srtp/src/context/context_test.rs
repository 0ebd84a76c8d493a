use super::*;
use crate::config::split_keying_material;

fn test_context() -> Context {
    Context::new(
        ProtectionProfile::Aes128CmHmacSha1_80,
        &[0x2b; 16],
        &[0x15; 14],
    )
    .unwrap()
}

fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x80, 111, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
    BigEndian::write_u16(&mut pkt[2..4], seq);
    BigEndian::write_u32(&mut pkt[8..12], ssrc);
    pkt.extend_from_slice(payload);
    pkt
}

#[test]
fn test_kdf_rfc3711_vectors() {
    // RFC 3711 appendix B.3
    let master_key = hex::decode("e1f97a0d3e018be0d64fa32c06de4139").unwrap();
    let master_salt = hex::decode("0ec675ad498afeebb6960b3aabe6").unwrap();

    let session_key = aes_cm_key_derivation(0x00, &master_key, &master_salt, 16);
    assert_eq!(
        hex::encode(session_key),
        "c61e7a93744f39ee10734afe3ff7a087"
    );

    let session_salt = aes_cm_key_derivation(0x02, &master_key, &master_salt, 14);
    assert_eq!(hex::encode(session_salt), "30cbbc08863d8c85d49db34a9ae1");

    let auth_key = aes_cm_key_derivation(0x01, &master_key, &master_salt, 20);
    assert_eq!(
        hex::encode(auth_key),
        "cebe321f6ff7716b6fd4ab49af256a156d38baa4"
    );
}

#[test]
fn test_rtp_roundtrip() {
    let mut tx = test_context();
    let mut rx = test_context();

    let packet = rtp_packet(1000, 0xdeadbeef, b"opus-frame");
    let protected = tx.protect_rtp(&packet).unwrap();

    assert_ne!(&protected[..packet.len()], packet.as_slice());
    assert_eq!(protected.len(), packet.len() + 10);

    let unprotected = rx.unprotect_rtp(&protected).unwrap();
    assert_eq!(unprotected, packet);
}

#[test]
fn test_rtp_tamper_detected() {
    let mut tx = test_context();
    let mut rx = test_context();

    let mut protected = tx.protect_rtp(&rtp_packet(1, 7, b"payload")).unwrap();
    let mid = protected.len() / 2;
    protected[mid] ^= 0xff;

    assert_eq!(
        rx.unprotect_rtp(&protected),
        Err(Error::ErrAuthenticationFailed)
    );
}

#[test]
fn test_rtp_replay_rejected() {
    let mut tx = test_context();
    let mut rx = test_context();

    let protected = tx.protect_rtp(&rtp_packet(42, 7, b"payload")).unwrap();
    rx.unprotect_rtp(&protected).unwrap();
    assert_eq!(rx.unprotect_rtp(&protected), Err(Error::ErrDuplicated));
}

#[test]
fn test_rtp_seq_rollover_keeps_decrypting() {
    let mut tx = test_context();
    let mut rx = test_context();

    for seq in [65533u16, 65534, 65535, 0, 1, 2] {
        let packet = rtp_packet(seq, 9, b"payload");
        let protected = tx.protect_rtp(&packet).unwrap();
        let unprotected = rx.unprotect_rtp(&protected).unwrap();
        assert_eq!(unprotected, packet, "seq {seq}");
    }
}

#[test]
fn test_rtcp_roundtrip_and_replay() {
    let mut tx = test_context();
    let mut rx = test_context();

    // receiver report: header + sender ssrc
    let mut rtcp = vec![0x80, 201, 0, 1];
    rtcp.extend_from_slice(&[0, 0, 0, 7]);

    let protected = tx.protect_rtcp(&rtcp).unwrap();
    assert!(protected.len() > rtcp.len());

    let unprotected = rx.unprotect_rtcp(&protected).unwrap();
    assert_eq!(unprotected, rtcp);

    assert_eq!(rx.unprotect_rtcp(&protected), Err(Error::ErrDuplicated));
}

#[test]
fn test_keying_material_split_mirrors() {
    let material: Vec<u8> = (0u8..60).collect();
    let profile = ProtectionProfile::Aes128CmHmacSha1_80;

    let (client_tx, client_rx) = split_keying_material(profile, &material, true).unwrap();
    let (server_tx, server_rx) = split_keying_material(profile, &material, false).unwrap();

    // what the client sends with, the server receives with
    assert_eq!(client_tx.master_key, server_rx.master_key);
    assert_eq!(client_tx.master_salt, server_rx.master_salt);
    assert_eq!(client_rx.master_key, server_tx.master_key);
    assert_eq!(client_rx.master_salt, server_tx.master_salt);
}

#[test]
fn test_short_material_rejected() {
    let profile = ProtectionProfile::Aes128CmHmacSha1_80;
    assert!(split_keying_material(profile, &[0u8; 10], true).is_err());
}
