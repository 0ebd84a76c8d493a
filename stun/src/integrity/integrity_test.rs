use super::*;
use crate::textattrs::TextAttribute;

#[test]
fn test_short_term_integrity_roundtrip() -> Result<()> {
    let i = MessageIntegrity::new_short_term_integrity("password".to_owned());

    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_USERNAME, "user".to_owned())),
    ])?;
    i.add_to(&mut m)?;

    let mut decoded = Message::new();
    decoded.read_from(&m.raw)?;
    i.check(&decoded)?;
    Ok(())
}

#[test]
fn test_integrity_detects_tamper() -> Result<()> {
    let i = MessageIntegrity::new_short_term_integrity("password".to_owned());

    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_USERNAME, "user".to_owned())),
    ])?;
    i.add_to(&mut m)?;

    // flip one bit inside the USERNAME value
    let mut raw = m.raw.clone();
    raw[MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE] ^= 0x20;

    let mut decoded = Message::new();
    decoded.read_from(&raw)?;
    assert!(matches!(
        i.check(&decoded),
        Err(Error::ErrIntegrityMismatch)
    ));
    Ok(())
}

#[test]
fn test_wrong_password_rejected() -> Result<()> {
    let good = MessageIntegrity::new_short_term_integrity("password".to_owned());
    let bad = MessageIntegrity::new_short_term_integrity("guess".to_owned());

    let mut m = Message::new();
    m.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;
    good.add_to(&mut m)?;

    assert!(matches!(bad.check(&m), Err(Error::ErrIntegrityMismatch)));
    Ok(())
}

#[test]
fn test_long_term_key_is_md5() {
    // RFC 5389 section 15.4 example key construction
    let i = MessageIntegrity::new_long_term_integrity(
        "user".to_owned(),
        "realm".to_owned(),
        "pass".to_owned(),
    );
    assert_eq!(i.0.len(), 16);
}

#[test]
fn test_integrity_before_fingerprint_enforced() -> Result<()> {
    let i = MessageIntegrity::new_short_term_integrity("pw".to_owned());

    let mut m = Message::new();
    m.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;
    crate::fingerprint::FINGERPRINT.add_to(&mut m)?;

    assert!(matches!(
        i.add_to(&mut m),
        Err(Error::ErrFingerprintBeforeIntegrity)
    ));
    Ok(())
}
