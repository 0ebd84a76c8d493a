use super::*;
use crate::message::*;
use crate::textattrs::TextAttribute;

#[test]
fn test_fingerprint_roundtrip() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, "software".to_owned())),
    ])?;
    FINGERPRINT.add_to(&mut m)?;

    let mut decoded = Message::new();
    decoded.read_from(&m.raw)?;
    FINGERPRINT.check(&decoded)?;
    Ok(())
}

#[test]
fn test_fingerprint_detects_corruption() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, "software".to_owned())),
    ])?;
    FINGERPRINT.add_to(&mut m)?;

    let mut raw = m.raw.clone();
    raw[MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE] ^= 0xff;

    let mut decoded = Message::new();
    decoded.read_from(&raw)?;
    assert!(matches!(
        FINGERPRINT.check(&decoded),
        Err(Error::ErrFingerprintMismatch)
    ));
    Ok(())
}
