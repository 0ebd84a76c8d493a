use super::*;

#[test]
fn test_error_code_roundtrip() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(TransactionId::new()), Box::new(BINDING_ERROR)])?;

    let attr = ErrorCodeAttribute {
        code: CODE_UNAUTHORIZED,
        reason: "Unauthorized".to_owned(),
    };
    attr.add_to(&mut m)?;

    let mut decoded = Message::new();
    decoded.read_from(&m.raw)?;

    let mut got = ErrorCodeAttribute::default();
    got.get_from(&decoded)?;
    assert_eq!(got, attr);
    Ok(())
}

#[test]
fn test_error_code_class_split() -> Result<()> {
    // 437 encodes as class 4, number 37
    let mut m = Message::new();
    m.build(&[Box::new(TransactionId::new()), Box::new(BINDING_ERROR)])?;
    ErrorCodeAttribute::new(CODE_ALLOC_MISMATCH).add_to(&mut m)?;

    let v = m.get(ATTR_ERROR_CODE)?;
    assert_eq!(v[2], 4);
    assert_eq!(v[3], 37);
    Ok(())
}
