use super::*;

#[test]
fn test_parse_stun_uri() -> Result<()> {
    let u = Uri::parse_uri("stun:stun.example.org")?;
    assert_eq!(u.scheme, SchemeType::Stun);
    assert_eq!(u.host, "stun.example.org");
    assert_eq!(u.port, 3478);
    assert_eq!(u.proto, ProtoType::Udp);
    Ok(())
}

#[test]
fn test_parse_turn_uri_with_transport() -> Result<()> {
    let u = Uri::parse_uri("turn:turn.example.org:5000?transport=tcp")?;
    assert_eq!(u.scheme, SchemeType::Turn);
    assert_eq!(u.port, 5000);
    assert_eq!(u.proto, ProtoType::Tcp);
    Ok(())
}

#[test]
fn test_parse_turns_defaults() -> Result<()> {
    let u = Uri::parse_uri("turns:turn.example.org")?;
    assert_eq!(u.scheme, SchemeType::Turns);
    assert_eq!(u.port, 5349);
    assert_eq!(u.proto, ProtoType::Tcp);
    Ok(())
}

#[test]
fn test_reject_unknown_scheme() {
    assert!(Uri::parse_uri("http://example.org").is_err());
}
