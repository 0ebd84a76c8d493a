use super::*;

#[test]
fn test_generate_auth_key() {
    // key must be the 16-byte md5 of user:realm:pass
    let key = generate_auth_key("user", "peercall.test", "pass");
    assert_eq!(key.len(), 16);

    let again = generate_auth_key("user", "peercall.test", "pass");
    assert_eq!(key, again);

    let other = generate_auth_key("user", "peercall.test", "other");
    assert_ne!(key, other);
}

#[test]
fn test_generate_nonce_unique() {
    let a = generate_nonce();
    let b = generate_nonce();
    assert_eq!(a.len(), 16);
    assert_ne!(a, b);
}
