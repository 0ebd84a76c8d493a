use super::*;

#[test]
fn test_add_get_update() {
    let mut props = Properties::new();
    assert!(props.get("videosend").is_none());

    props.add("videosend", "false");
    props.add("audiocbr", "false");
    assert_eq!(props.get("videosend"), Some("false"));

    props.update("videosend", "true");
    assert_eq!(props.get("videosend"), Some("true"));
    assert_eq!(props.len(), 2);
}

#[test]
fn test_insertion_order_preserved() {
    let mut props = Properties::new();
    props.add("zeta", "1");
    props.add("alpha", "2");
    props.add("mid", "3");

    let keys: Vec<&str> = props.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["zeta", "alpha", "mid"]);

    // updating must not move the key
    props.update("alpha", "9");
    let keys: Vec<&str> = props.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn test_unknown_value_types_roundtrip() {
    // a future peer may put numbers or nested objects in here;
    // they must survive decode -> encode untouched
    let v: serde_json::Value =
        serde_json::from_str(r#"{"videosend":"true","future_count":3,"nested":{"a":1}}"#)
            .unwrap();
    let props = Properties::from_value(&v).unwrap();

    assert_eq!(props.get("videosend"), Some("true"));
    // non-string values read as absent through the string getter
    assert!(props.get("future_count").is_none());

    assert_eq!(props.to_value(), v);
}
