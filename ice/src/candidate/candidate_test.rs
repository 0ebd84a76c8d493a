use super::*;

#[test]
fn test_priority_formula() {
    // host, local-pref 65535, component 1
    let p = calc_priority(CandidateType::Host, 65535, COMPONENT_RTP);
    assert_eq!(p, (126 << 24) + (65535 << 8) + 255);

    // relay sorts below everything
    let r = calc_priority(CandidateType::Relay, 65535, COMPONENT_RTP);
    assert!(r < calc_priority(CandidateType::ServerReflexive, 0, COMPONENT_RTP));
}

#[test]
fn test_attribute_roundtrip_host() {
    let cand = Candidate::new_host("1912840968".to_owned(), "192.168.1.7:9000".parse().unwrap(), 65535);
    let attr = cand.to_attribute();
    assert!(attr.contains("typ host"));

    let parsed = Candidate::parse_attribute(&attr).unwrap();
    assert_eq!(parsed, cand);
}

#[test]
fn test_attribute_roundtrip_relay() {
    let cand = Candidate::new_relay(
        "3".to_owned(),
        "203.0.113.9:50000".parse().unwrap(),
        "192.168.1.7:9000".parse().unwrap(),
    );
    let parsed = Candidate::parse_attribute(&cand.to_attribute()).unwrap();
    assert_eq!(parsed.typ, CandidateType::Relay);
    assert_eq!(parsed.related, cand.related);
}

#[test]
fn test_parse_with_prefix_and_extensions() {
    let attr = "candidate:842163049 1 udp 1677729535 203.0.113.1 61665 typ srflx raddr 192.168.1.7 rport 61665 generation 0 network-cost 999";
    let cand = Candidate::parse_attribute(attr).unwrap();
    assert_eq!(cand.typ, CandidateType::ServerReflexive);
    assert_eq!(cand.addr, "203.0.113.1:61665".parse().unwrap());
    assert_eq!(cand.related, Some("192.168.1.7:61665".parse().unwrap()));
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(Candidate::parse_attribute("candidate:x").is_err());
    assert!(Candidate::parse_attribute("a 1 udp nan 1.2.3.4 1 typ host").is_err());
    assert!(Candidate::parse_attribute("a 1 udp 1 1.2.3.4 1 typ wat").is_err());
}

#[test]
fn test_tcp_candidate_tcptype() {
    let mut cand = Candidate::new_host("7".to_owned(), "10.0.0.1:9".parse().unwrap(), 0);
    cand.protocol = CandidateProtocol::Tcp;
    cand.tcp_type = TcpType::Active;

    let attr = cand.to_attribute();
    assert!(attr.ends_with("tcptype active"));

    let parsed = Candidate::parse_attribute(&attr).unwrap();
    assert_eq!(parsed.tcp_type, TcpType::Active);
}
