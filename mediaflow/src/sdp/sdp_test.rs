use super::*;

const OFFER: &str = "v=0\r\n\
o=- 8427841 2 IN IP4 192.168.1.7\r\n\
s=-\r\n\
t=0 0\r\n\
a=ice-options:trickle\r\n\
m=audio 9000 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 192.168.1.7\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=mid:audio\r\n\
a=ice-ufrag:F7gI\r\n\
a=ice-pwd:x9cml/YzichV2+XlhiMu8g\r\n\
a=fingerprint:sha-256 01:02:03:04:05:06:07:08:09:0A:0B:0C:0D:0E:0F:10:11:12:13:14:15:16:17:18:19:1A:1B:1C:1D:1E:1F:20\r\n\
a=setup:actpass\r\n\
a=rtcp-mux\r\n\
a=candidate:1 1 udp 2130706431 192.168.1.7 9000 typ host\r\n\
a=sendrecv\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:data\r\n\
a=sctp-port:5000\r\n";

#[test]
fn test_parse_offer() {
    let sdp = SessionDescription::parse(OFFER).unwrap();

    assert_eq!(sdp.origin_addr, "192.168.1.7");
    assert_eq!(sdp.session_id, 8427841);
    assert!(sdp.has_session_attr("ice-options"));

    let audio = sdp.media("audio").unwrap();
    assert_eq!(audio.port, 9000);
    assert_eq!(audio.formats, vec!["111"]);
    assert_eq!(audio.attr("mid"), Some("audio"));
    assert_eq!(audio.attr("ice-ufrag"), Some("F7gI"));
    assert!(audio.has_attr("rtcp-mux"));
    assert_eq!(audio.all_attrs("candidate").len(), 1);

    let data = sdp.media("application").unwrap();
    assert_eq!(data.attr("sctp-port"), Some("5000"));
}

#[test]
fn test_format_parse_roundtrip() {
    let sdp = SessionDescription::parse(OFFER).unwrap();
    let rendered = sdp.to_string();
    let reparsed = SessionDescription::parse(&rendered).unwrap();

    assert_eq!(reparsed.media.len(), sdp.media.len());
    let a1 = sdp.media("audio").unwrap();
    let a2 = reparsed.media("audio").unwrap();
    assert_eq!(a1.attrs, a2.attrs);
    assert_eq!(a1.formats, a2.formats);
}

#[test]
fn test_fingerprint_parse() {
    let audio = SessionDescription::parse(OFFER).unwrap();
    let audio = audio.media("audio").unwrap();
    let fp = Fingerprint::parse(audio.attr("fingerprint").unwrap()).unwrap();

    assert_eq!(fp.hash, "sha-256");
    assert_eq!(fp.digest.len(), 32);
    assert_eq!(fp.digest[0], 0x01);
    assert_eq!(fp.digest[31], 0x20);
}

#[test]
fn test_fingerprint_sha1_accepted() {
    let fp = Fingerprint::parse("sha-1 AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD")
        .unwrap();
    assert_eq!(fp.hash, "sha-1");
    assert_eq!(fp.digest.len(), 20);
}

#[test]
fn test_setup_parse() {
    assert_eq!(Setup::parse("actpass").unwrap(), Setup::ActPass);
    assert_eq!(Setup::parse("active").unwrap(), Setup::Active);
    assert_eq!(Setup::parse("passive").unwrap(), Setup::Passive);
    assert!(Setup::parse("holdconn").is_err());
}

#[test]
fn test_unknown_attrs_preserved() {
    let raw = "v=0\r\no=- 1 2 IN IP4 10.0.0.1\r\ns=-\r\nt=0 0\r\n\
               m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
               a=x-streamchange\r\na=x-custom:value\r\n";
    let sdp = SessionDescription::parse(raw).unwrap();
    let audio = sdp.media("audio").unwrap();

    assert!(audio.has_attr("x-streamchange"));
    assert_eq!(audio.attr("x-custom"), Some("value"));

    let rendered = sdp.to_string();
    assert!(rendered.contains("a=x-streamchange\r\n"));
    assert!(rendered.contains("a=x-custom:value\r\n"));
}

#[test]
fn test_malformed_m_line_rejected() {
    let raw = "v=0\r\nm=audio\r\n";
    assert!(SessionDescription::parse(raw).is_err());
}
