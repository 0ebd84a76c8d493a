use super::*;

#[test]
fn test_channel_data_roundtrip() -> Result<()> {
    let mut cd = ChannelData {
        data: vec![1, 2, 3, 4, 5],
        number: ChannelNumber(MIN_CHANNEL_NUMBER + 1),
        raw: vec![],
    };
    cd.encode();

    let mut decoded = ChannelData {
        raw: cd.raw.clone(),
        ..Default::default()
    };
    decoded.decode()?;

    assert_eq!(decoded.number, cd.number);
    assert_eq!(decoded.data, cd.data);
    Ok(())
}

#[test]
fn test_channel_data_bad_number() {
    let mut cd = ChannelData {
        raw: vec![0x00, 0x01, 0x00, 0x00],
        ..Default::default()
    };
    assert!(matches!(
        cd.decode(),
        Err(Error::ErrChannelNumberOutOfRange)
    ));
}

#[test]
fn test_channel_data_length_mismatch() {
    // claims 8 payload bytes, carries 2
    let mut cd = ChannelData {
        raw: vec![0x40, 0x00, 0x00, 0x08, 0xaa, 0xbb],
        ..Default::default()
    };
    assert!(matches!(cd.decode(), Err(Error::ErrBadChannelDataLength)));
}

#[test]
fn test_is_channel_data() {
    assert!(is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
    assert!(is_channel_data(&[0x7f, 0xff, 0x00, 0x00]));
    assert!(!is_channel_data(&[0x80, 0x00, 0x00, 0x00]));
    assert!(!is_channel_data(&[0x00, 0x01, 0x00, 0x00]));
    assert!(!is_channel_data(&[0x40]));
}
