//! STUN/TURN messages over stream transports are self-delimiting:
//! a STUN header carries its attribute length, and ChannelData
//! carries its payload length (padded to 4 bytes on streams per
//! RFC 5766 section 11.5). These helpers cut one message at a time
//! out of a TCP byte stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{Error, Result};

const STUN_HEADER_SIZE: usize = 20;
const CHANNEL_DATA_HEADER_SIZE: usize = 4;
const MAX_STREAM_MESSAGE_SIZE: usize = 0xffff + CHANNEL_DATA_HEADER_SIZE;

fn is_channel_data(first_byte: u8) -> bool {
    (0x40..=0x7f).contains(&first_byte)
}

/// Reads exactly one STUN message or one ChannelData frame from the
/// stream and returns its raw bytes, header included.
pub async fn read_stream_message(rd: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut header = [0u8; CHANNEL_DATA_HEADER_SIZE];
    rd.read_exact(&mut header).await?;

    let body_len = u16::from_be_bytes([header[2], header[3]]) as usize;

    let (total, padded) = if is_channel_data(header[0]) {
        // pad ChannelData to a 4-byte boundary on stream transports
        let pad = (4 - (body_len % 4)) % 4;
        (CHANNEL_DATA_HEADER_SIZE + body_len, pad)
    } else {
        (STUN_HEADER_SIZE + body_len, 0)
    };

    if total + padded > MAX_STREAM_MESSAGE_SIZE {
        return Err(Error::ErrStreamMessageTooLarge(total + padded));
    }

    let mut msg = vec![0u8; total + padded];
    msg[..CHANNEL_DATA_HEADER_SIZE].copy_from_slice(&header);
    rd.read_exact(&mut msg[CHANNEL_DATA_HEADER_SIZE..]).await?;
    msg.truncate(total);

    Ok(msg)
}

/// Writes one message, padding ChannelData frames to 4 bytes as the
/// stream framing requires.
pub async fn write_stream_message(wr: &mut OwnedWriteHalf, msg: &[u8]) -> Result<()> {
    wr.write_all(msg).await?;

    if !msg.is_empty() && is_channel_data(msg[0]) {
        let pad = (4 - (msg.len() % 4)) % 4;
        if pad > 0 {
            wr.write_all(&[0u8; 3][..pad]).await?;
        }
    }

    wr.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tcp_framing_test {
    use super::*;

    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_stream_roundtrip_stun_and_channel_data() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;

        let (_crd, mut cwr) = client.into_split();
        let (mut srd, _swr) = server.into_split();

        // minimal STUN binding request header, zero attributes
        let stun: Vec<u8> = vec![
            0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
        ];
        write_stream_message(&mut cwr, &stun).await?;

        // channel-data frame with a 3-byte payload (forces 1 pad byte)
        let chan: Vec<u8> = vec![0x40, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc];
        write_stream_message(&mut cwr, &chan).await?;

        let got = read_stream_message(&mut srd).await?;
        assert_eq!(got, stun);

        let got = read_stream_message(&mut srd).await?;
        assert_eq!(got, chan);

        Ok(())
    }
}
