//! Messages between ranks and the hub, framed as `[len: u32 LE][rkyv payload]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TcpError};

pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on one frame's payload.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// First message from a rank.
    Hello {
        protocol_version: u16,
        rank: i32,
        world_size: i32,
    },

    /// Sent to every rank once the whole job has joined.
    Welcome { world_size: i32 },

    /// Handshake refused; the hub closes the connection.
    Reject { reason: String },

    /// One rank's share of a collective on scope `comm_id`.
    ///
    /// `index` is the sender's rank inside the scope and `expected` the
    /// scope size.
    Contribute {
        comm_id: u64,
        epoch: u64,
        index: i32,
        expected: i32,
        payload: Vec<u8>,
    },

    /// Every contribution to `(comm_id, epoch)`, in scope-rank order.
    Complete {
        comm_id: u64,
        epoch: u64,
        payloads: Vec<Vec<u8>>,
    },

    /// The rank has shut down and sends nothing more.
    Goodbye,
}

/// Encode a message into one frame.
pub fn encode_message(msg: &HubMessage) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| TcpError::EncodeFailed(e.to_string()))?;

    if payload.len() > MAX_FRAME_BYTES {
        return Err(TcpError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one frame payload (without its length prefix).
pub fn decode_message(payload: &[u8]) -> Result<HubMessage> {
    // rkyv validates alignment; socket buffers carry none.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<HubMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| TcpError::DecodeFailed(e.to_string()))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &HubMessage) -> Result<()> {
    let frame = encode_message(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<HubMessage>> {
    let mut len_buf = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TcpError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_message(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_roundtrip() {
        let msg = HubMessage::Complete {
            comm_id: 0xdead_beef,
            epoch: 7,
            payloads: vec![b"node0".to_vec(), Vec::new(), vec![0u8; 256]],
        };
        let frame = encode_message(&msg).unwrap();
        let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(decode_message(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_message(&[0xff; 3]).unwrap_err();
        assert!(err.to_string().contains("decode failed"), "got: {err}");
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = HubMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            rank: 2,
            world_size: 4,
        };
        write_message(&mut a, &hello).await.unwrap();
        write_message(&mut a, &HubMessage::Goodbye).await.unwrap();
        drop(a);

        assert_eq!(read_message(&mut b).await.unwrap(), Some(hello));
        assert_eq!(
            read_message(&mut b).await.unwrap(),
            Some(HubMessage::Goodbye)
        );
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, TcpError::FrameTooLarge { .. }));
    }
}
