//! Frame codec for the mailbox wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ len (4B) │  msgpack MessageEnvelope     │
//! │ u32 BE   │                              │
//! └──────────┴──────────────────────────────┘
//! ```
//! Length covers the payload only, NOT the 4-byte prefix.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::envelope::MessageEnvelope;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Read one frame from the stream.
///
/// Returns the payload bytes, or `None` on clean EOF at a frame boundary.
/// `max_frame_bytes` caps the accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }

    let mut payload = vec![0u8; frame_len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Build a complete frame (prefix + payload) in one buffer.
pub fn encode_frame(payload: &[u8]) -> std::io::Result<Bytes> {
    let frame_len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Frame too large: {} bytes", payload.len()),
        )
    })?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(frame_len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one envelope.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<MessageEnvelope>> {
    match read_frame(reader, max_frame_bytes).await? {
        Some(payload) => MessageEnvelope::decode(&payload)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        None => Ok(None),
    }
}

/// Encode and write one envelope.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &MessageEnvelope,
) -> std::io::Result<()> {
    let payload = envelope.encode().map_err(|e| {
        tracing::error!("envelope_encode_failed: command={}, error={}", envelope.command, e);
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })?;
    write_frame(writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorIdentity, ActorKind};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn test_frame_prefix_is_big_endian_payload_length() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_clean_eof_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(block_on(read_frame(&mut cursor, 1024)).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = encode_frame(&[7u8; 64]).unwrap();
        let mut cursor = Cursor::new(frame.to_vec());
        let err = block_on(read_frame(&mut cursor, 16)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut wire = encode_frame(b"truncated").unwrap().to_vec();
        wire.truncate(6);
        let mut cursor = Cursor::new(wire);
        let err = block_on(read_frame(&mut cursor, 1024)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_garbage_payload_fails_decode() {
        let mut cursor = Cursor::new(encode_frame(&[0xc1, 0xc1]).unwrap().to_vec());
        let err = block_on(read_envelope(&mut cursor, 1024)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    proptest! {
        #[test]
        fn prop_frames_are_read_back_in_write_order(commands in proptest::collection::vec("[a-z]{1,12}", 1..20)) {
            let sender = ActorIdentity::new(ActorKind::Actor, "a");
            let target = ActorIdentity::new(ActorKind::Actor, "b");
            let read_back = block_on(async {
                let mut wire = Vec::new();
                for (i, command) in commands.iter().enumerate() {
                    let env = MessageEnvelope::cast(sender.clone(), target.clone(), command.clone(), serde_json::json!(i));
                    write_envelope(&mut wire, &env).await.unwrap();
                }
                let mut cursor = Cursor::new(wire);
                let mut out = Vec::new();
                while let Some(env) = read_envelope(&mut cursor, 1 << 20).await.unwrap() {
                    out.push((env.command, env.args));
                }
                out
            });
            let expected: Vec<_> = commands
                .iter()
                .enumerate()
                .map(|(i, c)| (c.clone(), serde_json::json!(i)))
                .collect();
            prop_assert_eq!(read_back, expected);
        }
    }
}
