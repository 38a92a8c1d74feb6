//! Message framing for the length-prefixed sync protocol
//!
//! Format: `[4 bytes little-endian length][JSON payload]`. Limits are passed
//! in by the caller (`ServerConfig::max_frame_bytes` on the server).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default frame limit when no config is at hand
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("Malformed payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A stream that ends mid-frame counts as a closed connection
fn eof_as_closed(err: io::Error) -> FramingError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(err)
    }
}

/// Read one length-prefixed frame
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, FramingError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(eof_as_closed)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > max_len {
        return Err(FramingError::MessageTooLarge(len, max_len));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Write one length-prefixed frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
    max_len: usize,
) -> Result<(), FramingError> {
    if data.len() > max_len {
        return Err(FramingError::MessageTooLarge(data.len(), max_len));
    }

    stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}

/// Read and decode one JSON frame
pub async fn read_json<R, T>(stream: &mut R, max_len: usize) -> Result<T, FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(stream, max_len).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode and write one JSON frame
pub async fn write_json<W, T>(stream: &mut W, message: &T, max_len: usize) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(stream, &payload, max_len).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = DEFAULT_MAX_FRAME_BYTES;

    #[tokio::test]
    async fn test_read_write_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{\"type\":\"ping\"}", MAX).await.unwrap();
        assert_eq!(&wire[..4], &15u32.to_le_bytes());

        let payload = read_frame(&mut Cursor::new(wire), MAX).await.unwrap();
        assert_eq!(payload, b"{\"type\":\"ping\"}");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"", MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        assert!(read_frame(&mut cursor, MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let mut buffer = Vec::new();
        let result = write_frame(&mut buffer, &[0u8; 33], 32).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(33, 32))));

        // Oversized length prefix is refused before reading the payload
        let mut cursor = Cursor::new(1000u32.to_le_bytes().to_vec());
        let result = read_frame(&mut cursor, 32).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(1000, 32))));
    }

    #[tokio::test]
    async fn test_read_truncated_length() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_json_frames_in_sequence() {
        let mut buffer = Vec::new();
        write_json(&mut buffer, &vec![1, 2, 3], MAX).await.unwrap();
        write_json(&mut buffer, &"second", MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let first: Vec<u32> = read_json(&mut cursor, MAX).await.unwrap();
        let second: String = read_json(&mut cursor, MAX).await.unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, "second");
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"{not json", MAX).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result: Result<Vec<u32>, _> = read_json(&mut cursor, MAX).await;
        assert!(matches!(result, Err(FramingError::Codec(_))));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let len = 5u32.to_le_bytes();
        let mut stream = tokio_test::io::Builder::new()
            .read(&len[..2])
            .read(&len[2..])
            .read(b"he")
            .read(b"llo")
            .build();

        assert_eq!(read_frame(&mut stream, MAX).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_write_emits_prefix_then_payload() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&5u32.to_le_bytes())
            .write(b"hello")
            .build();

        write_frame(&mut stream, b"hello", MAX).await.unwrap();
    }
}
