//! Length-prefixed message framing.
//!
//! Every message on the wire is a little-endian unsigned 32-bit length
//! followed by that many bytes of UTF-8 payload. Both peers must frame with
//! the same 4-byte header; anything else is a wire-format error surfacing as
//! a short or garbled read.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the connection (EOF or an explicit zero-length frame).
    #[error("peer closed the connection")]
    Closed,

    /// A write finished short of the declared frame size.
    #[error("short write: declared {declared} bytes, sent {sent}")]
    Send { declared: usize, sent: usize },

    #[error("payload of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),

    #[error("frame payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True for the errors that mean the session should end quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Closed => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Read one frame. Loops until the declared length has fully arrived.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, FrameError> {
    let declared = match reader.read_u32_le().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    };
    if declared == 0 {
        return Err(FrameError::Closed);
    }

    let mut buffer = vec![0u8; declared];
    let mut received = 0;
    while received < declared {
        let n = reader.read(&mut buffer[received..]).await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        received += n;
    }
    Ok(String::from_utf8(buffer)?)
}

/// Write one frame, tracking partial progress so a short write reports the
/// declared and actually-sent byte counts.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &str,
) -> Result<(), FrameError> {
    let bytes = payload.as_bytes();
    if bytes.len() > u32::MAX as usize {
        return Err(FrameError::TooLarge(bytes.len()));
    }

    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    let mut sent = 0;
    while sent < bytes.len() {
        let n = writer.write(&bytes[sent..]).await?;
        if n == 0 {
            return Err(FrameError::Send {
                declared: bytes.len(),
                sent,
            });
        }
        sent += n;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, "hello exchange").await.unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, "hello exchange");
    }

    #[tokio::test]
    async fn test_roundtrip_multibyte_utf8() {
        let mut wire = Vec::new();
        let payload = "ticker \u{20ac}\u{00e9}\u{4e2d}";
        write_frame(&mut wire, payload).await.unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_header_is_four_bytes_little_endian() {
        let mut wire = Vec::new();
        write_frame(&mut wire, "ab").await.unwrap();
        assert_eq!(&wire[..4], &[2, 0, 0, 0]);
        assert_eq!(&wire[4..], b"ab");
    }

    #[tokio::test]
    async fn test_eof_reads_as_close() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_signals_close() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0, 0]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_close() {
        let mut wire = Vec::new();
        write_frame(&mut wire, "full message").await.unwrap();
        wire.truncate(wire.len() - 3);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_split_arrival_is_reassembled() {
        // A reader that yields one byte per poll still produces the whole
        // frame.
        let mut wire = Vec::new();
        write_frame(&mut wire, "chunked").await.unwrap();
        let mut reader = tokio_test::io::Builder::new();
        for byte in &wire {
            reader.read(&[*byte]);
        }
        let mut reader = reader.build();
        assert_eq!(read_frame(&mut reader).await.unwrap(), "chunked");
    }
}
