//! Length-prefixed framing for channel byte streams.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.

use crate::assert_invariant;
use crate::invariant_ppt::names;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds u32 length prefix", payload.len()),
        )
    })?;

    let header = len.to_be_bytes();
    assert_invariant!(
        u32::from_be_bytes(header) as usize == payload.len(),
        names::FRAME_LENGTH,
        "codec::write_frame"
    );

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary; a stream
/// that ends inside a frame is an `UnexpectedEof` error. Frames larger than
/// `max_len` are refused before any payload is read.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {} bytes", len, max_len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"third").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), b"third");
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[7u8; 100]).await.unwrap();

        let err = read_frame(&mut b, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_truncated_header_is_unexpected_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0u8, 0]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
