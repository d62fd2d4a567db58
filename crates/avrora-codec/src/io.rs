//! Framed message I/O over async byte streams.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::FrameError;

/// Default frame size for sessions that do not configure one.
pub const DEFAULT_FRAME_SIZE: usize = 2048;

/// Writes one logical message as length-prefixed frames plus a zero-length
/// terminator, then flushes.
pub async fn write_framed<W>(
    writer: &mut W,
    message: &[u8],
    frame_size: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if frame_size == 0 {
        return Err(FrameError::ZeroFrameSize);
    }
    for chunk in message.chunks(frame_size) {
        writer.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
        writer.write_all(chunk).await?;
    }
    writer.write_all(&0u32.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one logical message.
///
/// Returns `Ok(None)` on a clean end of stream (EOF at a message boundary).
/// EOF inside a length prefix, inside a payload, or after payload frames
/// with no terminator is [`FrameError::UnexpectedEnd`].
pub async fn read_framed<R>(reader: &mut R) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut parts: Vec<BytesMut> = Vec::new();
    loop {
        let len = match read_frame_len(reader, parts.is_empty()).await? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len == 0 {
            return Ok(Some(concat(parts)));
        }
        let mut payload = BytesMut::zeroed(len);
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::UnexpectedEnd
            } else {
                FrameError::Io(e)
            }
        })?;
        parts.push(payload);
    }
}

/// Reads a 4-byte big-endian frame length. A clean EOF before the first
/// byte of the first frame maps to `None`; EOF anywhere else is an error.
async fn read_frame_len<R>(reader: &mut R, at_boundary: bool) -> Result<Option<usize>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 && at_boundary {
                return Ok(None);
            }
            return Err(FrameError::UnexpectedEnd);
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf) as usize))
}

fn concat(parts: Vec<BytesMut>) -> Bytes {
    match parts.len() {
        0 => Bytes::new(),
        1 => parts.into_iter().next().map(BytesMut::freeze).unwrap_or_default(),
        _ => {
            let total = parts.iter().map(BytesMut::len).sum();
            let mut out = BytesMut::with_capacity(total);
            for part in parts {
                out.extend_from_slice(&part);
            }
            out.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_framed(&mut a, b"first message", 4).await.unwrap();
        write_framed(&mut a, b"", 4).await.unwrap();
        write_framed(&mut a, b"second", 1024).await.unwrap();
        drop(a);

        assert_eq!(
            read_framed(&mut b).await.unwrap(),
            Some(Bytes::from_static(b"first message"))
        );
        assert_eq!(read_framed(&mut b).await.unwrap(), Some(Bytes::new()));
        assert_eq!(
            read_framed(&mut b).await.unwrap(),
            Some(Bytes::from_static(b"second"))
        );
        assert_eq!(read_framed(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(256);
        // One payload frame, no terminator.
        a.write_all(&[0, 0, 0, 2, 1, 2]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_framed(&mut b).await,
            Err(FrameError::UnexpectedEnd)
        ));
    }

    #[tokio::test]
    async fn eof_inside_length_prefix_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_framed(&mut b).await,
            Err(FrameError::UnexpectedEnd)
        ));
    }

    #[tokio::test]
    async fn zero_frame_size_is_rejected() {
        let (mut a, _b) = tokio::io::duplex(16);
        assert!(matches!(
            write_framed(&mut a, b"x", 0).await,
            Err(FrameError::ZeroFrameSize)
        ));
    }
}
