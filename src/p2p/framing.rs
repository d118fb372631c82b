//! Length-prefixed framing
//!
//! Wire format, big-endian:
//!
//! ```text
//! [8 bytes: u64 length N][N bytes: serialized message]
//! ```
//!
//! Reads are always bounded by a deadline so a silent remote cannot park the
//! reader task forever, and a declared length above the configured maximum is
//! rejected before any of the body is read.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::FrameError;
use super::protocol::WireMessage;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 8;

/// Default maximum serialized message size (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Serialize `msg`, prefix it with its length and write both in one call.
///
/// Returns the number of payload bytes written, not counting the prefix.
pub async fn send<W, M>(writer: &mut W, msg: &M, max_size: usize) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
    M: WireMessage,
{
    let data = msg.to_bytes()?;
    if data.len() > max_size {
        return Err(FrameError::TooLarge {
            len: data.len() as u64,
            max: max_size,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
    frame.extend_from_slice(&(data.len() as u64).to_be_bytes());
    frame.extend_from_slice(&data);

    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(data.len())
}

/// Read exactly one frame and decode it, failing if `deadline` elapses first.
pub async fn receive<R, M>(reader: &mut R, deadline: Duration, max_size: usize) -> Result<M, FrameError>
where
    R: AsyncRead + Unpin,
    M: WireMessage,
{
    match tokio::time::timeout(deadline, read_frame(reader, max_size)).await {
        Ok(Ok(data)) => Ok(M::from_bytes(&data)?),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(FrameError::Timeout),
    }
}

async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut len_bytes).await {
        // EOF before the first byte of a frame is an orderly close
        return Err(match e.kind() {
            ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(e),
        });
    }

    let len = u64::from_be_bytes(len_bytes);
    if len > max_size as u64 {
        return Err(FrameError::TooLarge { len, max: max_size });
    }
    if len == 0 {
        return Err(FrameError::Empty);
    }

    debug!("Received frame length prefix: {} bytes", len);

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}
