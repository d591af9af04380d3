//! Length-prefixed bincode frames over any async byte stream
//!
//! Every frame is a 4-byte big-endian length followed by the bincode body.
//! The gateway and its workers use this over the child's stdin/stdout pipes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{SharedError, SharedResult};

/// Largest frame body either side accepts
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Serialize `message` and write it as one frame, flushing the writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> SharedResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let data = bincode::serialize(message).map_err(|e| SharedError::Encode {
        what: "frame",
        message: e.to_string(),
    })?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(SharedError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// before a new frame started.
pub async fn read_frame<R, T>(reader: &mut R) -> SharedResult<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SharedError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    bincode::deserialize(&data)
        .map(Some)
        .map_err(|e| SharedError::Decode {
            what: "frame",
            message: e.to_string(),
        })
}
