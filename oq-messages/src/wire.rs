//! Frames exchanged over the feed and ingress connections.
//!
//! Every message is a 4-byte little-endian length followed by the bincode
//! encoding of the payload. The same framing is used by the synchronous
//! worker side and the async dispatcher side.

use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Read;
use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::envelope::Envelope;
use crate::WorkerId;

/// Upper bound on a single frame; larger frames indicate a corrupted
/// stream rather than a legitimate payload.
pub const MAX_FRAME_SIZE: u32 = 1 << 30;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame I/O failed. err: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload is not decodable. err: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge { len: u32 },
}

/// Messages flowing from the dispatcher to a worker on the feed connection.
#[derive(Debug, Serialize, Deserialize)]
pub enum Downstream {
    /// Order the worker to process the given task.
    Todo { envelope: Envelope },

    /// Order the worker to finish up and exit.
    Stop,
}

impl Display for Downstream {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Downstream::Todo { envelope } => write!(f, "todo {}#{}", envelope.func, envelope.task_no),
            Downstream::Stop => write!(f, "stop"),
        }
    }
}

/// Messages flowing from a worker to the dispatcher on the feed connection.
#[derive(Debug, Serialize, Deserialize)]
pub enum Upstream {
    /// The worker is idle and can take a task.
    Ready { worker_id: WorkerId },
}

impl Display for Upstream {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Upstream::Ready { worker_id } => write!(f, "ready {}:{}", worker_id.0, worker_id.1),
        }
    }
}

/// Writes one frame to a blocking stream.
pub fn write_frame<T: Serialize>(
    writer: &mut impl Write,
    msg: &T,
) -> Result<(), FrameError> {
    let bytes = bincode::serialize(msg)?;
    let len = bytes.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len });
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from a blocking stream; `None` on a clean end of
/// stream (the peer closed between frames).
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>, FrameError> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut len_bytes[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len });
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bincode::deserialize(&bytes)?))
}

/// Writes one frame to an async stream.
pub async fn write_frame_async<T: Serialize>(
    writer: &mut (impl AsyncWrite + Unpin),
    msg: &T,
) -> Result<(), FrameError> {
    let bytes = bincode::serialize(msg)?;
    let len = bytes.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len });
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from an async stream; `None` on a clean end of stream.
pub async fn read_frame_async<T: DeserializeOwned>(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<Option<T>, FrameError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {},
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(FrameError::Io(err)),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len });
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(Some(bincode::deserialize(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::read_frame;
    use super::read_frame_async;
    use super::write_frame;
    use super::write_frame_async;
    use crate::envelope::Envelope;
    use crate::monitor::Monitor;
    use crate::pack::Packed;
    use crate::pack::PackedSeq;
    use crate::wire::Downstream;

    fn sample() -> Envelope {
        let args = PackedSeq::new(vec![Packed::new(&"hello".to_string()).unwrap()]);
        Envelope::new("count", args, 7, Monitor::new("count"))
    }

    #[test]
    fn frames_roundtrip_blocking() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Downstream::Todo { envelope: sample() })?;
        write_frame(&mut buf, &Downstream::Stop)?;
        let mut cursor = std::io::Cursor::new(buf);
        let Some(Downstream::Todo { envelope }) = read_frame(&mut cursor)? else {
            anyhow::bail!("first frame lost");
        };
        assert_eq!(envelope.task_no, 7);
        let Some(Downstream::Stop) = read_frame(&mut cursor)? else {
            anyhow::bail!("second frame lost");
        };
        assert!(read_frame::<Downstream>(&mut cursor)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn frames_roundtrip_async() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, &Downstream::Todo { envelope: sample() }).await?;
        let mut cursor = std::io::Cursor::new(buf);
        let frame: Option<Downstream> = read_frame_async(&mut cursor).await?;
        let Some(Downstream::Todo { envelope }) = frame else {
            anyhow::bail!("frame lost");
        };
        assert_eq!(envelope.func, "count");
        Ok(())
    }
}
