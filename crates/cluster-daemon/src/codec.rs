//! Async frame I/O over any byte stream.

use bytes::BytesMut;
use cluster_core::protocol::{Frame, LENGTH_PREFIX_LEN, MAX_FRAME_SIZE};
use cluster_core::{ProtocolError, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame (length prefix included) and flush. Oversized frames are
/// rejected before anything is written.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    frame.check_size()?;
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` when the peer closed the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(Frame::decode(buf.freeze())?))
}
