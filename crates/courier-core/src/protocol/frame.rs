//! Length-prefixed frame parts.
//!
//! An envelope travels as one preamble and two parts:
//!
//! ```text
//! [u8 version][u8 flags][u32 BE len][header bytes][u32 BE len][data bytes]
//! ```

use crate::config::IpcConfig;
use crate::{CourierError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Read the two-byte preamble of the next frame.
///
/// Returns `None` on clean EOF (peer closed the connection between frames).
pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(u8, u8)>> {
    let mut preamble = [0u8; 2];
    match reader.read_exact(&mut preamble[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut preamble[1..]).await?;

    if preamble[0] != PROTOCOL_VERSION {
        return Err(CourierError::invalid_message(format!(
            "unsupported protocol version {}",
            preamble[0]
        )));
    }
    Ok(Some((preamble[0], preamble[1])))
}

/// Read the length prefix of a part, bounded by the hard part size cap.
pub async fn read_part_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let len = reader.read_u32().await? as usize;
    if len > IpcConfig::MAX_FRAME_PART_SIZE {
        return Err(CourierError::MessageTooLarge {
            size: len,
            max: IpcConfig::MAX_FRAME_PART_SIZE,
        });
    }
    Ok(len)
}

/// Read a part body of `len` bytes.
pub async fn read_part_body<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Read a complete length-prefixed part.
pub async fn read_part<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_part_len(reader).await?;
    read_part_body(reader, len).await
}

/// Consume `len` bytes without keeping them.
pub async fn skip_part_body<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<()> {
    let mut body = (&mut *reader).take(len as u64);
    let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
    if skipped != len as u64 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

/// Append a length-prefixed part to an outgoing buffer.
pub fn put_part(buf: &mut Vec<u8>, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| CourierError::MessageTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Write an already encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
