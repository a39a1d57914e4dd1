//! Framing on a registry connection.
//!
//! * command: `u32` big endian
//! * advertisement: `u32` big-endian length, then that many bytes of JSON;
//!   a zero length means "no advertisement" (used for the optional private
//!   ad of a worker-node update)
//! * query reply: per result a `1` byte and an advertisement frame, then a
//!   single `0` byte
//! * acknowledgment: a single byte, `1` for success and `0` for failure

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::classad::Ad;
use crate::error::CollectorError;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const MORE: u8 = 1;
const END: u8 = 0;
const ACK: u8 = 1;
const NACK: u8 = 0;

/// Reads the next command code; `None` on a clean end of stream.
pub async fn read_command<R>(r: &mut R) -> Result<Option<u32>, CollectorError>
where
    R: AsyncRead + Unpin,
{
    match r.read_u32().await {
        Ok(cmd) => Ok(Some(cmd)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn write_command<W>(w: &mut W, cmd: u32) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u32(cmd).await?;
    Ok(())
}

pub async fn read_frame<R>(r: &mut R, max_size: usize) -> Result<Vec<u8>, CollectorError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u32().await? as usize;
    if len > max_size {
        return Err(CollectorError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<W>(w: &mut W, data: &[u8]) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| CollectorError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    w.write_u32(len).await?;
    w.write_all(data).await?;
    Ok(())
}

/// Reads an advertisement frame; an empty frame decodes to `None`.
pub async fn read_optional_ad<R>(r: &mut R, max_size: usize) -> Result<Option<Ad>, CollectorError>
where
    R: AsyncRead + Unpin,
{
    let buf = read_frame(r, max_size).await?;
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(Some(Ad::from_bytes(&buf)?))
}

pub async fn read_ad<R>(r: &mut R, max_size: usize) -> Result<Ad, CollectorError>
where
    R: AsyncRead + Unpin,
{
    let buf = read_frame(r, max_size).await?;
    Ad::from_bytes(&buf)
}

pub async fn write_ad<W>(w: &mut W, ad: &Ad) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, &ad.to_bytes()?).await
}

pub async fn write_optional_ad<W>(w: &mut W, ad: Option<&Ad>) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    match ad {
        Some(ad) => write_ad(w, ad).await,
        None => write_frame(w, &[]).await,
    }
}

pub async fn write_reply_item<W>(w: &mut W, ad: &Ad) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(MORE).await?;
    write_ad(w, ad).await
}

pub async fn write_reply_end<W>(w: &mut W) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(END).await?;
    w.flush().await?;
    Ok(())
}

/// Client side of a query reply.
pub async fn read_reply<R>(r: &mut R, max_size: usize) -> Result<Vec<Ad>, CollectorError>
where
    R: AsyncRead + Unpin,
{
    let mut ads = Vec::new();
    loop {
        match r.read_u8().await? {
            END => return Ok(ads),
            MORE => ads.push(read_ad(r, max_size).await?),
            other => {
                return Err(CollectorError::QueryRejected {
                    reason: format!("bad continuation flag {}", other),
                })
            }
        }
    }
}

pub async fn write_ack<W>(w: &mut W, ok: bool) -> Result<(), CollectorError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(if ok { ACK } else { NACK }).await?;
    w.flush().await?;
    Ok(())
}

/// `true` when the peer acknowledged.
pub async fn read_ack<R>(r: &mut R) -> Result<bool, CollectorError>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u8().await? == ACK)
}
