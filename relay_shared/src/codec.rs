//! Reliable-stream framing and payload compression.
//!
//! Frames are a 4-byte little-endian unsigned length followed by that many
//! payload bytes. Payloads (on either transport) starting with the literal
//! `ABG:` are zlib-deflated; the decoder strips the prefix and inflates the
//! remainder. Inflation is streamed and bounded so a hostile payload cannot
//! balloon memory.

use anyhow::{bail, Context};
use bytes::{BufMut, BytesMut};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::UDP_COMPRESS_MIN;

/// Marker for deflated payloads.
pub const COMPRESS_PREFIX: &[u8] = b"ABG:";

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on an inflated payload.
pub const MAX_INFLATED_LEN: usize = 10 * 1024 * 1024;

/// Reads one length-prefixed frame. Any short read fails the stream; the
/// caller treats that as a transport failure and closes the session.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("read frame len")?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(payload)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(payload);
    w.write_all(&buf).await.context("write frame")?;
    Ok(())
}

/// Strips the `ABG:` prefix and inflates, or passes the payload through.
pub fn decode_payload(raw: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    match raw.strip_prefix(COMPRESS_PREFIX) {
        Some(deflated) => inflate(deflated, MAX_INFLATED_LEN),
        None => Ok(raw),
    }
}

/// Deflates a payload with zlib.
pub fn deflate(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(data, Compression::best());
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    encoder.read_to_end(&mut out).context("deflate payload")?;
    Ok(out)
}

/// Inflates a zlib stream, reading in chunks so the output stays under
/// `max` even for adversarial input.
pub fn inflate(data: &[u8], max: usize) -> anyhow::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = decoder.read(&mut buf).context("inflate payload")?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > max {
            bail!("inflated payload exceeds {max} bytes");
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Applies the datagram compression rule: payloads longer than
/// [`UDP_COMPRESS_MIN`] go out deflated under the `ABG:` prefix.
pub fn encode_datagram(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    if payload.len() <= UDP_COMPRESS_MIN {
        return Ok(payload.to_vec());
    }
    let mut out = COMPRESS_PREFIX.to_vec();
    out.extend_from_slice(&deflate(payload)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, b"hello frames").await?;
        write_frame(&mut a, b"").await?;
        assert_eq!(read_frame(&mut b).await?, b"hello frames");
        assert_eq!(read_frame(&mut b).await?, b"");
        Ok(())
    }

    #[tokio::test]
    async fn truncated_frame_fails() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[10, 0, 0, 0, b'x']).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn compress_roundtrip() -> anyhow::Result<()> {
        let blob = "Os:Member:Alice:0-0:".repeat(60).into_bytes();
        let wire = encode_datagram(&blob)?;
        assert!(wire.starts_with(COMPRESS_PREFIX));
        assert!(wire.len() < blob.len());
        assert_eq!(decode_payload(wire)?, blob);
        Ok(())
    }

    #[test]
    fn short_payloads_stay_plain() -> anyhow::Result<()> {
        let wire = encode_datagram(b"p")?;
        assert_eq!(wire, b"p");
        assert_eq!(decode_payload(wire)?, b"p");
        Ok(())
    }

    #[test]
    fn inflate_is_bounded() -> anyhow::Result<()> {
        let bomb = deflate(&vec![0u8; 1 << 16])?;
        assert!(inflate(&bomb, 1 << 10).is_err());
        assert_eq!(inflate(&bomb, 1 << 20)?.len(), 1 << 16);
        Ok(())
    }
}
