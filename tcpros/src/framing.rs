//! Frame I/O on an established peer connection. After the header exchange,
//! every frame is a u32 little-endian length followed by that many payload
//! bytes. Service responses carry one extra status byte ahead of the length:
//! `1` for success (payload is the serialized response), `0` for failure
//! (payload is a human-readable error string).

use anyhow::bail;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size indicate a corrupted or hostile peer; the
///  connection is closed rather than attempting to buffer them.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        bail!("refusing to send a frame of {} bytes (maximum is {})", payload.len(), MAX_FRAME_LEN);
    }
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Read one complete frame. `read_exact` blocks on partial tails until the
///  rest arrives, so a payload is only ever surfaced whole. End-of-stream on
///  the length prefix boundary is a regular close and surfaces as the
///  underlying `UnexpectedEof`.
pub async fn read_frame(stream: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        bail!("received a frame length of {} bytes (maximum is {}) - closing connection because it is apparently compromised", len, MAX_FRAME_LEN);
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Server side of a service exchange: status byte, then a regular frame with
///  either the response payload or the error text.
pub async fn write_service_reply(stream: &mut (impl AsyncWrite + Unpin), reply: Result<&[u8], &str>) -> anyhow::Result<()> {
    match reply {
        Ok(payload) => {
            stream.write_all(&[1u8]).await?;
            write_frame(stream, payload).await
        }
        Err(errmsg) => {
            stream.write_all(&[0u8]).await?;
            write_frame(stream, errmsg.as_bytes()).await
        }
    }
}

/// Client side: the outer `Result` is transport failure, the inner one is the
///  server's verdict.
pub async fn read_service_reply(stream: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Result<Bytes, String>> {
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await?;
    let payload = read_frame(stream).await?;

    match status[0] {
        1 => Ok(Ok(payload)),
        0 => Ok(Err(String::from_utf8_lossy(&payload).into_owned())),
        n => bail!("invalid service response status byte: {}", n),
    }
}
