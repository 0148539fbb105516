//! Length-prefixed frame I/O and the HMON handshake preamble.
//!
//! Wire format: a 4-byte big-endian total frame length (including the
//! 8-byte header itself), then the 4 magic bytes `HMON`, then the payload.
//! The framer owns no JSON semantics — it only moves bytes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::HmonError;

/// ASCII `HMON`.
pub const MAGIC: [u8; 4] = [0x48, 0x4D, 0x4F, 0x4E];

/// Minimum total frame length: the 8-byte header with an empty payload.
const MIN_FRAME_LEN: u32 = 8;

const HANDSHAKE_PAYLOADS: [&str; 2] = ["SupportedProtocols=2", "UsingProtocol=2"];

/// Which side initiated the connection, for handshake ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side dialed out; per `spec.md` §4.1, the dialing side sends
    /// each handshake frame before waiting for the peer's matching frame.
    Dialer,
    /// This side accepted an inbound connection; it receives each
    /// handshake frame first, then echoes it back.
    Acceptor,
}

/// Read one length-prefixed frame's payload from `stream`.
///
/// Validates the length is within `[8, max_frame_size]` and the magic bytes
/// are `HMON`. Fails with `HmonError::Protocol` on violation, or
/// `HmonError::Io` on a transport error / short read (including clean EOF).
pub async fn read_frame<S>(stream: &mut S, max_frame_size: u32) -> Result<Vec<u8>, HmonError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let total_len = u32::from_be_bytes(len_buf);

    if total_len < MIN_FRAME_LEN {
        return Err(HmonError::Protocol(format!(
            "frame length {total_len} is below the minimum header size of {MIN_FRAME_LEN}"
        )));
    }
    if total_len > max_frame_size {
        return Err(HmonError::Protocol(format!(
            "frame length {total_len} exceeds configured cap of {max_frame_size}"
        )));
    }

    let mut magic_buf = [0u8; 4];
    stream.read_exact(&mut magic_buf).await?;
    if magic_buf != MAGIC {
        return Err(HmonError::Protocol(format!(
            "bad magic bytes: expected {MAGIC:?}, got {magic_buf:?}"
        )));
    }

    let payload_len = (total_len - MIN_FRAME_LEN) as usize;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame carrying `payload` to `stream`.
///
/// A single `write_all` call over the assembled buffer keeps the write
/// atomic with respect to the OS socket buffer; callers that share one
/// connection across tasks still need their own serialization (see
/// `Connection`'s write mutex) since two concurrent `write_frame` calls on
/// the same stream could otherwise interleave their buffers.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), HmonError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let total_len = MIN_FRAME_LEN as usize + payload.len();
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(&(total_len as u32).to_be_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Perform the two-frame-each-way HMON handshake.
///
/// For each of the two expected payloads, the dialer writes then reads its
/// peer's echo; the acceptor reads then writes. Fails with
/// `HmonError::HandshakeFailed` on a payload mismatch; transport and
/// framing errors propagate from the inner `read_frame`/`write_frame`
/// calls, wrapped the same way.
pub async fn handshake<S>(stream: &mut S, role: Role, max_frame_size: u32) -> Result<(), HmonError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    for expected in HANDSHAKE_PAYLOADS {
        match role {
            Role::Dialer => {
                write_frame(stream, expected.as_bytes())
                    .await
                    .map_err(wrap_handshake)?;
                let received = read_frame(stream, max_frame_size)
                    .await
                    .map_err(wrap_handshake)?;
                check_payload(&received, expected)?;
            }
            Role::Acceptor => {
                let received = read_frame(stream, max_frame_size)
                    .await
                    .map_err(wrap_handshake)?;
                check_payload(&received, expected)?;
                write_frame(stream, expected.as_bytes())
                    .await
                    .map_err(wrap_handshake)?;
            }
        }
    }
    Ok(())
}

fn wrap_handshake(err: HmonError) -> HmonError {
    match err {
        HmonError::HandshakeFailed(_) => err,
        other => HmonError::HandshakeFailed(other.to_string()),
    }
}

fn check_payload(received: &[u8], expected: &str) -> Result<(), HmonError> {
    let text = std::str::from_utf8(received).map_err(|e| {
        HmonError::HandshakeFailed(format!("handshake payload was not valid UTF-8: {e}"))
    })?;
    if text != expected {
        return Err(HmonError::HandshakeFailed(format!(
            "expected handshake payload '{expected}', got '{text}'"
        )));
    }
    Ok(())
}
