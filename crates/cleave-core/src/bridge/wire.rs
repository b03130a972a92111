//! Signed frame codec used by the TCP bridge.
//!
//! Every message is one frame:
//!
//! ```text
//! [2 bytes: version, big-endian]
//! [4 bytes: payload length, big-endian]
//! [64 bytes: lowercase hex SHA-256 of payload ++ secret]
//! [N bytes: payload]
//! ```
//!
//! The signature is verified before the payload reaches any deserializer,
//! so tampered or foreign bytes are rejected while still opaque.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::WireLimits;
use crate::error::{CleaveError, Result};

/// Version stamped on every outgoing frame and required on every incoming one.
pub const PROTOCOL_VERSION: u16 = 0;

/// Length of the hex-encoded signature field.
pub const SIGNATURE_LEN: usize = 64;

/// Compute the signature for `payload` under `secret`.
pub fn sign(payload: &[u8], secret: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(hex::encode(digest).as_bytes());
    out
}

/// Write one signed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    secret: &[u8],
) -> Result<()> {
    if payload.len() > WireLimits::MAX_FRAME_BYTES {
        return Err(CleaveError::frame(format!(
            "payload of {} bytes exceeds maximum of {}",
            payload.len(),
            WireLimits::MAX_FRAME_BYTES
        )));
    }
    let signature = sign(payload, secret);
    writer.write_all(&PROTOCOL_VERSION.to_be_bytes()).await?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&signature).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and verify one signed frame, returning its payload bytes.
///
/// Returns `None` on a clean close before any frame bytes arrive, which is
/// how readiness probes and departed peers look to a server.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    secret: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut version_buf = [0u8; 2];
    match reader.read_exact(&mut version_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let version = u16::from_be_bytes(version_buf);
    if version != PROTOCOL_VERSION {
        return Err(CleaveError::UnsupportedVersion {
            version,
            supported: PROTOCOL_VERSION,
        });
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(truncated)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > WireLimits::MAX_FRAME_BYTES {
        return Err(CleaveError::frame(format!(
            "declared payload of {len} bytes exceeds maximum of {}",
            WireLimits::MAX_FRAME_BYTES
        )));
    }

    let mut signature = [0u8; SIGNATURE_LEN];
    reader.read_exact(&mut signature).await.map_err(truncated)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;

    if signature != sign(&payload, secret) {
        return Err(CleaveError::InvalidSignature);
    }
    Ok(Some(payload))
}

fn truncated(err: std::io::Error) -> CleaveError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CleaveError::frame("connection closed mid-frame")
    } else {
        err.into()
    }
}
