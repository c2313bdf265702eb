//! Length-prefixed, version-tagged JSON frames.
//!
//! A frame is a big-endian `i32` length followed by that many body bytes.
//! The body starts with zero or more version-tag whitespace bytes (see
//! [`super::version`]) and then a JSON value.
//!
//! Reads consume exactly `4 + len` bytes from the stream and never buffer
//! past the declared length: the same socket subsequently carries
//! descriptors in ancillary messages, and a read-ahead would discard them.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{version, ProtocolError};

/// Upper bound on a frame body. Catalog metadata is tiny; anything near
/// this limit is a corrupt or hostile peer.
pub(crate) const MAX_FRAME_LEN: usize = 1 << 24;

/// Writes `value` as a frame tagged with `version`.
///
/// # Errors
///
/// Returns an error if serialization fails, the frame exceeds
/// [`MAX_FRAME_LEN`], or the write fails.
pub(crate) fn write_versioned_json<T, W>(
    dst: &mut W,
    value: &T,
    version: u32,
) -> Result<(), ProtocolError>
where
    T: Serialize + ?Sized,
    W: Write,
{
    let tag = version::encode_version(version);
    let body = serde_json::to_vec(value)?;
    let total = tag.len() + body.len();
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(total));
    }
    dst.write_all(&(total as i32).to_be_bytes())?;
    dst.write_all(&tag)?;
    dst.write_all(&body)?;
    Ok(())
}

/// Reads one frame, returning the decoded value and the peer's version.
///
/// A body with no whitespace prefix decodes as version 0.
///
/// # Errors
///
/// Returns an error on a malformed length, a truncated body, or a body
/// that is not valid JSON.
pub(crate) fn read_versioned_json<T, R>(src: &mut R) -> Result<(T, u32), ProtocolError>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut len_buf = [0u8; 4];
    src.read_exact(&mut len_buf)?;
    let len = i32::from_be_bytes(len_buf);
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    src.read_exact(&mut body)?;

    let tag_end = body
        .iter()
        .position(|b| !version::is_version_whitespace(*b))
        .unwrap_or(body.len());
    let version = version::decode_version(&body[..tag_end])?;
    let value = serde_json::from_slice(&body[tag_end..])?;
    Ok((value, version))
}
