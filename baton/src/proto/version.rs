//! Protocol version encoded as JSON-ignorable whitespace.
//!
//! JSON permits four insignificant whitespace characters, which gives two
//! bits per byte. A `u32` is emitted from the least significant nibble up,
//! two whitespace bytes per nibble, stopping once the remaining value is
//! zero. The empty encoding is version 0, which is exactly what a peer that
//! predates versioning produces.

use super::ProtocolError;

/// Encodes a version as a whitespace prefix for a JSON frame body.
pub(crate) fn encode_version(mut version: u32) -> Vec<u8> {
    let mut out = Vec::new();
    while version > 0 {
        let nibble = (version & 0xf) as u8;
        version >>= 4;
        out.push(encode_crumb(nibble & 0x3));
        out.push(encode_crumb(nibble >> 2));
    }
    out
}

/// Decodes a whitespace prefix back into a version.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidVersionByte`] if a byte is outside the
/// whitespace alphabet.
pub(crate) fn decode_version(data: &[u8]) -> Result<u32, ProtocolError> {
    let mut version: u32 = 0;
    for &b in data.iter().rev() {
        version = version.wrapping_shl(2) | u32::from(decode_crumb(b)?);
    }
    Ok(version)
}

/// Whether a byte belongs to the version-tag whitespace alphabet.
pub(crate) fn is_version_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn encode_crumb(crumb: u8) -> u8 {
    match crumb & 0x3 {
        0 => b' ',
        1 => b'\t',
        2 => b'\r',
        _ => b'\n',
    }
}

fn decode_crumb(b: u8) -> Result<u8, ProtocolError> {
    match b {
        b' ' => Ok(0),
        b'\t' => Ok(1),
        b'\r' => Ok(2),
        b'\n' => Ok(3),
        other => Err(ProtocolError::InvalidVersionByte(other)),
    }
}
