//! Wire protocol shared by every process version.
//!
//! Two protocol versions are in circulation: v0 and v1. A v0 owner sends a
//! bare length-prefixed JSON metadata frame and expects a single ready byte
//! back. That exchange races: the new process can believe it signalled
//! readiness even though the owner never read the byte, leaving two
//! processes that both think they own the descriptors.
//!
//! v1 closes the race with a full ready handshake. Between N, the new
//! process attempting to take ownership, and O, the current owner:
//!
//! 1. N sends [`V1_START_READY_HANDSHAKE`].
//! 2. N sends a framed `VersionInfo { version: 1 }`.
//! 3. O sends a framed `Message { msg: "stepping down" }` and closes.
//!
//! If O never sends the ack, N refuses to take ownership and the system
//! falls to zero owners, which is recoverable on the next launch. If O gets
//! an error sending the ack it must assume the send worked and step down —
//! again at worst zero owners. Two owners is the only unacceptable outcome.
//!
//! Frames carry their version as leading JSON-ignorable whitespace (see
//! [`version`]), so a v0 reader parses a v1 frame without noticing the tag.

pub(crate) mod fdpass;
pub(crate) mod frame;
pub(crate) mod version;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Latest protocol version. Peers that predate versioning are implicitly 0.
pub(crate) const PROTO_VERSION: u32 = 1;

/// Ready byte sent by a v0 receiver once it holds all descriptors.
pub(crate) const V0_NOTIFY_READY: u8 = 42;

/// First byte of the v1 ready handshake.
pub(crate) const V1_START_READY_HANDSHAKE: u8 = 0x42;

/// Ack message the owner sends before it stops serving handoffs.
pub(crate) const V1_MSG_STEPPING_DOWN: &str = "stepping down";

/// Version announcement sent by the new process in the v1 handshake.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VersionInfo {
    pub version: u32,
}

/// Free-form protocol message, currently only the stepping-down ack.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    pub msg: String,
}

/// Errors produced while encoding or decoding the handoff wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame length prefix was negative.
    #[error("invalid frame length {0}")]
    InvalidLength(i32),
    /// The frame length prefix exceeded the sanity limit.
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    /// A descriptor name met or exceeded the 4096-byte limit.
    #[error("descriptor name of {0} bytes exceeds the name limit")]
    NameTooLong(usize),
    /// A descriptor message carried the wrong number of descriptors.
    #[error("expected exactly one descriptor in the control message, got {0}")]
    AncillaryCount(usize),
    /// A version tag contained a byte outside the whitespace alphabet.
    #[error("byte {0:#04x} is not a version-tag whitespace character")]
    InvalidVersionByte(u8),
    /// The peer announced a version this process cannot handshake with.
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u32),
    /// The peer's ready byte was neither the v0 nor the v1 variant.
    #[error("unexpected ready byte {0:#04x}")]
    UnexpectedReadyByte(u8),
    /// The peer sent a message other than the one the handshake expects.
    #[error("unexpected handshake message {0:?}")]
    UnexpectedMessage(String),
    /// The frame body was not valid JSON.
    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),
    /// The underlying socket failed or closed mid-message.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
