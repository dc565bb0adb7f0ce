use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Width of a message id rendered as lowercase hex.
pub const MESSAGE_ID_HEX_LEN: usize = 8;
/// Width of an envelope id rendered as lowercase hex.
pub const ENVELOPE_ID_HEX_LEN: usize = 16;

/// Identifier for a queued message: the content blob one or more envelopes
/// share.
///
/// Rendered on disk as exactly eight lowercase hex digits, which is also the
/// message's directory name in the queue hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u32);

impl MessageId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The disk bucket this message lives under: the top byte of the id.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, reason = "top byte always fits")]
    pub const fn bucket(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Parse a message directory name.
    ///
    /// Accepts exactly [`MESSAGE_ID_HEX_LEN`] lowercase hex digits and
    /// nothing else, so a hostile or stray directory entry can never resolve
    /// to an id.
    pub fn from_dirname(name: &str) -> Option<Self> {
        parse_fixed_hex(name, MESSAGE_ID_HEX_LEN)
            .and_then(|v| u32::try_from(v).ok())
            .map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_dirname(s).ok_or(ParseIdError::Message)
    }
}

/// Identifier for a single envelope: one recipient's delivery obligation.
///
/// The high 32 bits are the owning [`MessageId`]; the low 32 bits are a
/// random nonzero disambiguator assigned at creation. Rendered on disk as
/// exactly sixteen lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(u64);

impl EnvelopeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Compose an envelope id from its message half and random half.
    #[must_use]
    pub const fn compose(message: MessageId, discriminant: u32) -> Self {
        Self(((message.value() as u64) << 32) | discriminant as u64)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The message this envelope belongs to, always `id >> 32`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, reason = "high half always fits")]
    pub const fn message_id(self) -> MessageId {
        MessageId::new((self.0 >> 32) as u32)
    }

    /// Parse an envelope filename.
    ///
    /// Accepts exactly [`ENVELOPE_ID_HEX_LEN`] lowercase hex digits and
    /// nothing else.
    pub fn from_filename(name: &str) -> Option<Self> {
        parse_fixed_hex(name, ENVELOPE_ID_HEX_LEN).map(Self)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for EnvelopeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_filename(s).ok_or(ParseIdError::Envelope)
    }
}

/// Failure to parse an identifier from its fixed-width hex rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("invalid message id: expected {MESSAGE_ID_HEX_LEN} lowercase hex digits")]
    Message,
    #[error("invalid envelope id: expected {ENVELOPE_ID_HEX_LEN} lowercase hex digits")]
    Envelope,
}

/// Strict fixed-width lowercase hex parse.
///
/// Rejects separators, uppercase, and any length mismatch; this is the only
/// gate between directory entries and ids, so it refuses anything that is
/// not byte-for-byte a rendered id.
fn parse_fixed_hex(name: &str, width: usize) -> Option<u64> {
    if name.len() != width {
        return None;
    }

    let mut value: u64 = 0;
    for byte in name.bytes() {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            _ => return None,
        };
        value = (value << 4) | u64::from(digit);
    }

    Some(value)
}
