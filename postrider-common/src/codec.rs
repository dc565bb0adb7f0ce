//! Envelope blob codec.
//!
//! The store moves opaque byte blobs; this codec is how the store's callers
//! give those blobs meaning. The store itself never calls it.

use bincode::config;

use crate::envelope::Envelope;

/// Failure to encode or decode an envelope blob.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("envelope decode failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The blob decoded but had bytes left over. Anything appended to or
    /// spliced onto an envelope file is corruption.
    #[error("envelope blob has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// Encode an envelope into its on-disk blob form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serde::encode_to_vec(envelope, config::legacy())?)
}

/// Decode an on-disk blob back into an envelope.
///
/// # Errors
///
/// Returns an error on malformed input, including trailing bytes; callers
/// treat any decode failure as corruption and quarantine the owning message.
pub fn decode(blob: &[u8]) -> Result<Envelope, CodecError> {
    let (envelope, read) = bincode::serde::decode_from_slice(blob, config::legacy())?;
    if read != blob.len() {
        return Err(CodecError::TrailingBytes(blob.len() - read));
    }
    Ok(envelope)
}
