pub mod codec;
pub mod envelope;
pub mod id;
pub mod logging;
pub mod time;

pub use codec::CodecError;
pub use envelope::{DeliveryKind, Envelope, EnvelopeSummary, StatusFlags};
pub use id::{ENVELOPE_ID_HEX_LEN, EnvelopeId, MESSAGE_ID_HEX_LEN, MessageId, ParseIdError};
pub use time::now_secs;

pub use tracing;

/// Lifecycle signal fanned out to every serving task.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
