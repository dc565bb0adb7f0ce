pub mod error;
pub mod store;
pub mod walker;

pub use error::{Result, StoreError, ValidationError};
pub use store::{EnvelopeStore, EnvelopeStoreBuilder};
pub use walker::QueueWalker;
