//! Control protocol for managing a running postrider instance
//!
//! This module provides an IPC mechanism using Unix domain sockets to:
//! - Inspect and reschedule queued envelopes
//! - Pause and resume delivery kinds
//! - Check system health
//!
//! The protocol uses bincode for efficient serialization.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    ListScope, PROTOCOL_VERSION, QueueCommand, Request, RequestCommand, RescheduleTarget, Response,
    ResponsePayload, SystemCommand,
};
pub use server::{CommandHandler, ControlServer};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/postrider.sock";
