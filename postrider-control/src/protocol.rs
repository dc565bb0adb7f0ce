//! Control protocol types and serialization

use std::fmt::{Display, Formatter};

use chrono::{TimeZone, Utc, offset::LocalResult};
use postrider_common::{DeliveryKind, EnvelopeId, MessageId};
use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Format timestamp (seconds since epoch) as human-readable
fn format_timestamp(timestamp_secs: u64) -> String {
    let datetime = Utc.timestamp_opt(i64::try_from(timestamp_secs).unwrap_or(0), 0);
    if let LocalResult::Single(dt) = datetime {
        dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    } else {
        "unknown".to_string()
    }
}

/// Request sent to the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub version: u32,
    /// The actual command to execute
    pub command: RequestCommand,
}

/// Request command types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestCommand {
    /// System management commands
    System(SystemCommand),
    /// Queue management commands
    Queue(QueueCommand),
}

/// System management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Health check / ping
    Ping,
    /// Get system status and statistics
    Status,
}

/// Queue management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueCommand {
    /// Get queue statistics
    Stats,
    /// List pending envelopes
    List {
        /// Which slice of the queue to list
        scope: ListScope,
    },
    /// Make envelopes due immediately and serve them next
    Reschedule {
        /// Which envelopes to expedite
        target: RescheduleTarget,
    },
    /// Drop one envelope from the queue
    Remove {
        /// Envelope to drop
        envelope: EnvelopeId,
    },
    /// Hold back deliveries of one kind
    Pause {
        /// Kind to hold back
        kind: DeliveryKind,
    },
    /// Serve deliveries of one kind again
    Resume {
        /// Kind to release
        kind: DeliveryKind,
    },
}

/// Which slice of the queue a list request covers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ListScope {
    /// Every pending envelope
    All,
    /// Envelopes destined to one host
    Host(String),
    /// Envelopes of one message
    Message(MessageId),
}

/// Which envelopes a reschedule request covers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RescheduleTarget {
    /// Every pending envelope
    All,
    /// A single envelope
    Envelope(EnvelopeId),
    /// Every pending envelope of one message
    Message(MessageId),
}

/// Response from the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version
    pub version: u32,
    /// The actual response payload
    pub payload: ResponsePayload,
}

/// Response payload types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command succeeded
    Ok,
    /// Command succeeded with data
    Data(Box<ResponseData>),
    /// Command failed with error message
    Error(String),
}

/// Response data types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    /// System status information
    SystemStatus(SystemStatus),
    /// Queue statistics
    QueueStats(QueueStats),
    /// Pending envelope list
    Envelopes(Vec<QueueEnvelope>),
    /// How many envelopes an operation touched
    Count(usize),
    /// Simple string message
    Message(String),
}

/// System status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Server version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Number of pending envelopes
    pub pending_envelopes: usize,
    /// Delivery kinds currently paused
    pub paused_kinds: Vec<String>,
}

/// Queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending envelopes across the whole queue
    pub pending: usize,
    /// Distinct destination hosts with pending work
    pub hosts: usize,
    /// (host, message) batches with pending work
    pub batches: usize,
    /// Distinct messages with pending work
    pub messages: usize,
    /// Envelopes already eligible for an attempt
    pub due_now: usize,
    /// Pending envelope counts per delivery kind
    pub by_kind: Vec<(String, usize)>,
    /// Busiest destination hosts with their pending envelope counts
    pub top_destinations: Vec<(String, usize)>,
    /// Age of the oldest pending envelope in seconds
    pub oldest_age_secs: Option<u64>,
    /// Delivery kinds currently paused
    pub paused_kinds: Vec<String>,
}

/// Pending envelope summary (for list command)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    /// Envelope ID (16 hex digits)
    pub id: String,
    /// Delivery kind
    pub kind: String,
    /// Destination host
    pub destination: String,
    /// Number of delivery attempts
    pub attempts: u32,
    /// Time the envelope was created (Unix timestamp in seconds)
    pub created_at: u64,
    /// Time the envelope is next eligible (Unix timestamp in seconds)
    pub due_at: u64,
}

impl Display for QueueEnvelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("ID:          {}\n", self.id))?;
        f.write_fmt(format_args!("Kind:        {}\n", self.kind))?;
        f.write_fmt(format_args!("Destination: {}\n", self.destination))?;
        f.write_fmt(format_args!("Attempts:    {}\n", self.attempts))?;
        f.write_fmt(format_args!(
            "Created:     {}\n",
            format_timestamp(self.created_at)
        ))?;
        f.write_fmt(format_args!(
            "Due:         {}\n",
            format_timestamp(self.due_at)
        ))
    }
}

impl Request {
    /// Create a new request with the current protocol version
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    /// Check if the request version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        // Only exact version match is supported
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    /// Create an error response
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    /// Create a success response with no data
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    /// Create a response with data
    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    /// Check if the response indicates success (not an error)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Check if the response version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        // Only exact version match is supported
        self.version == PROTOCOL_VERSION
    }
}
