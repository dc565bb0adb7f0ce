use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::id::EnvelopeId;

/// Which kind of agent an envelope is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryKind {
    /// Local delivery through a mail delivery agent.
    Mda,
    /// Relay to a remote host.
    Mta,
    /// A synthesized failure report headed back to the original sender.
    Bounce,
}

impl DeliveryKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mda => "mda",
            Self::Mta => "mta",
            Self::Bounce => "bounce",
        }
    }
}

impl Display for DeliveryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery-progress flags recorded on an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    /// The last attempt was accepted by the agent.
    #[serde(default)]
    pub accepted: bool,
    /// The last attempt was rejected outright.
    #[serde(default)]
    pub rejected: bool,
    /// The last attempt failed temporarily; the envelope stays scheduled.
    #[serde(default)]
    pub temp_failure: bool,
    /// The envelope failed permanently and is on its way out of the queue.
    #[serde(default)]
    pub perm_failure: bool,
}

/// One recipient's delivery obligation for one message.
///
/// This is the typed form the codec writes into the store's opaque blobs.
/// Times are seconds since the Unix epoch; a `last_attempt_time` of zero
/// means the envelope has never been attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Reverse-path; empty for bounce reports.
    pub sender: String,
    /// Forward-path this envelope is obliged to reach.
    pub recipient: String,
    /// Scheduler grouping key: the relay destination for MTA envelopes, a
    /// reserved name ("local", "bounce") otherwise.
    pub destination: Arc<str>,
    pub kind: DeliveryKind,
    pub creation_time: u64,
    pub last_attempt_time: u64,
    pub attempt_count: u32,
    pub expire_after_secs: u64,
    #[serde(default)]
    pub flags: StatusFlags,
}

impl Envelope {
    /// A fresh, never-attempted envelope created at `now`.
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        destination: impl Into<Arc<str>>,
        kind: DeliveryKind,
        expire_after_secs: u64,
        now: u64,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            destination: destination.into(),
            kind,
            creation_time: now,
            last_attempt_time: 0,
            attempt_count: 0,
            expire_after_secs,
            flags: StatusFlags::default(),
        }
    }

    /// Record one delivery attempt made at `now`.
    pub const fn record_attempt(&mut self, now: u64) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_time = now;
    }

    /// The slice of this envelope the scheduler and control surface need.
    #[must_use]
    pub fn summary(&self, id: EnvelopeId) -> EnvelopeSummary {
        EnvelopeSummary {
            id,
            kind: self.kind,
            destination: Arc::clone(&self.destination),
            creation_time: self.creation_time,
            last_attempt_time: self.last_attempt_time,
            attempt_count: self.attempt_count,
            expire_after_secs: self.expire_after_secs,
        }
    }
}

/// Scheduling-relevant projection of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSummary {
    pub id: EnvelopeId,
    pub kind: DeliveryKind,
    pub destination: Arc<str>,
    pub creation_time: u64,
    pub last_attempt_time: u64,
    pub attempt_count: u32,
    pub expire_after_secs: u64,
}

impl Display for EnvelopeSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Envelope:    {}\n", self.id))?;
        f.write_fmt(format_args!("Message:     {}\n", self.id.message_id()))?;
        f.write_fmt(format_args!("Kind:        {}\n", self.kind))?;
        f.write_fmt(format_args!("Destination: {}\n", self.destination))?;
        f.write_fmt(format_args!("Attempts:    {}", self.attempt_count))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::id::MessageId;

    #[test]
    fn fresh_envelope_has_no_attempts() {
        let envelope = Envelope::new("a@x", "b@y", "y", DeliveryKind::Mta, 345_600, 1000);
        assert_eq!(envelope.last_attempt_time, 0);
        assert_eq!(envelope.attempt_count, 0);
        assert_eq!(envelope.flags, StatusFlags::default());
    }

    #[test]
    fn record_attempt_bumps_count_and_time() {
        let mut envelope = Envelope::new("a@x", "b@y", "y", DeliveryKind::Mta, 345_600, 1000);
        envelope.record_attempt(1500);
        envelope.record_attempt(2500);
        assert_eq!(envelope.attempt_count, 2);
        assert_eq!(envelope.last_attempt_time, 2500);
    }

    #[test]
    fn summary_projects_scheduling_fields() {
        let envelope = Envelope::new("a@x", "b@y", "y", DeliveryKind::Mta, 345_600, 1000);
        let id = EnvelopeId::compose(MessageId::new(7), 42);
        let summary = envelope.summary(id);
        assert_eq!(summary.id, id);
        assert_eq!(summary.kind, DeliveryKind::Mta);
        assert_eq!(&*summary.destination, "y");
        assert_eq!(summary.creation_time, 1000);
    }

    #[test]
    fn kind_renders_lowercase() {
        assert_eq!(DeliveryKind::Mda.to_string(), "mda");
        assert_eq!(DeliveryKind::Mta.to_string(), "mta");
        assert_eq!(DeliveryKind::Bounce.to_string(), "bounce");
    }
}
