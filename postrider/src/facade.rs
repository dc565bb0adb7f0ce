//! Queue orchestration facade.
//!
//! [`QueueFacade`] is the single surface through which session handlers,
//! delivery workers, and the control interface touch the queue. It owns the
//! durable store and the in-memory scheduler, keeps the two consistent
//! through every operation, and carries the expiration and startup-replay
//! orchestration that neither component does on its own.
//!
//! The facade is owned and mutated by exactly one task (see
//! [`crate::service`]); every operation here is synchronous and runs to
//! completion before the next is serviced.

use std::collections::{HashMap, HashSet};

use postrider_common::{
    CodecError, DeliveryKind, Envelope, EnvelopeId, EnvelopeSummary, MessageId, codec, internal,
};
use postrider_scheduler::{RescheduleSelector, RetryPolicy, SchedulerCore};
use postrider_store::{EnvelopeStore, StoreError};
use thiserror::Error;

/// Destination name synthesized bounce reports are grouped under.
const BOUNCE_DESTINATION: &str = "bounce";

/// How many destinations a statistics snapshot reports.
const TOP_DESTINATIONS: usize = 10;

/// Top-level queue error type.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An envelope blob would not encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The queue service task is no longer running.
    #[error("queue service is not running")]
    ServiceClosed,
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Counts reported by one startup replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Envelopes loaded into the scheduler.
    pub loaded: usize,
    /// Envelopes that had already expired and were bounced.
    pub expired: usize,
    /// Messages quarantined because an envelope blob would not decode.
    pub quarantined: usize,
}

/// A pending envelope paired with its scheduled due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEnvelope {
    pub summary: EnvelopeSummary,
    pub due_time: u64,
}

/// Point-in-time snapshot of queue state for the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Pending envelopes across the whole queue.
    pub pending: usize,
    /// Distinct destination hosts with pending work.
    pub hosts: usize,
    /// (host, message) batches with pending work.
    pub batches: usize,
    /// Distinct messages with pending work.
    pub messages: usize,
    /// Envelopes already eligible for an attempt.
    pub due_now: usize,
    /// Pending envelope counts per delivery kind.
    pub by_kind: Vec<(DeliveryKind, usize)>,
    /// Busiest destinations with their pending envelope counts.
    pub top_destinations: Vec<(String, usize)>,
    /// Creation time of the oldest pending envelope.
    pub oldest_creation_time: Option<u64>,
    /// Delivery kinds currently paused.
    pub paused_kinds: Vec<DeliveryKind>,
}

/// Orchestration surface over the durable store and the scheduler.
///
/// Envelopes created through [`create_envelope`](Self::create_envelope) are
/// persisted immediately but stay invisible to the scheduler until their
/// message commits; the facade tracks those open sessions so commit can
/// schedule every envelope of the message in creation order.
#[derive(Debug)]
pub struct QueueFacade {
    store: EnvelopeStore,
    scheduler: SchedulerCore,
    /// Still-open sessions, keyed at message creation, each holding its
    /// envelopes' summaries in creation order. Drained into the scheduler
    /// at commit, discarded on rollback. A message absent here has already
    /// committed.
    open_sessions: HashMap<MessageId, Vec<EnvelopeSummary>>,
}

impl QueueFacade {
    /// Create a facade over `store`, scheduling retries with `policy`.
    #[must_use]
    pub fn new(store: EnvelopeStore, policy: RetryPolicy) -> Self {
        Self {
            store,
            scheduler: SchedulerCore::new(policy),
            open_sessions: HashMap::new(),
        }
    }

    /// Open a new message session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot claim a fresh message id.
    pub fn create_message(&mut self) -> Result<MessageId> {
        let message = self.store.create_message()?;
        self.open_sessions.insert(message, Vec::new());

        Ok(message)
    }

    /// Persist an envelope under `message`.
    ///
    /// Under an open session the envelope is durable from here on but is
    /// not scheduled until [`commit_message`](Self::commit_message). Under
    /// an already-committed message the store writes straight into the
    /// queue, so the envelope is scheduled immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the store cannot claim a
    /// fresh envelope id.
    pub fn create_envelope(
        &mut self,
        message: MessageId,
        envelope: &Envelope,
        now: u64,
    ) -> Result<EnvelopeId> {
        let blob = codec::encode(envelope)?;
        let id = self.store.create_envelope(message, &blob)?;

        if let Some(session) = self.open_sessions.get_mut(&message) {
            session.push(envelope.summary(id));
            return Ok(id);
        }

        self.scheduler.insert(envelope.summary(id), now);
        internal!(level = DEBUG, "Envelope {id} joined committed message {message}");

        Ok(id)
    }

    /// Commit a message, making every envelope of its session visible and
    /// scheduled. Returns the number of envelopes scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot move the message into the
    /// queue; no envelope is scheduled in that case.
    pub fn commit_message(&mut self, message: MessageId, now: u64) -> Result<usize> {
        self.store.commit_message(message)?;

        let summaries = self.open_sessions.remove(&message).unwrap_or_default();
        let count = summaries.len();
        for summary in summaries {
            self.scheduler.insert(summary, now);
        }

        internal!(level = DEBUG, "Committed message {message} with {count} envelope(s)");

        Ok(count)
    }

    /// Roll back an uncommitted message, discarding its session and every
    /// envelope persisted under it. Returns the number of envelopes
    /// discarded.
    ///
    /// Committed messages leave the queue envelope by envelope, never
    /// through this path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageNotFound`] if the message has no
    /// uncommitted directory, or an I/O error.
    pub fn delete_message(&mut self, message: MessageId) -> Result<usize> {
        self.store.delete_message(message)?;
        let discarded = self.open_sessions.remove(&message).map_or(0, |s| s.len());

        internal!(level = DEBUG, "Rolled back message {message}, discarding {discarded} envelope(s)");

        Ok(discarded)
    }

    /// Load and decode a committed envelope.
    ///
    /// Uncommitted and deleted envelopes read as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the blob will not decode.
    pub fn load_envelope(&self, id: EnvelopeId) -> Result<Option<Envelope>> {
        match self.store.load_envelope(id)? {
            Some(blob) => Ok(Some(codec::decode(&blob)?)),
            None => Ok(None),
        }
    }

    /// Persist an envelope's updated attempt history and reschedule it.
    ///
    /// This is the temporary-failure path: the worker records the attempt
    /// on the envelope, and the facade computes the next due time from the
    /// updated history. An envelope past its lifetime is not rescheduled;
    /// it bounces and leaves the queue instead. An envelope whose message
    /// has not committed is amended in its session and stays unscheduled.
    ///
    /// # Errors
    ///
    /// Returns an error on encode or store failure; the scheduler entry is
    /// untouched in that case.
    pub fn update_envelope(&mut self, id: EnvelopeId, envelope: &Envelope, now: u64) -> Result<()> {
        if RetryPolicy::is_expired(envelope.creation_time, envelope.expire_after_secs, now) {
            return self.expire_envelope(id, envelope, now);
        }

        let blob = codec::encode(envelope)?;
        self.store.update_envelope(id, &blob)?;

        if self.scheduler.contains(id) {
            self.scheduler.remove(id);
            let due = self.scheduler.insert(envelope.summary(id), now);

            internal!(level = DEBUG, "Envelope {id} rescheduled, due at {due}");
        } else if let Some(summary) = self
            .open_sessions
            .get_mut(&id.message_id())
            .and_then(|session| session.iter_mut().find(|summary| summary.id == id))
        {
            *summary = envelope.summary(id);
        }

        Ok(())
    }

    /// Remove an envelope from the store, the scheduler, and its session.
    ///
    /// This is the success and permanent-failure path; it also serves a
    /// session aborting one of its own envelopes before commit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EnvelopeNotFound`] if the envelope has no
    /// file, or an I/O error.
    pub fn delete_envelope(&mut self, id: EnvelopeId) -> Result<()> {
        self.store.delete_envelope(id)?;
        if self.scheduler.contains(id) {
            self.scheduler.remove(id);
        }
        self.forget_session_envelope(id);

        Ok(())
    }

    /// The next envelope eligible for a delivery attempt, skipping paused
    /// kinds. `None` while nothing has come due.
    #[must_use]
    pub fn next_due(&self, now: u64) -> Option<EnvelopeId> {
        let id = self.scheduler.peek_next()?;
        let due = self.scheduler.due_time(id)?;
        (due <= now).then_some(id)
    }

    /// Due time of the scheduler head, for arming the service wakeup.
    ///
    /// Unlike [`next_due`](Self::next_due) this does not gate on `now`.
    #[must_use]
    pub fn head_due_time(&self) -> Option<u64> {
        let id = self.scheduler.peek_next()?;
        self.scheduler.due_time(id)
    }

    /// Expedite pending envelopes, making them due immediately and ahead
    /// of everything else. Returns how many matched.
    pub fn reschedule(&mut self, selector: RescheduleSelector, now: u64) -> usize {
        self.scheduler.reschedule(selector, now)
    }

    /// The tracked summary and due time for a pending envelope.
    #[must_use]
    pub fn pending_envelope(&self, id: EnvelopeId) -> Option<PendingEnvelope> {
        let summary = self.scheduler.summary(id)?.clone();
        let due_time = self.scheduler.due_time(id)?;
        Some(PendingEnvelope { summary, due_time })
    }

    /// Every pending envelope destined to `host`.
    #[must_use]
    pub fn host_envelopes(&self, host: &str) -> Vec<PendingEnvelope> {
        let ids: Vec<EnvelopeId> = self.scheduler.host_envelopes(host).map(|s| s.id).collect();
        self.collect_pending(&ids)
    }

    /// Every pending envelope of `message`.
    #[must_use]
    pub fn message_envelopes(&self, message: MessageId) -> Vec<PendingEnvelope> {
        let ids: Vec<EnvelopeId> = self
            .scheduler
            .message_envelopes(message)
            .map(|s| s.id)
            .collect();
        self.collect_pending(&ids)
    }

    /// Every pending envelope in service order.
    #[must_use]
    pub fn all_envelopes(&self) -> Vec<PendingEnvelope> {
        let ids: Vec<EnvelopeId> = self.scheduler.all_envelopes().map(|s| s.id).collect();
        self.collect_pending(&ids)
    }

    fn collect_pending(&self, ids: &[EnvelopeId]) -> Vec<PendingEnvelope> {
        ids.iter()
            .filter_map(|&id| self.pending_envelope(id))
            .collect()
    }

    /// Stop serving envelopes of `kind` from [`next_due`](Self::next_due).
    pub fn pause(&mut self, kind: DeliveryKind) {
        self.scheduler.pause(kind);
    }

    /// Resume serving envelopes of `kind`.
    pub fn resume(&mut self, kind: DeliveryKind) {
        self.scheduler.resume(kind);
    }

    /// Delivery kinds currently paused.
    #[must_use]
    pub fn paused_kinds(&self) -> Vec<DeliveryKind> {
        [DeliveryKind::Mda, DeliveryKind::Mta, DeliveryKind::Bounce]
            .into_iter()
            .filter(|&kind| self.scheduler.is_paused(kind))
            .collect()
    }

    /// Snapshot queue statistics as of `now`.
    #[must_use]
    pub fn stats(&self, now: u64) -> QueueStats {
        let mut by_kind: Vec<(DeliveryKind, usize)> = [
            (DeliveryKind::Mda, 0),
            (DeliveryKind::Mta, 0),
            (DeliveryKind::Bounce, 0),
        ]
        .into();
        let mut destinations: HashMap<String, usize> = HashMap::new();
        let mut oldest_creation_time = None;
        let mut due_now = 0;

        for summary in self.scheduler.all_envelopes() {
            if let Some(entry) = by_kind.iter_mut().find(|(kind, _)| *kind == summary.kind) {
                entry.1 += 1;
            }
            *destinations
                .entry(summary.destination.to_string())
                .or_insert(0) += 1;
            oldest_creation_time = Some(
                oldest_creation_time.map_or(summary.creation_time, |oldest: u64| {
                    oldest.min(summary.creation_time)
                }),
            );
            if self
                .scheduler
                .due_time(summary.id)
                .is_some_and(|due| due <= now)
            {
                due_now += 1;
            }
        }

        let mut top_destinations: Vec<(String, usize)> = destinations.into_iter().collect();
        top_destinations.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_destinations.truncate(TOP_DESTINATIONS);

        QueueStats {
            pending: self.scheduler.len(),
            hosts: self.scheduler.host_count(),
            batches: self.scheduler.batch_count(),
            messages: self.scheduler.message_count(),
            due_now,
            by_kind,
            top_destinations,
            oldest_creation_time,
            paused_kinds: self.paused_kinds(),
        }
    }

    /// Rebuild the scheduler from the durable queue.
    ///
    /// Walks every committed envelope: undecodable blobs quarantine their
    /// whole message, already-expired envelopes bounce and leave, and the
    /// rest are scheduled from their recorded attempt history. Runs once at
    /// startup, before any command is serviced.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; decode failures are handled by
    /// quarantine and never surface here.
    pub fn replay(&mut self, now: u64) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let mut quarantined: HashSet<MessageId> = HashSet::new();

        let walker = self.store.walk();
        for id in walker {
            let message = id.message_id();
            if quarantined.contains(&message) {
                continue;
            }
            // A bounce synthesized earlier in this pass is already
            // scheduled; a coarse-mtime filesystem can let its file
            // through the walker's cutoff.
            if self.scheduler.contains(id) {
                continue;
            }

            let Some(blob) = self.store.load_envelope(id)? else {
                continue;
            };

            match codec::decode(&blob) {
                Ok(envelope) => {
                    if RetryPolicy::is_expired(
                        envelope.creation_time,
                        envelope.expire_after_secs,
                        now,
                    ) {
                        self.expire_envelope(id, &envelope, now)?;
                        report.expired += 1;
                    } else {
                        self.scheduler.insert(envelope.summary(id), now);
                        report.loaded += 1;
                    }
                }
                Err(error) => {
                    internal!(
                        level = WARN,
                        "Envelope {id} is corrupt ({error}), quarantining message {message}"
                    );
                    let target = self.store.quarantine_message(message)?;
                    internal!(level = WARN, "Message {message} moved to {target:?}");

                    // Siblings scheduled earlier in this pass just lost
                    // their files to the quarantine move.
                    let siblings: Vec<EnvelopeId> = self
                        .scheduler
                        .message_envelopes(message)
                        .map(|s| s.id)
                        .collect();
                    report.loaded = report.loaded.saturating_sub(siblings.len());
                    for sibling in siblings {
                        self.scheduler.remove(sibling);
                    }

                    quarantined.insert(message);
                    report.quarantined += 1;
                }
            }
        }

        Ok(report)
    }

    /// Bounce an envelope whose queue lifetime ran out.
    ///
    /// The bounce report is committed as a new message before the expired
    /// original is deleted, so there is never a moment with zero live
    /// copies of the obligation. An expired bounce report is dropped
    /// without synthesizing another; its sender is long gone.
    fn expire_envelope(&mut self, id: EnvelopeId, envelope: &Envelope, now: u64) -> Result<()> {
        if envelope.kind == DeliveryKind::Bounce {
            internal!(
                level = WARN,
                "Failure report {id} expired undelivered, dropping it"
            );
            self.remove_expired(id)?;
            return Ok(());
        }

        let bounce = Envelope::new(
            "",
            envelope.sender.clone(),
            BOUNCE_DESTINATION,
            DeliveryKind::Bounce,
            envelope.expire_after_secs,
            now,
        );

        let message = self.create_message()?;
        let bounce_id = self.create_envelope(message, &bounce, now)?;
        self.commit_message(message, now)?;

        internal!(
            level = WARN,
            "Envelope {id} expired after {} attempt(s), bounced as {bounce_id}",
            envelope.attempt_count
        );

        self.remove_expired(id)
    }

    fn remove_expired(&mut self, id: EnvelopeId) -> Result<()> {
        self.store.delete_envelope(id)?;
        // During replay the expired envelope was never scheduled.
        if self.scheduler.contains(id) {
            self.scheduler.remove(id);
        }
        self.forget_session_envelope(id);

        Ok(())
    }

    /// Drop `id` from its open session, if its message still has one. An
    /// emptied session is closed outright: the store removed the message
    /// directory along with its last envelope.
    fn forget_session_envelope(&mut self, id: EnvelopeId) {
        let message = id.message_id();
        if let Some(session) = self.open_sessions.get_mut(&message) {
            session.retain(|summary| summary.id != id);
            if session.is_empty() {
                self.open_sessions.remove(&message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts() {
        let error = QueueError::from(StoreError::EnvelopeNotFound(EnvelopeId::new(1)));
        assert!(matches!(error, QueueError::Store(_)));
    }

    #[test]
    fn codec_error_converts() {
        let Err(error) = codec::decode(&[0xff; 8]) else {
            panic!("garbage decoded");
        };
        assert!(matches!(QueueError::from(error), QueueError::Codec(_)));
    }
}
