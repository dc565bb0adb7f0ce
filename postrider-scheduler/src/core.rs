//! Time-ordered in-memory index over pending envelopes.
//!
//! The core tracks every pending envelope in four containers at once: a
//! global due-time index, a front-of-queue lane for expedited work, a host
//! index grouping envelopes into per-message batches, and a message index.
//! All containers key by envelope id, so removal is a handful of map
//! deletes and orphan nodes cannot hide behind dangling pointers. The core
//! is rebuildable at any time by walking the store and re-inserting
//! whatever it yields.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use ahash::AHashMap;
use postrider_common::{DeliveryKind, EnvelopeId, EnvelopeSummary, MessageId, internal};

use crate::policy::RetryPolicy;

/// Which pending envelopes a reschedule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleSelector {
    /// Every pending envelope.
    All,
    /// A single envelope.
    Envelope(EnvelopeId),
    /// Every pending envelope of one message.
    Message(MessageId),
}

#[derive(Debug)]
struct Entry {
    summary: EnvelopeSummary,
    due_time: u64,
    seq: u64,
    expedited: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct PausedKinds {
    mda: bool,
    mta: bool,
    bounce: bool,
}

impl PausedKinds {
    const fn get(self, kind: DeliveryKind) -> bool {
        match kind {
            DeliveryKind::Mda => self.mda,
            DeliveryKind::Mta => self.mta,
            DeliveryKind::Bounce => self.bounce,
        }
    }

    const fn set(&mut self, kind: DeliveryKind, value: bool) {
        match kind {
            DeliveryKind::Mda => self.mda = value,
            DeliveryKind::Mta => self.mta = value,
            DeliveryKind::Bounce => self.bounce = value,
        }
    }
}

/// In-memory scheduling state for the whole queue.
///
/// Owned and mutated by a single task; due times come from the configured
/// [`RetryPolicy`] at insertion. Envelopes with equal due times are served
/// in insertion order.
#[derive(Debug)]
pub struct SchedulerCore {
    policy: RetryPolicy,
    entries: AHashMap<EnvelopeId, Entry>,
    /// Global index, ascending by `(due_time, insertion seq)`.
    by_due: BTreeMap<(u64, u64), EnvelopeId>,
    /// Expedited lane, served before anything in `by_due`.
    expedited: VecDeque<EnvelopeId>,
    /// Host name to per-message batches of envelope ids.
    hosts: AHashMap<Arc<str>, AHashMap<MessageId, BTreeSet<EnvelopeId>>>,
    messages: AHashMap<MessageId, BTreeSet<EnvelopeId>>,
    paused: PausedKinds,
    next_seq: u64,
}

impl SchedulerCore {
    /// Create an empty scheduler driven by `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: AHashMap::new(),
            by_due: BTreeMap::new(),
            expedited: VecDeque::new(),
            hosts: AHashMap::new(),
            messages: AHashMap::new(),
            paused: PausedKinds::default(),
            next_seq: 0,
        }
    }

    /// Add a pending envelope, computing its due time from its attempt
    /// history. Returns the due time.
    ///
    /// Inserting an id the scheduler already tracks is a caller bug: fatal
    /// in debug builds, logged and ignored in release builds.
    pub fn insert(&mut self, summary: EnvelopeSummary, now: u64) -> u64 {
        let id = summary.id;
        if let Some(existing) = self.entries.get(&id) {
            debug_assert!(false, "duplicate insert of envelope {id}");
            internal!(level = WARN, "Ignoring duplicate insert of envelope {id}");
            return existing.due_time;
        }

        let due_time = self.policy.next_due(
            summary.kind,
            summary.attempt_count,
            summary.last_attempt_time,
            now,
        );
        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_due.insert((due_time, seq), id);
        self.hosts
            .entry(Arc::clone(&summary.destination))
            .or_default()
            .entry(id.message_id())
            .or_default()
            .insert(id);
        self.messages.entry(id.message_id()).or_default().insert(id);
        self.entries.insert(
            id,
            Entry {
                summary,
                due_time,
                seq,
                expedited: false,
            },
        );

        due_time
    }

    /// Detach an envelope from every container, dropping batch, host, and
    /// message nodes that become empty.
    ///
    /// Removing an id the scheduler does not track is a caller bug: fatal
    /// in debug builds, logged and ignored in release builds.
    pub fn remove(&mut self, id: EnvelopeId) {
        let Some(entry) = self.entries.remove(&id) else {
            debug_assert!(false, "removal of untracked envelope {id}");
            internal!(level = WARN, "Ignoring removal of untracked envelope {id}");
            return;
        };

        if entry.expedited {
            self.expedited.retain(|queued| *queued != id);
        } else {
            self.by_due.remove(&(entry.due_time, entry.seq));
        }

        let message = id.message_id();

        if let Some(batches) = self.hosts.get_mut(&entry.summary.destination) {
            if let Some(batch) = batches.get_mut(&message) {
                batch.remove(&id);
                if batch.is_empty() {
                    batches.remove(&message);
                }
            }
            if batches.is_empty() {
                self.hosts.remove(&entry.summary.destination);
            }
        }

        if let Some(envelopes) = self.messages.get_mut(&message) {
            envelopes.remove(&id);
            if envelopes.is_empty() {
                self.messages.remove(&message);
            }
        }
    }

    /// The first envelope in service order whose kind is not paused,
    /// without removing it. Expedited envelopes come first, then the
    /// due-time index; no attention is paid to whether the head is due yet.
    #[must_use]
    pub fn peek_next(&self) -> Option<EnvelopeId> {
        self.expedited
            .iter()
            .chain(self.by_due.values())
            .copied()
            .find(|id| !self.is_kind_paused(*id))
    }

    /// Make every selected envelope due at `now` and move it into the
    /// expedited lane, ahead of the whole due-time index. Returns how many
    /// envelopes matched.
    pub fn reschedule(&mut self, selector: RescheduleSelector, now: u64) -> usize {
        let matched: Vec<EnvelopeId> = match selector {
            RescheduleSelector::Envelope(id) => {
                if self.entries.contains_key(&id) {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            RescheduleSelector::Message(message) => match self.messages.get(&message) {
                Some(envelopes) => self.in_service_order(envelopes),
                None => Vec::new(),
            },
            RescheduleSelector::All => self
                .expedited
                .iter()
                .chain(self.by_due.values())
                .copied()
                .collect(),
        };

        for id in &matched {
            self.expedite(*id, now);
        }

        matched.len()
    }

    fn expedite(&mut self, id: EnvelopeId, now: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        let previous = (entry.due_time, entry.seq);
        entry.due_time = now;

        // Already in the expedited lane; keep its position there.
        if entry.expedited {
            return;
        }

        entry.expedited = true;
        self.by_due.remove(&previous);
        self.expedited.push_back(id);
    }

    /// Members of `set` ordered the way service would reach them.
    fn in_service_order(&self, set: &BTreeSet<EnvelopeId>) -> Vec<EnvelopeId> {
        self.expedited
            .iter()
            .chain(self.by_due.values())
            .copied()
            .filter(|id| set.contains(id))
            .collect()
    }

    fn is_kind_paused(&self, id: EnvelopeId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| self.paused.get(entry.summary.kind))
    }

    /// Stop serving envelopes of `kind` from `peek_next`.
    pub fn pause(&mut self, kind: DeliveryKind) {
        self.paused.set(kind, true);
        internal!(level = INFO, "Paused {kind} deliveries");
    }

    /// Serve envelopes of `kind` again.
    pub fn resume(&mut self, kind: DeliveryKind) {
        self.paused.set(kind, false);
        internal!(level = INFO, "Resumed {kind} deliveries");
    }

    /// Whether envelopes of `kind` are currently held back.
    #[must_use]
    pub const fn is_paused(&self, kind: DeliveryKind) -> bool {
        self.paused.get(kind)
    }

    /// Every pending envelope destined to `host` (for control interface).
    pub fn host_envelopes<'a>(
        &'a self,
        host: &str,
    ) -> impl Iterator<Item = &'a EnvelopeSummary> + 'a {
        self.hosts
            .get(host)
            .into_iter()
            .flat_map(|batches| batches.values())
            .flatten()
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.summary))
    }

    /// Every pending envelope of `message` (for control interface).
    pub fn message_envelopes(
        &self,
        message: MessageId,
    ) -> impl Iterator<Item = &EnvelopeSummary> + '_ {
        self.messages
            .get(&message)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.summary))
    }

    /// Every pending envelope in service order (for control interface).
    pub fn all_envelopes(&self) -> impl Iterator<Item = &EnvelopeSummary> + '_ {
        self.expedited
            .iter()
            .chain(self.by_due.values())
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.summary))
    }

    /// The tracked summary for `id`, if pending.
    #[must_use]
    pub fn summary(&self, id: EnvelopeId) -> Option<&EnvelopeSummary> {
        self.entries.get(&id).map(|entry| &entry.summary)
    }

    /// The due time for `id`, if pending.
    #[must_use]
    pub fn due_time(&self, id: EnvelopeId) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.due_time)
    }

    /// Whether `id` is pending.
    #[must_use]
    pub fn contains(&self, id: EnvelopeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of pending envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any envelopes are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct destination hosts with pending work.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Number of (host, message) batches with pending work.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.hosts.values().map(|batches| batches.len()).sum()
    }

    /// Number of distinct messages with pending work.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The policy due times are computed with.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn summary(id: u64, kind: DeliveryKind, host: &str) -> EnvelopeSummary {
        EnvelopeSummary {
            id: EnvelopeId::new(id),
            kind,
            destination: Arc::from(host),
            creation_time: 1000,
            last_attempt_time: 0,
            attempt_count: 0,
            expire_after_secs: 345_600,
        }
    }

    fn core() -> SchedulerCore {
        SchedulerCore::new(RetryPolicy {
            jitter_window_secs: 0,
            ..RetryPolicy::default()
        })
    }

    #[test]
    fn test_insert_tracks_all_indices() {
        let mut core = core();
        let envelope = summary(0x0000_0001_0000_0001, DeliveryKind::Mta, "x");

        let due = core.insert(envelope, 1000);

        assert_eq!(due, 1000, "never attempted means due now");
        assert_eq!(core.len(), 1);
        assert_eq!(core.host_count(), 1);
        assert_eq!(core.batch_count(), 1);
        assert_eq!(core.message_count(), 1);
        assert_eq!(core.due_time(EnvelopeId::new(0x0000_0001_0000_0001)), Some(1000));
    }

    #[test]
    fn test_batches_group_by_message_and_host() {
        let mut core = core();
        core.insert(summary(0x0000_0001_0000_0001, DeliveryKind::Mta, "x"), 1000);
        core.insert(summary(0x0000_0001_0000_0002, DeliveryKind::Mta, "x"), 1000);
        core.insert(summary(0x0000_0002_0000_0001, DeliveryKind::Mta, "x"), 1000);
        core.insert(summary(0x0000_0002_0000_0002, DeliveryKind::Mta, "y"), 1000);

        assert_eq!(core.host_count(), 2);
        assert_eq!(core.batch_count(), 3, "x carries two messages, y one");
        assert_eq!(core.message_count(), 2);
        assert_eq!(core.host_envelopes("x").count(), 3);
        assert_eq!(core.host_envelopes("y").count(), 1);
        assert_eq!(
            core.message_envelopes(MessageId::new(0x0000_0001)).count(),
            2
        );
    }

    #[test]
    fn test_pause_flags_cover_each_kind() {
        let mut core = core();
        assert!(!core.is_paused(DeliveryKind::Mta));

        core.pause(DeliveryKind::Mta);
        core.pause(DeliveryKind::Bounce);
        assert!(core.is_paused(DeliveryKind::Mta));
        assert!(core.is_paused(DeliveryKind::Bounce));
        assert!(!core.is_paused(DeliveryKind::Mda));

        core.resume(DeliveryKind::Mta);
        assert!(!core.is_paused(DeliveryKind::Mta));
        assert!(core.is_paused(DeliveryKind::Bounce));
    }

    #[test]
    fn test_remove_of_untracked_id_is_ignored_in_release() {
        // Exercised only where debug assertions are off; the contract in
        // debug builds is a panic.
        if cfg!(debug_assertions) {
            return;
        }

        let mut core = core();
        core.remove(EnvelopeId::new(0x0000_0009_0000_0009));
        assert!(core.is_empty());
    }
}
