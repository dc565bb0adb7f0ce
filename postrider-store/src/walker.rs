use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use postrider_common::{EnvelopeId, MessageId, internal};

/// Bounded traversal of every committed envelope, depth first through the
/// bucket, message, and envelope levels.
///
/// The walker records a single start timestamp at construction; envelope
/// files modified after that instant are skipped, so a pass over a live
/// queue never folds in envelopes committed while it runs. Entries that
/// fail structural validation at any level are skipped with a warning,
/// never a fatal error. Dropping the walker and creating a new one simply
/// begins a fresh pass.
///
/// Directory listings happen lazily, one directory per descent, so a caller
/// can interleave `walk_next` with other work on a large queue.
#[derive(Debug)]
pub struct QueueWalker {
    queue_dir: PathBuf,
    started_at: SystemTime,
    buckets: Option<VecDeque<(u8, PathBuf)>>,
    messages: VecDeque<(MessageId, PathBuf)>,
    envelopes: VecDeque<EnvelopeId>,
}

impl QueueWalker {
    pub(crate) fn new(queue_dir: PathBuf) -> Self {
        Self {
            queue_dir,
            started_at: SystemTime::now(),
            buckets: None,
            messages: VecDeque::new(),
            envelopes: VecDeque::new(),
        }
    }

    /// Yield the next committed envelope, or `None` once the pass is done.
    pub fn walk_next(&mut self) -> Option<EnvelopeId> {
        loop {
            if let Some(id) = self.envelopes.pop_front() {
                return Some(id);
            }

            if let Some((message, dir)) = self.messages.pop_front() {
                self.envelopes = Self::list_envelopes(message, &dir, self.started_at);
                continue;
            }

            let queue_dir = &self.queue_dir;
            let buckets = self
                .buckets
                .get_or_insert_with(|| Self::list_buckets(queue_dir));
            let (bucket, dir) = buckets.pop_front()?;
            self.messages = Self::list_messages(bucket, &dir);
        }
    }

    fn list_buckets(queue_dir: &Path) -> VecDeque<(u8, PathBuf)> {
        let mut buckets = VecDeque::new();

        let entries = match fs::read_dir(queue_dir) {
            Ok(entries) => entries,
            Err(e) => {
                internal!(level = WARN, "Unable to list queue directory {queue_dir:?}: {e}");
                return buckets;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') {
                continue;
            }

            let Some(bucket) = parse_bucket(&name) else {
                internal!(level = WARN, "Skipping malformed bucket entry {name:?}");
                continue;
            };

            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                buckets.push_back((bucket, entry.path()));
            } else {
                internal!(level = WARN, "Skipping non-directory bucket entry {name:?}");
            }
        }

        buckets
    }

    fn list_messages(bucket: u8, dir: &Path) -> VecDeque<(MessageId, PathBuf)> {
        let mut messages = VecDeque::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                internal!(level = WARN, "Unable to list bucket {dir:?}: {e}");
                return messages;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') {
                continue;
            }

            let Some(message) = MessageId::from_dirname(&name) else {
                internal!(level = WARN, "Skipping malformed message entry {name:?}");
                continue;
            };

            if message.bucket() != bucket {
                internal!(
                    level = WARN,
                    "Skipping message {message} filed under wrong bucket {bucket:02x}"
                );
                continue;
            }

            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                messages.push_back((message, entry.path()));
            } else {
                internal!(level = WARN, "Skipping non-directory message entry {name:?}");
            }
        }

        messages
    }

    fn list_envelopes(message: MessageId, dir: &Path, started_at: SystemTime) -> VecDeque<EnvelopeId> {
        let mut envelopes = VecDeque::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                internal!(level = WARN, "Unable to list message {message}: {e}");
                return envelopes;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') {
                continue;
            }

            let Some(id) = EnvelopeId::from_filename(&name) else {
                internal!(level = WARN, "Skipping malformed envelope entry {name:?}");
                continue;
            };

            if id.message_id() != message {
                internal!(
                    level = WARN,
                    "Skipping envelope {id} filed under wrong message {message}"
                );
                continue;
            }

            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    internal!(level = WARN, "Skipping unreadable envelope {id}: {e}");
                    continue;
                }
            };

            // Committed while this pass was already running; the committer
            // inserts it through the normal path.
            if modified > started_at {
                continue;
            }

            envelopes.push_back(id);
        }

        envelopes
    }
}

impl Iterator for QueueWalker {
    type Item = EnvelopeId;

    fn next(&mut self) -> Option<Self::Item> {
        self.walk_next()
    }
}

fn parse_bucket(name: &str) -> Option<u8> {
    if name.len() != 2 || !name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }

    u8::from_str_radix(name, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names_are_two_lowercase_hex_digits() {
        assert_eq!(parse_bucket("00"), Some(0x00));
        assert_eq!(parse_bucket("ab"), Some(0xab));
        assert_eq!(parse_bucket("ff"), Some(0xff));

        for name in ["", "0", "abc", "AB", "zz", "0x", ".."] {
            assert_eq!(parse_bucket(name), None, "{name:?} should not parse");
        }
    }
}
