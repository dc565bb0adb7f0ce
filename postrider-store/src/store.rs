use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use postrider_common::{EnvelopeId, MessageId, internal};
use rand::Rng;
use serde::Deserialize;

use crate::{
    error::{Result, StoreError, ValidationError},
    walker::QueueWalker,
};

/// Subdirectory holding committed messages, bucketed by the id's top byte.
pub(crate) const QUEUE_DIR: &str = "queue";
/// Subdirectory holding messages still open in a session.
const INCOMING_DIR: &str = "incoming";
/// Subdirectory quarantined messages are moved into.
const CORRUPT_DIR: &str = "corrupt";
/// Prefix for in-flight temporary writes. Never parses as an id, so walkers
/// and listings skip these without special cases.
const TMP_PREFIX: &str = ".tmp_";

/// Bounded attempt count for random id allocation.
const ID_DRAW_ATTEMPTS: u32 = 20;
/// Bounded probe count for a free quarantine slot.
const QUARANTINE_SLOTS: u32 = 1000;

/// Crash-durable envelope store over a bucketed directory hierarchy.
///
/// Layout under the root:
/// - `queue/<bucket>/<message>/<envelope>` - committed envelopes, where
///   `bucket` is the top byte of the message id as two hex digits, so no
///   single directory ever holds more than ~1/256 of the live messages
/// - `incoming/<message>/<envelope>` - envelopes of messages a session has
///   created but not yet committed
/// - `corrupt/<message>[.<n>]` - quarantined messages
///
/// The store moves opaque byte blobs; it never interprets envelope content.
///
/// # Atomicity
///
/// Envelope content is always written to a `.tmp_` sibling, flushed and
/// synced, then renamed over the final name, so a reader never observes a
/// torn blob and a crash leaves only ignorable temporaries. Id allocation
/// claims the final name with an exclusive create before any content is
/// written; commit is a single directory rename.
///
/// # Security
///
/// The root path is validated against traversal components and system
/// directories, and every directory entry must parse as a fixed-width hex id
/// before the store will touch it.
#[derive(Debug, Clone)]
pub struct EnvelopeStore {
    root: PathBuf,
}

impl Default for EnvelopeStore {
    fn default() -> Self {
        Self {
            root: PathBuf::from(defaults::ROOT),
        }
    }
}

mod defaults {
    pub(super) const ROOT: &str = "/var/spool/postrider";
}

// Custom Deserialize implementation with root validation
impl<'de> Deserialize<'de> for EnvelopeStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct EnvelopeStoreHelper {
            path: PathBuf,
        }

        let helper = EnvelopeStoreHelper::deserialize(deserializer)?;
        Self::validate_root(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { root: helper.path })
    }
}

impl EnvelopeStore {
    /// Create a new `EnvelopeStore` builder.
    #[must_use]
    pub fn builder() -> EnvelopeStoreBuilder {
        EnvelopeStoreBuilder::default()
    }

    /// Validate a store root path.
    ///
    /// Rejects relative paths, paths containing `..` components, and paths
    /// under protected system directories.
    fn validate_root(root: &Path) -> std::result::Result<(), ValidationError> {
        for component in root.components() {
            if component == std::path::Component::ParentDir {
                return Err(ValidationError::ParentComponent(
                    root.display().to_string(),
                ));
            }
        }

        if !root.is_absolute() {
            return Err(ValidationError::NotAbsolute(root.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        for prefix in &sensitive_prefixes {
            if root.starts_with(prefix) {
                return Err(ValidationError::SystemDirectory(
                    root.display().to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Initialize the store hierarchy.
    ///
    /// Creates the queue, incoming, and corrupt directories if absent,
    /// discards incoming messages whose session never committed, and sweeps
    /// temporaries left behind by a crash mid-write.
    ///
    /// # Errors
    ///
    /// Returns an error if the root exists but is not a directory, or if any
    /// directory cannot be created.
    pub fn init(&self) -> Result<()> {
        internal!("Initialising envelope store at {:?} ...", self.root);

        if self.root.try_exists()? && !self.root.is_dir() {
            return Err(ValidationError::NotDirectory(self.root.display().to_string()).into());
        }

        for dir in [QUEUE_DIR, INCOMING_DIR, CORRUPT_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }

        self.discard_stale_sessions()?;
        self.sweep_temporaries()?;

        Ok(())
    }

    /// Remove incoming message directories left over from a previous run.
    /// Nothing can commit them any more, and the walker never reads them.
    fn discard_stale_sessions(&self) -> Result<()> {
        let mut discarded = 0_u32;

        for entry in fs::read_dir(self.root.join(INCOMING_DIR))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if MessageId::from_dirname(&name).is_none() {
                internal!(level = WARN, "Skipping malformed incoming entry {name:?}");
                continue;
            }
            if !entry.file_type()?.is_dir() {
                internal!(level = WARN, "Skipping non-directory incoming entry {name:?}");
                continue;
            }

            fs::remove_dir_all(entry.path())?;
            discarded += 1;
        }

        if discarded > 0 {
            internal!(level = INFO, "Discarded {discarded} stale incoming messages");
        }

        Ok(())
    }

    /// Remove `.tmp_` files left by writes interrupted before their rename.
    fn sweep_temporaries(&self) -> Result<()> {
        let mut swept = 0_u32;

        for message_dir in self.message_dirs()? {
            for entry in fs::read_dir(&message_dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                    fs::remove_file(entry.path())?;
                    swept += 1;
                }
            }
        }

        if swept > 0 {
            internal!(level = INFO, "Swept {swept} orphaned temporaries");
        }

        Ok(())
    }

    /// Every message directory currently on disk, incoming and committed.
    fn message_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();

        for entry in fs::read_dir(self.root.join(INCOMING_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }

        for bucket in fs::read_dir(self.queue_dir())? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(bucket.path())? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    dirs.push(entry.path());
                }
            }
        }

        Ok(dirs)
    }

    /// Allocate a fresh message and its incoming directory.
    ///
    /// Draws random nonzero ids until one is free in both the committed and
    /// incoming hierarchies; the exclusive directory create is the claim.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageIdExhausted`] after bounded draws, or an
    /// I/O error for anything the filesystem refuses.
    pub fn create_message(&self) -> Result<MessageId> {
        for _ in 0..ID_DRAW_ATTEMPTS {
            let id = MessageId::new(rand::rng().random_range(1..=u32::MAX));

            if self.message_dir(id).is_dir() {
                continue;
            }

            match fs::create_dir(self.incoming_message_dir(id)) {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::MessageIdExhausted {
            attempts: ID_DRAW_ATTEMPTS,
        })
    }

    /// Persist a new envelope blob under `message` and return its id.
    ///
    /// The final name is claimed with an exclusive create, then the blob is
    /// written to a temporary sibling, synced, and renamed over the claim. A
    /// failure at any step removes the claim; nothing partial survives under
    /// the final name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageNotFound`] if `message` has no directory,
    /// [`StoreError::EnvelopeIdExhausted`] after bounded draws, or an I/O
    /// error.
    pub fn create_envelope(&self, message: MessageId, blob: &[u8]) -> Result<EnvelopeId> {
        let dir = self.resolve_message_dir(message)?;

        for _ in 0..ID_DRAW_ATTEMPTS {
            let id = EnvelopeId::compose(message, rand::rng().random_range(1..=u32::MAX));
            let final_path = dir.join(id.to_string());

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&final_path)
            {
                Ok(claim) => {
                    drop(claim);
                    if let Err(e) = Self::write_blob(&dir, &final_path, id, blob) {
                        let _ = fs::remove_file(&final_path);
                        return Err(e);
                    }
                    return Ok(id);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::EnvelopeIdExhausted {
            message,
            attempts: ID_DRAW_ATTEMPTS,
        })
    }

    /// Move a message from incoming into the committed queue hierarchy.
    ///
    /// Creates the destination bucket lazily; a bucket that already exists,
    /// whoever created it, is fine. After the rename every envelope of the
    /// message is visible to loads and walks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageNotFound`] if the message has no
    /// incoming directory, or an I/O error.
    pub fn commit_message(&self, message: MessageId) -> Result<()> {
        let from = self.incoming_message_dir(message);
        if !from.is_dir() {
            return Err(StoreError::MessageNotFound(message));
        }

        let bucket = self.bucket_dir(message.bucket());
        match fs::create_dir(&bucket) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        fs::rename(&from, self.message_dir(message))?;

        Ok(())
    }

    /// Read a committed envelope blob.
    ///
    /// An absent envelope is `None`, not an error; envelopes still in
    /// incoming are not visible here.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for anything other than absence.
    pub fn load_envelope(&self, id: EnvelopeId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.committed_envelope_path(id)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace an envelope blob in place.
    ///
    /// Writes to a temporary sibling, syncs, then renames over the
    /// destination; a reader never observes a torn blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EnvelopeNotFound`] if the envelope is in
    /// neither hierarchy, or an I/O error.
    pub fn update_envelope(&self, id: EnvelopeId, blob: &[u8]) -> Result<()> {
        let (dir, path) = self.resolve_envelope(id)?;
        Self::write_blob(&dir, &path, id, blob)
    }

    /// Unlink an envelope, and the whole message directory once its last
    /// envelope is gone.
    ///
    /// The message's reference count is its live directory entries: after
    /// the unlink, a message directory holding no parseable envelope names
    /// is deleted outright.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EnvelopeNotFound`] if the envelope is in
    /// neither hierarchy, or an I/O error.
    pub fn delete_envelope(&self, id: EnvelopeId) -> Result<()> {
        let (dir, path) = self.resolve_envelope(id)?;
        fs::remove_file(&path)?;

        if Self::live_envelopes(&dir)? == 0 {
            fs::remove_dir_all(&dir)?;
        }

        Ok(())
    }

    /// Remove an uncommitted message and everything under it.
    ///
    /// This is the session-rollback path; committed messages leave the queue
    /// envelope by envelope, never wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageNotFound`] if the message has no
    /// incoming directory, or an I/O error.
    pub fn delete_message(&self, message: MessageId) -> Result<()> {
        let dir = self.incoming_message_dir(message);
        if !dir.is_dir() {
            return Err(StoreError::MessageNotFound(message));
        }

        fs::remove_dir_all(&dir)?;

        Ok(())
    }

    /// Move a message's entire directory into corrupt storage.
    ///
    /// An existing quarantine entry for the same id is never overwritten;
    /// the target name is probed with a numeric suffix until a free slot is
    /// found. Returns the quarantine path for the log line.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageNotFound`] if the message has no
    /// directory anywhere, or an I/O error (including exhaustion of
    /// quarantine slots).
    pub fn quarantine_message(&self, message: MessageId) -> Result<PathBuf> {
        let from = self.resolve_message_dir(message)?;
        let corrupt = self.root.join(CORRUPT_DIR);

        let mut target = corrupt.join(message.to_string());
        let mut suffix = 0_u32;
        while target.try_exists()? {
            suffix += 1;
            if suffix > QUARANTINE_SLOTS {
                return Err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("no free quarantine slot for {message}"),
                )
                .into());
            }
            target = corrupt.join(format!("{message}.{suffix}"));
        }

        fs::rename(&from, &target)?;
        internal!(level = WARN, "Quarantined message {message} to {target:?}");

        Ok(target)
    }

    /// Begin a bounded traversal of every committed envelope.
    #[must_use]
    pub fn walk(&self) -> QueueWalker {
        QueueWalker::new(self.queue_dir())
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self) -> PathBuf {
        self.root.join(QUEUE_DIR)
    }

    fn bucket_dir(&self, bucket: u8) -> PathBuf {
        self.queue_dir().join(format!("{bucket:02x}"))
    }

    fn message_dir(&self, message: MessageId) -> PathBuf {
        self.bucket_dir(message.bucket()).join(message.to_string())
    }

    fn incoming_message_dir(&self, message: MessageId) -> PathBuf {
        self.root.join(INCOMING_DIR).join(message.to_string())
    }

    fn committed_envelope_path(&self, id: EnvelopeId) -> PathBuf {
        self.message_dir(id.message_id()).join(id.to_string())
    }

    /// The directory a message's envelopes live in right now: committed if
    /// the message has been committed, incoming otherwise.
    fn resolve_message_dir(&self, message: MessageId) -> Result<PathBuf> {
        let committed = self.message_dir(message);
        if committed.is_dir() {
            return Ok(committed);
        }

        let incoming = self.incoming_message_dir(message);
        if incoming.is_dir() {
            return Ok(incoming);
        }

        Err(StoreError::MessageNotFound(message))
    }

    /// Locate an envelope file, committed hierarchy first.
    fn resolve_envelope(&self, id: EnvelopeId) -> Result<(PathBuf, PathBuf)> {
        let committed = self.message_dir(id.message_id());
        let path = committed.join(id.to_string());
        if path.is_file() {
            return Ok((committed, path));
        }

        let incoming = self.incoming_message_dir(id.message_id());
        let path = incoming.join(id.to_string());
        if path.is_file() {
            return Ok((incoming, path));
        }

        Err(StoreError::EnvelopeNotFound(id))
    }

    /// Entries of `dir` that parse as envelope filenames.
    fn live_envelopes(dir: &Path) -> Result<u32> {
        let mut live = 0_u32;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if EnvelopeId::from_filename(&entry.file_name().to_string_lossy()).is_some() {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Temp-write, sync, rename. The temporary is removed on any failure.
    fn write_blob(dir: &Path, final_path: &Path, id: EnvelopeId, blob: &[u8]) -> Result<()> {
        let tmp_path = dir.join(format!("{TMP_PREFIX}{id}"));

        let written = Self::write_and_sync(&tmp_path, blob)
            .and_then(|()| fs::rename(&tmp_path, final_path).map_err(StoreError::from));

        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }

        written
    }

    fn write_and_sync(path: &Path, blob: &[u8]) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(blob)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Builder for [`EnvelopeStore`].
#[derive(Debug, Default)]
pub struct EnvelopeStoreBuilder {
    root: Option<PathBuf>,
}

impl EnvelopeStoreBuilder {
    /// Set the store root directory.
    #[must_use]
    pub fn root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }

    /// Validate the root and build the store.
    ///
    /// # Errors
    ///
    /// Returns a validation error for relative, traversing, or system-path
    /// roots.
    pub fn build(self) -> Result<EnvelopeStore> {
        let root = self
            .root
            .unwrap_or_else(|| PathBuf::from(defaults::ROOT));
        EnvelopeStore::validate_root(&root)?;
        Ok(EnvelopeStore { root })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_relative_root() {
        let result = EnvelopeStore::builder()
            .root(PathBuf::from("spool/postrider"))
            .build();
        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::NotAbsolute(_)))
        ));
    }

    #[test]
    fn builder_rejects_parent_components() {
        let result = EnvelopeStore::builder()
            .root(PathBuf::from("/var/spool/../spool/postrider"))
            .build();
        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::ParentComponent(_)))
        ));
    }

    #[test]
    fn builder_rejects_system_directories() {
        for root in ["/etc/postrider", "/proc/postrider", "/dev/postrider"] {
            let result = EnvelopeStore::builder().root(PathBuf::from(root)).build();
            assert!(matches!(
                result,
                Err(StoreError::Validation(ValidationError::SystemDirectory(_)))
            ));
        }
    }

    #[test]
    fn builder_accepts_spool_paths() {
        assert!(
            EnvelopeStore::builder()
                .root(PathBuf::from("/var/spool/postrider"))
                .build()
                .is_ok()
        );
    }

    #[test]
    fn default_root_is_valid() {
        assert!(EnvelopeStore::validate_root(Path::new(defaults::ROOT)).is_ok());
    }
}
