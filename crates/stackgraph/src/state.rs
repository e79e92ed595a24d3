//! State store: durable record of previously applied resources
//!
//! The file store keeps two files in its directory:
//!
//! - `state.json`: a versioned snapshot of all records, replaced atomically
//!   (write tmp, fsync, rename)
//! - `state.journal`: append-only JSON lines, one per commit, each fsynced
//!   before `commit` returns
//!
//! Loading reads the snapshot and replays journal entries newer than it.
//! `compact` folds the journal back into the snapshot.

use crate::error::{Error, Result};
use crate::node::ResourceNode;
use crate::types::{Outputs, Properties, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "state.json";
const JOURNAL_FILE: &str = "state.journal";
const LOCK_FILE: &str = "state.lock";

/// Outcome of the last operation recorded for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Succeeded,
    Failed,
    /// Intent written before a create; the resource may or may not exist
    Pending,
}

/// One persisted resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub kind: ResourceKind,
    /// Provider-assigned identity, if known
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub outputs: Outputs,
    /// Content hash of the declared properties at last successful apply
    pub content_hash: String,
    pub status: RecordStatus,
    /// Dependencies at last apply, used to order deletes of removed nodes
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Declared properties at last apply, used to find changed fields
    #[serde(default)]
    pub declared_properties: Properties,
    /// Resolved properties last sent to the provider
    #[serde(default)]
    pub applied_properties: Properties,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Write-ahead intent for a create that is about to be issued
    pub fn pending(node: &ResourceNode, resolved: &Properties) -> Self {
        Self {
            id: node.id().to_string(),
            kind: node.kind(),
            identity: None,
            outputs: Outputs::new(),
            content_hash: node.content_hash(),
            status: RecordStatus::Pending,
            dependencies: node.dependencies().into_iter().map(str::to_string).collect(),
            declared_properties: node.properties().clone(),
            applied_properties: resolved.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Record of a node whose operation just succeeded
    pub fn succeeded(
        node: &ResourceNode,
        identity: Option<String>,
        outputs: Outputs,
        resolved: &Properties,
    ) -> Self {
        Self {
            identity,
            outputs,
            status: RecordStatus::Succeeded,
            ..Self::pending(node, resolved)
        }
    }

    /// Whether the resource might exist without the store knowing its identity
    pub fn is_unknown(&self) -> bool {
        self.identity.is_none() && self.status != RecordStatus::Succeeded
    }
}

/// All records keyed by logical id
pub type RecordSet = BTreeMap<String, ResourceRecord>;

/// Durable storage for resource records
///
/// Implementations must make `commit` and `remove` durable before
/// returning: the executor proceeds to dependents immediately afterwards.
pub trait StateStore: Send {
    /// Load prior records; empty on first run, `StateCorrupt` on corruption
    fn load(&mut self) -> Result<RecordSet>;

    /// Insert or replace one record
    fn commit(&mut self, record: &ResourceRecord) -> Result<()>;

    /// Forget a record after its resource was deleted
    fn remove(&mut self, id: &str) -> Result<()>;

    /// Fold incremental writes into a compact snapshot
    fn compact(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    records: RecordSet,
    writes: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordSet) -> Self {
        Self { records, writes: 0 }
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    /// Number of commits and removals performed
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl StateStore for MemoryStateStore {
    fn load(&mut self) -> Result<RecordSet> {
        Ok(self.records.clone())
    }

    fn commit(&mut self, record: &ResourceRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record.clone());
        self.writes += 1;
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        self.records.remove(id);
        self.writes += 1;
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    serial: u64,
    records: RecordSet,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Upsert { serial: u64, record: ResourceRecord },
    Remove { serial: u64, id: String },
}

impl JournalEntry {
    fn serial(&self) -> u64 {
        match self {
            Self::Upsert { serial, .. } | Self::Remove { serial, .. } => *serial,
        }
    }
}

/// Exclusive ownership of a state directory for one run
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock, failing with `StateLocked` if another run holds it
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::StateLocked(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stale lock left by a crashed run
    pub fn force_release(dir: &Path) -> Result<bool> {
        let path = dir.join(LOCK_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::warn!("Removed stale state lock {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release state lock {}: {}", self.path.display(), e);
        }
    }
}

/// Snapshot + journal store in a directory
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    records: RecordSet,
    serial: u64,
    _lock: Option<StateLock>,
}

impl FileStateStore {
    /// Open a state directory for writing, taking the run lock
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = StateLock::acquire(&dir)?;
        let mut store = Self {
            dir,
            records: RecordSet::new(),
            serial: 0,
            _lock: Some(lock),
        };
        store.reload()?;
        Ok(store)
    }

    /// Open a state directory for inspection without taking the lock
    pub fn open_unlocked(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self {
            dir: dir.into(),
            records: RecordSet::new(),
            serial: 0,
            _lock: None,
        };
        store.reload()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn reload(&mut self) -> Result<()> {
        let snapshot_path = self.snapshot_path();
        let (mut records, base_serial) = if snapshot_path.exists() {
            let content = fs::read_to_string(&snapshot_path)?;
            let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                Error::corrupt(snapshot_path.display().to_string(), e.to_string())
            })?;
            if snapshot.version != STATE_VERSION {
                return Err(Error::corrupt(
                    snapshot_path.display().to_string(),
                    format!(
                        "unsupported state version {} (expected {STATE_VERSION})",
                        snapshot.version
                    ),
                ));
            }
            (snapshot.records, snapshot.serial)
        } else {
            log::debug!("No state snapshot at {}, starting empty", snapshot_path.display());
            (RecordSet::new(), 0)
        };

        let mut serial = base_serial;
        let journal_path = self.journal_path();
        if journal_path.exists() {
            let content = fs::read_to_string(&journal_path)?;
            let location = journal_path.display().to_string();

            // A final line without its newline is a write torn by a crash.
            let (complete, torn) = match content.rfind('\n') {
                Some(end) => content.split_at(end + 1),
                None => ("", content.as_str()),
            };

            for (index, line) in complete.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JournalEntry = serde_json::from_str(line).map_err(|e| {
                    Error::corrupt(location.clone(), format!("line {}: {e}", index + 1))
                })?;
                serial = serial.max(entry.serial());
                if entry.serial() <= base_serial {
                    continue;
                }
                match entry {
                    JournalEntry::Upsert { record, .. } => {
                        records.insert(record.id.clone(), record);
                    }
                    JournalEntry::Remove { id, .. } => {
                        records.remove(&id);
                    }
                }
            }

            if !torn.is_empty() {
                log::warn!(
                    "Discarding torn journal entry in {} ({} bytes)",
                    location,
                    torn.len()
                );
                let file = OpenOptions::new().write(true).open(&journal_path)?;
                file.set_len(complete.len() as u64)?;
                file.sync_all()?;
            }
        }

        log::debug!(
            "Loaded {} state records from {} (serial {serial})",
            records.len(),
            self.dir.display()
        );
        self.records = records;
        self.serial = serial;
        Ok(())
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&mut self) -> Result<RecordSet> {
        self.reload()?;
        Ok(self.records.clone())
    }

    fn commit(&mut self, record: &ResourceRecord) -> Result<()> {
        let serial = self.serial + 1;
        self.append(&JournalEntry::Upsert {
            serial,
            record: record.clone(),
        })?;
        self.serial = serial;
        self.records.insert(record.id.clone(), record.clone());
        log::debug!("Committed {} ({:?}) at serial {serial}", record.id, record.status);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<()> {
        let serial = self.serial + 1;
        self.append(&JournalEntry::Remove {
            serial,
            id: id.to_string(),
        })?;
        self.serial = serial;
        self.records.remove(id);
        log::debug!("Removed {id} at serial {serial}");
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let snapshot = Snapshot {
            version: STATE_VERSION,
            serial: self.serial,
            records: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(std::io::Error::other)?;

        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        // Entries are all covered by the snapshot serial now; replay skips them
        // even if truncation is interrupted.
        let journal = File::create(self.journal_path())?;
        journal.sync_all()?;

        log::debug!("Compacted state to {} at serial {}", path.display(), self.serial);
        Ok(())
    }
}
