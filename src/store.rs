//! Durable overflow for payloads that could not be delivered.
//!
//! The store is a text file with one JSON object per line. New entries are
//! only ever appended, and each append is flushed and synced before it
//! returns, so a crash can at worst leave a torn final line that is skipped
//! on the next load. Removing entries rewrites the log into a temporary file
//! that atomically replaces the original.
//!
//! An in-memory copy of the log is kept in file order; it is what
//! [`FailureStore::drain_all`] hands out.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::DeliveryPayload;

/// A payload waiting for redelivery, as stored on disk.
///
/// Payload fields are flattened so every line is still a plain payload object
/// with bookkeeping fields added. Bare payload lines load with a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    #[serde(default = "Uuid::new_v4")]
    pub entry_id: Uuid,

    /// Delivery attempts that failed for any reason
    #[serde(default)]
    pub attempts: u32,

    /// Attempts the backend answered with a permanent rejection
    #[serde(default)]
    pub rejections: u32,

    #[serde(flatten)]
    pub payload: DeliveryPayload,
}

impl StoredEntry {
    pub fn new(payload: DeliveryPayload) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            attempts: 1,
            rejections: 0,
            payload,
        }
    }
}

/// Errors raised by the failure store.
#[derive(Debug)]
pub enum StoreError {
    /// Reading or writing a log file failed
    Io { path: PathBuf, source: std::io::Error },

    /// An entry could not be serialized
    Serialize(serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "Failure store I/O error on {}: {}", path.display(), source)
            }
            StoreError::Serialize(e) => write!(f, "Failed to serialize entry: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Serialize(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialize(err)
    }
}

/// Append-only log of undelivered payloads.
#[derive(Debug)]
pub struct FailureStore {
    path: PathBuf,
    dead_letter_path: PathBuf,
    entries: Vec<StoredEntry>,
    /// The log may end in a torn line; the next append must start a new one.
    needs_newline: bool,
    dead_letter_needs_newline: bool,
}

impl FailureStore {
    /// Open the store, loading whatever a previous run left behind.
    ///
    /// Missing files are created lazily on first write. Lines that do not
    /// parse are skipped with a warning.
    pub fn open(
        path: impl Into<PathBuf>,
        dead_letter_path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let dead_letter_path = dead_letter_path.into();
        let (entries, needs_newline) = load(&path)?;
        let dead_letter_needs_newline = ends_mid_line(&dead_letter_path)?;

        if !entries.is_empty() {
            info!(
                path = %path.display(),
                entries = entries.len(),
                "Recovered undelivered events"
            );
        }

        Ok(Self {
            path,
            dead_letter_path,
            entries,
            needs_newline,
            dead_letter_needs_newline,
        })
    }

    /// Durably append a payload, returning its entry id.
    pub fn append(&mut self, payload: DeliveryPayload) -> Result<Uuid, StoreError> {
        self.append_entry(StoredEntry::new(payload))
    }

    /// Durably append a prepared entry, returning its id.
    pub fn append_entry(&mut self, entry: StoredEntry) -> Result<Uuid, StoreError> {
        let leading_newline = self.needs_newline;
        // A failed write may have left part of the record behind.
        self.needs_newline = true;
        append_record(&self.path, &entry, leading_newline)?;
        self.needs_newline = false;

        let id = entry.entry_id;
        debug!(entry_id = %id, pending = self.entries.len() + 1, "Entry persisted");
        self.entries.push(entry);
        Ok(id)
    }

    /// Every stored entry, in the order it was appended.
    pub fn drain_all(&self) -> Vec<StoredEntry> {
        self.entries.clone()
    }

    /// Remove one entry. Returns `false` if the id is unknown.
    pub fn remove(&mut self, entry_id: Uuid) -> Result<bool, StoreError> {
        if !self.entries.iter().any(|e| e.entry_id == entry_id) {
            return Ok(false);
        }
        let survivors: Vec<StoredEntry> = self
            .entries
            .iter()
            .filter(|e| e.entry_id != entry_id)
            .cloned()
            .collect();
        self.replace_all(survivors)?;
        Ok(true)
    }

    /// Replace the whole log with `survivors`, in the given order.
    ///
    /// The in-memory copy only changes once the new log is on disk.
    pub fn replace_all(&mut self, survivors: Vec<StoredEntry>) -> Result<(), StoreError> {
        rewrite(&self.path, &survivors)?;
        debug!(
            removed = self.entries.len().saturating_sub(survivors.len()),
            remaining = survivors.len(),
            "Failure log compacted"
        );
        self.entries = survivors;
        self.needs_newline = false;
        Ok(())
    }

    /// Append an entry to the dead-letter log.
    ///
    /// The entry is not removed from the store; callers leave it out of the
    /// next [`replace_all`](Self::replace_all).
    pub fn dead_letter(&mut self, entry: &StoredEntry) -> Result<(), StoreError> {
        let leading_newline = self.dead_letter_needs_newline;
        self.dead_letter_needs_newline = true;
        append_record(&self.dead_letter_path, entry, leading_newline)?;
        self.dead_letter_needs_newline = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dead_letter_path(&self) -> &Path {
        &self.dead_letter_path
    }
}

fn load(path: &Path) -> Result<(Vec<StoredEntry>, bool), StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let needs_newline = !bytes.is_empty() && !bytes.ends_with(b"\n");
    let content = String::from_utf8_lossy(&bytes);
    let mut entries = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping unreadable failure log line"
            ),
        }
    }

    Ok((entries, needs_newline))
}

/// Whether a log file exists and its last byte is not a newline.
fn ends_mid_line(path: &Path) -> Result<bool, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let len = file
        .metadata()
        .map_err(|e| StoreError::io(path, e))?
        .len();
    if len == 0 {
        return Ok(false);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| StoreError::io(path, e))?;
    Ok(last[0] != b'\n')
}

fn append_record(path: &Path, entry: &StoredEntry, leading_newline: bool) -> Result<(), StoreError> {
    let mut line = String::new();
    if leading_newline {
        line.push('\n');
    }
    line.push_str(&serde_json::to_string(entry)?);
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    // One write per record keeps earlier records intact if this one tears.
    file.write_all(line.as_bytes())
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data())
        .map_err(|e| StoreError::io(path, e))
}

fn rewrite(path: &Path, entries: &[StoredEntry]) -> Result<(), StoreError> {
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut content = String::new();
    for entry in entries {
        content.push_str(&serde_json::to_string(entry)?);
        content.push('\n');
    }

    let mut file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))?;

    // The rename is only durable once the directory entry is synced. The new
    // log is already in place, so a failure here is not reported upward.
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "Failed to sync failure log directory");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Credentials, SensorEvent, SensorId, Status};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn payload(second: u32, status: Status) -> DeliveryPayload {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, second))
            .unwrap();
        let event = SensorEvent::at(SensorId(21), status, at);
        DeliveryPayload::new(&event, &Credentials::new("7", "s3cret"))
    }

    fn open_in(dir: &TempDir) -> FailureStore {
        FailureStore::open(dir.path().join("failed.log"), dir.path().join("dead.log")).unwrap()
    }

    fn stored_seconds(store: &FailureStore) -> Vec<u32> {
        use chrono::Timelike;
        store
            .drain_all()
            .iter()
            .map(|e| e.payload.timestamp.second())
            .collect()
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        assert!(store.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_append_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = open_in(&dir);
            store.append(payload(1, Status::Obstacle)).unwrap()
        };

        let reopened = open_in(&dir);
        let entries = reopened.drain_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_id, id);
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[0].payload, payload(1, Status::Obstacle));
    }

    #[test]
    fn test_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();
        store.append(payload(2, Status::NoObstacle)).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id_refugio"], "7");
        assert_eq!(first["status"], "Obstacle");
        assert_eq!(first["timestamp"], "2024-05-01 12:00:01");
        assert!(first["entry_id"].is_string());
    }

    #[test]
    fn test_identical_payloads_are_not_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        let a = store.append(payload(1, Status::Obstacle)).unwrap();
        let b = store.append(payload(1, Status::Obstacle)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_compacts_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();
        let middle = store.append(payload(2, Status::NoObstacle)).unwrap();
        store.append(payload(3, Status::Obstacle)).unwrap();

        assert!(store.remove(middle).unwrap());
        assert!(!store.remove(middle).unwrap());
        assert_eq!(stored_seconds(&store), vec![1, 3]);

        let reopened = open_in(&dir);
        assert_eq!(stored_seconds(&reopened), vec![1, 3]);
    }

    #[test]
    fn test_replace_all_rebuilds_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();
        store.append(payload(2, Status::NoObstacle)).unwrap();

        let mut survivors = store.drain_all();
        survivors.remove(0);
        survivors[0].attempts += 1;
        store.replace_all(survivors).unwrap();

        let reopened = open_in(&dir);
        let entries = reopened.drain_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 2);

        store.replace_all(Vec::new()).unwrap();
        assert!(open_in(&dir).is_empty());
    }

    #[test]
    fn test_loads_bare_payload_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.log");
        fs::write(
            &path,
            "{\"id_refugio\": \"7\", \"password\": \"x\", \"timestamp\": \"2024-05-01 12:00:09\", \"status\": \"No obstacle\", \"sensor_id\": 21}\n",
        )
        .unwrap();

        let store = open_in(&dir);
        let entries = store.drain_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 0);
        assert_eq!(entries[0].payload.status, Status::NoObstacle);
    }

    #[test]
    fn test_torn_line_is_skipped_and_not_extended() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_in(&dir);
            store.append(payload(1, Status::Obstacle)).unwrap();
        }
        let path = dir.path().join("failed.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id_refugio\": \"7\", \"pass").unwrap();
        drop(file);

        let mut store = open_in(&dir);
        assert_eq!(store.len(), 1);
        store.append(payload(2, Status::NoObstacle)).unwrap();

        let reopened = open_in(&dir);
        assert_eq!(stored_seconds(&reopened), vec![1, 2]);
    }

    #[test]
    fn test_dead_letter_appends_to_separate_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();

        let entry = store.drain_all().remove(0);
        store.dead_letter(&entry).unwrap();

        let dead = fs::read_to_string(store.dead_letter_path()).unwrap();
        let parsed: StoredEntry = serde_json::from_str(dead.trim()).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FailureStore::open(
            dir.path().join("missing-dir").join("failed.log"),
            dir.path().join("dead.log"),
        )
        .unwrap();

        let err = store.append(payload(1, Status::Obstacle)).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(err.to_string().contains("missing-dir"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_after_failed_write_starts_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.log");
        let parked = dir.path().join("failed.log.parked");
        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();

        // Make the next append fail, then put back what a partial write leaves behind.
        fs::rename(&path, &parked).unwrap();
        fs::create_dir(&path).unwrap();
        assert!(store.append(payload(2, Status::NoObstacle)).is_err());
        fs::remove_dir(&path).unwrap();
        fs::rename(&parked, &path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"entry_id\":\"02de63d7-").unwrap();
        drop(file);

        store.append(payload(3, Status::Obstacle)).unwrap();
        assert_eq!(stored_seconds(&store), vec![1, 3]);

        let reopened = open_in(&dir);
        assert_eq!(stored_seconds(&reopened), vec![1, 3]);
    }

    #[test]
    fn test_dead_letter_after_torn_tail_starts_new_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dead.log"), "{\"entry_id\":\"1e88").unwrap();

        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();
        let entry = store.drain_all().remove(0);
        store.dead_letter(&entry).unwrap();

        let dead = fs::read_to_string(store.dead_letter_path()).unwrap();
        let lines: Vec<&str> = dead.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: StoredEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_compaction_replaces_log_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.append(payload(1, Status::Obstacle)).unwrap();
        store.append(payload(2, Status::NoObstacle)).unwrap();

        let survivors = store.drain_all().split_off(1);
        store.replace_all(survivors).unwrap();

        assert!(!dir.path().join("failed.log.tmp").exists());
        assert_eq!(stored_seconds(&open_in(&dir)), vec![2]);
    }
}
