//! Durable backends for the nonce counter map
//!
//! The on-disk format is a flat JSON object mapping account hex to a decimal
//! sequence string:
//!
//! ```json
//! { "ab01...": "7", "cd02...": "0" }
//! ```
//!
//! Pending sets are never persisted. After a restart they are considered
//! abandoned and left to reconciliation.
//!
//! Two backends implement the same [`NonceBackend`] contract:
//! - [`FileBackend`]: server side. Writes go to a temp file in the target
//!   directory, are fsynced, then atomically renamed over the store file.
//!   An older single-file location is migrated on first load.
//! - [`MemoryBackend`]: keeps the serialized document in memory. Stands in for
//!   browser-local storage and is what the tests use.

use super::nonce_errors::{NonceError, NonceResult};
use crate::types::{AccountId, Sequence};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Storage contract for the account -> sequence map
pub trait NonceBackend: Send + Sync + std::fmt::Debug {
    /// Load every record that parses. Malformed records are skipped and logged.
    fn load(&self) -> NonceResult<HashMap<AccountId, Sequence>>;

    /// Replace the stored map with `snapshot`
    fn save(&self, snapshot: &BTreeMap<AccountId, Sequence>) -> NonceResult<()>;
}

/// Parse a persisted document, keeping every well-formed record.
///
/// Returns the parsed map plus one error per discarded record. A document that
/// is not a JSON object at all yields an empty map and a single error.
pub fn parse_snapshot(text: &str) -> (HashMap<AccountId, Sequence>, Vec<NonceError>) {
    let mut entries = HashMap::new();
    let mut discarded = Vec::new();

    if text.trim().is_empty() {
        return (entries, discarded);
    }

    let object: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(text) {
        Ok(object) => object,
        Err(e) => {
            discarded.push(NonceError::CorruptRecord {
                key: "<document>".to_string(),
                reason: e.to_string(),
            });
            return (entries, discarded);
        }
    };

    for (key, value) in object {
        let account = match key.parse::<AccountId>() {
            Ok(account) => account,
            Err(e) => {
                discarded.push(NonceError::CorruptRecord {
                    key,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let sequence = match &value {
            serde_json::Value::String(s) => s.trim().parse::<Sequence>().ok(),
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        };

        match sequence {
            Some(sequence) => {
                entries.insert(account, sequence);
            }
            None => discarded.push(NonceError::CorruptRecord {
                key,
                reason: format!("not a sequence: {}", value),
            }),
        }
    }

    (entries, discarded)
}

/// Serialize a snapshot into the persisted document format
pub fn render_snapshot(snapshot: &BTreeMap<AccountId, Sequence>) -> NonceResult<String> {
    let document: BTreeMap<String, String> = snapshot
        .iter()
        .map(|(account, sequence)| (account.to_hex(), sequence.to_string()))
        .collect();
    Ok(serde_json::to_string_pretty(&document)?)
}

fn log_discarded(source: &str, discarded: &[NonceError]) {
    for err in discarded {
        warn!(source = source, error = %err, "Discarding corrupt nonce record");
    }
}

/// File-backed nonce store (server side)
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    legacy_path: Option<PathBuf>,
}

impl FileBackend {
    /// Store file `file_name` inside the dedicated `data_dir`
    pub fn new(data_dir: impl AsRef<Path>, file_name: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(file_name),
            legacy_path: None,
        }
    }

    /// Older single-file location to migrate from when the store file is missing
    pub fn with_legacy_path(mut self, legacy_path: impl Into<PathBuf>) -> Self {
        self.legacy_path = Some(legacy_path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the legacy file into the new layout if the new file does not exist yet.
    ///
    /// Returns `true` when a migration happened. The legacy file is left in place.
    pub fn migrate_legacy(&self) -> NonceResult<bool> {
        let Some(legacy) = &self.legacy_path else {
            return Ok(false);
        };
        if self.path.exists() || !legacy.exists() {
            return Ok(false);
        }

        let text = fs::read_to_string(legacy)?;
        let (entries, discarded) = parse_snapshot(&text);
        log_discarded("legacy", &discarded);

        let snapshot: BTreeMap<AccountId, Sequence> = entries.into_iter().collect();
        self.save(&snapshot)?;

        info!(
            from = %legacy.display(),
            to = %self.path.display(),
            accounts = snapshot.len(),
            "Migrated legacy nonce store"
        );
        Ok(true)
    }

    fn ensure_dir(&self) -> NonceResult<&Path> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            restrict_permissions(dir, 0o700)?;
        }
        Ok(dir)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> NonceResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> NonceResult<()> {
    Ok(())
}

impl NonceBackend for FileBackend {
    fn load(&self) -> NonceResult<HashMap<AccountId, Sequence>> {
        if let Err(e) = self.migrate_legacy() {
            warn!(error = %e, "Legacy nonce store migration failed");
        }

        if !self.path.exists() {
            debug!(path = %self.path.display(), "No nonce store on disk yet");
            return Ok(HashMap::new());
        }

        let text = fs::read_to_string(&self.path)?;
        let (entries, discarded) = parse_snapshot(&text);
        log_discarded("file", &discarded);
        Ok(entries)
    }

    fn save(&self, snapshot: &BTreeMap<AccountId, Sequence>) -> NonceResult<()> {
        let document = render_snapshot(snapshot)?;
        let dir = self.ensure_dir()?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(document.as_bytes())?;
        tmp.as_file().sync_all()?;
        restrict_permissions(tmp.path(), 0o600)?;
        tmp.persist(&self.path)
            .map_err(|e| NonceError::Persistence(e.error.to_string()))?;

        debug!(path = %self.path.display(), accounts = snapshot.len(), "Nonce store written");
        Ok(())
    }
}

/// In-memory backend holding the serialized document
#[derive(Debug, Default)]
pub struct MemoryBackend {
    document: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend with a raw document (may be malformed)
    pub fn with_raw(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(document.into())),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.document.lock().clone()
    }
}

impl NonceBackend for MemoryBackend {
    fn load(&self) -> NonceResult<HashMap<AccountId, Sequence>> {
        let guard = self.document.lock();
        let Some(text) = guard.as_deref() else {
            return Ok(HashMap::new());
        };
        let (entries, discarded) = parse_snapshot(text);
        log_discarded("memory", &discarded);
        Ok(entries)
    }

    fn save(&self, snapshot: &BTreeMap<AccountId, Sequence>) -> NonceResult<()> {
        let document = render_snapshot(snapshot)?;
        *self.document.lock() = Some(document);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(byte: u8) -> AccountId {
        AccountId::new([byte; 32])
    }

    #[test]
    fn test_parse_skips_only_bad_records() {
        let text = format!(
            r#"{{ "{}": "7", "{}": 3, "nothex": "1", "{}": "seven" }}"#,
            account(1).to_hex(),
            account(2).to_hex(),
            account(3).to_hex()
        );
        let (entries, discarded) = parse_snapshot(&text);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&account(1)], 7);
        assert_eq!(entries[&account(2)], 3);
        assert_eq!(discarded.len(), 2);
    }

    #[test]
    fn test_parse_garbage_document_is_empty() {
        let (entries, discarded) = parse_snapshot("{ not json");
        assert!(entries.is_empty());
        assert_eq!(discarded.len(), 1);

        let (entries, discarded) = parse_snapshot("   ");
        assert!(entries.is_empty());
        assert!(discarded.is_empty());
    }

    #[test]
    fn test_render_uses_decimal_strings() {
        let mut snapshot = BTreeMap::new();
        snapshot.insert(account(9), 42);
        let text = render_snapshot(&snapshot).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[account(9).to_hex()], serde_json::json!("42"));
    }

    #[test]
    fn test_file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("data"), "nonces.json");

        let mut snapshot = BTreeMap::new();
        snapshot.insert(account(1), 7);
        snapshot.insert(account(2), 0);
        backend.save(&snapshot).unwrap();

        let loaded = backend.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&account(1)], 7);
        assert_eq!(loaded[&account(2)], 0);
    }

    #[test]
    fn test_file_backend_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "nonces.json");
        assert!(backend.load().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_backend_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "nonces.json");
        backend.save(&BTreeMap::new()).unwrap();

        let mode = fs::metadata(backend.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_legacy_migration_only_when_new_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("nonces-legacy.json");
        fs::write(&legacy, format!(r#"{{ "{}": "11" }}"#, account(4).to_hex())).unwrap();

        let backend =
            FileBackend::new(dir.path().join("data"), "nonces.json").with_legacy_path(&legacy);
        assert!(backend.migrate_legacy().unwrap());
        assert!(backend.path().exists());
        assert!(!backend.migrate_legacy().unwrap());

        let loaded = backend.load().unwrap();
        assert_eq!(loaded[&account(4)], 11);
    }

    #[test]
    fn test_memory_backend_roundtrip_and_corruption() {
        let backend = MemoryBackend::new();
        assert!(backend.load().unwrap().is_empty());

        let mut snapshot = BTreeMap::new();
        snapshot.insert(account(5), 5);
        backend.save(&snapshot).unwrap();
        assert_eq!(backend.load().unwrap()[&account(5)], 5);

        let corrupt = MemoryBackend::with_raw("[1,2,3]");
        assert!(corrupt.load().unwrap().is_empty());
    }
}
