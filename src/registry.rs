use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

pub const REGISTRY_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Stale,
    Removed,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Active => write!(f, "active"),
            EntryStatus::Stale => write!(f, "stale"),
            EntryStatus::Removed => write!(f, "removed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EntryStatus,
    /// Consecutive reconciliation passes in which the project was not found
    #[serde(default, skip_serializing_if = "is_zero")]
    pub missed_passes: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl RegistryEntry {
    pub fn new(path: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            path,
            created_at: now,
            updated_at: now,
            status: EntryStatus::Active,
            missed_passes: 0,
        }
    }
}

/// Machine-wide map of project name to discovery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub version: String,
    /// Keyed by project name, so names are unique by construction
    pub projects: BTreeMap<String, RegistryEntry>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Registry {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            projects: BTreeMap::new(),
            created: now,
            updated: now,
        }
    }

    /// Projects that have not been marked removed
    pub fn tracked(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.projects
            .iter()
            .filter(|(_, e)| e.status != EntryStatus::Removed)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked().count()
    }

    pub fn count_with_status(&self, status: EntryStatus) -> usize {
        self.projects.values().filter(|e| e.status == status).count()
    }

    /// Advance `updated`, strictly increasing even if the clock stalls or steps back.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.updated + Duration::milliseconds(1);
        self.updated = if now > self.updated { now } else { floor };
    }
}

/// Owner of the registry file.
///
/// Every mutation goes through [`RegistryStore::update`], which holds an
/// exclusive lock for the whole read-modify-write and replaces the file by
/// renaming a fully written temp file over it.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    /// Number of upcoming saves that fail before touching the disk
    #[cfg(test)]
    failing_saves: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            #[cfg(test)]
            failing_saves: Default::default(),
        }
    }

    #[cfg(test)]
    fn fail_next_saves(&self, count: u32) {
        self.failing_saves
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Read the registry, or an empty one if the file does not exist yet.
    pub fn load(&self) -> Result<Registry> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Registry::new(Utc::now())),
            Err(e) => Err(SyncError::io(&self.path, e)),
        }
    }

    /// Locked read-modify-write. The closure's registry is persisted only if it returns `Ok`.
    pub fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Registry) -> Result<T>,
    {
        let _lock = RegistryLock::acquire(&self.lock_path())?;
        let mut registry = self.load()?;
        let out = mutate(&mut registry)?;
        registry.touch(Utc::now());
        self.save_with_retry(&registry)?;
        Ok(out)
    }

    fn save_with_retry(&self, registry: &Registry) -> Result<()> {
        match self.save(registry) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(path = %self.path.display(), error = %first, "registry write failed, retrying once");
                self.save(registry)
            }
        }
    }

    /// Write the whole document to a temp file in the same directory, then rename it into place.
    fn save(&self, registry: &Registry) -> Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let pending = self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if pending.is_ok() {
                return Err(SyncError::io(
                    &self.path,
                    std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                ));
            }
        }
        let data = serde_json::to_vec_pretty(registry)?;
        let tmp = self.write_temp(&data)?;
        tmp.persist(&self.path)
            .map_err(|e| SyncError::io(&self.path, e.error))?;
        debug!(path = %self.path.display(), projects = registry.projects.len(), "registry saved");
        Ok(())
    }

    fn write_temp(&self, data: &[u8]) -> Result<NamedTempFile> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".registry-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| SyncError::io(dir, e))?;
        tmp.write_all(data).map_err(|e| SyncError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SyncError::io(tmp.path(), e))?;
        Ok(tmp)
    }
}

/// Advisory exclusive lock on a sidecar file, released on drop.
struct RegistryLock {
    #[allow(dead_code)]
    file: File,
}

impl RegistryLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| SyncError::io(path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // Blocks until any other writer releases the lock.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(SyncError::io(path, std::io::Error::last_os_error()));
            }
        }

        Ok(Self { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let registry = store.load().unwrap();
        assert!(registry.projects.is_empty());
        assert_eq!(registry.version, REGISTRY_VERSION);
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));

        store
            .update(|r| {
                r.projects
                    .insert("alpha".into(), RegistryEntry::new("/code/alpha".into(), Utc::now()));
                Ok(())
            })
            .unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.projects.len(), 1);
        assert_eq!(reloaded.projects["alpha"].path, PathBuf::from("/code/alpha"));
        assert_eq!(reloaded.projects["alpha"].status, EntryStatus::Active);
    }

    #[test]
    fn test_on_disk_format_uses_camel_case_keys() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store
            .update(|r| {
                r.projects
                    .insert("alpha".into(), RegistryEntry::new("/code/alpha".into(), ts(100)));
                Ok(())
            })
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        let entry = &raw["projects"]["alpha"];
        assert!(entry.get("createdAt").is_some());
        assert!(entry.get("updatedAt").is_some());
        assert_eq!(entry["status"], "active");
        assert!(entry.get("missedPasses").is_none());
        assert!(raw.get("created").is_some());
        assert!(raw.get("updated").is_some());
    }

    #[test]
    fn test_failed_mutation_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.update(|_| Ok(())).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let result: Result<()> = store.update(|r| {
            r.projects
                .insert("ghost".into(), RegistryEntry::new("/nowhere".into(), Utc::now()));
            Err(SyncError::Conflict("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_single_write_failure_is_retried() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.fail_next_saves(1);
        store
            .update(|r| {
                r.projects
                    .insert("alpha".into(), RegistryEntry::new("/code/alpha".into(), Utc::now()));
                Ok(())
            })
            .unwrap();
        assert!(store.load().unwrap().projects.contains_key("alpha"));
    }

    #[test]
    fn test_second_write_failure_surfaces_and_keeps_file() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store
            .update(|r| {
                r.projects
                    .insert("alpha".into(), RegistryEntry::new("/code/alpha".into(), Utc::now()));
                Ok(())
            })
            .unwrap();
        let before = fs::read(store.path()).unwrap();

        store.fail_next_saves(2);
        let err = store
            .update(|r| {
                r.projects
                    .insert("beta".into(), RegistryEntry::new("/code/beta".into(), Utc::now()));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::TransientIo { .. }));
        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert!(!store.load().unwrap().projects.contains_key("beta"));
    }

    #[test]
    fn test_updated_strictly_increases() {
        let mut registry = Registry::new(ts(1000));
        let first = registry.updated;
        registry.touch(ts(1000));
        assert!(registry.updated > first);
        let second = registry.updated;
        registry.touch(ts(500));
        assert!(registry.updated > second);
        registry.touch(ts(2000));
        assert_eq!(registry.updated, ts(2000));
    }

    #[test]
    fn test_updated_increases_across_saves() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.update(|_| Ok(())).unwrap();
        let a = store.load().unwrap().updated;
        store.update(|_| Ok(())).unwrap();
        let b = store.load().unwrap().updated;
        assert!(b > a);
    }

    #[test]
    fn test_interrupted_write_never_observable() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store
            .update(|r| {
                r.projects
                    .insert("alpha".into(), RegistryEntry::new("/code/alpha".into(), Utc::now()));
                Ok(())
            })
            .unwrap();
        let before = store.load().unwrap();

        // Simulate the process dying after writing half a document but before the rename.
        let full = serde_json::to_vec_pretty(&before).unwrap();
        let partial = store.write_temp(&full[..full.len() / 2]).unwrap();
        drop(partial);

        let after = store.load().unwrap();
        assert_eq!(after, before);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RegistryStore::new(dir.path().join("registry.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update(|r| {
                            r.projects.insert(
                                format!("p{}", i),
                                RegistryEntry::new(format!("/code/p{}", i).into(), Utc::now()),
                            );
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let registry = store.load().unwrap();
        assert_eq!(registry.projects.len(), 8);
    }

    #[test]
    fn test_tracked_excludes_removed() {
        let mut registry = Registry::new(ts(0));
        registry
            .projects
            .insert("a".into(), RegistryEntry::new("/a".into(), ts(0)));
        let mut gone = RegistryEntry::new("/b".into(), ts(0));
        gone.status = EntryStatus::Removed;
        registry.projects.insert("b".into(), gone);
        assert_eq!(registry.tracked_count(), 1);
        assert_eq!(registry.count_with_status(EntryStatus::Removed), 1);
    }
}
