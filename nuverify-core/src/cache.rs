//! Persistent instruction cache: one JSON file per target version.
//!
//! Entries are keyed by version only. The generating model is stored as
//! metadata and never gates a hit, so instructions generated by one model are
//! reused by runs configured with another.
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so readers see either the old entry or the new one, never a mix.
//! Writes and invalidations for the same version are serialized in-process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CacheError, SetupError};
use crate::types::{CacheEntry, CacheListing, InstructionSet};
use crate::version::{Version, VersionRange};

const ENTRY_DIR: &str = "instructions";
const ENTRY_EXT: &str = "json";
const TMP_EXT: &str = "tmp";
/// Temp files older than this are leftovers from a crashed writer.
const STALE_TMP_AGE: Duration = Duration::from_secs(600);

/// Which entries an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Versions(Vec<Version>),
}

/// Directory-level cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub directory: PathBuf,
    pub entries: usize,
    pub total_size_bytes: u64,
    pub versions: Vec<Version>,
}

/// Handle to the on-disk instruction cache.
///
/// Opened once per run and shared behind an `Arc`; [`InstructionCache::close`]
/// sweeps leftover temporary files.
#[derive(Debug)]
pub struct InstructionCache {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstructionCache {
    /// Open (creating if needed) the cache under `root` and verify it is writable.
    pub fn open(root: &Path) -> Result<Self, SetupError> {
        let dir = root.join(ENTRY_DIR);
        let unwritable = |source| SetupError::CacheUnwritable {
            path: dir.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(unwritable)?;
        let probe = dir.join(format!(".probe-{}.{TMP_EXT}", uuid::Uuid::new_v4()));
        std::fs::write(&probe, b"").map_err(unwritable)?;
        let _ = std::fs::remove_file(&probe);

        debug!(dir = %dir.display(), "Opened instruction cache");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, version: &Version) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXT}", version.cache_key()))
    }

    fn lock_for(&self, version: &Version) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(version.cache_key()).or_default().clone()
    }

    /// Look up the entry for `version`.
    ///
    /// `model_id` is informational: a hit only requires the version to match.
    /// Unreadable or corrupt entries are logged and reported as a miss.
    pub fn get(&self, version: &Version, model_id: &str) -> Option<CacheEntry> {
        let path = self.entry_path(version);
        if !path.exists() {
            debug!(%version, "Cache miss");
            return None;
        }

        let entry = match read_entry(&path) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache entry, treating as miss");
                return None;
            }
        };
        if entry.version != *version {
            warn!(
                path = %path.display(),
                stored = %entry.version,
                "Cache entry version does not match its file name, treating as miss"
            );
            return None;
        }

        if entry.model_id != model_id {
            debug!(%version, cached_model = %entry.model_id, model = %model_id, "Serving entry generated by a different model");
        }
        debug!(%version, instructions = entry.instructions.len(), "Cache hit");
        Some(entry)
    }

    /// Replace the entry for `version` wholesale.
    pub fn put(
        &self,
        version: &Version,
        model_id: &str,
        source_range: VersionRange,
        instructions: InstructionSet,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            version: version.release(),
            model_id: model_id.to_string(),
            created_at: Utc::now(),
            source_range,
            instructions,
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let lock = self.lock_for(version);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.write_atomic(&self.entry_path(version), &bytes)?;

        info!(%version, model = %model_id, instructions = entry.instructions.len(), "Cached instructions");
        Ok(entry)
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        use std::io::Write;

        let tmp = self
            .dir
            .join(format!(".{}.{TMP_EXT}", uuid::Uuid::new_v4()));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CacheError::Io { path, source }
        };

        let result = (|| {
            let mut file = std::fs::File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(bytes).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
            drop(file);
            std::fs::rename(&tmp, target).map_err(io_err(target))
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// Remove entries. Missing entries are not an error. Returns the number removed.
    pub fn invalidate(&self, scope: &CacheScope) -> Result<usize, CacheError> {
        let versions = match scope {
            CacheScope::All => self.stored_versions()?,
            CacheScope::Versions(versions) => versions.clone(),
        };

        let mut removed = 0;
        for version in &versions {
            let lock = self.lock_for(version);
            let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let path = self.entry_path(version);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::Io { path, source }),
            }
        }

        if matches!(scope, CacheScope::All) {
            self.sweep_tmp(Duration::ZERO);
        }
        info!(removed, "Invalidated cache entries");
        Ok(removed)
    }

    /// Every readable entry, ordered by version ascending.
    pub fn list(&self) -> Vec<CacheListing> {
        let mut rows: Vec<CacheListing> = self
            .entry_files()
            .into_iter()
            .filter_map(|path| {
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                match read_entry(&path) {
                    Ok(entry) => Some(CacheListing {
                        version: entry.version,
                        model_id: entry.model_id,
                        created_at: entry.created_at,
                        source_range: entry.source_range,
                        instruction_count: entry.instructions.len(),
                        size_bytes,
                    }),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupt cache entry");
                        None
                    }
                }
            })
            .collect();
        rows.sort_by(|a, b| a.version.cmp(&b.version));
        rows
    }

    pub fn info(&self) -> CacheInfo {
        let files = self.entry_files();
        let total_size_bytes = files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let mut versions: Vec<Version> = files
            .iter()
            .filter_map(|p| p.file_stem()?.to_str().and_then(|s| Version::parse(s).ok()))
            .collect();
        versions.sort();
        CacheInfo {
            directory: self.dir.clone(),
            entries: files.len(),
            total_size_bytes,
            versions,
        }
    }

    /// End of run: drop lock bookkeeping and sweep stale temp files.
    pub fn close(self) {
        let swept = self.sweep_tmp(STALE_TMP_AGE);
        debug!(dir = %self.dir.display(), swept, "Closed instruction cache");
    }

    fn stored_versions(&self) -> Result<Vec<Version>, CacheError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        Ok(self
            .entry_files()
            .iter()
            .filter_map(|p| p.file_stem()?.to_str().and_then(|s| Version::parse(s).ok()))
            .collect())
    }

    fn entry_files(&self) -> Vec<PathBuf> {
        let Ok(read) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = read
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == ENTRY_EXT))
            .collect();
        files.sort();
        files
    }

    fn sweep_tmp(&self, older_than: Duration) -> usize {
        let Ok(read) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut swept = 0;
        for entry in read.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != TMP_EXT) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or_default();
            if age >= older_than && std::fs::remove_file(&path).is_ok() {
                swept += 1;
            }
        }
        swept
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let raw = std::fs::read(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompatibilityInstruction;

    fn set(tag: &str, n: usize) -> InstructionSet {
        InstructionSet::new(
            (0..n)
                .map(|i| CompatibilityInstruction {
                    description: format!("{tag}-{i}"),
                    introduced_in: Version::new(0, 95 + i as u64, 0),
                    detection: None,
                    remediation: Some(format!("fix {tag}-{i}")),
                })
                .collect(),
        )
    }

    fn range() -> VersionRange {
        VersionRange::new(Version::new(0, 90, 0), Version::new(0, 100, 0))
    }

    #[test]
    fn put_then_get_ignores_model() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        let v = Version::new(0, 100, 0);
        let instructions = set("a", 3);

        cache.put(&v, "openai/gpt-4", range(), instructions.clone()).unwrap();

        let same = cache.get(&v, "openai/gpt-4").unwrap();
        assert_eq!(same.instructions, instructions);
        let other = cache.get(&v, "anthropic/claude-sonnet-4").unwrap();
        assert_eq!(other.instructions, instructions);
        assert_eq!(other.model_id, "openai/gpt-4");
        assert_eq!(other.source_range, range());
    }

    #[test]
    fn miss_for_other_version() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        cache.put(&Version::new(0, 100, 0), "m", range(), set("a", 1)).unwrap();
        assert!(cache.get(&Version::new(0, 101, 0), "m").is_none());
    }

    #[test]
    fn pre_release_shares_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        cache.put(&Version::new(0, 100, 0), "m", range(), set("a", 1)).unwrap();
        let pre = Version::parse("0.100.0-nightly.2").unwrap();
        assert!(cache.get(&pre, "m").is_some());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        let v = Version::new(0, 100, 0);
        std::fs::write(cache.entry_path(&v), b"{ not json").unwrap();
        assert!(cache.get(&v, "m").is_none());
        assert!(cache.list().is_empty());
    }

    #[test]
    fn mismatched_version_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        cache.put(&Version::new(0, 99, 0), "m", range(), set("a", 1)).unwrap();
        std::fs::rename(
            cache.entry_path(&Version::new(0, 99, 0)),
            cache.entry_path(&Version::new(0, 100, 0)),
        )
        .unwrap();
        assert!(cache.get(&Version::new(0, 100, 0), "m").is_none());
    }

    #[test]
    fn invalidate_all_empties_list() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        for minor in [98, 99, 100] {
            cache.put(&Version::new(0, minor, 0), "m", range(), set("a", 1)).unwrap();
        }
        assert_eq!(cache.list().len(), 3);
        assert_eq!(cache.invalidate(&CacheScope::All).unwrap(), 3);
        assert!(cache.list().is_empty());
        assert_eq!(cache.invalidate(&CacheScope::All).unwrap(), 0);
    }

    #[test]
    fn invalidate_named_versions_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        cache.put(&Version::new(0, 99, 0), "m", range(), set("a", 1)).unwrap();
        cache.put(&Version::new(0, 100, 0), "m", range(), set("b", 1)).unwrap();

        let scope = CacheScope::Versions(vec![Version::new(0, 99, 0), Version::new(0, 50, 0)]);
        assert_eq!(cache.invalidate(&scope).unwrap(), 1);
        assert_eq!(cache.invalidate(&scope).unwrap(), 0);

        let remaining: Vec<_> = cache.list().into_iter().map(|r| r.version).collect();
        assert_eq!(remaining, vec![Version::new(0, 100, 0)]);
    }

    #[test]
    fn list_orders_by_version_not_name() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        for minor in [100, 9, 95] {
            cache.put(&Version::new(0, minor, 0), "m", range(), set("a", 2)).unwrap();
        }
        let versions: Vec<_> = cache.list().into_iter().map(|r| r.version.minor).collect();
        assert_eq!(versions, vec![9, 95, 100]);

        let info = cache.info();
        assert_eq!(info.entries, 3);
        assert!(info.total_size_bytes > 0);
        assert_eq!(info.versions.first(), Some(&Version::new(0, 9, 0)));
    }

    #[test]
    fn concurrent_puts_leave_one_whole_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(InstructionCache::open(dir.path()).unwrap());
        let v = Version::new(0, 100, 0);
        let a = set("a", 50);
        let b = set("b", 50);

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .map(|instructions| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let v = v.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..20 {
                        cache.put(&v, "m", range(), instructions.clone()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stored = cache.get(&v, "m").unwrap().instructions;
        assert!(stored == a || stored == b);
        let leftovers = std::fs::read_dir(cache.directory())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == TMP_EXT))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn open_fails_when_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let err = InstructionCache::open(&blocker).unwrap_err();
        assert!(matches!(err, SetupError::CacheUnwritable { .. }));
    }

    #[test]
    fn close_sweeps_only_stale_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InstructionCache::open(dir.path()).unwrap();
        let fresh = cache.directory().join(".fresh.tmp");
        std::fs::write(&fresh, b"partial").unwrap();
        let entries = cache.directory().to_path_buf();
        cache.close();
        assert!(entries.join(".fresh.tmp").exists());
    }
}
