//! Enforces a byte budget over a directory by evicting least-recently-used
//! files, using the store's ledger as the source of truth rather than
//! trusting the filesystem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::Error;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::Registry;
use crate::store::{Store, TypedStore};

const NAMESPACE: &str = "disk_ledger";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FileRecord {
    size: u64,
    last_used_unix: i64,
}

/// Tracks files under `dir` against a byte budget, evicting the
/// least-recently-used ones once the budget is exceeded. The ledger (this
/// module's [`Store`] entries) is authoritative: a sweep that finds a
/// ledger entry whose file is missing prunes the entry rather than
/// treating it as an error, since an already-evicted file is a normal
/// outcome, not a corruption.
pub struct Janitor<S> {
    dir: PathBuf,
    budget_bytes: i64,
    store: Arc<S>,
}

impl<S: Store> Janitor<S> {
    pub fn new(dir: PathBuf, budget_bytes: i64, store: Arc<S>) -> Self {
        Janitor {
            dir,
            budget_bytes,
            store,
        }
    }

    /// Registers a file as just-used (created, or read for a clip), adding
    /// it to the ledger if new and bumping its LRU position either way.
    pub async fn touch(&self, path: &Path, size: u64, now_unix: i64) -> Result<(), Error> {
        let typed = TypedStore::new(self.store.as_ref());
        typed
            .put(
                NAMESPACE,
                &path_key(&self.dir, path),
                &FileRecord {
                    size,
                    last_used_unix: now_unix,
                },
            )
            .await
    }

    /// First sweep: reconciles the ledger against the filesystem. Entries
    /// for files that no longer exist are pruned (already evicted by some
    /// other path, e.g. a manual cleanup); nothing is treated as an error.
    pub async fn sweep_consistency(&self) -> Result<(), Error> {
        let typed = TypedStore::new(self.store.as_ref());
        let entries: Vec<(String, FileRecord)> = typed.list(NAMESPACE).await?;
        for (key, _record) in entries {
            let path = self.dir.join(&key);
            if tokio::fs::metadata(&path).await.is_err() {
                typed.delete(NAMESPACE, &key).await?;
                info!(path = %path.display(), "pruned ledger entry for missing file");
            }
        }
        Ok(())
    }

    /// Second sweep for the clips directory: while the ledger's total size
    /// exceeds the budget, deletes the least-recently-used files (and their
    /// ledger entries) until it's back under budget. Clips have no
    /// in-use concept — whatever's oldest goes — unlike the downloads
    /// directory, which needs [`Janitor::sweep_downloads`] instead.
    pub async fn sweep_evict(&self) -> Result<Vec<PathBuf>, Error> {
        let typed = TypedStore::new(self.store.as_ref());
        let mut entries: Vec<(String, FileRecord)> = typed.list(NAMESPACE).await?;
        entries.sort_by_key(|(_k, r)| r.last_used_unix);

        let mut total: i64 = entries.iter().map(|(_k, r)| r.size as i64).sum();
        let mut evicted = Vec::new();
        let mut i = 0;
        while total > self.budget_bytes && i < entries.len() {
            let (key, record) = &entries[i];
            let path = self.dir.join(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) | Err(_) => {
                    // Missing file: still prune the ledger entry, same as
                    // the consistency sweep would.
                }
            }
            typed.delete(NAMESPACE, key).await?;
            total -= record.size as i64;
            evicted.push(path);
            i += 1;
        }
        if !evicted.is_empty() {
            warn!(count = evicted.len(), total_bytes = total, "evicted files over budget");
        }
        Ok(evicted)
    }

    /// Downloads-directory sweep: unlike [`Janitor::sweep_evict`], this one
    /// knows about in-flight captures and asks streams to clean up after
    /// themselves rather than deleting blindly. Two passes: first, any
    /// ledger entry no stream currently claims (an orphan — e.g. left over
    /// from a crash) is deleted outright; then, if still over budget, each
    /// stream is asked — oldest broadcast first — to free its own oldest
    /// segments via [`crate::stream::Stream::clean_space`], which never
    /// touches that stream's active download.
    pub async fn sweep_downloads(&self, registry: &Registry) -> Result<Vec<PathBuf>, Error> {
        let typed = TypedStore::new(self.store.as_ref());
        let entries: Vec<(String, FileRecord)> = typed.list(NAMESPACE).await?;
        let streams = registry.all();

        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for stream in &streams {
            claimed.extend(stream.used_files().await);
        }

        let sizes: std::collections::HashMap<PathBuf, u64> = entries
            .iter()
            .map(|(k, r)| (self.dir.join(k), r.size))
            .collect();

        let mut total: i64 = entries.iter().map(|(_k, r)| r.size as i64).sum();
        let mut evicted = Vec::new();
        for (key, record) in &entries {
            let path = self.dir.join(key);
            if !claimed.contains(&path) {
                let _ = tokio::fs::remove_file(&path).await;
                typed.delete(NAMESPACE, key).await?;
                total -= record.size as i64;
                evicted.push(path);
            }
        }

        if total > self.budget_bytes {
            let mut shortfall = (total - self.budget_bytes) as u64;
            let mut by_start: Vec<(i64, Arc<crate::stream::Stream>)> = Vec::new();
            for stream in &streams {
                if let Some(start) = stream.start_time().await {
                    by_start.push((start, stream.clone()));
                }
            }
            by_start.sort_by_key(|(start, _)| *start);

            for (_start, stream) in by_start {
                if shortfall == 0 {
                    break;
                }
                let freed = stream.clean_space(shortfall).await?;
                for path in &freed {
                    let key = path_key(&self.dir, path);
                    typed.delete(NAMESPACE, &key).await?;
                    shortfall = shortfall.saturating_sub(sizes.get(path).copied().unwrap_or(0));
                }
                evicted.extend(freed);
            }
        }

        if !evicted.is_empty() {
            warn!(count = evicted.len(), "evicted files over budget (downloads)");
        }
        Ok(evicted)
    }
}

fn path_key(dir: &Path, path: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn evicts_least_recently_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let janitor = Janitor::new(dir.path().to_path_buf(), 15, store);

        for (name, size, ts) in [("a", 10u64, 1i64), ("b", 10, 2), ("c", 10, 3)] {
            let path = dir.path().join(name);
            tokio::fs::write(&path, vec![0u8; size as usize]).await.unwrap();
            janitor.touch(&path, size, ts).await.unwrap();
        }

        let evicted = janitor.sweep_evict().await.unwrap();
        assert_eq!(evicted, vec![dir.path().join("a"), dir.path().join("b")]);
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("c").exists());
    }

    #[tokio::test]
    async fn consistency_sweep_prunes_missing_files_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let janitor = Janitor::new(dir.path().to_path_buf(), 1000, store);
        let path = dir.path().join("ghost");
        janitor.touch(&path, 5, 1).await.unwrap();
        // File was never actually written to disk.
        janitor.sweep_consistency().await.unwrap();
        let evicted = janitor.sweep_evict().await.unwrap();
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn under_budget_evicts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let janitor = Janitor::new(dir.path().to_path_buf(), 1000, store);
        let path = dir.path().join("a");
        tokio::fs::write(&path, vec![0u8; 10]).await.unwrap();
        janitor.touch(&path, 10, 1).await.unwrap();
        let evicted = janitor.sweep_evict().await.unwrap();
        assert!(evicted.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn sweep_downloads_deletes_orphans_before_touching_streams() {
        use crate::cutter::tests::FakeCutter;
        use crate::downloader::past_range::PlatformTPastRange;
        use crate::ids::{Platform, StreamKey};
        use crate::registry::Registry;
        use crate::stream::{Segment, Stream};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let janitor = Janitor::new(dir.path().to_path_buf(), 10, store);

        let orphan = dir.path().join("orphan.ts");
        tokio::fs::write(&orphan, vec![0u8; 20]).await.unwrap();
        janitor.touch(&orphan, 20, 1).await.unwrap();

        let segment_path = dir.path().join("seg.ts");
        tokio::fs::write(&segment_path, vec![0u8; 5]).await.unwrap();
        janitor.touch(&segment_path, 5, 2).await.unwrap();

        let registry = Registry::new();
        let key = StreamKey::new(Platform::Y, "s1");
        let stream = registry.get_or_insert_with(key, || {
            Stream::new(
                StreamKey::new(Platform::Y, "s1"),
                "https://y.example/watch/s1".into(),
                dir.path().to_path_buf(),
                Arc::new(PlatformTPastRange),
                Arc::new(FakeCutter),
            )
        });
        stream
            .add_segment(Segment {
                range: 0..10,
                path: segment_path.clone(),
            })
            .await;

        let evicted = janitor.sweep_downloads(&registry).await.unwrap();
        assert_eq!(evicted, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(segment_path.exists());
    }
}
