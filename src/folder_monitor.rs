//! C13 — Folder monitor: periodic scan of registered roots, classifying
//! files as new/modified/deleted against a remembered `(path, mtime, size)`
//! snapshot and driving the ingestion engine accordingly (§4.8).

use crate::errors::RagResult;
use crate::ingestion::IngestionEngine;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Map;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
struct FileFingerprint {
    mtime_secs: i64,
    size: u64,
}

#[derive(Debug, Clone)]
struct WatchedFolder {
    root: PathBuf,
    patterns: Vec<String>,
    recursive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub indexed: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl Default for ScanOutcome {
    fn default() -> Self {
        Self {
            indexed: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub folder_count: usize,
    pub tracked_file_count: usize,
    pub last_scan: Option<ScanOutcome>,
}

struct MonitorState {
    folders: Vec<WatchedFolder>,
    known_files: HashMap<PathBuf, FileFingerprint>,
    last_scan: Option<ScanOutcome>,
}

/// Periodically scans its registered roots and ingests/deletes documents as
/// files appear, change, or disappear. Scans are serialized by an async
/// mutex so a manual `force_scan` never overlaps the background loop's own
/// tick.
pub struct FolderMonitor {
    state: RwLock<MonitorState>,
    scan_lock: AsyncMutex<()>,
    running: AtomicBool,
    ingestion: Arc<IngestionEngine>,
    check_interval: Duration,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FolderMonitor {
    pub fn new(ingestion: Arc<IngestionEngine>, check_interval: Duration) -> Self {
        Self {
            state: RwLock::new(MonitorState {
                folders: Vec::new(),
                known_files: HashMap::new(),
                last_scan: None,
            }),
            scan_lock: AsyncMutex::new(()),
            running: AtomicBool::new(false),
            ingestion,
            check_interval,
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Registers a folder to watch and returns how many files in it already
    /// match `patterns` (§8 scenario S6). Adding the same root twice is a
    /// no-op, but the count is still reported.
    pub fn add_folder(&self, root: impl Into<PathBuf>, patterns: Vec<String>, recursive: bool) -> usize {
        let root = root.into();
        let files_found = count_matching_files(&root, &patterns, recursive);
        let mut state = self.state.write();
        if state.folders.iter().any(|f| f.root == root) {
            return files_found;
        }
        state.folders.push(WatchedFolder {
            root,
            patterns,
            recursive,
        });
        files_found
    }

    pub fn remove_folder(&self, root: &Path) -> bool {
        let mut state = self.state.write();
        let before = state.folders.len();
        state.folders.retain(|f| f.root != root);
        state.folders.len() != before
    }

    pub fn list_folders(&self) -> Vec<PathBuf> {
        self.state.read().folders.iter().map(|f| f.root.clone()).collect()
    }

    pub fn list_files(&self) -> Vec<PathBuf> {
        self.state.read().known_files.keys().cloned().collect()
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.state.read();
        MonitorStatus {
            running: self.running.load(Ordering::SeqCst),
            folder_count: state.folders.len(),
            tracked_file_count: state.known_files.len(),
            last_scan: state.last_scan.clone(),
        }
    }

    /// Starts the background scan loop. Starting an already-running monitor
    /// is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.check_interval);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                let outcome = this.scan().await;
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "folder monitor scan failed");
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stops the background scan loop, joining the scanner task before
    /// returning so an in-flight scan (possibly mid-ingest, holding an
    /// identity lock) finishes cleanly rather than being cancelled (§4.12).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn force_scan(&self) -> RagResult<ScanOutcome> {
        self.scan().await
    }

    async fn scan(&self) -> RagResult<ScanOutcome> {
        let _guard = self.scan_lock.lock().await;

        let folders = self.state.read().folders.clone();
        let mut outcome = ScanOutcome::default();
        let mut seen_this_scan: HashMap<PathBuf, FileFingerprint> = HashMap::new();

        for folder in &folders {
            let walker = if folder.recursive {
                walkdir::WalkDir::new(&folder.root)
            } else {
                walkdir::WalkDir::new(&folder.root).max_depth(1)
            };

            for entry in walker.into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path().to_path_buf();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !folder.patterns.is_empty()
                    && !folder.patterns.iter().any(|p| pattern_matches(p, name))
                {
                    continue;
                }

                let metadata = match std::fs::metadata(&path) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let fingerprint = FileFingerprint {
                    mtime_secs: metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                    size: metadata.len(),
                };
                seen_this_scan.insert(path.clone(), fingerprint);

                let previous = self.state.read().known_files.get(&path).copied();
                match previous {
                    Some(prev) if prev == fingerprint => {
                        outcome.skipped += 1;
                        continue;
                    }
                    Some(_) => {
                        match self.ingestion.ingest_file(&path, Map::new()).await {
                            Ok(_) => outcome.updated += 1,
                            Err(e) => outcome.errors.push(format!("{}: {e}", path.display())),
                        }
                    }
                    None => match self.ingestion.ingest_file(&path, Map::new()).await {
                        Ok(_) => outcome.indexed += 1,
                        Err(e) => outcome.errors.push(format!("{}: {e}", path.display())),
                    },
                }
            }
        }

        let removed: Vec<PathBuf> = {
            let state = self.state.read();
            state
                .known_files
                .keys()
                .filter(|p| !seen_this_scan.contains_key(*p))
                .cloned()
                .collect()
        };
        for path in &removed {
            let identity = path.to_string_lossy().to_string();
            match self.ingestion.delete_file(&identity) {
                Ok(_) => outcome.deleted += 1,
                Err(e) => outcome.errors.push(format!("{}: {e}", path.display())),
            }
        }

        {
            let mut state = self.state.write();
            state.known_files = seen_this_scan;
            state.last_scan = Some(outcome.clone());
        }

        Ok(outcome)
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return name.ends_with(suffix);
    }
    pattern == name || pattern == "*"
}

/// Counts files under `root` that match `patterns` (an empty pattern list
/// matches everything), without touching the monitor's known-files table.
fn count_matching_files(root: &Path, patterns: &[String], recursive: bool) -> usize {
    let walker = if recursive {
        walkdir::WalkDir::new(root)
    } else {
        walkdir::WalkDir::new(root).max_depth(1)
    };
    walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.path().file_name().and_then(|n| n.to_str()).unwrap_or("");
            patterns.is_empty() || patterns.iter().any(|p| pattern_matches(p, name))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use crate::metadata_store::FileMetadataStore;
    use crate::processor_registry::ProcessorRegistry;
    use crate::vector_store::VectorStore;
    use async_trait::async_trait;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed_text(&self, text: &str) -> RagResult<Vec<f32>> {
            Ok(vec![text.len() as f32, 0.0])
        }
        async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed_text(t).await?);
            }
            Ok(out)
        }
        fn get_dimension(&self) -> usize {
            2
        }
    }

    async fn monitor(data_dir: &Path) -> FolderMonitor {
        let vs = Arc::new(VectorStore::open(data_dir, 2).await.unwrap());
        let ms = Arc::new(FileMetadataStore::open(data_dir).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder);
        let processors = Arc::new(ProcessorRegistry::new());
        let ingestion = Arc::new(IngestionEngine::new(vs, ms, embedder, processors, 1750, 200));
        FolderMonitor::new(ingestion, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn scan_indexes_new_files_and_skips_unchanged() {
        let data_dir = tempfile::tempdir().unwrap();
        let watch_dir = tempfile::tempdir().unwrap();
        std::fs::write(watch_dir.path().join("a.txt"), "hello world").unwrap();

        let mon = monitor(data_dir.path()).await;
        mon.add_folder(watch_dir.path(), vec!["*.txt".to_string()], false);

        let first = mon.force_scan().await.unwrap();
        assert_eq!(first.indexed, 1);

        let second = mon.force_scan().await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.indexed, 0);
    }

    #[tokio::test]
    async fn scan_detects_modification_and_deletion() {
        let data_dir = tempfile::tempdir().unwrap();
        let watch_dir = tempfile::tempdir().unwrap();
        let file_path = watch_dir.path().join("a.txt");
        std::fs::write(&file_path, "hello world").unwrap();

        let mon = monitor(data_dir.path()).await;
        mon.add_folder(watch_dir.path(), vec!["*.txt".to_string()], false);
        mon.force_scan().await.unwrap();

        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(&file_path, "hello world, much longer now").unwrap();
        let second = mon.force_scan().await.unwrap();
        assert_eq!(second.updated, 1);

        std::fs::remove_file(&file_path).unwrap();
        let third = mon.force_scan().await.unwrap();
        assert_eq!(third.deleted, 1);
        assert!(mon.list_files().is_empty());
    }

    #[test]
    fn adding_same_root_twice_is_idempotent() {
        let data_dir = tempfile::tempdir().unwrap();
        let watch_dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mon = rt.block_on(monitor(data_dir.path()));
        mon.add_folder(watch_dir.path(), vec![], true);
        mon.add_folder(watch_dir.path(), vec![], true);
        assert_eq!(mon.list_folders().len(), 1);
    }

    #[tokio::test]
    async fn add_folder_reports_files_already_present() {
        let data_dir = tempfile::tempdir().unwrap();
        let watch_dir = tempfile::tempdir().unwrap();
        std::fs::write(watch_dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(watch_dir.path().join("b.md"), "ignored").unwrap();

        let mon = monitor(data_dir.path()).await;
        let files_found = mon.add_folder(watch_dir.path(), vec!["*.txt".to_string()], false);
        assert_eq!(files_found, 1);

        // re-adding the same root reports the count again without duplicating it
        let again = mon.add_folder(watch_dir.path(), vec!["*.txt".to_string()], false);
        assert_eq!(again, 1);
        assert_eq!(mon.list_folders().len(), 1);
    }

    #[tokio::test]
    async fn stop_joins_the_scan_loop_before_returning() {
        let data_dir = tempfile::tempdir().unwrap();
        let mon = Arc::new(monitor(data_dir.path()).await);
        mon.start();
        mon.stop().await;
        assert!(!mon.status().running);
    }
}
