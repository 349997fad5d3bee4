//! Knowledge-base ingestion: scan → register → extract → chunk → embed →
//! persist.
//!
//! One controller instance owns the pipeline. Scans and processing runs
//! are non-reentrant; pause and cancel are cooperative, observed at every
//! scan step, file loop, and chunk loop through [`RunToken::checkpoint`].
//! Processing fans out over a semaphore-bounded worker pool; each file is
//! written in a single transaction (old chunks deleted first, new ones
//! batch-inserted) so a failure never leaves a file half-indexed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::LruTtlCache;
use crate::chunk;
use crate::engine::{content_hash, vec_to_blob, EngineHandle};
use crate::error::{Error, Result};
use crate::extract;
use crate::models::{
    ChunkProgress, KbFile, SyncProgress, STATUS_ERROR, STATUS_PENDING, STATUS_PROCESSED,
};
use crate::store::{self, NewChunk};

/// Interval at which a paused worker re-checks the pause flag.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Per-chunk progress updates are throttled to every N chunks…
const PROGRESS_CHUNK_STRIDE: usize = 25;
/// …or at least this often.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(250);

/// Embedding is skipped for spreadsheets at or past either bound; the
/// chunks stay keyword-searchable and can be embedded on demand later.
const SKIP_EMBED_MIN_CHUNKS: usize = 200;
const SKIP_EMBED_MIN_BYTES: i64 = 3 * 1024 * 1024;

/// Worker pool size for file processing.
fn worker_limit() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 2).clamp(4, 16)
}

/// Cooperative cancellation plus pause for one ingestion run.
///
/// Cancel is sticky per token; `cancel_sync` replaces the controller's
/// token so the next run starts clean. Pause is polled: a paused worker
/// sleeps in 200 ms slices until resumed or cancelled.
#[derive(Clone)]
pub struct RunToken {
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl RunToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Called at every loop head: errors out when cancelled, parks in
    /// 200 ms slices while paused.
    pub async fn checkpoint(&self) -> Result<()> {
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !self.paused.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }
}

pub struct KnowledgeBase {
    pool: SqlitePool,
    engine: EngineHandle,
    progress: Mutex<SyncProgress>,
    run: Mutex<RunToken>,
    syncing: AtomicBool,
    embedding_cache: LruTtlCache<String, Vec<u8>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the non-reentrancy flag when a run finishes, however it exits.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl KnowledgeBase {
    pub fn new(pool: SqlitePool, engine: EngineHandle) -> Arc<Self> {
        Arc::new(Self {
            pool,
            engine,
            progress: Mutex::new(SyncProgress::default()),
            run: Mutex::new(RunToken::new()),
            syncing: AtomicBool::new(false),
            embedding_cache: LruTtlCache::new(2048, Duration::from_secs(600)),
        })
    }

    pub fn sync_progress(&self) -> SyncProgress {
        lock(&self.progress).clone()
    }

    pub fn pause_sync(&self) {
        lock(&self.run).set_paused(true);
    }

    pub fn resume_sync(&self) {
        lock(&self.run).set_paused(false);
    }

    /// Cancel the current run, reset progress, and install a fresh token
    /// for subsequent runs.
    pub fn cancel_sync(&self) {
        let mut run = lock(&self.run);
        run.cancel();
        *run = RunToken::new();
        drop(run);

        self.syncing.store(false, Ordering::SeqCst);
        *lock(&self.progress) = SyncProgress::default();
    }

    /// Cancel on shutdown without resetting anything else.
    pub fn close(&self) {
        lock(&self.run).cancel();
    }

    fn current_run(&self) -> RunToken {
        lock(&self.run).clone()
    }

    fn begin_sync(&self) -> Result<SyncGuard<'_>> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SyncInProgress);
        }
        Ok(SyncGuard(&self.syncing))
    }

    fn set_progress(&self, progress: SyncProgress) {
        let mut guard = lock(&self.progress);
        // Keep the per-file chunk list across coarse updates.
        let chunk_progress = std::mem::take(&mut guard.chunk_progress);
        *guard = progress;
        if guard.chunk_progress.is_empty() {
            guard.chunk_progress = chunk_progress;
        }
    }

    fn update_chunk_progress(&self, update: ChunkProgress) {
        let mut guard = lock(&self.progress);
        match guard
            .chunk_progress
            .iter_mut()
            .find(|p| p.file_name == update.file_name)
        {
            Some(existing) => *existing = update,
            None => guard.chunk_progress.push(update),
        }
    }

    // ============ Public operations ============

    /// Register and immediately process a single file.
    pub async fn add_file(&self, path: &Path) -> Result<()> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            return Err(Error::InvalidInput(format!(
                "path is a directory: {}",
                path.display()
            )));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if filename.starts_with(".~") {
            return Err(Error::Unsupported(format!(
                "temporary file not supported: {filename}"
            )));
        }
        let ext = extract::file_ext(path);
        if !extract::is_supported_ext(&ext) {
            return Err(Error::Unsupported(format!("file extension: .{ext}")));
        }

        let checksum = md5_file(path)?;
        let file = store::save_kb_file(
            &self.pool,
            &path.to_string_lossy(),
            meta.len() as i64,
            &checksum,
        )
        .await?;

        let run = self.current_run();
        match self.process_file(&file, &run).await {
            Ok(()) => {
                store::update_kb_file_status(&self.pool, file.id, STATUS_PROCESSED).await?;
                Ok(())
            }
            Err(err) => {
                let _ = store::update_kb_file_status(&self.pool, file.id, STATUS_ERROR).await;
                Err(err)
            }
        }
    }

    /// Walk the configured folder and register every supported file.
    /// Files are only registered here; `process_files` does the heavy
    /// work.
    pub async fn scan_folder(&self) -> Result<()> {
        let run = self.current_run();
        if run.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _guard = self.begin_sync()?;

        let folder = store::get_kb_folder(&self.pool)
            .await?
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("knowledge base folder not set".to_string()))?;

        *lock(&self.progress) = SyncProgress::default();
        self.set_progress(SyncProgress {
            status: "scanning".to_string(),
            ..SyncProgress::default()
        });

        // First pass: collect candidate paths.
        let root = PathBuf::from(&folder);
        let entries = tokio::task::spawn_blocking(move || collect_supported_files(&root))
            .await
            .map_err(|e| Error::Transient(format!("scan task failed: {e}")))??;

        // Second pass: hash each file, skipping unreadable ones.
        let mut files: Vec<(PathBuf, i64, String)> = Vec::new();
        for (path, size) in entries {
            run.checkpoint().await?;
            let hash_path = path.clone();
            let checksum =
                match tokio::task::spawn_blocking(move || md5_file(&hash_path)).await {
                    Ok(Ok(checksum)) => checksum,
                    Ok(Err(err)) => {
                        warn!("skipping unreadable file {}: {err}", path.display());
                        continue;
                    }
                    Err(err) => return Err(Error::Transient(format!("hash task failed: {err}"))),
                };
            files.push((path.clone(), size, checksum));
            self.set_progress(SyncProgress {
                total_files: files.len(),
                current_file: path.to_string_lossy().into_owned(),
                status: "scanning".to_string(),
                ..SyncProgress::default()
            });
        }

        // Third pass: register in the database.
        let total = files.len();
        self.set_progress(SyncProgress {
            total_files: total,
            status: "syncing".to_string(),
            ..SyncProgress::default()
        });
        for (i, (path, size, checksum)) in files.iter().enumerate() {
            run.checkpoint().await?;
            store::save_kb_file(&self.pool, &path.to_string_lossy(), *size, checksum).await?;
            self.set_progress(SyncProgress {
                total_files: total,
                processed_files: i + 1,
                current_file: path.to_string_lossy().into_owned(),
                status: "syncing".to_string(),
                progress: (i + 1) as f64 / total.max(1) as f64 * 100.0,
                ..SyncProgress::default()
            });
        }

        self.set_progress(SyncProgress {
            total_files: total,
            processed_files: total,
            status: "completed".to_string(),
            progress: 100.0,
            ..SyncProgress::default()
        });
        info!("scan registered {total} files from {folder}");
        Ok(())
    }

    /// Process every pending file in parallel. Returns the first error
    /// after all workers drain; individual failures mark their file
    /// `error` and do not stop the batch.
    pub async fn process_files(self: &Arc<Self>) -> Result<()> {
        let run = self.current_run();
        if run.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _guard = self.begin_sync()?;

        let pending: Vec<KbFile> = store::list_kb_files(&self.pool)
            .await?
            .into_iter()
            .filter(|f| f.status == STATUS_PENDING)
            .collect();

        if pending.is_empty() {
            *lock(&self.progress) = SyncProgress::default();
            return Ok(());
        }

        let total = pending.len();
        *lock(&self.progress) = SyncProgress::default();
        self.set_progress(SyncProgress {
            total_files: total,
            status: "processing".to_string(),
            ..SyncProgress::default()
        });

        let semaphore = Arc::new(Semaphore::new(worker_limit()));
        let processed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for file in pending {
            let kb = Arc::clone(self);
            let run = run.clone();
            let semaphore = Arc::clone(&semaphore);
            let processed = Arc::clone(&processed);
            tasks.spawn(async move {
                run.checkpoint().await?;
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                run.checkpoint().await?;

                let done = processed.load(Ordering::Relaxed);
                kb.set_progress(SyncProgress {
                    total_files: total,
                    processed_files: done,
                    current_file: file.path.clone(),
                    status: "processing".to_string(),
                    progress: done as f64 / total as f64 * 100.0,
                    ..SyncProgress::default()
                });

                match kb.process_file(&file, &run).await {
                    Ok(()) => {
                        let _ = store::update_kb_file_status(&kb.pool, file.id, STATUS_PROCESSED)
                            .await;
                        let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                        kb.set_progress(SyncProgress {
                            total_files: total,
                            processed_files: done,
                            status: "processing".to_string(),
                            progress: done as f64 / total as f64 * 100.0,
                            ..SyncProgress::default()
                        });
                        Ok(())
                    }
                    Err(err) => {
                        warn!("processing {} failed: {err}", file.path);
                        let _ =
                            store::update_kb_file_status(&kb.pool, file.id, STATUS_ERROR).await;
                        Err(err)
                    }
                }
            });
        }

        let mut first_err: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Transient(format!("worker panicked: {err}")));
                    }
                }
            }
        }

        // A cancelled run reports idle, even when a worker slipped in a
        // late update between the cancel and its own exit.
        if run.is_cancelled() {
            *lock(&self.progress) = SyncProgress::default();
        } else {
            self.set_progress(SyncProgress {
                total_files: total,
                processed_files: total,
                status: "completed".to_string(),
                progress: 100.0,
                ..SyncProgress::default()
            });
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ============ Per-file pipeline ============

    async fn process_file(&self, file: &KbFile, run: &RunToken) -> Result<()> {
        self.check_embedding_model().await?;

        let path = PathBuf::from(&file.path);
        let ext = extract::file_ext(&path);
        let file_size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);

        let chunks = self.extract_chunks(&path, &ext, file_size).await?;
        if chunks.is_empty() {
            debug!("no content chunks in {}", file.path);
            return Ok(());
        }

        let total_chunks = chunks.len();
        let skip_embedding = matches!(ext.as_str(), "xlsx" | "xls")
            && (total_chunks >= SKIP_EMBED_MIN_CHUNKS || file_size >= SKIP_EMBED_MIN_BYTES);
        if skip_embedding {
            info!(
                "skipping embeddings for {} ({total_chunks} chunks, {file_size} bytes)",
                file.path
            );
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.update_chunk_progress(ChunkProgress {
            file_name: file_name.clone(),
            total_chunks,
            processed_chunks: 0,
            progress: 0.0,
        });

        let batch_size = if total_chunks >= 2000 { 500 } else { 200 };
        let mut batch: Vec<NewChunk> = Vec::with_capacity(batch_size);
        let mut processed = 0usize;
        let mut last_update = Instant::now();

        let mut tx = self.pool.begin().await?;
        store::delete_file_chunks(&mut tx, file.id).await?;

        for content in chunks {
            // Dropping the transaction on any early return rolls the
            // whole file back.
            run.checkpoint().await?;

            let vector = if skip_embedding {
                Vec::new()
            } else {
                self.embedding_for(&content).await
            };
            batch.push(NewChunk { content, vector });

            processed += 1;
            if processed == total_chunks
                || processed % PROGRESS_CHUNK_STRIDE == 0
                || last_update.elapsed() >= PROGRESS_MIN_INTERVAL
            {
                self.update_chunk_progress(ChunkProgress {
                    file_name: file_name.clone(),
                    total_chunks,
                    processed_chunks: processed,
                    progress: processed as f64 / total_chunks as f64 * 100.0,
                });
                last_update = Instant::now();
            }

            if batch.len() >= batch_size {
                store::insert_chunk_batch(&mut tx, file.id, &batch).await?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            store::insert_chunk_batch(&mut tx, file.id, &batch).await?;
        }
        tx.commit().await?;

        debug!("indexed {} ({total_chunks} chunks)", file.path);
        Ok(())
    }

    async fn extract_chunks(&self, path: &Path, ext: &str, file_size: i64) -> Result<Vec<String>> {
        let path = path.to_path_buf();
        let ext = ext.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            match ext.as_str() {
                "xlsx" | "xls" => {
                    let sheets = extract::excel_index_records(&path)?;
                    let target =
                        chunk::excel_target_chars(file_size, extract::row_cap(file_size));
                    let basename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    Ok(chunk::pack_excel_records(&sheets, &basename, target))
                }
                _ => {
                    let content = extract::file_content(&path)?;
                    Ok(chunk::split_for_ext(&content, &ext))
                }
            }
        })
        .await
        .map_err(|e| Error::Transient(format!("extract task failed: {e}")))?
    }

    /// Embed one chunk, consulting the content-hash cache first. A
    /// failure is non-fatal: the chunk is stored with an empty vector and
    /// stays keyword-searchable.
    async fn embedding_for(&self, content: &str) -> Vec<u8> {
        let key = content_hash(content);
        if let Some(cached) = self.embedding_cache.get(&key) {
            return cached;
        }

        let text = content.to_string();
        match self.engine.with_locked(move |e| e.embed(&text)).await {
            Ok(vec) if !vec.is_empty() => {
                let blob = vec_to_blob(&vec);
                self.embedding_cache.set(key, blob.clone());
                blob
            }
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!("embedding failed, storing chunk without vector: {err}");
                Vec::new()
            }
        }
    }

    /// The vectors already in the store must come from the same model
    /// the engine is using now; otherwise similarity scores are garbage
    /// and the store has to be rebuilt.
    async fn check_embedding_model(&self) -> Result<()> {
        let current = self.engine.model_path().await.unwrap_or_default();
        if current.is_empty() {
            return Ok(());
        }
        match store::get_kb_embedding_model(&self.pool).await? {
            None => {
                store::set_kb_embedding_model(&self.pool, &current).await?;
                Ok(())
            }
            Some(existing) if existing.trim().is_empty() => {
                store::set_kb_embedding_model(&self.pool, &current).await?;
                Ok(())
            }
            Some(existing) if existing.trim() == current => Ok(()),
            Some(existing) => Err(Error::EmbeddingModelMismatch {
                kb: existing.trim().to_string(),
                current,
            }),
        }
    }
}

/// Walk a folder collecting supported, non-temporary files.
fn collect_supported_files(root: &Path) -> Result<Vec<(PathBuf, i64)>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("scan skipping entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with(".~") {
            continue;
        }
        if !extract::is_supported_ext(&extract::file_ext(entry.path())) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
        out.push((entry.into_path(), size));
    }
    Ok(out)
}

/// MD5 hex digest of a file's contents, streamed.
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_limit_is_clamped() {
        let limit = worker_limit();
        assert!((4..=16).contains(&limit));
    }

    #[test]
    fn md5_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn checkpoint_errors_after_cancel() {
        let token = RunToken::new();
        token.cancel();
        assert!(matches!(token.checkpoint().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn checkpoint_parks_while_paused() {
        let token = RunToken::new();
        token.set_paused(true);
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        token.set_paused(false);
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn scan_filter_skips_temp_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "a").unwrap();
        std::fs::write(dir.path().join(".~lock.doc.docx"), "b").unwrap();
        std::fs::write(dir.path().join("image.png"), "c").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/readme.md"), "d").unwrap();

        let mut found = collect_supported_files(dir.path()).unwrap();
        found.sort();
        let names: Vec<String> = found
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["notes.txt", "readme.md"]);
    }
}
