//! Local disk cache for events that could not be published or persisted.
//!
//! Events are buffered in memory and written as one JSON array per file once
//! the buffer reaches the flush threshold. Files are named
//! `cache_<yyyyMMddHHmmss>_<counter>.json` so lexical order is write order, and
//! are written through a `.tmp` sibling plus rename so a crash never leaves a
//! half-written file under the final name.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use abstractgateway::ValidationEvent;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::metrics::PipelineMetrics;

const FILE_PREFIX: &str = "cache_";
const FILE_SUFFIX: &str = ".json";
const REPLAYED_DIR: &str = "replayed";

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache file {path} is not a valid event array: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io { path: path.to_path_buf(), source }
}

/// Result of scanning the cache directory at startup.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Files that were read, in write order.
    pub files: Vec<PathBuf>,
    /// Their events, concatenated in file order.
    pub events: Vec<ValidationEvent>,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct DurabilityCache {
    base: PathBuf,
    threshold: usize,
    buffer: Mutex<Vec<ValidationEvent>>,
    counter: AtomicU64,
    metrics: Arc<dyn PipelineMetrics>,
}

impl std::fmt::Debug for DurabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurabilityCache")
            .field("base", &self.base)
            .field("threshold", &self.threshold)
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl DurabilityCache {
    /// Create the cache, making sure the base directory exists.
    pub async fn open(cfg: &CacheConfig, metrics: Arc<dyn PipelineMetrics>) -> Result<Arc<Self>, CacheError> {
        tokio::fs::create_dir_all(&cfg.base_path)
            .await
            .map_err(io_err(&cfg.base_path))?;
        info!(path = %cfg.base_path.display(), threshold = cfg.flush_threshold, "durability cache ready");
        Ok(Arc::new(Self {
            base: cfg.base_path.clone(),
            threshold: cfg.flush_threshold.max(1),
            buffer: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            metrics,
        }))
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Events held in memory, not yet on disk.
    pub fn buffered(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ValidationEvent>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer one event; writes a file when the buffer reaches the threshold.
    pub async fn store(&self, event: ValidationEvent) -> Result<(), CacheError> {
        self.store_all(vec![event]).await
    }

    /// Buffer several events at once.
    pub async fn store_all(&self, events: Vec<ValidationEvent>) -> Result<(), CacheError> {
        if events.is_empty() {
            return Ok(());
        }
        let count = events.len();
        let full = {
            let mut buf = self.lock();
            buf.extend(events);
            if buf.len() >= self.threshold {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        self.metrics.events_cached(count);

        match full {
            Some(batch) => self.write_or_restore(batch).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Write whatever is buffered. Returns the number of events written.
    pub async fn flush(&self) -> Result<usize, CacheError> {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        self.write_or_restore(batch).await
    }

    /// On failure the batch goes back to the front of the buffer so the next
    /// flush retries it.
    async fn write_or_restore(&self, batch: Vec<ValidationEvent>) -> Result<usize, CacheError> {
        let len = batch.len();
        match self.write_file(&batch).await {
            Ok(path) => {
                debug!(path = %path.display(), events = len, "cache file written");
                Ok(len)
            }
            Err(e) => {
                error!(error = %e, events = len, "cache write failed, keeping events in memory");
                let mut buf = self.lock();
                let newer = std::mem::take(&mut *buf);
                *buf = batch;
                buf.extend(newer);
                Err(e)
            }
        }
    }

    async fn next_path(&self) -> Result<PathBuf, CacheError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let path = self.base.join(format!("{FILE_PREFIX}{stamp}_{n:012}{FILE_SUFFIX}"));
            // a previous run may have used the same second and counter
            if !tokio::fs::try_exists(&path).await.map_err(io_err(&path))? {
                return Ok(path);
            }
        }
    }

    async fn write_file(&self, batch: &[ValidationEvent]) -> Result<PathBuf, CacheError> {
        let path = self.next_path().await?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(batch).map_err(|source| CacheError::Serde { path: path.clone(), source })?;

        tokio::fs::write(&tmp, &bytes).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
        Ok(path)
    }

    /// Cache files currently on disk, oldest first.
    pub async fn files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut entries = tokio::fs::read_dir(&self.base).await.map_err(io_err(&self.base))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.base))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read every cache file. Files are left in place; call [`Self::archive`]
    /// once their events have been handed back to the pipeline. Unreadable
    /// files are skipped with a warning and stay on disk.
    pub async fn recover(&self) -> Result<Recovery, CacheError> {
        let mut recovery = Recovery::default();
        for path in self.files().await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable cache file");
                    continue;
                }
            };
            match serde_json::from_slice::<Vec<ValidationEvent>>(&bytes) {
                Ok(events) => {
                    debug!(path = %path.display(), events = events.len(), "cache file recovered");
                    recovery.events.extend(events);
                    recovery.files.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt cache file");
                }
            }
        }
        if !recovery.files.is_empty() {
            info!(files = recovery.files.len(), events = recovery.events.len(), "recovered cached events");
        }
        Ok(recovery)
    }

    /// Move replayed files into `<base>/replayed/`. Returns how many were moved.
    pub async fn archive(&self, files: &[PathBuf]) -> Result<usize, CacheError> {
        if files.is_empty() {
            return Ok(0);
        }
        let dir = self.base.join(REPLAYED_DIR);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        let mut moved = 0;
        for file in files {
            let Some(name) = file.file_name() else { continue };
            tokio::fs::rename(file, dir.join(name)).await.map_err(io_err(file))?;
            moved += 1;
        }
        info!(files = moved, dir = %dir.display(), "archived replayed cache files");
        Ok(moved)
    }
}
