//! Flat-file embedding store with an mtime-keyed snapshot cache.
//!
//! The persisted form is a single pretty-printed JSON array of records,
//! rewritten whole on every append. Loads are served from an in-memory
//! snapshot while the file's modification time is unchanged.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use thiserror::Error;

use crate::matcher::Matcher;
use crate::types::{Embedding, FaceRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] io::Error),
    #[error("malformed store file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding store document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What to do when the persisted document fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptPolicy {
    /// Treat the store as empty, logging the condition.
    #[default]
    TreatAsEmpty,
    /// Surface [`StoreError::Corrupt`] to the caller.
    Reject,
}

struct CacheEntry {
    snapshot: Arc<Vec<FaceRecord>>,
    modified: SystemTime,
}

/// JSON-file-backed record store.
///
/// The cache lives inside the store rather than in process globals, so tests
/// can construct independent stores over temp files.
pub struct VectorStore {
    path: PathBuf,
    on_corrupt: CorruptPolicy,
    cache: Mutex<Option<CacheEntry>>,
}

impl VectorStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_corrupt_policy(path, CorruptPolicy::default())
    }

    pub fn with_corrupt_policy(path: impl Into<PathBuf>, on_corrupt: CorruptPolicy) -> Self {
        Self {
            path: path.into(),
            on_corrupt,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record snapshot.
    ///
    /// A missing file is an empty store. While the file's modification time
    /// matches the one recorded at the last load, the cached snapshot is
    /// returned as-is; two `load()` calls without an intervening write hand
    /// back the same `Arc`.
    pub fn load(&self) -> Result<Arc<Vec<FaceRecord>>, StoreError> {
        let modified = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Arc::new(Vec::new())),
            Err(e) => return Err(e.into()),
        };

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = cache.as_ref() {
            if entry.modified == modified {
                return Ok(Arc::clone(&entry.snapshot));
            }
        }

        let snapshot = Arc::new(self.read_document()?);
        *cache = Some(CacheEntry {
            snapshot: Arc::clone(&snapshot),
            modified,
        });
        Ok(snapshot)
    }

    /// Append one record: read the whole document, push, rewrite it, and
    /// invalidate the cached snapshot so the next load observes the write.
    pub fn append(&self, record: FaceRecord) -> Result<(), StoreError> {
        let mut records = self.read_document()?;
        records.push(record);

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let doc = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.path, doc)?;

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = None;
        Ok(())
    }

    /// Read and parse the whole document, applying the corrupt policy.
    fn read_document(&self) -> Result<Vec<FaceRecord>, StoreError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&data) {
            Ok(records) => Ok(records),
            Err(source) => match self.on_corrupt {
                CorruptPolicy::TreatAsEmpty => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %source,
                        "store file is malformed; treating as empty"
                    );
                    Ok(Vec::new())
                }
                CorruptPolicy::Reject => Err(StoreError::Corrupt {
                    path: self.path.display().to_string(),
                    source,
                }),
            },
        }
    }
}

/// Outcome of an enrollment attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    /// The record was appended to the store.
    Enrolled,
    /// The duplicate guard refused the write: the probe already matches an
    /// enrolled identity at or above the threshold.
    AlreadyRegistered { label: String, score: f32 },
}

/// Persist a new embedding under `label`.
///
/// With `force` unset and a non-empty store, the probe is first matched
/// against the existing records and a recognized identity refuses the write.
/// The check and the write are not atomic against concurrent enrollers;
/// the intended deployment is a single local user.
pub fn enroll(
    store: &VectorStore,
    matcher: &dyn Matcher,
    threshold: f32,
    label: &str,
    embedding: Embedding,
    force: bool,
) -> Result<EnrollOutcome, StoreError> {
    if !force {
        let records = store.load()?;
        if !records.is_empty() {
            let result = matcher.best_match(&embedding, &records, threshold);
            if let Some(existing) = result.label {
                return Ok(EnrollOutcome::AlreadyRegistered {
                    label: existing,
                    score: result.score,
                });
            }
        }
    }

    store.append(FaceRecord {
        label: label.to_string(),
        vector: embedding.values,
    })?;
    Ok(EnrollOutcome::Enrolled)
}
