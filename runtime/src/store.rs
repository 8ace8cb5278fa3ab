//! Fire-and-forget listing persistence.
//!
//! Every parsed listing and every accepted comparable is offered to a
//! [`ListingSink`] from a spawned task owned by a [`SinkWriter`]. A failing
//! sink is logged and never fails the request that produced the record.
//! [`SinkWriter::flush`] waits for writes still in flight.
//!
//! [`JsonlSink`] appends one JSON object per line and rotates the file when
//! it exceeds `MAX_SINK_SIZE` (`.1`, `.2`, ... up to `MAX_ROTATIONS`).

use crate::error::ScrapeResult;
use crate::listing::PropertyListing;
use crate::strategy::Technique;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum sink size before rotation (50 MB).
const MAX_SINK_SIZE: u64 = 50 * 1024 * 1024;

/// Maximum number of rotated files to keep.
const MAX_ROTATIONS: u32 = 5;

/// One persisted record.
#[derive(Debug, Clone, Serialize)]
pub struct SinkRecord {
    pub timestamp: String,
    /// `listing` for a parse result, `comparable` for a search result.
    pub kind: &'static str,
    pub technique: Option<Technique>,
    /// Originating tier for comparables.
    pub tier: Option<String>,
    pub listing: PropertyListing,
}

impl SinkRecord {
    pub fn parsed(listing: PropertyListing, technique: Technique) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            kind: "listing",
            technique: Some(technique),
            tier: None,
            listing,
        }
    }

    pub fn comparable(listing: PropertyListing, tier: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            kind: "comparable",
            technique: None,
            tier: Some(tier.into()),
            listing,
        }
    }
}

/// Persistent-store collaborator.
#[async_trait]
pub trait ListingSink: Send + Sync {
    async fn save(&self, record: SinkRecord) -> ScrapeResult<()>;
}

/// Background writer in front of a [`ListingSink`].
///
/// Clones share the same sink and the same set of in-flight writes.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn ListingSink>,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn ListingSink>) -> Self {
        Self {
            sink,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Writer that discards everything.
    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Save in the background; errors are logged only.
    pub fn save(&self, record: SinkRecord) {
        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move {
            if let Err(e) = sink.save(record).await {
                warn!("listing sink failed: {e}");
            }
        });
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Number of writes not yet finished.
    pub fn pending(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every write started so far, including ones queued while waiting.
    pub async fn flush(&self) {
        loop {
            let batch = std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
            if batch.is_empty() {
                return;
            }
            debug!(writes = batch.len(), "flushing listing sink");
            for handle in batch {
                if let Err(e) = handle.await {
                    warn!("listing sink task failed: {e}");
                }
            }
        }
    }
}

struct SinkFile {
    file: File,
    /// Approximate current size (re-checked on rotation).
    current_size: u64,
}

/// Append-only JSONL sink with rotation.
pub struct JsonlSink {
    path: PathBuf,
    inner: Mutex<SinkFile>,
}

impl JsonlSink {
    /// Open or create the sink file, creating parent directories.
    pub fn open(path: &Path) -> ScrapeResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(SinkFile { file, current_size }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> ScrapeResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.current_size >= MAX_SINK_SIZE {
            inner.file.flush()?;
            rotate(&self.path);
            inner.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            inner.current_size = 0;
        }
        writeln!(inner.file, "{line}")?;
        inner.current_size += line.len() as u64 + 1;
        Ok(())
    }
}

#[async_trait]
impl ListingSink for JsonlSink {
    async fn save(&self, record: SinkRecord) -> ScrapeResult<()> {
        let line = serde_json::to_string(&record)?;
        self.append(&line)
    }
}

/// Shift `listings.jsonl` → `.1` → `.2` ..., dropping the oldest.
fn rotate(base: &Path) {
    for i in (1..MAX_ROTATIONS).rev() {
        let from = rotation_path(base, i);
        if from.exists() {
            let _ = std::fs::rename(&from, rotation_path(base, i + 1));
        }
    }
    let _ = std::fs::rename(base, rotation_path(base, 1));
}

fn rotation_path(base: &Path, index: u32) -> PathBuf {
    let name = format!(
        "{}.{index}",
        base.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("listings.jsonl")
    );
    base.with_file_name(name)
}

/// Sink that discards everything.
pub struct NullSink;

#[async_trait]
impl ListingSink for NullSink {
    async fn save(&self, _record: SinkRecord) -> ScrapeResult<()> {
        Ok(())
    }
}
