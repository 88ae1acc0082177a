//! Local resource bounds and cleanup for a single job.
//!
//! Every file a job writes lives under one working directory owned by a
//! [`ResourceGuard`]. The guard keeps a registry of artifacts and a running
//! total of reserved bytes, and removes everything on [`ResourceGuard::release`]
//! or, failing that, when it is dropped.

use crate::config::ResourceConfig;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors raised by the resource guard.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Source video is {size} bytes, limit is {limit}")]
    VideoTooLarge { size: u64, limit: u64 },

    #[error("Reserving {requested} bytes would exceed the {ceiling} byte ceiling ({in_use} in use)")]
    CeilingExceeded {
        requested: u64,
        in_use: u64,
        ceiling: u64,
    },

    #[error("Source video grew past its reported {reported} bytes during download")]
    SourceGrew { reported: u64 },

    #[error("Workspace I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes held against the ephemeral ceiling. Returned to the guard on drop.
#[derive(Debug)]
pub struct Reservation {
    counter: Arc<AtomicU64>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Owns the local workspace of one job.
pub struct ResourceGuard {
    workdir: PathBuf,
    max_video_size: u64,
    ceiling: u64,
    in_use: Arc<AtomicU64>,
    artifacts: Mutex<Vec<PathBuf>>,
    released: AtomicBool,
}

impl ResourceGuard {
    /// Create the job's working directory under `config.work_root`.
    pub async fn create(job_id: Uuid, config: &ResourceConfig) -> Result<Self, ResourceError> {
        let workdir = config.work_root.join(format!("vigil-{}", job_id));
        tokio::fs::create_dir_all(&workdir).await?;

        debug!(workdir = %workdir.display(), "Created job workspace");

        Ok(Self {
            workdir,
            max_video_size: config.max_video_size_bytes,
            ceiling: config.ephemeral_ceiling_bytes,
            in_use: Arc::new(AtomicU64::new(0)),
            artifacts: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Metadata-only check, run before any video bytes are transferred.
    pub fn check_source_size(&self, size: u64) -> Result<(), ResourceError> {
        let limit = self.max_video_size.min(self.ceiling);
        if size > limit {
            return Err(ResourceError::VideoTooLarge { size, limit });
        }
        Ok(())
    }

    /// Reserve `bytes` against the ceiling.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation, ResourceError> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.ceiling {
                return Err(ResourceError::CeilingExceeded {
                    requested: bytes,
                    in_use: current,
                    ceiling: self.ceiling,
                });
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Reservation {
                        counter: Arc::clone(&self.in_use),
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Path for a new artifact inside the workspace, registered for cleanup.
    pub fn register(&self, file_name: &str) -> PathBuf {
        let path = self.workdir.join(file_name);
        self.artifacts.lock().push(path.clone());
        path
    }

    /// Remove an artifact early and drop it from the registry.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                return;
            }
        }
        self.artifacts.lock().retain(|p| p != path);
    }

    /// Number of artifacts still registered.
    pub fn artifact_count(&self) -> usize {
        self.artifacts.lock().len()
    }

    /// Remove every registered artifact and the workspace itself.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let leftovers = std::mem::take(&mut *self.artifacts.lock());
        for path in &leftovers {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                }
            }
        }

        match tokio::fs::remove_dir_all(&self.workdir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(workdir = %self.workdir.display(), error = %e, "Failed to remove workspace"),
        }

        info!(
            workdir = %self.workdir.display(),
            leftover_artifacts = leftovers.len(),
            "Released job workspace"
        );
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(workdir = %self.workdir.display(), error = %e, "Failed to remove workspace on drop");
                }
            }
        }
    }
}
