//! The "latest successful backup" pointer.
//!

use std::{fs, io, path::PathBuf};

use thiserror::Error;
use tracing::info;

use crate::{
    BackupRoot, Manifest, ManifestError, RunId, RunStatus,
    manifest::RunIdError,
    staging::{StageError, write_atomic},
};

/// Publishes and resolves the latest pointer.
///
/// Publishing replaces the pointer file with a single rename, readers never need the run lock.
#[derive(Debug, Clone)]
pub struct PointerPublisher {
    root: BackupRoot,
}

impl PointerPublisher {
    #[allow(missing_docs)]
    pub fn new(root: BackupRoot) -> Self {
        Self { root }
    }

    /// Point at `id`. The run's manifest must already be written with status `succeeded`.
    pub fn publish(&self, id: RunId) -> Result<(), PublishError> {
        let manifest = Manifest::load(&self.root.run_directory(id))?;
        if manifest.run.status != RunStatus::Succeeded {
            return Err(PublishError::NotSucceeded(id, manifest.run.status));
        }

        write_atomic(&self.root.pointer_path(), format!("{id}\n").as_bytes())?;
        info!("Latest pointer now references {id}");

        Ok(())
    }

    /// The run the pointer references, `None` before the first publish.
    pub fn resolve(&self) -> Result<Option<RunId>, PointerError> {
        let path = self.root.pointer_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PointerError::Read(e, path)),
        };

        let id = contents.trim().parse()?;
        Ok(Some(id))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Could not load the run's manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Run {0} has status {1}, only succeeded runs are published")]
    NotSucceeded(RunId, RunStatus),

    #[error("Failed to replace the pointer: {0}")]
    Write(#[from] StageError),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum PointerError {
    #[error("Failed to read pointer {1:?}: {0}")]
    Read(#[source] io::Error, PathBuf),

    #[error("Pointer is corrupt: {0}")]
    Corrupt(#[from] RunIdError),
}
