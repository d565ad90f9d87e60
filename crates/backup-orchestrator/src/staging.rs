//! Atomic file placement.
//!
//! Files are written beside their final path under a hidden temporary name, flushed to disk and
//! renamed into place, so an observer of the final path only ever sees a complete file.

use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::warn;

/// A file being written that only appears at its final path once committed.
///
/// Dropping an uncommitted staged file removes the temporary file.
#[derive(Debug)]
pub struct StagedFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    committed: bool,
}

impl StagedFile {
    /// Stage a new file that will be placed at `final_path`.
    pub fn new(final_path: &Path) -> Result<Self, StageError> {
        let temp_path = hidden_sibling(final_path, "partial")?;

        // A crashed earlier attempt may have left its temporary file behind.
        match fs::remove_file(&temp_path) {
            Ok(()) => warn!("Removed stale temporary file {temp_path:?}"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StageError::Io(e, "remove stale temporary file")),
        }

        Ok(Self {
            final_path: final_path.to_path_buf(),
            temp_path,
            committed: false,
        })
    }

    /// The temporary path to write to.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Create the temporary file for writing.
    pub fn create(&self) -> Result<File, StageError> {
        File::create(&self.temp_path).map_err(|e| StageError::Io(e, "create temporary file"))
    }

    /// Flush the temporary file to disk and rename it into place.
    ///
    /// Returns the size of the placed file. An empty file is never placed.
    pub fn commit(mut self) -> Result<u64, StageError> {
        let file = File::open(&self.temp_path)
            .map_err(|e| StageError::Io(e, "open temporary file"))?;
        file.sync_all()
            .map_err(|e| StageError::Io(e, "sync temporary file"))?;
        let size = file
            .metadata()
            .map_err(|e| StageError::Io(e, "get temporary file metadata"))?
            .len();
        drop(file);

        if size == 0 {
            return Err(StageError::Empty(self.final_path.clone()));
        }

        fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| StageError::Io(e, "rename temporary file into place"))?;
        self.committed = true;

        sync_parent(&self.final_path).map_err(|e| StageError::Io(e, "sync directory"))?;

        Ok(size)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if let Err(e) = fs::remove_file(&self.temp_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove temporary file {:?}: {e}", self.temp_path);
            }
        }
    }
}

/// Replace the contents of `path` atomically and durably.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StageError> {
    let temp_path = hidden_sibling(path, "tmp")?;

    let result = (|| {
        let mut file =
            File::create(&temp_path).map_err(|e| StageError::Io(e, "create temporary file"))?;
        file.write_all(contents)
            .map_err(|e| StageError::Io(e, "write temporary file"))?;
        file.sync_all()
            .map_err(|e| StageError::Io(e, "sync temporary file"))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|e| StageError::Io(e, "rename temporary file into place"))?;

        sync_parent(path).map_err(|e| StageError::Io(e, "sync directory"))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }

    result
}

/// Flush a directory entry change (create, rename, remove) to disk.
pub fn sync_directory(directory: &Path) -> io::Result<()> {
    File::open(directory)?.sync_all()
}

fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_directory(parent),
        _ => sync_directory(Path::new(".")),
    }
}

fn hidden_sibling(path: &Path, suffix: &str) -> Result<PathBuf, StageError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| StageError::NoFileName(path.to_path_buf()))?;

    let mut hidden = std::ffi::OsString::from(".");
    hidden.push(file_name);
    hidden.push(".");
    hidden.push(suffix);

    Ok(path.with_file_name(hidden))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Path has no file name: {0:?}")]
    NoFileName(PathBuf),

    #[error("Output {0:?} was empty")]
    Empty(PathBuf),
}
