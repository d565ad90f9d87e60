//! The on-disk layout of the backup root.
//!
//! ```text
//! <root>/
//!   latest                      run id of the newest succeeded run
//!   runs/
//!     <run id>/
//!       <artifact files>
//!       SHA256SUMS
//!       manifest.json
//!     .<run id>.deleting/       a run being pruned
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::RunId;

const RUNS_DIRECTORY: &str = "runs";
const POINTER_FILE: &str = "latest";
const DELETING_SUFFIX: &str = ".deleting";

/// The backup root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRoot {
    root: PathBuf,
}

impl BackupRoot {
    #[allow(missing_docs)]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The directory holding one directory per run.
    pub fn runs_directory(&self) -> PathBuf {
        self.root.join(RUNS_DIRECTORY)
    }

    /// The directory of a run.
    pub fn run_directory(&self, id: RunId) -> PathBuf {
        self.runs_directory().join(id.to_string())
    }

    /// Where a run is moved while it is being deleted.
    pub fn deleting_directory(&self, id: RunId) -> PathBuf {
        self.runs_directory()
            .join(format!(".{id}{DELETING_SUFFIX}"))
    }

    /// The latest pointer file.
    pub fn pointer_path(&self) -> PathBuf {
        self.root.join(POINTER_FILE)
    }

    /// Create the root and runs directories if they do not exist.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.runs_directory())
    }

    /// The ids of every run directory, oldest first.
    pub fn list_runs(&self) -> io::Result<Vec<RunId>> {
        let directory = match fs::read_dir(self.runs_directory()) {
            Ok(directory) => directory,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut runs = Vec::new();
        for entry in directory {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            match name.to_str().map(str::parse::<RunId>) {
                Some(Ok(id)) => runs.push(id),
                _ => debug!("Skipping {:?}, not a run directory", entry.path()),
            }
        }

        runs.sort();
        Ok(runs)
    }

    /// Directories left behind by an interrupted deletion.
    pub fn list_deleting(&self) -> io::Result<Vec<PathBuf>> {
        let directory = match fs::read_dir(self.runs_directory()) {
            Ok(directory) => directory,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut leftovers = Vec::new();
        for entry in directory {
            let entry = entry?;
            let is_deleting = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.') && name.ends_with(DELETING_SUFFIX));

            if is_deleting && entry.file_type()?.is_dir() {
                leftovers.push(entry.path());
            }
        }

        Ok(leftovers)
    }
}
