use core::time::Duration;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ArtifactProducer, ProduceContext, ProduceError};
use crate::{ArtifactKind, command::supervise, staging::StagedFile};

/// GNU tar exits with 1 when files changed or disappeared while being read.
const TAR_FILES_CHANGED: i32 = 1;

/// Archive a storage directory tree with tar and gzip.
///
/// Files may be written while the archive is created. Files that change or disappear are logged
/// and skipped instead of failing the artifact.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FolderTar {
    /// The path to the folder.
    pub folder_path: PathBuf,

    /// Patterns passed to `tar --exclude`.
    pub exclude: Vec<String>,

    /// The artifact's file name.
    pub file_name: String,

    /// If the run can only succeed with this artifact.
    pub required: bool,

    /// Overrides the run's producer timeout.
    pub timeout_secs: Option<u64>,

    /// The GNU tar program, `gtar` on systems where `tar` is another implementation.
    pub tar_program: PathBuf,
}

impl Default for FolderTar {
    fn default() -> Self {
        Self {
            folder_path: PathBuf::from("./storage"),
            exclude: Vec::new(),
            file_name: "storage.tar.gz".to_string(),
            required: true,
            timeout_secs: None,
            tar_program: PathBuf::from("tar"),
        }
    }
}

impl ArtifactProducer for FolderTar {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Filetree
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn required(&self) -> bool {
        self.required
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn produce(&self, context: &ProduceContext, output: &Path) -> Result<(), ProduceError> {
        context.check()?;

        let folder_metadata = match fs::metadata(&self.folder_path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProduceError::MissingPath(self.folder_path.clone()));
            }
            Err(e) => return Err(ProduceError::Io(e, "get folder metadata")),
        };
        if !folder_metadata.is_dir() {
            return Err(ProduceError::NotDirectory(self.folder_path.clone()));
        }

        let staged = StagedFile::new(output)?;

        let mut command = Command::new(&self.tar_program);
        command
            .args(["--create", "--gzip", "--file"])
            .arg(staged.temp_path())
            .arg("--directory")
            .arg(&self.folder_path)
            .args([
                "--ignore-failed-read",
                "--warning=no-file-changed",
                "--warning=no-file-removed",
            ]);
        for pattern in &self.exclude {
            command.arg(format!("--exclude={pattern}"));
        }
        command.arg(".");

        info!("{}Archiving {:?}", context.context, self.folder_path);
        let tar = supervise(
            &mut command,
            None,
            Some(context.deadline),
            &context.cancellation,
        )?;

        if tar.status.code() == Some(TAR_FILES_CHANGED) {
            warn!(
                "{}Some files changed or disappeared while archiving, continuing: {}",
                context.context, tar.stderr
            );
        } else {
            tar.ensure_success()?;
        }

        let size = staged.commit()?;
        info!("{}Archived {size} bytes", context.context);

        Ok(())
    }
}
