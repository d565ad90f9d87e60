use core::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ArtifactProducer, ProduceContext, ProduceError};
use crate::{ArtifactKind, command::supervise, staging::StagedFile};

/// Archive a fixed set of configuration paths. Every path must exist.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigArchive {
    /// The directory `paths` are relative to.
    pub base_directory: PathBuf,

    /// The files and directories to archive.
    pub paths: Vec<PathBuf>,

    /// The artifact's file name.
    pub file_name: String,

    /// If the run can only succeed with this artifact.
    pub required: bool,

    /// Overrides the run's producer timeout.
    pub timeout_secs: Option<u64>,
}

impl Default for ConfigArchive {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("."),
            paths: vec![PathBuf::from(".env"), PathBuf::from("docker-compose.yml")],
            file_name: "config.tar.gz".to_string(),
            required: true,
            timeout_secs: None,
        }
    }
}

impl ArtifactProducer for ConfigArchive {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Config
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

        if self.paths.is_empty() {
            return Err(ProduceError::NoPaths);
        }

        // Configuration must be complete, check everything before archiving anything.
        for path in &self.paths {
            let full_path = self.base_directory.join(path);
            if fs::symlink_metadata(&full_path).is_err() {
                return Err(ProduceError::MissingPath(full_path));
            }
        }

        let staged = StagedFile::new(output)?;

        let mut command = Command::new("tar");
        command
            .args(["--create", "--gzip", "--file"])
            .arg(staged.temp_path())
            .arg("--directory")
            .arg(&self.base_directory)
            .arg("--")
            .args(&self.paths);

        info!(
            "{}Archiving {} configuration paths from {:?}",
            context.context,
            self.paths.len(),
            self.base_directory
        );
        supervise(
            &mut command,
            None,
            Some(context.deadline),
            &context.cancellation,
        )?
        .ensure_success()?;

        let size = staged.commit()?;
        info!("{}Archived {size} bytes", context.context);

        Ok(())
    }
}
