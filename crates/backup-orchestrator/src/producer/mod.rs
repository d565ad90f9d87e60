//! Artifact producers.
//!
//! Each producer writes exactly one artifact into the run directory. Producers only write their
//! own output path and report a result, the orchestrator owns the artifact records.

use core::{fmt::Debug, time::Duration};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArtifactKind, Cancellation, Context, command::CommandError, staging::StageError};

mod config_archive;
mod database;
mod folder_tar;

pub use config_archive::ConfigArchive;
pub use database::{DatabaseEngine, DockerDatabase};
pub use folder_tar::FolderTar;

/// What a producer is given for one run.
#[derive(Debug, Clone)]
pub struct ProduceContext {
    /// Log context, scoped to the artifact.
    pub context: Context,

    /// When the producer must have finished.
    pub deadline: Instant,

    /// Raised when the producer timed out or the run was interrupted.
    pub cancellation: Cancellation,
}

impl ProduceContext {
    /// Fail if the producer should stop.
    pub fn check(&self) -> Result<(), ProduceError> {
        if self.cancellation.is_cancelled() {
            return Err(ProduceError::Cancelled);
        }

        if Instant::now() >= self.deadline {
            return Err(ProduceError::Timeout);
        }

        Ok(())
    }
}

/// A unit that produces one artifact.
pub trait ArtifactProducer: Debug + Send + Sync {
    /// What the artifact contains.
    fn kind(&self) -> ArtifactKind;

    /// The artifact's file name inside the run directory.
    fn file_name(&self) -> &str;

    /// If the run can only succeed with this artifact.
    fn required(&self) -> bool {
        true
    }

    /// Overrides the run's producer timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Write the complete artifact to `output`, or fail without leaving a file at `output`.
    fn produce(&self, context: &ProduceContext, output: &Path) -> Result<(), ProduceError>;
}

/// A configured artifact source.
#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum ArtifactSource {
    DockerDatabase(DockerDatabase),
    FolderTar(FolderTar),
    ConfigArchive(ConfigArchive),
}

impl ArtifactSource {
    /// Create the producer for this source.
    pub fn build(&self) -> Arc<dyn ArtifactProducer> {
        match self {
            Self::DockerDatabase(database) => Arc::new(database.clone()),
            Self::FolderTar(folder_tar) => Arc::new(folder_tar.clone()),
            Self::ConfigArchive(config_archive) => Arc::new(config_archive.clone()),
        }
    }

    /// The artifact's file name inside the run directory.
    pub fn file_name(&self) -> &str {
        match self {
            Self::DockerDatabase(database) => database.file_name(),
            Self::FolderTar(folder_tar) => folder_tar.file_name(),
            Self::ConfigArchive(config_archive) => config_archive.file_name(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("{0}")]
    Command(#[source] CommandError),

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to place output: {0}")]
    Stage(#[from] StageError),

    #[error("Path {0:?} does not exist")]
    MissingPath(PathBuf),

    #[error("Path {0:?} is not a directory")]
    NotDirectory(PathBuf),

    #[error("Environment variable '{0}' is not set")]
    MissingEnvironment(String),

    #[error("Nothing was written to the artifact")]
    EmptyOutput,

    #[error("No paths are configured")]
    NoPaths,

    #[error("Producer did not finish before its deadline")]
    Timeout,

    #[error("Producer was cancelled")]
    Cancelled,

    #[error("Producer panicked")]
    Panicked,
}

impl From<CommandError> for ProduceError {
    fn from(value: CommandError) -> Self {
        match value {
            CommandError::Timeout(_) => Self::Timeout,
            CommandError::Cancelled(_) => Self::Cancelled,
            error => Self::Command(error),
        }
    }
}
