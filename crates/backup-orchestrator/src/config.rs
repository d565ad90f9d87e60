//! Orchestrator config
//!

use core::time::Duration;
use std::{collections::HashSet, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    MANIFEST_FILE, RetentionPolicy,
    checksum::SIDECAR_FILE,
    producer::{ArtifactSource, ConfigArchive, DockerDatabase, FolderTar},
    quiesce::RuntimeConfig,
};

/// Which services are stopped around the snapshot and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiescenceConfig {
    /// The services to stop. Leave the database running when it is dumped with `docker exec`.
    pub services: Vec<String>,

    /// How long to wait for the services to stop.
    pub pause_timeout_secs: u64,

    /// The runtime that controls the services.
    pub runtime: RuntimeConfig,
}

impl Default for QuiescenceConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            pause_timeout_secs: 120,
            runtime: RuntimeConfig::Disabled,
        }
    }
}

/// The orchestrator's config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The directory holding the runs and the latest pointer.
    pub backup_root: PathBuf,

    /// The run lock file, defaults to `backup.lock` in the backup root.
    pub lock_file: Option<PathBuf>,

    /// The directory for log files.
    pub log_directory: PathBuf,

    /// The log level.
    pub log_level: String,

    /// How long each producer may run unless it sets its own timeout.
    pub producer_timeout_secs: u64,

    /// If `backup run` prunes after taking a backup.
    pub prune_after_run: bool,

    /// Service quiescence.
    pub quiescence: QuiescenceConfig,

    /// The retention policy.
    pub retention: RetentionPolicy,

    /// The artifacts each run produces, in order.
    pub artifacts: Vec<ArtifactSource>,
}

impl Config {
    /// Tries to load a config from a toml file.
    pub fn load_toml(file_path: PathBuf) -> Result<Self, LoadConfigError> {
        if !file_path.exists() {
            return Err(LoadConfigError::NoFile);
        }

        let contents = fs::read_to_string(file_path).map_err(LoadConfigError::Read)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    /// Check for values that would make every run fail.
    pub fn validate(&self) -> Result<(), LoadConfigError> {
        let mut file_names = HashSet::new();
        for artifact in &self.artifacts {
            let file_name = artifact.file_name();

            if file_name.is_empty() || file_name.contains('/') || file_name.starts_with('.') {
                return Err(LoadConfigError::Invalid(format!(
                    "artifact file name '{file_name}' must be a plain, non-hidden file name"
                )));
            }

            if file_name == MANIFEST_FILE || file_name == SIDECAR_FILE {
                return Err(LoadConfigError::Invalid(format!(
                    "artifact file name '{file_name}' is reserved"
                )));
            }

            if !file_names.insert(file_name) {
                return Err(LoadConfigError::Invalid(format!(
                    "artifact file name '{file_name}' is used more than once"
                )));
            }
        }

        if self.producer_timeout_secs == 0 {
            return Err(LoadConfigError::Invalid(
                "producer_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// The run lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.backup_root.join("backup.lock"))
    }

    /// How long each producer may run.
    pub fn producer_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_timeout_secs)
    }

    /// How long to wait for the services to stop.
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.quiescence.pause_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("./backups"),
            lock_file: None,
            log_directory: PathBuf::from("./logs"),
            log_level: "info".to_string(),
            producer_timeout_secs: 60 * 60,
            prune_after_run: true,
            quiescence: QuiescenceConfig::default(),
            retention: RetentionPolicy::default(),
            artifacts: vec![
                ArtifactSource::DockerDatabase(DockerDatabase::default()),
                ArtifactSource::FolderTar(FolderTar::default()),
                ArtifactSource::ConfigArchive(ConfigArchive::default()),
            ],
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("The file does not exist.")]
    NoFile,

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to deserialize the file:\n{0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
