//! The durable record of a backup run.
//!

use core::{fmt, str::FromStr};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize, de};
use thiserror::Error;

use crate::{
    checksum::{ChecksumAlgorithm, Digest, digest_bytes},
    staging::{StageError, write_atomic},
};

/// The name of the manifest inside a run directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// The manifest format version written by this crate.
pub const MANIFEST_VERSION: u32 = 1;

const RUN_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%3f";

/// Identifies a run. Renders as a UTC timestamp with millisecond precision, so the
/// lexicographic order of run directory names is their chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(DateTime<Utc>);

impl RunId {
    /// A run id for the given time, truncated to milliseconds.
    pub fn from_time(time: DateTime<Utc>) -> Self {
        let truncated =
            DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time);
        Self(truncated)
    }

    /// A run id for `now` that sorts after `newest`.
    pub fn next_after(newest: Option<Self>, now: DateTime<Utc>) -> Self {
        let candidate = Self::from_time(now);

        match newest {
            Some(newest) if candidate <= newest => Self(newest.0 + TimeDelta::milliseconds(1)),
            _ => candidate,
        }
    }

    /// The time encoded in the id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_ID_FORMAT))
    }
}

impl FromStr for RunId {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let time = NaiveDateTime::parse_from_str(s, RUN_ID_FORMAT)
            .map_err(|e| RunIdError(s.to_string(), e))?
            .and_utc();

        Ok(Self(time))
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string: String = Deserialize::deserialize(deserializer)?;
        string.parse().map_err(de::Error::custom)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
#[error("Invalid run id '{0}': {1}")]
pub struct RunIdError(String, #[source] chrono::ParseError);

/// The status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has not reached a terminal state.
    InProgress,

    /// Every required artifact was verified.
    Succeeded,

    /// Some artifacts were verified and some failed.
    Partial,

    /// No artifact was verified.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a run stopped before producing artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The services did not stop within the pause timeout.
    QuiesceTimeout,

    /// The runtime reported an error while stopping the services.
    QuiesceFailed,

    /// The operator interrupted the run.
    Cancelled,
}

/// What an artifact contains. Unknown kinds from newer writers are kept as [`ArtifactKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArtifactKind {
    /// A logical dump of the relational store.
    Database,

    /// An archive of a storage directory tree.
    Filetree,

    /// An archive of configuration files.
    Config,

    #[allow(missing_docs)]
    Other(String),
}

impl From<String> for ArtifactKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "database" => Self::Database,
            "filetree" => Self::Filetree,
            "config" => Self::Config,
            _ => Self::Other(value),
        }
    }
}

impl From<ArtifactKind> for String {
    fn from(value: ArtifactKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Filetree => write!(f, "filetree"),
            Self::Config => write!(f, "config"),
            Self::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// The lifecycle of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Scheduled, not yet produced.
    Pending,

    /// The producer succeeded and the output is in place.
    Produced,

    /// The digest was computed and recorded.
    Verified,

    /// Production or verification failed.
    Failed,

    /// The file no longer matches its recorded digest. Only reported by re-verification.
    ChecksumMismatch,
}

impl ArtifactStatus {
    /// If no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::ChecksumMismatch)
    }
}

fn default_required() -> bool {
    true
}

/// One artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// What the artifact contains.
    pub kind: ArtifactKind,

    /// The artifact's path relative to the run directory.
    pub path: PathBuf,

    /// If the run can only succeed with this artifact verified.
    #[serde(default = "default_required")]
    pub required: bool,

    /// The artifact's size once verified.
    pub size_bytes: Option<u64>,

    /// The lower-case hex digest once verified.
    pub checksum: Option<String>,

    /// The algorithm of `checksum`.
    pub checksum_algorithm: Option<ChecksumAlgorithm>,

    /// Lifecycle status.
    pub status: ArtifactStatus,

    /// Why the artifact failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactRecord {
    /// A newly scheduled artifact.
    pub fn pending(kind: ArtifactKind, path: PathBuf, required: bool) -> Self {
        Self {
            kind,
            path,
            required,
            size_bytes: None,
            checksum: None,
            checksum_algorithm: None,
            status: ArtifactStatus::Pending,
            error: None,
        }
    }

    /// The producer finished and its output is in place.
    pub fn mark_produced(&mut self) {
        if self.status == ArtifactStatus::Pending {
            self.status = ArtifactStatus::Produced;
        }
    }

    /// The output's digest has been computed.
    pub fn mark_verified(&mut self, size_bytes: u64, digest: Digest) {
        if self.status != ArtifactStatus::Produced {
            return;
        }

        self.size_bytes = Some(size_bytes);
        self.checksum = Some(digest.hex);
        self.checksum_algorithm = Some(digest.algorithm);
        self.status = ArtifactStatus::Verified;
    }

    /// Fail the artifact unless it already reached a terminal status.
    pub fn mark_failed(&mut self, reason: impl fmt::Display) {
        if self.status.is_terminal() {
            return;
        }

        self.status = ArtifactStatus::Failed;
        self.error = Some(reason.to_string());
    }

    /// The recorded digest, if verified.
    pub fn digest(&self) -> Option<Digest> {
        Some(Digest {
            algorithm: self.checksum_algorithm?,
            hex: self.checksum.clone()?,
        })
    }
}

/// One snapshot attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRun {
    /// The run id, also the run directory's name.
    pub id: RunId,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,

    /// The run status.
    pub status: RunStatus,

    /// Set when the run stopped before producing artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortReason>,

    /// The artifacts in production order.
    pub artifacts: Vec<ArtifactRecord>,
}

impl BackupRun {
    /// A run that has just started.
    pub fn new(id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            finished_at: None,
            status: RunStatus::InProgress,
            abort: None,
            artifacts: Vec::new(),
        }
    }

    /// The status the run's artifacts add up to.
    pub fn classify(&self) -> RunStatus {
        let verified = self
            .artifacts
            .iter()
            .filter(|artifact| artifact.status == ArtifactStatus::Verified)
            .count();

        if verified == 0 {
            return RunStatus::Failed;
        }

        let required_verified = self
            .artifacts
            .iter()
            .filter(|artifact| artifact.required)
            .all(|artifact| artifact.status == ArtifactStatus::Verified);

        if required_verified {
            RunStatus::Succeeded
        } else {
            RunStatus::Partial
        }
    }

    /// Move the run to its terminal status.
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        for artifact in &mut self.artifacts {
            artifact.mark_failed("run finished before the artifact reached a terminal status");
        }

        self.status = self.classify();
        self.finished_at = Some(finished_at);
    }
}

/// The serialized form of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// The manifest format version.
    pub version: u32,

    /// The run.
    pub run: BackupRun,

    /// `algorithm:hex` digest of the canonical encoding of `run`.
    pub digest: String,
}

impl Manifest {
    /// Seal a finished run into a manifest.
    pub fn seal(run: BackupRun) -> Result<Self, ManifestError> {
        if run.status == RunStatus::InProgress {
            return Err(ManifestError::NotFinished(run.id));
        }

        let value = serde_json::to_value(&run).map_err(ManifestError::Serialize)?;
        let digest = canonical_digest(&value)?.to_string();

        Ok(Self {
            version: MANIFEST_VERSION,
            run,
            digest,
        })
    }

    /// Durably write the manifest to the root of the run directory.
    pub fn write(&self, run_directory: &Path) -> Result<(), ManifestError> {
        let contents = serde_json::to_vec_pretty(self).map_err(ManifestError::Serialize)?;
        write_atomic(&run_directory.join(MANIFEST_FILE), &contents)?;
        Ok(())
    }

    /// Load the manifest of a run directory.
    pub fn load(run_directory: &Path) -> Result<Self, ManifestError> {
        let path = run_directory.join(MANIFEST_FILE);
        let contents = fs::read(&path).map_err(|e| ManifestError::Read(e, path.clone()))?;
        serde_json::from_slice(&contents).map_err(|e| ManifestError::Deserialize(e, path))
    }

    /// Recompute the digest from the file on disk, including fields this version does not know.
    pub fn check_digest(run_directory: &Path) -> Result<DigestCheck, ManifestError> {
        let path = run_directory.join(MANIFEST_FILE);
        let contents = fs::read(&path).map_err(|e| ManifestError::Read(e, path.clone()))?;
        let value: serde_json::Value = serde_json::from_slice(&contents)
            .map_err(|e| ManifestError::Deserialize(e, path.clone()))?;

        let recorded = value
            .get("digest")
            .and_then(serde_json::Value::as_str)
            .ok_or(ManifestError::MissingDigest(path))?
            .to_string();
        let run = value.get("run").unwrap_or(&serde_json::Value::Null);
        let actual = canonical_digest(run)?.to_string();

        Ok(DigestCheck { recorded, actual })
    }

    /// If the manifest exists for a run directory.
    pub fn exists(run_directory: &Path) -> bool {
        run_directory.join(MANIFEST_FILE).is_file()
    }
}

/// The recorded and recomputed digest of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCheck {
    /// The digest stored in the manifest.
    pub recorded: String,

    /// The digest computed from the manifest's run.
    pub actual: String,
}

impl DigestCheck {
    /// If the manifest is intact.
    pub fn is_intact(&self) -> bool {
        self.recorded == self.actual
    }
}

/// `serde_json` objects are ordered maps, so the compact encoding of a value has sorted keys.
fn canonical_digest(value: &serde_json::Value) -> Result<Digest, ManifestError> {
    let bytes = serde_json::to_vec(value).map_err(ManifestError::Serialize)?;
    Ok(digest_bytes(&bytes))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Run {0} has not finished")]
    NotFinished(RunId),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to deserialize manifest {1:?}: {0}")]
    Deserialize(#[source] serde_json::Error, PathBuf),

    #[error("Failed to read manifest {1:?}: {0}")]
    Read(#[source] io::Error, PathBuf),

    #[error("Failed to write manifest: {0}")]
    Write(#[from] StageError),

    #[error("Manifest {0:?} has no digest")]
    MissingDigest(PathBuf),
}

impl ManifestError {
    /// If the manifest does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Read(e, _) if e.kind() == io::ErrorKind::NotFound)
    }
}
