//! Independent re-verification of a finished run.
//!
//! Used by operators and by restore tooling. It only reads the run directory and never needs the
//! run lock.

use core::fmt;
use std::{collections::HashMap, path::PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    ArtifactKind, ArtifactStatus, BackupRoot, Manifest, ManifestError, RunId, RunStatus,
    checksum::{Digest, digest_file, read_sidecar},
};

/// The outcome of re-checking one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactCheck {
    /// The file matches its recorded digest.
    Ok,

    /// The file no longer matches its recorded digest.
    ChecksumMismatch {
        #[allow(missing_docs)]
        expected: Digest,
        #[allow(missing_docs)]
        actual: Digest,
    },

    /// The file is gone.
    Missing,

    /// The file could not be read.
    Unreadable(String),

    /// The artifact was never verified, so there is nothing to compare against.
    NotVerified(ArtifactStatus),
}

impl ArtifactCheck {
    /// The status this check maps to.
    pub fn status(&self) -> ArtifactStatus {
        match self {
            Self::Ok => ArtifactStatus::Verified,
            Self::ChecksumMismatch { .. } => ArtifactStatus::ChecksumMismatch,
            Self::Missing | Self::Unreadable(_) => ArtifactStatus::Failed,
            Self::NotVerified(status) => *status,
        }
    }

    /// If this check indicates damage to a verified artifact.
    pub fn is_damaged(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::Missing | Self::Unreadable(_)
        )
    }
}

impl fmt::Display for ArtifactCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch, expected {expected}, found {actual}")
            }
            Self::Missing => write!(f, "missing"),
            Self::Unreadable(error) => write!(f, "unreadable: {error}"),
            Self::NotVerified(status) => write!(f, "not verified ({status:?})"),
        }
    }
}

/// One artifact in a [`VerifyReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReport {
    #[allow(missing_docs)]
    pub kind: ArtifactKind,
    #[allow(missing_docs)]
    pub path: PathBuf,
    #[allow(missing_docs)]
    pub check: ArtifactCheck,
}

/// The result of re-verifying a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// The verified run.
    pub run_id: RunId,

    /// The run's recorded status.
    pub status: RunStatus,

    /// If the manifest's own digest matches its contents.
    pub manifest_intact: bool,

    /// Disagreements between the sidecar and the manifest.
    pub sidecar_problems: Vec<String>,

    /// Per artifact results in manifest order.
    pub artifacts: Vec<ArtifactReport>,
}

impl VerifyReport {
    /// If nothing in the run is damaged.
    pub fn is_intact(&self) -> bool {
        self.manifest_intact
            && self.sidecar_problems.is_empty()
            && !self.artifacts.iter().any(|artifact| artifact.check.is_damaged())
    }
}

/// Re-read every verified artifact of a run and compare it to the manifest and the sidecar.
pub fn verify_run(root: &BackupRoot, id: RunId) -> Result<VerifyReport, VerifyError> {
    let run_directory = root.run_directory(id);
    if !run_directory.is_dir() {
        return Err(VerifyError::RunNotFound(id));
    }

    let manifest = Manifest::load(&run_directory)?;
    let digest_check = Manifest::check_digest(&run_directory)?;
    if !digest_check.is_intact() {
        error!(
            "[{id}] Manifest digest mismatch, recorded {}, computed {}",
            digest_check.recorded, digest_check.actual
        );
    }

    let mut sidecar_problems = Vec::new();
    let mut sidecar: HashMap<PathBuf, Digest> = match read_sidecar(&run_directory) {
        Ok(entries) => entries
            .into_iter()
            .map(|entry| (entry.path, entry.digest))
            .collect(),
        Err(e) => {
            sidecar_problems.push(format!("sidecar unreadable: {e}"));
            HashMap::new()
        }
    };

    let mut artifacts = Vec::with_capacity(manifest.run.artifacts.len());
    for record in &manifest.run.artifacts {
        let check = match record.digest() {
            Some(expected) if record.status == ArtifactStatus::Verified => {
                match sidecar.remove(&record.path) {
                    Some(listed) if listed != expected => sidecar_problems.push(format!(
                        "{:?} listed as {listed}, manifest records {expected}",
                        record.path
                    )),
                    Some(_) => {}
                    None => sidecar_problems.push(format!("{:?} not listed", record.path)),
                }

                check_artifact(&run_directory.join(&record.path), expected)
            }
            _ => ArtifactCheck::NotVerified(record.status),
        };

        if check.is_damaged() {
            error!("[{id}] {:?}: {check}", record.path);
        } else {
            info!("[{id}] {:?}: {check}", record.path);
        }

        artifacts.push(ArtifactReport {
            kind: record.kind.clone(),
            path: record.path.clone(),
            check,
        });
    }

    for path in sidecar.into_keys() {
        sidecar_problems.push(format!("{path:?} listed but not in the manifest"));
    }
    for problem in &sidecar_problems {
        warn!("[{id}] Sidecar: {problem}");
    }

    Ok(VerifyReport {
        run_id: id,
        status: manifest.run.status,
        manifest_intact: digest_check.is_intact(),
        sidecar_problems,
        artifacts,
    })
}

fn check_artifact(path: &std::path::Path, expected: Digest) -> ArtifactCheck {
    if !path.is_file() {
        return ArtifactCheck::Missing;
    }

    match digest_file(path) {
        Ok(actual) if actual == expected => ArtifactCheck::Ok,
        Ok(actual) => ArtifactCheck::ChecksumMismatch { expected, actual },
        Err(e) => ArtifactCheck::Unreadable(e.to_string()),
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Run {0} does not exist")]
    RunNotFound(RunId),

    #[error("{0}")]
    Manifest(#[from] ManifestError),
}
