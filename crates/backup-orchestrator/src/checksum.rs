//! Artifact digests and the checksum sidecar.
//!

use core::{fmt, str::FromStr};
use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::staging::{StageError, write_atomic};

/// The name of the checksum sidecar inside a run directory.
pub const SIDECAR_FILE: &str = "SHA256SUMS";

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// The hash algorithm used for a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256
    #[default]
    Sha256,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            other => Err(ChecksumError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A computed digest, rendered as `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The algorithm that produced the digest.
    pub algorithm: ChecksumAlgorithm,

    /// The lower-case hex digest.
    pub hex: String,
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| ChecksumError::Malformed(s.to_string()))?;

        if hex.is_empty() || !hex.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(ChecksumError::Malformed(s.to_string()));
        }

        Ok(Self {
            algorithm: algorithm.parse()?,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

/// Stream a file through the hash without holding it in memory.
pub fn digest_file(path: &Path) -> Result<Digest, ChecksumError> {
    let mut file = File::open(path).map_err(|e| ChecksumError::Io(e, path.to_path_buf()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(bytes_read) => bytes_read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChecksumError::Io(e, path.to_path_buf())),
        };

        hasher.update(buffer.get(..bytes_read).unwrap_or_default());
    }

    Ok(Digest {
        algorithm: ChecksumAlgorithm::Sha256,
        hex: format!("{:x}", hasher.finalize()),
    })
}

/// Digest an in-memory value.
pub fn digest_bytes(bytes: &[u8]) -> Digest {
    Digest {
        algorithm: ChecksumAlgorithm::Sha256,
        hex: format!("{:x}", Sha256::digest(bytes)),
    }
}

/// One line of the checksum sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEntry {
    /// The artifact's digest.
    pub digest: Digest,

    /// The artifact's path relative to the run directory.
    pub path: PathBuf,
}

/// Write the checksum sidecar, one `algorithm:hex  path` line per entry.
pub fn write_sidecar(run_directory: &Path, entries: &[SidecarEntry]) -> Result<(), StageError> {
    let contents: String = entries
        .iter()
        .map(|entry| format!("{}  {}\n", entry.digest, entry.path.display()))
        .collect();

    write_atomic(&run_directory.join(SIDECAR_FILE), contents.as_bytes())
}

/// Read the checksum sidecar of a run.
pub fn read_sidecar(run_directory: &Path) -> Result<Vec<SidecarEntry>, ChecksumError> {
    let path = run_directory.join(SIDECAR_FILE);
    let contents = fs::read_to_string(&path).map_err(|e| ChecksumError::Io(e, path))?;

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (digest, path) = line
                .split_once("  ")
                .ok_or_else(|| ChecksumError::Malformed(line.to_string()))?;

            Ok(SidecarEntry {
                digest: digest.parse()?,
                path: PathBuf::from(path),
            })
        })
        .collect()
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("Failed to read {1:?}: {0}")]
    Io(#[source] io::Error, PathBuf),

    #[error("Unknown checksum algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("Malformed checksum '{0}'")]
    Malformed(String),
}
