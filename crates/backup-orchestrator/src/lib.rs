//! # backup-orchestrator
//! Quiesces a service stack, snapshots it into verified artifacts, publishes the latest good run
//! and prunes old runs.
//!

mod cancellation;
pub mod checksum;
mod command;
mod config;
mod context;
mod layout;
pub mod lock;
pub mod manifest;
mod orchestrator;
mod pointer;
pub mod producer;
pub mod quiesce;
pub mod retention;
mod staging;
pub mod verify;

pub use cancellation::Cancellation;
pub use command::{CommandError, CommandOutput, supervise};
pub use config::{Config, LoadConfigError, QuiescenceConfig};
pub use context::Context;
pub use layout::BackupRoot;
pub use manifest::{
    AbortReason, ArtifactKind, ArtifactRecord, ArtifactStatus, BackupRun, MANIFEST_FILE, Manifest,
    ManifestError, RunId, RunStatus,
};
pub use orchestrator::{Orchestrator, RunError, RunOutcome};
pub use pointer::{PointerError, PointerPublisher, PublishError};
pub use retention::RetentionPolicy;
pub use staging::{StageError, StagedFile, write_atomic};
