//! Tests for runs and manifests
//!

use std::path::PathBuf;

use backup_orchestrator::{
    ArtifactKind, ArtifactRecord, ArtifactStatus, BackupRun, Manifest, ManifestError, RunId,
    RunStatus, checksum::digest_bytes,
};
use chrono::{TimeDelta, TimeZone, Utc};

fn verified(kind: ArtifactKind, name: &str, required: bool) -> ArtifactRecord {
    let mut artifact = ArtifactRecord::pending(kind, PathBuf::from(name), required);
    artifact.mark_produced();
    artifact.mark_verified(4, digest_bytes(b"data"));
    artifact
}

fn failed(kind: ArtifactKind, name: &str, required: bool) -> ArtifactRecord {
    let mut artifact = ArtifactRecord::pending(kind, PathBuf::from(name), required);
    artifact.mark_failed("failed in test");
    artifact
}

fn run_with(artifacts: Vec<ArtifactRecord>) -> BackupRun {
    let now = Utc::now();
    let mut run = BackupRun::new(RunId::from_time(now), now);
    run.artifacts = artifacts;
    run
}

#[test]
fn run_id_round_trips() {
    let time = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap() + TimeDelta::milliseconds(789);
    let id = RunId::from_time(time);

    assert_eq!(id.to_string(), "2024-03-09_04-05-06_789");
    assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
    assert!("latest".parse::<RunId>().is_err());
}

#[test]
fn run_ids_are_ordered() {
    let now = Utc::now();
    let first = RunId::next_after(None, now);

    // A clock that did not advance, or went backwards, still yields a later id.
    let second = RunId::next_after(Some(first), now);
    let third = RunId::next_after(Some(second), now - TimeDelta::hours(1));

    assert!(first < second);
    assert!(second < third);
    assert!(first.to_string() < second.to_string());
    assert!(second.to_string() < third.to_string());
}

#[test]
fn classify_run() {
    use ArtifactKind::{Config, Database, Filetree};

    let succeeded = run_with(vec![
        verified(Database, "a", true),
        verified(Filetree, "b", true),
    ]);
    assert_eq!(succeeded.classify(), RunStatus::Succeeded);

    let partial = run_with(vec![
        failed(Database, "a", true),
        verified(Filetree, "b", true),
    ]);
    assert_eq!(partial.classify(), RunStatus::Partial);

    let optional_failure = run_with(vec![
        verified(Database, "a", true),
        failed(Config, "c", false),
    ]);
    assert_eq!(optional_failure.classify(), RunStatus::Succeeded);

    let failed_run = run_with(vec![failed(Database, "a", true), failed(Config, "c", false)]);
    assert_eq!(failed_run.classify(), RunStatus::Failed);

    assert_eq!(run_with(Vec::new()).classify(), RunStatus::Failed);
}

#[test]
fn artifact_lifecycle_is_forward_only() {
    let mut artifact =
        ArtifactRecord::pending(ArtifactKind::Database, PathBuf::from("a"), true);

    // Verification requires production first.
    artifact.mark_verified(4, digest_bytes(b"data"));
    assert_eq!(artifact.status, ArtifactStatus::Pending);

    artifact.mark_produced();
    artifact.mark_verified(4, digest_bytes(b"data"));
    assert_eq!(artifact.status, ArtifactStatus::Verified);
    assert_eq!(artifact.digest(), Some(digest_bytes(b"data")));

    // Terminal statuses are never left.
    artifact.mark_failed("too late");
    assert_eq!(artifact.status, ArtifactStatus::Verified);
    assert_eq!(artifact.error, None);
}

#[test]
fn finish_fails_unfinished_artifacts() {
    let mut produced = ArtifactRecord::pending(ArtifactKind::Filetree, PathBuf::from("b"), true);
    produced.mark_produced();

    let mut run = run_with(vec![verified(ArtifactKind::Database, "a", true), produced]);
    run.finish(Utc::now());

    assert_eq!(run.artifacts[1].status, ArtifactStatus::Failed);
    assert_eq!(run.status, RunStatus::Partial);
    assert!(run.finished_at.is_some());
}

#[test]
fn unfinished_run_cannot_be_sealed() {
    let run = run_with(vec![verified(ArtifactKind::Database, "a", true)]);

    assert!(matches!(
        Manifest::seal(run),
        Err(ManifestError::NotFinished(_))
    ));
}

#[test]
fn manifest_written_and_loaded() {
    let directory = tempfile::tempdir().unwrap();

    let mut run = run_with(vec![
        verified(ArtifactKind::Database, "database.sql.zst", true),
        failed(ArtifactKind::Other("media".to_string()), "media.tar.gz", false),
    ]);
    run.finish(Utc::now());

    let manifest = Manifest::seal(run).unwrap();
    assert!(manifest.digest.starts_with("sha256:"));
    manifest.write(directory.path()).unwrap();

    assert!(Manifest::exists(directory.path()));
    assert_eq!(Manifest::load(directory.path()).unwrap(), manifest);
    assert!(
        Manifest::check_digest(directory.path())
            .unwrap()
            .is_intact()
    );
}

#[test]
fn missing_manifest_is_not_found() {
    let directory = tempfile::tempdir().unwrap();

    assert!(!Manifest::exists(directory.path()));
    assert!(Manifest::load(directory.path()).unwrap_err().is_not_found());
}
