//! Tests for a full backup run
//!

use core::time::Duration;
use std::{
    fs,
    sync::{Arc, Barrier},
    thread,
};

use backup_orchestrator::{
    AbortReason, ArtifactKind, ArtifactStatus, Cancellation, MANIFEST_FILE, Manifest,
    PointerPublisher, RunError, RunStatus, checksum::digest_file, lock::RunLock,
    verify::verify_run,
};
use common::{
    Behaviour, MockProducer, MockRuntime, RuntimeCall, cancellable_orchestrator,
    healthy_producers, test_orchestrator,
};

mod common;

#[test]
fn successful_run() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let orchestrator = test_orchestrator(&directory, &runtime, healthy_producers());

    let outcome = orchestrator.run_backup().unwrap();
    let run = &outcome.manifest.run;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.finished_at.is_some());
    assert!(outcome.published);
    assert!(outcome.resumed);

    // Services are stopped before and started after the artifacts.
    let services = vec!["app".to_string(), "worker".to_string()];
    assert_eq!(
        runtime.calls(),
        vec![RuntimeCall::Stop(services.clone()), RuntimeCall::Start(services)]
    );

    // Every stored checksum matches the artifact on disk.
    let run_directory = orchestrator.root().run_directory(run.id);
    for artifact in &run.artifacts {
        assert_eq!(artifact.status, ArtifactStatus::Verified);

        let path = run_directory.join(&artifact.path);
        assert_eq!(Some(digest_file(&path).unwrap()), artifact.digest());
        assert_eq!(
            Some(fs::metadata(&path).unwrap().len()),
            artifact.size_bytes
        );
    }

    // The manifest on disk is the returned manifest.
    let loaded = Manifest::load(&run_directory).unwrap();
    assert_eq!(loaded, outcome.manifest);
    assert!(Manifest::check_digest(&run_directory).unwrap().is_intact());

    let latest = PointerPublisher::new(orchestrator.root().clone())
        .resolve()
        .unwrap();
    assert_eq!(latest, Some(run.id));

    assert!(verify_run(orchestrator.root(), run.id).unwrap().is_intact());
}

#[test]
fn artifacts_keep_production_order() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let orchestrator = test_orchestrator(&directory, &runtime, healthy_producers());

    let outcome = orchestrator.run_backup().unwrap();
    let kinds: Vec<_> = outcome
        .manifest
        .run
        .artifacts
        .iter()
        .map(|artifact| artifact.kind.clone())
        .collect();

    assert_eq!(
        kinds,
        vec![
            ArtifactKind::Database,
            ArtifactKind::Filetree,
            ArtifactKind::Config
        ]
    );
}

#[test]
fn database_timeout_is_partial() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();

    let first = test_orchestrator(&directory, &runtime, healthy_producers())
        .run_backup()
        .unwrap();
    assert_eq!(first.status(), RunStatus::Succeeded);

    let producers = vec![
        MockProducer::hangs(
            ArtifactKind::Database,
            "database.sql.zst",
            Duration::from_millis(200),
        ),
        MockProducer::writes(ArtifactKind::Filetree, "storage.tar.gz", b"archive of the storage"),
        MockProducer::writes(ArtifactKind::Config, "config.tar.gz", b"archive of the config"),
    ];
    let orchestrator = test_orchestrator(&directory, &runtime, producers);
    let outcome = orchestrator.run_backup().unwrap();
    let run = &outcome.manifest.run;

    assert_eq!(run.status, RunStatus::Partial);
    assert!(!outcome.published);
    assert!(run.id > first.manifest.run.id);

    let statuses: Vec<_> = run.artifacts.iter().map(|artifact| artifact.status).collect();
    assert_eq!(
        statuses,
        vec![
            ArtifactStatus::Failed,
            ArtifactStatus::Verified,
            ArtifactStatus::Verified
        ]
    );
    assert!(run.artifacts[0].error.is_some());

    // No output of the timed out producer is left behind.
    let run_directory = orchestrator.root().run_directory(run.id);
    assert!(!run_directory.join("database.sql.zst").exists());

    let latest = PointerPublisher::new(orchestrator.root().clone())
        .resolve()
        .unwrap();
    assert_eq!(latest, Some(first.manifest.run.id));
}

#[test]
fn pause_timeout_aborts_before_producing() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::never_stops();
    let orchestrator = test_orchestrator(&directory, &runtime, healthy_producers());

    let outcome = orchestrator.run_backup().unwrap();
    let run = &outcome.manifest.run;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(outcome.abort(), Some(AbortReason::QuiesceTimeout));
    assert!(
        run.artifacts
            .iter()
            .all(|artifact| artifact.status == ArtifactStatus::Failed)
    );

    // Resume is still invoked.
    assert_eq!(runtime.starts(), 1);
    assert!(outcome.resumed);

    // Only the manifest and the empty sidecar exist.
    let run_directory = orchestrator.root().run_directory(run.id);
    for artifact in &run.artifacts {
        assert!(!run_directory.join(&artifact.path).exists());
    }
    assert!(run_directory.join(MANIFEST_FILE).exists());

    let latest = PointerPublisher::new(orchestrator.root().clone())
        .resolve()
        .unwrap();
    assert_eq!(latest, None);
}

#[test]
fn concurrent_run_is_rejected() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let orchestrator = test_orchestrator(&directory, &runtime, healthy_producers());

    let lock_path = directory.path().join("backups").join("backup.lock");
    let held = RunLock::acquire(&lock_path).unwrap();

    let result = orchestrator.run_backup();
    assert!(matches!(result, Err(RunError::AlreadyRunning(_))));

    // A rejected run never touches the services or the runs.
    assert!(runtime.calls().is_empty());
    assert!(orchestrator.root().list_runs().unwrap().is_empty());

    drop(held);
    let outcome = orchestrator.run_backup().unwrap();
    assert_eq!(outcome.status(), RunStatus::Succeeded);
}

#[test]
fn concurrent_invocations_take_one_run() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();

    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let producers = vec![MockProducer::with(
        ArtifactKind::Database,
        "database.sql.zst",
        Behaviour::Rendezvous {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
            contents: b"dump of the database".to_vec(),
        },
    )];
    let first = test_orchestrator(&directory, &runtime, producers);
    let second = test_orchestrator(&directory, &runtime, healthy_producers());

    let (first_result, second_result) = thread::scope(|scope| {
        let first = scope.spawn(|| first.run_backup());

        // The first run is producing, so it holds the lock.
        started.wait();
        let second_result = second.run_backup();
        release.wait();

        (first.join().unwrap(), second_result)
    });

    assert_eq!(first_result.unwrap().status(), RunStatus::Succeeded);
    assert!(matches!(second_result, Err(RunError::AlreadyRunning(_))));

    assert_eq!(first.root().list_runs().unwrap().len(), 1);
    assert_eq!(runtime.starts(), 1);
}

#[test]
fn interrupt_while_producing_still_resumes() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let cancellation = Cancellation::new();

    let producers = vec![
        MockProducer::hangs(
            ArtifactKind::Database,
            "database.sql.zst",
            Duration::from_secs(30),
        ),
        MockProducer::writes(ArtifactKind::Filetree, "storage.tar.gz", b"archive of the storage"),
    ];
    let orchestrator =
        cancellable_orchestrator(&directory, &runtime, producers, cancellation.clone());

    let outcome = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(200));
            cancellation.cancel();
        });

        orchestrator.run_backup().unwrap()
    });
    let run = &outcome.manifest.run;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(
        run.artifacts
            .iter()
            .all(|artifact| artifact.status == ArtifactStatus::Failed)
    );
    assert!(!outcome.published);

    let run_directory = orchestrator.root().run_directory(run.id);
    assert!(run_directory.join(MANIFEST_FILE).exists());
    assert_eq!(Manifest::load(&run_directory).unwrap(), outcome.manifest);

    assert_eq!(runtime.starts(), 1);
    assert!(outcome.resumed);
}

#[test]
fn interrupt_while_pausing_aborts() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::never_stops();
    let cancellation = Cancellation::new();

    let orchestrator = cancellable_orchestrator(
        &directory,
        &runtime,
        healthy_producers(),
        cancellation.clone(),
    );

    let outcome = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(200));
            cancellation.cancel();
        });

        orchestrator.run_backup().unwrap()
    });
    let run = &outcome.manifest.run;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(outcome.abort(), Some(AbortReason::Cancelled));

    let run_directory = orchestrator.root().run_directory(run.id);
    assert!(run_directory.join(MANIFEST_FILE).exists());
    for artifact in &run.artifacts {
        assert!(!run_directory.join(&artifact.path).exists());
    }

    assert_eq!(runtime.starts(), 1);
    assert!(outcome.resumed);
}

#[test]
fn manifest_failure_keeps_pointer() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();

    let first = test_orchestrator(&directory, &runtime, healthy_producers())
        .run_backup()
        .unwrap();

    let producers = vec![MockProducer::with(
        ArtifactKind::Database,
        "database.sql.zst",
        Behaviour::BlockManifest(b"dump of the database".to_vec()),
    )];
    let orchestrator = test_orchestrator(&directory, &runtime, producers);

    let result = orchestrator.run_backup();
    assert!(matches!(result, Err(RunError::WriteManifest(_))));

    // Services are resumed on the error path too.
    assert_eq!(runtime.starts(), 2);

    let latest = PointerPublisher::new(orchestrator.root().clone())
        .resolve()
        .unwrap();
    assert_eq!(latest, Some(first.manifest.run.id));
}

#[test]
fn producer_failures_are_recorded() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();

    let producers = vec![
        MockProducer::writes(ArtifactKind::Database, "database.sql.zst", b"dump of the database"),
        MockProducer::with(ArtifactKind::Filetree, "storage.tar.gz", Behaviour::Fail),
        MockProducer::with(ArtifactKind::Config, "config.tar.gz", Behaviour::Lie),
        MockProducer::with(
            ArtifactKind::Other("media".to_string()),
            "media.tar.gz",
            Behaviour::Panic,
        ),
    ];
    let orchestrator = test_orchestrator(&directory, &runtime, producers);

    let outcome = orchestrator.run_backup().unwrap();
    let run = &outcome.manifest.run;

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.artifacts[0].status, ArtifactStatus::Verified);
    for artifact in &run.artifacts[1..] {
        assert_eq!(artifact.status, ArtifactStatus::Failed);
        assert!(artifact.error.is_some());
        assert_eq!(artifact.checksum, None);
    }
    assert!(outcome.resumed);
}

#[test]
fn optional_artifact_failure_still_succeeds() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();

    let producers = vec![
        MockProducer::writes(ArtifactKind::Database, "database.sql.zst", b"dump of the database"),
        MockProducer::with(ArtifactKind::Filetree, "storage.tar.gz", Behaviour::Fail).optional(),
    ];
    let orchestrator = test_orchestrator(&directory, &runtime, producers);

    let outcome = orchestrator.run_backup().unwrap();

    assert_eq!(outcome.status(), RunStatus::Succeeded);
    assert!(outcome.published);
    assert_eq!(
        outcome.manifest.run.artifacts[1].status,
        ArtifactStatus::Failed
    );
}

#[test]
fn no_artifacts_verified_is_failed() {
    let directory = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();

    let producers = vec![MockProducer::with(
        ArtifactKind::Database,
        "database.sql.zst",
        Behaviour::Fail,
    )];
    let orchestrator = test_orchestrator(&directory, &runtime, producers);

    let outcome = orchestrator.run_backup().unwrap();

    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(outcome.abort(), None);
    assert!(!outcome.published);
}
