//! # common
//!

#![allow(dead_code)]

use core::time::Duration;
use std::{
    fs,
    io::Write,
    path::Path,
    sync::{Arc, Barrier, Mutex},
    thread,
    time::Instant,
};

use backup_orchestrator::{
    ArtifactKind, ArtifactRecord, BackupRoot, BackupRun, Cancellation, Config, Manifest,
    Orchestrator, QuiescenceConfig, RunId, StagedFile,
    checksum::digest_bytes,
    producer::{ArtifactProducer, ProduceContext, ProduceError},
    quiesce::{RuntimeConfig, RuntimeError, ServiceRuntime},
};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

/// A config rooted in `directory` with no configured artifacts.
pub fn test_config(directory: &Path) -> Config {
    Config {
        backup_root: directory.join("backups"),
        log_directory: directory.join("logs"),
        prune_after_run: false,
        quiescence: QuiescenceConfig {
            services: vec!["app".to_string(), "worker".to_string()],
            pause_timeout_secs: 1,
            runtime: RuntimeConfig::Disabled,
        },
        artifacts: Vec::new(),
        ..Config::default()
    }
}

pub fn test_orchestrator(
    directory: &TempDir,
    runtime: &MockRuntime,
    producers: Vec<MockProducer>,
) -> Orchestrator {
    cancellable_orchestrator(directory, runtime, producers, Cancellation::new())
}

/// An orchestrator interrupted through `cancellation`.
pub fn cancellable_orchestrator(
    directory: &TempDir,
    runtime: &MockRuntime,
    producers: Vec<MockProducer>,
    cancellation: Cancellation,
) -> Orchestrator {
    shared::test::init_test_logger();

    Orchestrator::new(
        test_config(directory.path()),
        Box::new(runtime.clone()),
        producers.into_iter().map(MockProducer::into_arc).collect(),
        cancellation,
    )
}

/// The three artifacts of a healthy stack.
pub fn healthy_producers() -> Vec<MockProducer> {
    vec![
        MockProducer::writes(ArtifactKind::Database, "database.sql.zst", b"dump of the database"),
        MockProducer::writes(ArtifactKind::Filetree, "storage.tar.gz", b"archive of the storage"),
        MockProducer::writes(ArtifactKind::Config, "config.tar.gz", b"archive of the config"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Stop(Vec<String>),
    Start(Vec<String>),
}

/// A service runtime that records what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    calls: Arc<Mutex<Vec<RuntimeCall>>>,
    never_stops: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime whose services never confirm they stopped.
    pub fn never_stops() -> Self {
        Self {
            never_stops: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RuntimeCall::Start(_)))
            .count()
    }
}

impl ServiceRuntime for MockRuntime {
    fn stop_services(
        &self,
        services: &[String],
        deadline: Instant,
        cancellation: &Cancellation,
    ) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .push(RuntimeCall::Stop(services.to_vec()));

        if !self.never_stops {
            return Ok(());
        }

        while Instant::now() < deadline {
            if cancellation.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            thread::sleep(Duration::from_millis(10));
        }

        Err(RuntimeError::Timeout(services.to_vec()))
    }

    fn start_services(&self, services: &[String]) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .push(RuntimeCall::Start(services.to_vec()));

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Behaviour {
    Write(Vec<u8>),
    /// Runs until it is told to stop.
    Hang,
    Fail,
    Panic,
    /// Reports success without writing anything.
    Lie,
    /// Writes its output and then blocks the manifest path.
    BlockManifest(Vec<u8>),
    /// Meets the test on `started`, waits on `release`, then writes its output.
    Rendezvous {
        started: Arc<Barrier>,
        release: Arc<Barrier>,
        contents: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct MockProducer {
    pub kind: ArtifactKind,
    pub file_name: String,
    pub required: bool,
    pub timeout: Option<Duration>,
    pub behaviour: Behaviour,
}

impl MockProducer {
    fn new(kind: ArtifactKind, file_name: &str, behaviour: Behaviour) -> Self {
        Self {
            kind,
            file_name: file_name.to_string(),
            required: true,
            timeout: None,
            behaviour,
        }
    }

    pub fn writes(kind: ArtifactKind, file_name: &str, contents: &[u8]) -> Self {
        Self::new(kind, file_name, Behaviour::Write(contents.to_vec()))
    }

    pub fn hangs(kind: ArtifactKind, file_name: &str, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new(kind, file_name, Behaviour::Hang)
        }
    }

    pub fn with(kind: ArtifactKind, file_name: &str, behaviour: Behaviour) -> Self {
        Self::new(kind, file_name, behaviour)
    }

    pub fn optional(self) -> Self {
        Self {
            required: false,
            ..self
        }
    }

    pub fn into_arc(self) -> Arc<dyn ArtifactProducer> {
        Arc::new(self)
    }
}

fn write_output(output: &Path, contents: &[u8]) -> Result<(), ProduceError> {
    let staged = StagedFile::new(output)?;
    let mut file = staged.create()?;
    file.write_all(contents)
        .map_err(|e| ProduceError::Io(e, "write output"))?;
    drop(file);
    staged.commit()?;

    Ok(())
}

impl ArtifactProducer for MockProducer {
    fn kind(&self) -> ArtifactKind {
        self.kind.clone()
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn required(&self) -> bool {
        self.required
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn produce(&self, context: &ProduceContext, output: &Path) -> Result<(), ProduceError> {
        match &self.behaviour {
            Behaviour::Write(contents) => write_output(output, contents),
            Behaviour::Hang => loop {
                context.check()?;
                thread::sleep(Duration::from_millis(10));
            },
            Behaviour::Fail => Err(ProduceError::MissingEnvironment(
                "TEST_DATABASE_PASSWORD".to_string(),
            )),
            Behaviour::Panic => panic!("producer panicked"),
            Behaviour::Lie => Ok(()),
            Behaviour::BlockManifest(contents) => {
                write_output(output, contents)?;

                let run_directory = output.parent().unwrap();
                fs::create_dir(run_directory.join(backup_orchestrator::MANIFEST_FILE)).unwrap();
                fs::write(
                    run_directory
                        .join(backup_orchestrator::MANIFEST_FILE)
                        .join("blocker"),
                    "",
                )
                .unwrap();

                Ok(())
            }
            Behaviour::Rendezvous {
                started,
                release,
                contents,
            } => {
                started.wait();
                release.wait();
                write_output(output, contents)
            }
        }
    }
}

/// Write a finished run directly into the backup root.
pub fn seed_run(root: &BackupRoot, finished_at: DateTime<Utc>, succeeded: bool) -> RunId {
    let id = RunId::from_time(finished_at);
    let run_directory = root.run_directory(id);
    fs::create_dir_all(&run_directory).unwrap();

    let contents = b"seeded database dump";
    let mut artifact = ArtifactRecord::pending(
        ArtifactKind::Database,
        "database.sql.zst".into(),
        true,
    );
    if succeeded {
        fs::write(run_directory.join("database.sql.zst"), contents).unwrap();
        artifact.mark_produced();
        artifact.mark_verified(u64::try_from(contents.len()).unwrap(), digest_bytes(contents));
    } else {
        artifact.mark_failed("seeded failure");
    }

    let mut run = BackupRun::new(id, finished_at);
    run.artifacts.push(artifact);
    run.finish(finished_at);

    Manifest::seal(run).unwrap().write(&run_directory).unwrap();

    id
}
