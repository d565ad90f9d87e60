//! The run orchestrator.
//!
//! One run is: lock, allocate the run directory, pause the services, produce every artifact
//! concurrently, digest the produced artifacts, write the sidecar and the manifest, publish the
//! latest pointer if the run succeeded, resume the services, prune and unlock.

use std::{
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Instant,
};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    AbortReason, ArtifactRecord, ArtifactStatus, BackupRoot, BackupRun, Cancellation, Config,
    Context, Manifest, ManifestError, PointerPublisher, RunId, RunStatus,
    checksum::{SidecarEntry, digest_file, write_sidecar},
    lock::{LockError, RunLock},
    producer::{ArtifactProducer, ArtifactSource, ProduceContext, ProduceError},
    quiesce::{Quiescence, ServiceRuntime},
    retention,
    staging::sync_directory,
};

/// The result of a run that reached a terminal status.
#[derive(Debug)]
pub struct RunOutcome {
    /// The manifest that was written.
    pub manifest: Manifest,

    /// If the latest pointer now references this run.
    pub published: bool,

    /// If the services were resumed.
    pub resumed: bool,

    /// The runs deleted by the pruning that followed the run.
    pub pruned: Vec<RunId>,
}

impl RunOutcome {
    /// The run's status.
    pub fn status(&self) -> RunStatus {
        self.manifest.run.status
    }

    /// Why the run was aborted, if it was.
    pub fn abort(&self) -> Option<AbortReason> {
        self.manifest.run.abort
    }
}

/// A producer the orchestrator is still waiting on.
struct InFlight {
    index: usize,
    deadline: Instant,
    stop: Cancellation,
}

/// Sequences backup runs and pruning.
pub struct Orchestrator {
    config: Config,
    root: BackupRoot,
    runtime: Box<dyn ServiceRuntime>,
    producers: Vec<Arc<dyn ArtifactProducer>>,
    cancellation: Cancellation,
}

impl Orchestrator {
    /// Create an orchestrator with the runtime and producers described by the config.
    pub fn from_config(config: Config, cancellation: Cancellation) -> Self {
        let runtime = config.quiescence.runtime.build();
        let producers = config.artifacts.iter().map(ArtifactSource::build).collect();

        Self::new(config, runtime, producers, cancellation)
    }

    /// Create an orchestrator with an explicit runtime and producers.
    pub fn new(
        config: Config,
        runtime: Box<dyn ServiceRuntime>,
        producers: Vec<Arc<dyn ArtifactProducer>>,
        cancellation: Cancellation,
    ) -> Self {
        let root = BackupRoot::new(config.backup_root.clone());

        Self {
            config,
            root,
            runtime,
            producers,
            cancellation,
        }
    }

    /// The backup root.
    pub fn root(&self) -> &BackupRoot {
        &self.root
    }

    /// Take one backup.
    ///
    /// Producer and verification failures are recorded in the manifest. Only failing to take the
    /// lock, to prepare the run directory or to write the manifest returns an error.
    pub fn run_backup(&self) -> Result<RunOutcome, RunError> {
        let mut context = Context {
            current_context: "Lock",
            ..Context::default()
        };
        let _lock = self.lock()?;

        context.current_context = "Prepare";
        self.root
            .ensure()
            .map_err(|e| RunError::Io(e, "create backup root"))?;
        let existing = self
            .root
            .list_runs()
            .map_err(|e| RunError::Io(e, "list runs"))?;
        for id in &existing {
            if !Manifest::exists(&self.root.run_directory(*id)) {
                warn!("{context}Run {id} has no manifest, it was interrupted and is left to pruning");
            }
        }

        let id = RunId::next_after(existing.last().copied(), Utc::now());
        context.run = Some(id);

        let run_directory = self.root.run_directory(id);
        fs::create_dir(&run_directory).map_err(|e| RunError::Io(e, "create run directory"))?;
        if let Err(e) = sync_directory(&self.root.runs_directory()) {
            warn!("{context}Could not sync runs directory: {e}");
        }
        let run_directory = fs::canonicalize(&run_directory)
            .map_err(|e| RunError::Io(e, "resolve run directory"))?;
        info!("{context}Started run in {run_directory:?}");

        let mut run = BackupRun::new(id, Utc::now());
        run.artifacts = self
            .producers
            .iter()
            .map(|producer| {
                ArtifactRecord::pending(
                    producer.kind(),
                    PathBuf::from(producer.file_name()),
                    producer.required(),
                )
            })
            .collect();

        let mut quiescence = Quiescence::new(
            self.runtime.as_ref(),
            &self.config.quiescence.services,
            &context,
        );

        match quiescence.pause(self.config.pause_timeout(), &self.cancellation) {
            Ok(()) => {
                self.produce_artifacts(&mut context, &run_directory, &mut run);
                self.verify_artifacts(&mut context, &run_directory, &mut run);
            }
            Err(error) => {
                context.current_context = "Pause";
                error!("{context}Aborting before producing artifacts: {error}");

                run.abort = Some(error.abort_reason());
                for artifact in &mut run.artifacts {
                    artifact.mark_failed(format!("Not produced: {error}"));
                }
            }
        }

        run.finish(Utc::now());

        context.current_context = "Manifest";
        let manifest = self.write_manifest(&context, &run_directory, run)?;
        info!("{context}Run finished with status {}", manifest.run.status);

        context.current_context = "Publish";
        let published = if manifest.run.status == RunStatus::Succeeded {
            match PointerPublisher::new(self.root.clone()).publish(id) {
                Ok(()) => true,
                Err(e) => {
                    error!("{context}Could not publish the latest pointer: {e}");
                    false
                }
            }
        } else {
            info!(
                "{context}Latest pointer unchanged, run is {}",
                manifest.run.status
            );
            false
        };

        let resumed = quiescence.resume().is_ok();
        drop(quiescence);

        let pruned = if self.config.prune_after_run {
            retention::prune(&self.root, &self.config.retention, Utc::now(), &mut context)
        } else {
            Vec::new()
        };

        Ok(RunOutcome {
            manifest,
            published,
            resumed,
            pruned,
        })
    }

    /// Prune old runs under the run lock.
    pub fn prune(&self) -> Result<Vec<RunId>, RunError> {
        let mut context = Context::default();
        let _lock = self.lock()?;

        Ok(retention::prune(
            &self.root,
            &self.config.retention,
            Utc::now(),
            &mut context,
        ))
    }

    fn lock(&self) -> Result<RunLock, RunError> {
        RunLock::acquire(&self.config.lock_path()).map_err(|error| match error {
            LockError::Held(_) => RunError::AlreadyRunning(error),
            error => RunError::Lock(error),
        })
    }

    /// Run every producer on its own thread and wait until each reported or hit its deadline.
    fn produce_artifacts(&self, context: &mut Context, run_directory: &Path, run: &mut BackupRun) {
        context.current_context = "Produce";
        let context = &*context;

        let started = Instant::now();
        let (sender, receiver) = mpsc::channel::<(usize, Result<(), ProduceError>)>();

        thread::scope(|scope| {
            let mut in_flight = Vec::with_capacity(self.producers.len());

            for (index, producer) in self.producers.iter().enumerate() {
                let deadline = started
                    + producer
                        .timeout()
                        .unwrap_or_else(|| self.config.producer_timeout());
                let produce_context = ProduceContext {
                    context: context.for_artifact(producer.file_name()),
                    deadline,
                    cancellation: self.cancellation.child(),
                };
                let stop = produce_context.cancellation.clone();
                let output = run_directory.join(producer.file_name());
                let sender = sender.clone();

                scope.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        producer.produce(&produce_context, &output)
                    }))
                    .unwrap_or_else(|_| Err(ProduceError::Panicked));

                    // Nobody listens for producers that already timed out.
                    let _ = sender.send((index, result));
                });

                in_flight.push(InFlight {
                    index,
                    deadline,
                    stop,
                });
            }
            drop(sender);

            info!("{context}Started {} producers", in_flight.len());

            while let Some(next_deadline) = in_flight.iter().map(|producer| producer.deadline).min()
            {
                let wait = next_deadline.saturating_duration_since(Instant::now());

                match receiver.recv_timeout(wait) {
                    Ok((index, result)) => {
                        let Some(position) =
                            in_flight.iter().position(|producer| producer.index == index)
                        else {
                            continue;
                        };
                        in_flight.swap_remove(position);

                        record_production(context, run_directory, run, index, result);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        in_flight.retain(|producer| {
                            if producer.deadline > now {
                                return true;
                            }

                            producer.stop.cancel();
                            if let Some(artifact) = run.artifacts.get_mut(producer.index) {
                                error!(
                                    "{}Timed out, stopping producer",
                                    context.for_artifact(artifact.path.display().to_string())
                                );
                                artifact.mark_failed(ProduceError::Timeout);
                            }
                            false
                        });
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        for producer in in_flight.drain(..) {
                            if let Some(artifact) = run.artifacts.get_mut(producer.index) {
                                artifact.mark_failed("Producer exited without reporting");
                            }
                        }
                    }
                }
            }
        });

        // Output written after a producer was given up on is not part of the run.
        for artifact in &run.artifacts {
            if artifact.status != ArtifactStatus::Failed {
                continue;
            }

            let path = run_directory.join(&artifact.path);
            match fs::remove_file(&path) {
                Ok(()) => warn!("{context}Discarded output of failed artifact {path:?}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("{context}Could not discard output {path:?}: {e}"),
            }
        }
    }

    /// Digest every produced artifact.
    fn verify_artifacts(&self, context: &mut Context, run_directory: &Path, run: &mut BackupRun) {
        context.current_context = "Verify";

        for artifact in &mut run.artifacts {
            if artifact.status != ArtifactStatus::Produced {
                continue;
            }
            let artifact_context = context.for_artifact(artifact.path.display().to_string());

            if self.cancellation.is_cancelled() {
                warn!("{artifact_context}Run was cancelled, not verifying");
                artifact.mark_failed(ProduceError::Cancelled);
                continue;
            }

            let path = run_directory.join(&artifact.path);
            let size = match fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    error!("{artifact_context}Output disappeared before verification: {e}");
                    artifact.mark_failed(format!("Output disappeared before verification: {e}"));
                    continue;
                }
            };

            match digest_file(&path) {
                Ok(digest) => {
                    info!("{artifact_context}Verified {size} bytes, {digest}");
                    artifact.mark_verified(size, digest);
                }
                Err(e) => {
                    error!("{artifact_context}Could not digest output: {e}");
                    artifact.mark_failed(e);
                }
            }
        }
    }

    /// Write the sidecar and the manifest. The manifest is the last file written to the run.
    fn write_manifest(
        &self,
        context: &Context,
        run_directory: &Path,
        run: BackupRun,
    ) -> Result<Manifest, RunError> {
        let entries: Vec<SidecarEntry> = run
            .artifacts
            .iter()
            .filter(|artifact| artifact.status == ArtifactStatus::Verified)
            .filter_map(|artifact| {
                Some(SidecarEntry {
                    digest: artifact.digest()?,
                    path: artifact.path.clone(),
                })
            })
            .collect();

        // The manifest still records every digest, a missing sidecar is reported by `verify`.
        if let Err(e) = write_sidecar(run_directory, &entries) {
            error!("{context}Could not write checksum sidecar: {e}");
        }

        let manifest = Manifest::seal(run).map_err(RunError::WriteManifest)?;
        manifest
            .write(run_directory)
            .map_err(RunError::WriteManifest)?;

        Ok(manifest)
    }
}

fn record_production(
    context: &Context,
    run_directory: &Path,
    run: &mut BackupRun,
    index: usize,
    result: Result<(), ProduceError>,
) {
    let Some(artifact) = run.artifacts.get_mut(index) else {
        return;
    };
    let context = context.for_artifact(artifact.path.display().to_string());

    if let Err(e) = result {
        error!("{context}Failed: {e}");
        artifact.mark_failed(e);
        return;
    }

    // A producer reporting success is not trusted to have left a complete file.
    let path = run_directory.join(&artifact.path);
    match fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => {
            info!("{context}Produced");
            artifact.mark_produced();
        }
        Ok(_) => {
            error!("{context}Producer succeeded but the output is empty");
            artifact.mark_failed("Output is empty");
        }
        Err(e) => {
            error!("{context}Producer succeeded but the output is missing: {e}");
            artifact.mark_failed(format!("Output is missing: {e}"));
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    AlreadyRunning(#[source] LockError),

    #[error("Failed to take the run lock: {0}")]
    Lock(#[source] LockError),

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to write the manifest: {0}")]
    WriteManifest(#[source] ManifestError),
}
