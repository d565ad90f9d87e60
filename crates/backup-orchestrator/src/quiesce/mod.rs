//! Service quiescence.
//!
//! The services being snapshotted are stopped before any artifact is produced and started again
//! afterwards. [`Quiescence`] is a guard: once created it resumes the services on every exit
//! path, including early returns and panics.

use core::{fmt::Debug, time::Duration};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{AbortReason, Cancellation, Context, command::CommandError};

mod docker;

pub use docker::{Docker, DockerCompose};

/// Control over the runtime hosting the service stack.
pub trait ServiceRuntime: Debug + Send + Sync {
    /// Stop the services.
    ///
    /// Returns once every service is confirmed stopped, or with [`RuntimeError::Timeout`] once
    /// `deadline` has passed.
    fn stop_services(
        &self,
        services: &[String],
        deadline: Instant,
        cancellation: &Cancellation,
    ) -> Result<(), RuntimeError>;

    /// Start the services. Starting a running service must succeed.
    fn start_services(&self, services: &[String]) -> Result<(), RuntimeError>;
}

/// A runtime for stacks that do not need to be stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

impl ServiceRuntime for Disabled {
    fn stop_services(
        &self,
        _services: &[String],
        _deadline: Instant,
        _cancellation: &Cancellation,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn start_services(&self, _services: &[String]) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// The configured service runtime.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub enum RuntimeConfig {
    #[default]
    Disabled,
    Docker(Docker),
    DockerCompose(DockerCompose),
}

impl RuntimeConfig {
    /// Create the runtime.
    pub fn build(&self) -> Box<dyn ServiceRuntime> {
        match self {
            Self::Disabled => Box::new(Disabled),
            Self::Docker(docker) => Box::new(docker.clone()),
            Self::DockerCompose(compose) => Box::new(compose.clone()),
        }
    }
}

/// Guard that pauses a set of services and guarantees they are resumed.
#[derive(Debug)]
pub struct Quiescence<'a> {
    runtime: &'a dyn ServiceRuntime,
    services: &'a [String],
    context: Context,
    resumed: bool,
}

impl<'a> Quiescence<'a> {
    /// Create the guard. From here on the services are resumed when the guard is dropped.
    pub fn new(runtime: &'a dyn ServiceRuntime, services: &'a [String], context: &Context) -> Self {
        Self {
            runtime,
            services,
            context: context.clone(),
            resumed: false,
        }
    }

    /// Stop the services, waiting at most `timeout` for them to stop.
    pub fn pause(
        &mut self,
        timeout: Duration,
        cancellation: &Cancellation,
    ) -> Result<(), QuiesceError> {
        self.context.current_context = "Pause";
        let context = &self.context;

        if self.services.is_empty() {
            info!("{context}No services to stop");
            return Ok(());
        }

        if cancellation.is_cancelled() {
            return Err(QuiesceError::Cancelled);
        }

        info!("{context}Stopping {:?}", self.services);
        let started = Instant::now();

        match self
            .runtime
            .stop_services(self.services, started + timeout, cancellation)
        {
            Ok(()) => {
                info!(
                    "{context}Services stopped after {:.1}s",
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(RuntimeError::Timeout(_) | RuntimeError::Command(CommandError::Timeout(_))) => {
                Err(QuiesceError::Timeout(timeout))
            }
            Err(RuntimeError::Cancelled | RuntimeError::Command(CommandError::Cancelled(_))) => {
                Err(QuiesceError::Cancelled)
            }
            Err(error) => Err(QuiesceError::Runtime(error)),
        }
    }

    /// Start the services again. Only the first call does anything, later calls return `Ok`.
    ///
    /// Resuming is attempted regardless of whether the pause succeeded and ignores cancellation.
    pub fn resume(&mut self) -> Result<(), RuntimeError> {
        if self.resumed {
            return Ok(());
        }
        self.resumed = true;
        self.context.current_context = "Resume";
        let context = &self.context;

        if self.services.is_empty() {
            return Ok(());
        }

        info!("{context}Starting {:?}", self.services);
        match self.runtime.start_services(self.services) {
            Ok(()) => {
                info!("{context}Services started");
                Ok(())
            }
            Err(error) => {
                error!(
                    "{context}CRITICAL: Services {:?} did not start, the stack is down: {error}",
                    self.services
                );
                Err(error)
            }
        }
    }
}

impl Drop for Quiescence<'_> {
    fn drop(&mut self) {
        if self.resumed {
            return;
        }

        warn!("{}Run ended early, resuming services", self.context);
        // The outcome is logged by `resume`.
        let _ = self.resume();
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum QuiesceError {
    #[error("Services did not stop within {0:?}")]
    Timeout(Duration),

    #[error("Failed to stop services: {0}")]
    Runtime(#[source] RuntimeError),

    #[error("Cancelled while stopping services")]
    Cancelled,
}

impl QuiesceError {
    /// How the run is recorded as aborted.
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            Self::Timeout(_) => AbortReason::QuiesceTimeout,
            Self::Runtime(_) => AbortReason::QuiesceFailed,
            Self::Cancelled => AbortReason::Cancelled,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Command(#[from] CommandError),

    #[error("Services still running at the deadline: {0:?}")]
    Timeout(Vec<String>),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unexpected runtime output: {0}")]
    UnexpectedOutput(String),
}
