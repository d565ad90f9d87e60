use core::time::Duration;
use std::{
    collections::HashSet,
    path::PathBuf,
    process::Command,
    thread,
    time::Instant,
};

use serde::{Deserialize, Serialize};

use super::{RuntimeError, ServiceRuntime};
use crate::{Cancellation, command::supervise};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stop and start containers with the docker CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Docker {
    /// Seconds docker waits for a container to exit before killing it.
    pub stop_grace_secs: u64,

    /// Upper bound for starting the containers again.
    pub start_timeout_secs: u64,
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            stop_grace_secs: 30,
            start_timeout_secs: 300,
        }
    }
}

impl Docker {
    fn running(
        &self,
        services: &[String],
        deadline: Instant,
        cancellation: &Cancellation,
    ) -> Result<Vec<String>, RuntimeError> {
        let output = supervise(
            Command::new("docker")
                .args(["inspect", "--format", "{{.Name}} {{.State.Running}}"])
                .args(services),
            None,
            Some(deadline),
            cancellation,
        )?
        .ensure_success()?;

        let mut running = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let (name, state) = line
                .trim()
                .split_once(' ')
                .ok_or_else(|| RuntimeError::UnexpectedOutput(line.to_string()))?;

            if state == "true" {
                running.push(name.trim_start_matches('/').to_string());
            }
        }

        Ok(running)
    }
}

impl ServiceRuntime for Docker {
    fn stop_services(
        &self,
        services: &[String],
        deadline: Instant,
        cancellation: &Cancellation,
    ) -> Result<(), RuntimeError> {
        supervise(
            Command::new("docker")
                .args(["stop", "--time", self.stop_grace_secs.to_string().as_str()])
                .args(services),
            None,
            Some(deadline),
            cancellation,
        )?
        .ensure_success()?;

        wait_until_stopped(
            || self.running(services, deadline, cancellation),
            deadline,
            cancellation,
        )
    }

    fn start_services(&self, services: &[String]) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + Duration::from_secs(self.start_timeout_secs);

        supervise(
            Command::new("docker").arg("start").args(services),
            None,
            Some(deadline),
            &Cancellation::new(),
        )?
        .ensure_success()?;

        Ok(())
    }
}

/// Stop and start services of a compose project.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DockerCompose {
    /// The compose file of the stack.
    pub compose_file: PathBuf,

    /// Overrides the project name derived from the compose file's directory.
    pub project_name: Option<String>,

    /// Seconds compose waits for a container to exit before killing it.
    pub stop_grace_secs: u64,

    /// Upper bound for starting the services again.
    pub start_timeout_secs: u64,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self {
            compose_file: PathBuf::from("docker-compose.yml"),
            project_name: None,
            stop_grace_secs: 30,
            start_timeout_secs: 300,
        }
    }
}

impl DockerCompose {
    fn compose(&self) -> Command {
        let mut command = Command::new("docker");
        command.arg("compose").arg("--file").arg(&self.compose_file);
        if let Some(project_name) = &self.project_name {
            command.arg("--project-name").arg(project_name);
        }
        command
    }

    fn running(
        &self,
        services: &[String],
        deadline: Instant,
        cancellation: &Cancellation,
    ) -> Result<Vec<String>, RuntimeError> {
        let output = supervise(
            self.compose()
                .args(["ps", "--status", "running", "--services"]),
            None,
            Some(deadline),
            cancellation,
        )?
        .ensure_success()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let running: HashSet<&str> = stdout.lines().map(str::trim).collect();

        Ok(services
            .iter()
            .filter(|service| running.contains(service.as_str()))
            .cloned()
            .collect())
    }
}

impl ServiceRuntime for DockerCompose {
    fn stop_services(
        &self,
        services: &[String],
        deadline: Instant,
        cancellation: &Cancellation,
    ) -> Result<(), RuntimeError> {
        supervise(
            self.compose()
                .args(["stop", "--timeout", self.stop_grace_secs.to_string().as_str()])
                .args(services),
            None,
            Some(deadline),
            cancellation,
        )?
        .ensure_success()?;

        wait_until_stopped(
            || self.running(services, deadline, cancellation),
            deadline,
            cancellation,
        )
    }

    fn start_services(&self, services: &[String]) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + Duration::from_secs(self.start_timeout_secs);

        supervise(
            self.compose().arg("start").args(services),
            None,
            Some(deadline),
            &Cancellation::new(),
        )?
        .ensure_success()?;

        Ok(())
    }
}

/// Poll until no service is reported running.
fn wait_until_stopped(
    mut running: impl FnMut() -> Result<Vec<String>, RuntimeError>,
    deadline: Instant,
    cancellation: &Cancellation,
) -> Result<(), RuntimeError> {
    loop {
        let still_running = running()?;
        if still_running.is_empty() {
            return Ok(());
        }

        if cancellation.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        if Instant::now() >= deadline {
            return Err(RuntimeError::Timeout(still_running));
        }

        thread::sleep(POLL_INTERVAL);
    }
}
