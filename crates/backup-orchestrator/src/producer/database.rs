use core::time::Duration;
use std::{
    env,
    io::{self, BufWriter, Write},
    path::Path,
    process::Command,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ArtifactProducer, ProduceContext, ProduceError};
use crate::{ArtifactKind, command::supervise, staging::StagedFile};

/// The engine running inside the database container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum DatabaseEngine {
    /// `pg_dump` exports from a single snapshot without blocking writers.
    #[default]
    Postgres,

    /// `mysqldump --single-transaction` exports InnoDB tables from one consistent read view.
    MySql,
}

impl DatabaseEngine {
    fn password_variable(&self) -> &'static str {
        match self {
            Self::Postgres => "PGPASSWORD",
            Self::MySql => "MYSQL_PWD",
        }
    }
}

/// Dump a database running in a docker container, compressed with zstd.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DockerDatabase {
    /// The name of the container.
    pub container_name: String,

    /// The database engine.
    pub engine: DatabaseEngine,

    /// The database username.
    pub username: String,

    /// The database to dump.
    pub database: String,

    /// The environment variable holding the password, if the engine needs one.
    pub password_env: Option<String>,

    /// The zstd compression level.
    pub compression_level: i32,

    /// The artifact's file name.
    pub file_name: String,

    /// If the run can only succeed with this artifact.
    pub required: bool,

    /// Overrides the run's producer timeout.
    pub timeout_secs: Option<u64>,
}

impl Default for DockerDatabase {
    fn default() -> Self {
        Self {
            container_name: "postgres".to_string(),
            engine: DatabaseEngine::Postgres,
            username: "postgres".to_string(),
            database: "postgres".to_string(),
            password_env: None,
            compression_level: 3,
            file_name: "database.sql.zst".to_string(),
            required: true,
            timeout_secs: None,
        }
    }
}

impl DockerDatabase {
    fn dump_command(&self) -> Result<Command, ProduceError> {
        let mut command = Command::new("docker");
        command.arg("exec");

        // `--env NAME` without a value forwards the variable from the docker client, which keeps
        // the password off the command line.
        if let Some(variable) = &self.password_env {
            let password = env::var(variable)
                .map_err(|_| ProduceError::MissingEnvironment(variable.clone()))?;
            let name = self.engine.password_variable();
            command.arg("--env").arg(name).env(name, password);
        }

        command.arg(&self.container_name);

        match self.engine {
            DatabaseEngine::Postgres => command.args([
                "pg_dump",
                "--username",
                self.username.as_str(),
                "--dbname",
                self.database.as_str(),
                "--no-owner",
            ]),
            DatabaseEngine::MySql => command.args([
                "mysqldump",
                "--user",
                self.username.as_str(),
                "--single-transaction",
                "--quick",
                "--skip-lock-tables",
                "--routines",
                self.database.as_str(),
            ]),
        };

        Ok(command)
    }
}

impl ArtifactProducer for DockerDatabase {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Database
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn required(&self) -> bool {
        self.required
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn produce(&self, context: &ProduceContext, output: &Path) -> Result<(), ProduceError> {
        context.check()?;
        let mut command = self.dump_command()?;

        let staged = StagedFile::new(output)?;
        let file = staged.create()?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), self.compression_level)
            .map_err(|e| ProduceError::Io(e, "create compressor"))?;
        let mut sink = Counted::new(encoder);

        info!(
            "{}Dumping '{}' from container '{}'",
            context.context, self.database, self.container_name
        );
        supervise(
            &mut command,
            Some(&mut sink as &mut (dyn Write + Send)),
            Some(context.deadline),
            &context.cancellation,
        )?
        .ensure_success()?;

        if sink.bytes == 0 {
            return Err(ProduceError::EmptyOutput);
        }
        let dump_bytes = sink.bytes;

        sink.inner
            .finish()
            .map_err(|e| ProduceError::Io(e, "finish compression"))?
            .into_inner()
            .map_err(|e| ProduceError::Io(e.into_error(), "flush dump"))?;

        let size = staged.commit()?;
        info!(
            "{}Dumped {dump_bytes} bytes, {size} bytes compressed",
            context.context
        );

        Ok(())
    }
}

/// Counts the bytes written through it, so an empty dump is caught before compression hides it.
struct Counted<W> {
    inner: W,
    bytes: u64,
}

impl<W> Counted<W> {
    fn new(inner: W) -> Self {
        Self { inner, bytes: 0 }
    }
}

impl<W: Write> Write for Counted<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes = self
            .bytes
            .saturating_add(u64::try_from(written).unwrap_or(u64::MAX));
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
