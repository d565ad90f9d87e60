//! Context for the current run. Used for prefixing logs.
//!

use core::fmt::Display;

use crate::RunId;

/// Holds the context for the current run.
#[derive(Default, Debug, Clone)]
pub struct Context {
    /// The run being taken.
    pub run: Option<RunId>,
    /// The artifact being worked on.
    pub artifact: Option<String>,
    /// The current phase.
    pub current_context: &'static str,
}

impl Context {
    /// A copy of this context scoped to one artifact.
    pub fn for_artifact(&self, artifact: impl Into<String>) -> Self {
        Self {
            artifact: Some(artifact.into()),
            ..self.clone()
        }
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(run) = &self.run {
            write!(f, "[{run}] ")?;
        }

        if let Some(artifact) = &self.artifact {
            write!(f, "[{artifact}] ")?;
        }

        write!(f, "[{}] ", self.current_context)?;

        Ok(())
    }
}
