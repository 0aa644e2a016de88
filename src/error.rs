//! Bootstrap stages and the errors that end a run.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::poll::PollError;
use crate::vm::{BackendError, CommandError};

/// Linear progression of a bootstrap run.
///
/// ```text
/// absent → created → running → addressed → reachable → credential-available
///        → retrieved → rewritten → (verified)
/// ```
///
/// With the guest channel `addressed` is reached after `retrieved` (the
/// address is only needed for rewriting) and `reachable` is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Absent,
    Created,
    Running,
    Addressed,
    Reachable,
    CredentialAvailable,
    Retrieved,
    Rewritten,
    Verified,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Absent => "absent",
            Stage::Created => "created",
            Stage::Running => "running",
            Stage::Addressed => "addressed",
            Stage::Reachable => "reachable",
            Stage::CredentialAvailable => "credential-available",
            Stage::Retrieved => "retrieved",
            Stage::Rewritten => "rewritten",
            Stage::Verified => "verified",
        };
        f.write_str(s)
    }
}

/// Why a bootstrap run stopped. `stage` is the stage that could not be
/// reached.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("stage `{stage}`: backend call failed: {source}")]
    Backend {
        stage: Stage,
        #[source]
        source: BackendError,
    },

    #[error("stage `{stage}`: VM entered the error state ({detail})")]
    VmFailed { stage: Stage, detail: String },

    #[error("stage `{stage}`: backend does not know VM `{vm_id}`")]
    UnknownVm { stage: Stage, vm_id: String },

    #[error("stage `{stage}`: timed out after {attempts} attempts ({elapsed:?})")]
    Timeout { stage: Stage, attempts: u32, elapsed: Duration },

    #[error("stage `{stage}`: command channel failed: {source}")]
    Command {
        stage: Stage,
        #[source]
        source: CommandError,
    },

    #[error("stage `{stage}`: credential document unusable: {reason}")]
    InvalidCredential { stage: Stage, reason: String },

    #[error("stage `{stage}`: writing {}: {source}", .path.display())]
    Output {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BootstrapError {
    /// The stage that failed, if the error belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BootstrapError::Backend { stage, .. }
            | BootstrapError::VmFailed { stage, .. }
            | BootstrapError::UnknownVm { stage, .. }
            | BootstrapError::Timeout { stage, .. }
            | BootstrapError::Command { stage, .. }
            | BootstrapError::InvalidCredential { stage, .. }
            | BootstrapError::Output { stage, .. } => Some(*stage),
            BootstrapError::Config(_) => None,
        }
    }

    /// Collapse the outcome of a readiness wait into a stage error.
    pub(crate) fn from_poll(stage: Stage, err: PollError<BootstrapError>) -> Self {
        match err {
            PollError::Timeout { attempts, elapsed } => {
                BootstrapError::Timeout { stage, attempts, elapsed }
            }
            PollError::Aborted(inner) => inner,
        }
    }
}
