//! Optional end-to-end check of a freshly written kubeconfig.
//!
//! Issues one read-only query against the new API server with the rewritten
//! credential. A failure here is reported in the run summary; it never undoes
//! earlier stages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

/// Why a verification attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited {status}: {stderr}")]
    Failed { program: String, status: i32, stderr: String },
}

/// Runs a trivial read-only query using a kubeconfig.
#[async_trait]
pub trait ClusterVerifier: Send + Sync {
    /// Returns a short human-readable summary of what the cluster answered.
    async fn verify(&self, kubeconfig: &Path) -> Result<String, VerifyError>;
}

/// Result of the optional verification stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "lowercase")]
pub enum VerificationOutcome {
    Passed(String),
    Failed(String),
}

impl VerificationOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, VerificationOutcome::Passed(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            VerificationOutcome::Passed(d) | VerificationOutcome::Failed(d) => d,
        }
    }
}

/// `kubectl --kubeconfig <file> get nodes -o name`.
#[derive(Debug, Clone)]
pub struct KubectlVerifier {
    kubectl: PathBuf,
    request_timeout: Duration,
}

impl KubectlVerifier {
    pub fn new(kubectl: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self { kubectl: kubectl.into(), request_timeout }
    }

    fn args(&self, kubeconfig: &Path) -> Vec<String> {
        vec![
            "--kubeconfig".to_string(),
            kubeconfig.display().to_string(),
            format!("--request-timeout={}s", self.request_timeout.as_secs().max(1)),
            "get".to_string(),
            "nodes".to_string(),
            "-o".to_string(),
            "name".to_string(),
        ]
    }
}

#[async_trait]
impl ClusterVerifier for KubectlVerifier {
    async fn verify(&self, kubeconfig: &Path) -> Result<String, VerifyError> {
        let program = self.kubectl.display().to_string();
        let output = Command::new(&self.kubectl)
            .args(self.args(kubeconfig))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|source| VerifyError::Spawn { program: program.clone(), source })?;

        if !output.status.success() {
            return Err(VerifyError::Failed {
                program,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let nodes: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        debug!(nodes = ?nodes, "kubectl get nodes");
        Ok(format!("{} node(s): {}", nodes.len(), nodes.join(", ")))
    }
}
