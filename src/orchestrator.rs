//! Bootstrap orchestration: from "no VM" to "kubeconfig on disk".
//!
//! ## Stage sequence
//!
//! ```text
//! bootstrap(VmDescriptor)
//!     └─► create ─► start ─► wait running
//!             ├─ network channel: wait addressed ─► wait reachable (echo over ssh)
//!             │                        ─► wait credential file ─► retrieve
//!             └─ guest channel:   wait credential file ─► retrieve ─► wait addressed
//!                 └─► rewrite ─► atomic write (0600) ─► optional verify
//! ```
//!
//! Exactly one stage is awaited at a time and no stage is re-entered. The
//! only loops are the bounded waits in [`crate::poll`]. A caller that wants
//! to retry after a failure starts again with [`Orchestrator::bootstrap_existing`]
//! (enters at `created`) or [`Orchestrator::bootstrap`] (creates another VM).
//!
//! Two runs against the same VM identifier at the same time are not
//! coordinated in any way.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credential;
use crate::error::{BootstrapError, Stage};
use crate::poll::{PollPolicy, poll_until};
use crate::verify::{ClusterVerifier, VerificationOutcome};
use crate::vm::{
    AgentTransport, ChannelKind, CommandChannel, CommandRequest, GuestExecChannel, SshChannel,
    SshSettings, VmBackend, VmDescriptor, VmState, VmStatus,
};

/// Default location of the k3s admin kubeconfig inside the guest.
pub const DEFAULT_CREDENTIAL_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One poll policy per readiness wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub running: PollPolicy,
    pub address: PollPolicy,
    pub reachable: PollPolicy,
    pub credential: PollPolicy,
    /// Budget for a single guest command to finish.
    pub exec_status: PollPolicy,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            running: PollPolicy { interval_ms: 2_000, max_attempts: 90, ..PollPolicy::default() },
            address: PollPolicy { interval_ms: 3_000, max_attempts: 100, ..PollPolicy::default() },
            reachable: PollPolicy { interval_ms: 5_000, max_attempts: 60, ..PollPolicy::default() },
            credential: PollPolicy {
                interval_ms: 5_000,
                max_attempts: 120,
                ..PollPolicy::default()
            },
            exec_status: PollPolicy {
                interval_ms: 250,
                max_attempts: 120,
                backoff: 1.5,
                max_interval_ms: Some(2_000),
            },
        }
    }
}

/// Everything the orchestrator needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub channel: ChannelKind,
    /// Path of the kubeconfig inside the guest.
    pub credential_path: String,
    /// Where the rewritten kubeconfig lands on this host.
    pub output_path: PathBuf,
    /// Address to write into the kubeconfig (and to reach ssh on) instead of
    /// the one the backend reports. Useful behind NAT or a load balancer.
    pub advertise_address: Option<IpAddr>,
    pub ssh: SshSettings,
    pub timeouts: Timeouts,
}

impl OrchestratorConfig {
    pub fn new(channel: ChannelKind, output_path: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            credential_path: DEFAULT_CREDENTIAL_PATH.to_string(),
            output_path: output_path.into(),
            advertise_address: None,
            ssh: SshSettings::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Builds the network channel once an address is known.
pub type NetworkConnector = Arc<dyn Fn(IpAddr) -> Arc<dyn CommandChannel> + Send + Sync>;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Time spent getting from the previous stage to `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub vm_id: String,
    /// Address written into the kubeconfig.
    pub address: IpAddr,
    pub channel: ChannelKind,
    pub output_path: PathBuf,
    /// Stages reached, in order.
    pub stages: Vec<StageTiming>,
    pub verification: Option<VerificationOutcome>,
    pub finished_at: DateTime<Utc>,
}

impl BootstrapReport {
    pub fn reached(&self, stage: Stage) -> bool {
        self.stages.iter().any(|t| t.stage == stage)
    }

    pub fn total_ms(&self) -> u64 {
        self.stages.iter().map(|t| t.elapsed_ms).sum()
    }
}

/// Bookkeeping threaded through the stages of one run.
struct Progress {
    vm_id: String,
    stage: Stage,
    since: Instant,
    stages: Vec<StageTiming>,
}

impl Progress {
    fn new(vm_id: String) -> Self {
        Self { vm_id, stage: Stage::Absent, since: Instant::now(), stages: Vec::new() }
    }

    fn reach(&mut self, stage: Stage) {
        let elapsed_ms = u64::try_from(self.since.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(vm_id = %self.vm_id, from = %self.stage, stage = %stage, elapsed_ms, "stage reached");
        self.stages.push(StageTiming { stage, elapsed_ms });
        self.stage = stage;
        self.since = Instant::now();
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one VM through the bootstrap stages.
pub struct Orchestrator {
    backend: Arc<dyn VmBackend>,
    agent: Arc<dyn AgentTransport>,
    verifier: Option<Arc<dyn ClusterVerifier>>,
    connect: NetworkConnector,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("verify", &self.verifier.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn VmBackend>,
        agent: Arc<dyn AgentTransport>,
        config: OrchestratorConfig,
    ) -> Self {
        let ssh = config.ssh.clone();
        let connect: NetworkConnector = Arc::new(move |address| {
            Arc::new(SshChannel::new(address, ssh.clone())) as Arc<dyn CommandChannel>
        });
        Self { backend, agent, verifier: None, connect, config }
    }

    /// Run the optional verification stage with `verifier`.
    pub fn with_verifier(mut self, verifier: Arc<dyn ClusterVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replace the ssh-backed network channel.
    pub fn with_network_connector(mut self, connect: NetworkConnector) -> Self {
        self.connect = connect;
        self
    }

    /// Create a VM from `descriptor`, start it, and run every later stage.
    ///
    /// `create` is called exactly once. If this returns an error after
    /// creation succeeded the VM is left in place; retry with
    /// [`bootstrap_existing`](Self::bootstrap_existing) rather than calling
    /// this again.
    pub async fn bootstrap(
        &self,
        descriptor: &VmDescriptor,
    ) -> Result<BootstrapReport, BootstrapError> {
        if let Some(id) = &descriptor.id {
            return Err(BootstrapError::Config(format!(
                "descriptor already carries backend id `{id}`; \
                 resume it instead of creating another VM"
            )));
        }

        let mut progress = Progress::new(String::new());
        warn!(
            name = %descriptor.name,
            "creating VM; create is not idempotent, a rerun after failure may leave a duplicate"
        );
        let vm_id = self
            .backend
            .create(descriptor)
            .await
            .map_err(|source| BootstrapError::Backend { stage: Stage::Created, source })?;
        progress.vm_id = vm_id;
        progress.reach(Stage::Created);

        self.start(&progress.vm_id).await?;
        self.advance(progress).await
    }

    /// Continue a VM that already exists, entering at `created`.
    ///
    /// `start` is skipped when the VM already reports `running`.
    pub async fn bootstrap_existing(&self, vm_id: &str) -> Result<BootstrapReport, BootstrapError> {
        let status = self
            .backend
            .status(vm_id)
            .await
            .map_err(|source| BootstrapError::Backend { stage: Stage::Created, source })?;

        let mut progress = Progress::new(vm_id.to_string());
        match status.state {
            VmState::Absent => {
                return Err(BootstrapError::UnknownVm {
                    stage: Stage::Created,
                    vm_id: vm_id.to_string(),
                });
            }
            VmState::Error => return Err(vm_failed(Stage::Running, &status)),
            VmState::Running => {
                progress.reach(Stage::Created);
                info!(vm_id, "VM already running, not starting it again");
            }
            VmState::Creating | VmState::Stopped => {
                progress.reach(Stage::Created);
                self.start(vm_id).await?;
            }
        }
        self.advance(progress).await
    }

    async fn start(&self, vm_id: &str) -> Result<(), BootstrapError> {
        self.backend
            .start(vm_id)
            .await
            .map_err(|source| BootstrapError::Backend { stage: Stage::Running, source })
    }

    /// Everything after `created`.
    async fn advance(&self, mut progress: Progress) -> Result<BootstrapReport, BootstrapError> {
        let vm_id = progress.vm_id.clone();

        self.wait_running(&vm_id).await?;
        progress.reach(Stage::Running);

        let (document, address) = match self.config.channel {
            ChannelKind::Network => {
                let address = match self.config.advertise_address {
                    Some(address) => address,
                    None => self.wait_addressed(&vm_id).await?,
                };
                progress.reach(Stage::Addressed);

                let channel = (self.connect)(address);
                self.wait_reachable(channel.as_ref()).await?;
                progress.reach(Stage::Reachable);

                self.wait_credential(channel.as_ref()).await?;
                progress.reach(Stage::CredentialAvailable);

                let document = self.retrieve(channel.as_ref()).await?;
                progress.reach(Stage::Retrieved);
                (document, address)
            }
            ChannelKind::Guest => {
                let channel = GuestExecChannel::new(
                    Arc::clone(&self.agent),
                    vm_id.clone(),
                    self.config.timeouts.exec_status,
                );

                self.wait_credential(&channel).await?;
                progress.reach(Stage::CredentialAvailable);

                let document = self.retrieve(&channel).await?;
                progress.reach(Stage::Retrieved);

                // Only the rewrite needs an address on this path.
                let address = match self.config.advertise_address {
                    Some(address) => address,
                    None => self.wait_addressed(&vm_id).await?,
                };
                progress.reach(Stage::Addressed);
                (document, address)
            }
        };

        if !credential::has_placeholder_endpoint(&document) {
            warn!(%vm_id, "kubeconfig has no loopback server endpoint; writing it unchanged");
        }
        let rewritten = credential::rewrite_for_address(&document, address);
        let output_path = self.config.output_path.clone();
        credential::write_private_atomic(&output_path, rewritten.as_bytes()).map_err(|source| {
            BootstrapError::Output { stage: Stage::Rewritten, path: output_path.clone(), source }
        })?;
        info!(vm_id = %vm_id, path = %output_path.display(), %address, "kubeconfig written");
        progress.reach(Stage::Rewritten);

        let verification = match &self.verifier {
            Some(verifier) => match verifier.verify(&output_path).await {
                Ok(summary) => {
                    progress.reach(Stage::Verified);
                    Some(VerificationOutcome::Passed(summary))
                }
                Err(e) => {
                    warn!(vm_id = %vm_id, error = %e, "verification failed; kubeconfig kept");
                    Some(VerificationOutcome::Failed(e.to_string()))
                }
            },
            None => None,
        };

        Ok(BootstrapReport {
            vm_id,
            address,
            channel: self.config.channel,
            output_path,
            stages: progress.stages,
            verification,
            finished_at: Utc::now(),
        })
    }

    // -----------------------------------------------------------------------
    // Stage waits
    // -----------------------------------------------------------------------

    async fn wait_running(&self, vm_id: &str) -> Result<(), BootstrapError> {
        let backend = self.backend.as_ref();
        poll_until(&self.config.timeouts.running, "vm running", move |attempt| async move {
            let status = match observe(backend, vm_id, Stage::Running, attempt).await {
                Ok(Some(status)) => status,
                Ok(None) => return Ok(None),
                Err(e) => return Err(e),
            };
            match status.state {
                VmState::Running => Ok(Some(())),
                VmState::Error => Err(vm_failed(Stage::Running, &status)),
                VmState::Absent | VmState::Creating | VmState::Stopped => {
                    debug!(vm_id, attempt, state = %status.state, "waiting for running");
                    Ok(None)
                }
            }
        })
        .await
        .map_err(|e| BootstrapError::from_poll(Stage::Running, e))
    }

    async fn wait_addressed(&self, vm_id: &str) -> Result<IpAddr, BootstrapError> {
        let backend = self.backend.as_ref();
        poll_until(&self.config.timeouts.address, "vm address", move |attempt| async move {
            let status = match observe(backend, vm_id, Stage::Addressed, attempt).await {
                Ok(Some(status)) => status,
                Ok(None) => return Ok(None),
                Err(e) => return Err(e),
            };
            if status.state == VmState::Error {
                return Err(vm_failed(Stage::Addressed, &status));
            }
            let address = status.routable_address();
            if address.is_none() {
                debug!(vm_id, attempt, addresses = ?status.addresses, "no routable address yet");
            }
            Ok(address)
        })
        .await
        .map_err(|e| BootstrapError::from_poll(Stage::Addressed, e))
    }

    async fn wait_reachable(&self, channel: &dyn CommandChannel) -> Result<(), BootstrapError> {
        let label = channel.describe();
        let label = label.as_str();
        poll_until(&self.config.timeouts.reachable, "channel reachable", move |attempt| async move {
            match channel.run(&CommandRequest::echo()).await {
                Ok(_) => Ok(Some(())),
                Err(e) if e.is_transient() => {
                    debug!(channel = label, attempt, error = %e, "not reachable yet");
                    Ok(None)
                }
                Err(source) => Err(BootstrapError::Command { stage: Stage::Reachable, source }),
            }
        })
        .await
        .map_err(|e| BootstrapError::from_poll(Stage::Reachable, e))
    }

    async fn wait_credential(&self, channel: &dyn CommandChannel) -> Result<(), BootstrapError> {
        let request = CommandRequest::file_present(&self.config.credential_path);
        let request = &request;
        let label = channel.describe();
        let label = label.as_str();
        poll_until(&self.config.timeouts.credential, "credential file", move |attempt| async move {
            match channel.execute(request).await {
                Ok(output) if output.success() => Ok(Some(())),
                Ok(output) => {
                    debug!(
                        channel = label,
                        attempt,
                        exit_status = output.exit_status,
                        "credential file not there yet"
                    );
                    Ok(None)
                }
                Err(e) if e.is_transient() => {
                    warn!(channel = label, attempt, error = %e, "credential check failed");
                    Ok(None)
                }
                Err(source) => {
                    Err(BootstrapError::Command { stage: Stage::CredentialAvailable, source })
                }
            }
        })
        .await
        .map_err(|e| BootstrapError::from_poll(Stage::CredentialAvailable, e))
    }

    async fn retrieve(&self, channel: &dyn CommandChannel) -> Result<String, BootstrapError> {
        let output = channel
            .run(&CommandRequest::read_file(&self.config.credential_path))
            .await
            .map_err(|source| BootstrapError::Command { stage: Stage::Retrieved, source })?;

        let document =
            String::from_utf8(output.stdout).map_err(|e| BootstrapError::InvalidCredential {
                stage: Stage::Retrieved,
                reason: format!("not UTF-8: {e}"),
            })?;
        if document.trim().is_empty() {
            return Err(BootstrapError::InvalidCredential {
                stage: Stage::Retrieved,
                reason: "empty document".to_string(),
            });
        }
        debug!(channel = %channel.describe(), bytes = document.len(), "kubeconfig retrieved");
        Ok(document)
    }
}

/// One status query inside a wait. Transient backend trouble reads as
/// not-ready; anything else ends the wait.
async fn observe(
    backend: &dyn VmBackend,
    vm_id: &str,
    stage: Stage,
    attempt: u32,
) -> Result<Option<VmStatus>, BootstrapError> {
    match backend.status(vm_id).await {
        Ok(status) => Ok(Some(status)),
        Err(e) if e.is_transient() => {
            warn!(vm_id, attempt, error = %e, "status query failed, retrying");
            Ok(None)
        }
        Err(source) => Err(BootstrapError::Backend { stage, source }),
    }
}

fn vm_failed(stage: Stage, status: &VmStatus) -> BootstrapError {
    BootstrapError::VmFailed {
        stage,
        detail: status.message.clone().unwrap_or_else(|| "no detail from backend".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
