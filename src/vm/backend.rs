//! VM control-plane client for the inventory backend.
//!
//! The orchestrator only needs create, start, query and delete, expressed by
//! [`VmBackend`]. [`InventoryClient`] implements them
//! against a JSON REST inventory service:
//!
//! ```text
//! POST   {base}/vms                 VmDescriptor          → {"id": "..."}
//! POST   {base}/vms/{id}/start
//! GET    {base}/vms/{id}                                  → VmStatus   (404 = absent)
//! DELETE {base}/vms/{id}                                              (404 = already gone)
//! POST   {base}/vms/{id}/agent      guest agent envelope  → raw agent reply
//! ```
//!
//! Every request carries HTTP basic auth.
//!
//! `create` is NOT idempotent on most backends: calling it twice for the same
//! logical deployment can leave two VMs behind, and on some backends
//! deleting a VM also invalidates the disk image it was cloned from. Nothing
//! in this module retries `create`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::command::CommandError;
use super::guest_agent::{AgentCommand, AgentTransport};
use super::{VmDescriptor, VmStatus};

/// Failures talking to the inventory backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response.
    #[error("inventory request failed: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("inventory rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The response body did not decode into the expected shape.
    #[error("malformed inventory response: {0}")]
    Protocol(String),

    /// The client configuration itself is unusable.
    #[error("invalid inventory configuration: {0}")]
    Config(String),
}

impl BackendError {
    /// Whether a status poll may keep going after this error.
    ///
    /// Connection trouble and gateway errors are expected while the backend
    /// is busy; explicit rejections and undecodable replies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport(_) => true,
            BackendError::Rejected { status, .. } => matches!(status, 502..=504),
            BackendError::Protocol(_) | BackendError::Config(_) => false,
        }
    }
}

/// Abstract create/start/query/delete capability over VMs.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Submit a new VM. Returns the backend-assigned identifier.
    async fn create(&self, descriptor: &VmDescriptor) -> Result<String, BackendError>;

    async fn start(&self, vm_id: &str) -> Result<(), BackendError>;

    /// Current state and addresses. Safe to call arbitrarily often.
    async fn status(&self, vm_id: &str) -> Result<VmStatus, BackendError>;

    async fn delete(&self, vm_id: &str) -> Result<(), BackendError>;
}

/// Connection settings for [`InventoryClient`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://inventory.example:8006/api/v1`.
    pub url: String,
    pub username: String,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
    /// Accept self-signed certificates (lab backends).
    pub accept_invalid_certs: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:8006/api/v1".to_string(),
            username: "root".to_string(),
            password: None,
            request_timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CreatedVm {
    id: String,
}

/// REST client for the inventory service.
#[derive(Debug, Clone)]
pub struct InventoryClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
}

impl InventoryClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let base = Url::parse(&config.url)
            .map_err(|e| BackendError::Config(format!("backend url `{}`: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::Config(format!(
                "backend url `{}` cannot be a base",
                config.url
            )));
        }
        let password = config
            .password
            .clone()
            .ok_or_else(|| BackendError::Config("backend password is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| BackendError::Config(format!("http client: {e}")))?;

        Ok(Self { http, base, username: config.username.clone(), password })
    }

    /// `base` with `segments` appended as individually escaped path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                BackendError::Config(format!("backend url `{}` cannot be a base", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn dispatch(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))
    }

    async fn expect_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Rejected { status: status.as_u16(), body: body.trim().to_string() })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
        let body = response.text().await.map_err(|e| BackendError::Transport(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| BackendError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl VmBackend for InventoryClient {
    async fn create(&self, descriptor: &VmDescriptor) -> Result<String, BackendError> {
        let url = self.endpoint(&["vms"])?;
        let response = self.dispatch(self.http.post(url).json(descriptor)).await?;
        let created: CreatedVm = Self::decode(Self::expect_success(response).await?).await?;
        if created.id.trim().is_empty() {
            return Err(BackendError::Protocol("create returned an empty id".to_string()));
        }
        info!(vm_id = %created.id, name = %descriptor.name, "VM created");
        Ok(created.id)
    }

    async fn start(&self, vm_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["vms", vm_id, "start"])?;
        Self::expect_success(self.dispatch(self.http.post(url)).await?).await?;
        info!(vm_id, "VM start requested");
        Ok(())
    }

    async fn status(&self, vm_id: &str) -> Result<VmStatus, BackendError> {
        let url = self.endpoint(&["vms", vm_id])?;
        let response = self.dispatch(self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(VmStatus::absent());
        }
        let status: VmStatus = Self::decode(Self::expect_success(response).await?).await?;
        debug!(vm_id, state = %status.state, addresses = ?status.addresses, "VM status");
        Ok(status)
    }

    async fn delete(&self, vm_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["vms", vm_id])?;
        let response = self.dispatch(self.http.delete(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            info!(vm_id, "VM already absent");
            return Ok(());
        }
        Self::expect_success(response).await?;
        info!(vm_id, "VM deleted");
        Ok(())
    }
}

/// Envelopes tunnelled through the inventory API. Any failure to obtain a
/// reply counts as the agent being unreachable.
#[async_trait]
impl AgentTransport for InventoryClient {
    async fn send(
        &self,
        vm_id: &str,
        command: &AgentCommand,
    ) -> Result<serde_json::Value, CommandError> {
        let url = self
            .endpoint(&["vms", vm_id, "agent"])
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        let response = self.dispatch(self.http.post(url).json(command))
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        let response = Self::expect_success(response)
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        let body = response.text().await.map_err(|e| CommandError::Transport(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| CommandError::Protocol(format!("agent reply: {e}")))
    }
}
