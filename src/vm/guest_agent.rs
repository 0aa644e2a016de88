//! Guest command channel over the QEMU guest agent.
//!
//! The agent runs inside the VM and answers JSON command envelopes on a side
//! channel that needs no IP networking, so it can read files out of the guest
//! before DHCP has finished.
//!
//! ## Protocol
//!
//! ```text
//! {"execute":"guest-exec","arguments":{"path":"cat","arg":["/etc/..."],"capture-output":true}}
//!     └─► {"return":{"pid":1234}}
//! {"execute":"guest-exec-status","arguments":{"pid":1234}}
//!     └─► {"return":{"exited":false}}                          (poll again)
//!     └─► {"return":{"exited":true,"exitcode":0,"out-data":"<b64>","err-data":"<b64>"}}
//! ```
//!
//! The agent never pushes completion, so the status query is itself a
//! bounded poll. Envelopes travel over an [`AgentTransport`]: either tunnelled
//! through the inventory backend (see [`super::backend::InventoryClient`]) or
//! written straight to the agent's Unix socket ([`QgaSocketTransport`]).

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::command::{CommandChannel, CommandError, CommandOutput, CommandRequest};
use crate::poll::{PollError, PollPolicy, poll_until};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A command envelope understood by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "execute", content = "arguments", rename_all = "kebab-case")]
pub enum AgentCommand {
    GuestExec(GuestExecArgs),
    GuestExecStatus(GuestExecStatusArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestExecArgs {
    pub path: String,
    #[serde(default)]
    pub arg: Vec<String>,
    #[serde(rename = "capture-output")]
    pub capture_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestExecStatusArgs {
    pub pid: i64,
}

impl AgentCommand {
    fn exec(request: &CommandRequest) -> Self {
        AgentCommand::GuestExec(GuestExecArgs {
            path: request.path.clone(),
            arg: request.args.clone(),
            capture_output: true,
        })
    }

    fn status(pid: i64) -> Self {
        AgentCommand::GuestExecStatus(GuestExecStatusArgs { pid })
    }
}

/// Agent reply: exactly one of `return` or `error`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AgentReply<T> {
    Return(T),
    Error(AgentErrorBody),
}

#[derive(Debug, Deserialize)]
struct AgentErrorBody {
    #[serde(default)]
    class: String,
    #[serde(default)]
    desc: String,
}

#[derive(Debug, Deserialize)]
struct ExecStarted {
    pid: i64,
}

#[derive(Debug, Deserialize)]
struct ExecStatus {
    exited: bool,
    #[serde(default)]
    exitcode: Option<i32>,
    #[serde(default)]
    signal: Option<i32>,
    #[serde(default, rename = "out-data")]
    out_data: Option<String>,
    #[serde(default, rename = "err-data")]
    err_data: Option<String>,
    #[serde(default, rename = "out-truncated")]
    out_truncated: bool,
}

fn decode_reply<T: DeserializeOwned>(reply: serde_json::Value) -> Result<T, CommandError> {
    match serde_json::from_value::<AgentReply<T>>(reply) {
        Ok(AgentReply::Return(value)) => Ok(value),
        Ok(AgentReply::Error(body)) => {
            Err(CommandError::Agent { class: body.class, desc: body.desc })
        }
        Err(e) => Err(CommandError::Protocol(e.to_string())),
    }
}

fn decode_payload(field: &str, data: Option<String>) -> Result<Vec<u8>, CommandError> {
    match data {
        None => Ok(Vec::new()),
        Some(encoded) => BASE64
            .decode(encoded.trim())
            .map_err(|e| CommandError::Protocol(format!("{field} is not valid base64: {e}"))),
    }
}

impl ExecStatus {
    fn into_output(self) -> Result<CommandOutput, CommandError> {
        let exit_status = match (self.exitcode, self.signal) {
            (Some(code), _) => code,
            // Shell convention for a signal-terminated process.
            (None, Some(sig)) => match 128i32.checked_add(sig) {
                Some(status) if sig > 0 => status,
                _ => {
                    return Err(CommandError::Protocol(format!(
                        "signal {sig} is not a valid signal number"
                    )));
                }
            },
            (None, None) => {
                return Err(CommandError::Protocol(
                    "exited process reported neither exitcode nor signal".to_string(),
                ));
            }
        };
        if self.out_truncated {
            warn!("guest agent truncated captured stdout");
        }
        Ok(CommandOutput {
            exit_status,
            stdout: decode_payload("out-data", self.out_data)?,
            stderr: decode_payload("err-data", self.err_data)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Carries one agent envelope to the VM identified by `vm_id` and returns
/// the raw JSON reply.
///
/// Implementations report an unreachable agent as
/// [`CommandError::Transport`]; decoding the reply is the channel's job.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(
        &self,
        vm_id: &str,
        command: &AgentCommand,
    ) -> Result<serde_json::Value, CommandError>;
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// [`CommandChannel`] backed by the guest agent's `guest-exec` pair.
#[derive(Clone)]
pub struct GuestExecChannel {
    transport: Arc<dyn AgentTransport>,
    vm_id: String,
    status_policy: PollPolicy,
}

impl std::fmt::Debug for GuestExecChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestExecChannel")
            .field("vm_id", &self.vm_id)
            .field("status_policy", &self.status_policy)
            .finish_non_exhaustive()
    }
}

impl GuestExecChannel {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        vm_id: impl Into<String>,
        status_policy: PollPolicy,
    ) -> Self {
        Self { transport, vm_id: vm_id.into(), status_policy }
    }
}

#[async_trait]
impl CommandChannel for GuestExecChannel {
    fn describe(&self) -> String {
        format!("guest-agent:{}", self.vm_id)
    }

    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let transport = self.transport.as_ref();
        let vm_id = self.vm_id.as_str();

        let reply = transport.send(vm_id, &AgentCommand::exec(request)).await?;
        let ExecStarted { pid } = decode_reply(reply)?;
        debug!(vm_id, pid, command = %request, "guest-exec started");

        let status = poll_until(&self.status_policy, "guest-exec-status", move |_| async move {
            let reply = match transport.send(vm_id, &AgentCommand::status(pid)).await {
                Ok(reply) => reply,
                Err(CommandError::Transport(e)) => {
                    warn!(vm_id, pid, error = %e, "guest-exec-status transport error, retrying");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let status: ExecStatus = decode_reply(reply)?;
            Ok::<_, CommandError>(status.exited.then_some(status))
        })
        .await
        .map_err(|e| match e {
            PollError::Timeout { attempts, .. } => CommandError::Timeout { attempts },
            PollError::Aborted(inner) => inner,
        })?;

        let output = status.into_output()?;
        debug!(
            vm_id,
            pid,
            exit_status = output.exit_status,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "guest-exec finished"
        );
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Direct agent socket transport
// ---------------------------------------------------------------------------

/// Talks to the agent's host-side Unix socket directly, one connection per
/// envelope, newline-delimited JSON in both directions.
///
/// `socket_template` may contain `{vm_id}`, e.g.
/// `/var/run/qemu-server/{vm_id}.qga`.
#[derive(Debug, Clone)]
pub struct QgaSocketTransport {
    socket_template: String,
    reply_timeout: std::time::Duration,
}

/// Largest reply accepted from the agent socket. Base64 output of a
/// kubeconfig is a few KiB; the agent caps captured output well below this.
const MAX_REPLY_BYTES: u64 = 16 * 1024 * 1024;

impl QgaSocketTransport {
    pub fn new(socket_template: impl Into<String>, reply_timeout: std::time::Duration) -> Self {
        Self { socket_template: socket_template.into(), reply_timeout }
    }

    pub fn socket_path(&self, vm_id: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(self.socket_template.replace("{vm_id}", vm_id))
    }
}

#[cfg(unix)]
#[async_trait]
impl AgentTransport for QgaSocketTransport {
    async fn send(
        &self,
        vm_id: &str,
        command: &AgentCommand,
    ) -> Result<serde_json::Value, CommandError> {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixStream;

        let path = self.socket_path(vm_id);
        let exchange = async {
            let stream = UnixStream::connect(&path)
                .await
                .map_err(|e| CommandError::Transport(format!("connect {}: {e}", path.display())))?;
            let (read, mut write) = stream.into_split();

            let mut line = serde_json::to_vec(command)
                .map_err(|e| CommandError::Protocol(format!("encode envelope: {e}")))?;
            line.push(b'\n');
            write
                .write_all(&line)
                .await
                .map_err(|e| CommandError::Transport(format!("write {}: {e}", path.display())))?;

            let mut reader = BufReader::new(read.take(MAX_REPLY_BYTES));
            let mut reply = String::new();
            let n = reader
                .read_line(&mut reply)
                .await
                .map_err(|e| CommandError::Transport(format!("read {}: {e}", path.display())))?;
            if n == 0 {
                return Err(CommandError::Transport(format!(
                    "{} closed without a reply",
                    path.display()
                )));
            }
            serde_json::from_str::<serde_json::Value>(reply.trim())
                .map_err(|e| CommandError::Protocol(format!("agent reply is not JSON: {e}")))
        };

        tokio::time::timeout(self.reply_timeout, exchange)
            .await
            .map_err(|_| {
                CommandError::Transport(format!(
                    "no reply from {} within {:?}",
                    path.display(),
                    self.reply_timeout
                ))
            })?
    }
}

#[cfg(not(unix))]
#[async_trait]
impl AgentTransport for QgaSocketTransport {
    async fn send(
        &self,
        _vm_id: &str,
        _command: &AgentCommand,
    ) -> Result<serde_json::Value, CommandError> {
        Err(CommandError::Transport(
            "guest agent sockets are only supported on Unix hosts".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
