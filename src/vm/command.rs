//! The command-channel contract shared by the guest agent and ssh paths.
//!
//! Both channels run one executable with an argument list inside the guest
//! and hand back exit status, stdout and stderr. The orchestrator only ever
//! talks to [`CommandChannel`], so which transport carried the command is a
//! configuration detail.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single command to execute inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Executable, resolved through the guest's `PATH` when not absolute.
    pub path: String,
    pub args: Vec<String>,
    /// Needs root in the guest. Channels that log in as an ordinary user
    /// elevate only these.
    pub privileged: bool,
}

impl CommandRequest {
    /// A privileged command.
    pub fn new(path: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            privileged: true,
        }
    }

    /// Run as the login user.
    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    /// `test -s <path>`: succeeds when the file exists and is non-empty.
    pub fn file_present(path: &str) -> Self {
        Self::new("test", ["-s", path])
    }

    /// `cat <path>`.
    pub fn read_file(path: &str) -> Self {
        Self::new("cat", [path])
    }

    /// `echo ready`, the cheapest round trip through a channel. Needs no
    /// privileges, so it only tests the login itself.
    pub fn echo() -> Self {
        Self::new("echo", ["ready"]).unprivileged()
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Failures raised by a command channel.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The channel could not be reached: guest agent not running yet, ssh
    /// connection refused or timed out, authentication rejected.
    #[error("channel unavailable: {0}")]
    Transport(String),

    /// The guest agent answered with an error object instead of a result.
    #[error("guest agent error ({class}): {desc}")]
    Agent { class: String, desc: String },

    /// The command ran and exited non-zero.
    #[error("command exited with status {status}: {}", String::from_utf8_lossy(.stderr).trim())]
    NonZeroExit { status: i32, stdout: Vec<u8>, stderr: Vec<u8> },

    /// The channel answered with something that does not decode.
    #[error("malformed channel reply: {0}")]
    Protocol(String),

    /// The login works but may not run privileged commands.
    #[error("privilege escalation refused: {0}")]
    Denied(String),

    /// The command was accepted but never reported completion.
    #[error("command did not complete after {attempts} status polls")]
    Timeout { attempts: u32 },
}

impl CommandError {
    /// Whether a readiness wait should keep probing after this error.
    ///
    /// Protocol defects and refused privileges are never retried; everything
    /// else can clear up once the guest finishes booting.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CommandError::Protocol(_) | CommandError::Denied(_))
    }
}

/// Which channel the orchestrator uses to reach into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Guest agent side channel; needs no IP connectivity.
    #[default]
    Guest,
    /// ssh to the VM's routable address.
    Network,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Guest => f.write_str("guest"),
            ChannelKind::Network => f.write_str("network"),
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(ChannelKind::Guest),
            "network" => Ok(ChannelKind::Network),
            other => Err(format!("unknown channel `{other}` (expected `guest` or `network`)")),
        }
    }
}

/// Executes a single command inside a running VM.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String;

    /// Run `request` and return its captured output whatever the exit
    /// status. Errors mean the command could not be run or observed.
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError>;

    /// Like [`execute`](Self::execute), but a non-zero exit becomes
    /// [`CommandError::NonZeroExit`] carrying the captured output.
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let output = self.execute(request).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::NonZeroExit {
                status: output.exit_status,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_message_includes_stderr() {
        let err = CommandError::NonZeroExit {
            status: 1,
            stdout: Vec::new(),
            stderr: b"cat: /etc/rancher/k3s/k3s.yaml: No such file or directory\n".to_vec(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 1"));
        assert!(msg.ends_with("No such file or directory"), "got: {msg}");
    }

    #[test]
    fn protocol_and_denied_errors_are_not_transient() {
        assert!(!CommandError::Protocol("bad".into()).is_transient());
        assert!(!CommandError::Denied("sudo: a password is required".into()).is_transient());
        assert!(CommandError::Transport("refused".into()).is_transient());
        assert!(CommandError::Timeout { attempts: 3 }.is_transient());
    }

    #[test]
    fn channel_kind_parses() {
        assert_eq!("guest".parse::<ChannelKind>(), Ok(ChannelKind::Guest));
        assert_eq!("network".parse::<ChannelKind>(), Ok(ChannelKind::Network));
        assert!("serial".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn only_the_echo_runs_unprivileged() {
        assert!(!CommandRequest::echo().privileged);
        assert!(CommandRequest::file_present("/etc/rancher/k3s/k3s.yaml").privileged);
        assert!(CommandRequest::read_file("/etc/rancher/k3s/k3s.yaml").privileged);
    }

    #[test]
    fn request_display_joins_args() {
        let req = CommandRequest::read_file("/etc/rancher/k3s/k3s.yaml");
        assert_eq!(req.to_string(), "cat /etc/rancher/k3s/k3s.yaml");
    }
}
