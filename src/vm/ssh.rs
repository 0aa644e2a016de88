//! Network command channel: run a command in the guest over `ssh`.
//!
//! Needs a routable address, a login user and either a private key or a
//! password. Password logins go through `sshpass -e` so the secret travels in
//! the child's environment rather than on its command line.
//!
//! All I/O uses `tokio::process::Command`, so callers stay async while ssh
//! runs.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::command::{CommandChannel, CommandError, CommandOutput, CommandRequest};

/// SSH options shared by every invocation.
///
/// * `StrictHostKeyChecking=no`: the VM is fresh, its host key is unknown.
/// * `UserKnownHostsFile=/dev/null`: don't pollute the host's known_hosts.
/// * `LogLevel=ERROR`: suppress banner noise.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
];

/// ssh exits 255 when the session itself failed (refused, timed out,
/// authentication rejected).
const SSH_CONNECTION_FAILURE: i32 = 255;

/// sshpass: 5 = wrong password, 6 = host key prompt it could not answer.
const SSHPASS_AUTH_FAILURES: &[i32] = &[5, 6];

/// What `sudo -n` prints when it would have to prompt.
const SUDO_PROMPT_REFUSED: &str = "sudo: a password is required";

/// Login settings for the guest.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,

    /// Private key for `-i`. Takes precedence over `password`.
    pub key_path: Option<PathBuf>,

    pub password: Option<String>,

    /// Prefix privileged remote commands with `sudo -n` (the kubeconfig is
    /// usually root-only).
    pub use_sudo: bool,

    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            key_path: None,
            password: None,
            use_sudo: true,
            connect_timeout_secs: 5,
        }
    }
}

impl std::fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSettings")
            .field("user", &self.user)
            .field("port", &self.port)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_sudo", &self.use_sudo)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// How the channel authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    Key(PathBuf),
    Password(String),
}

impl SshSettings {
    pub fn auth(&self) -> Option<SshAuth> {
        match (&self.key_path, &self.password) {
            (Some(key), _) => Some(SshAuth::Key(key.clone())),
            (None, Some(password)) => Some(SshAuth::Password(password.clone())),
            (None, None) => None,
        }
    }
}

/// [`CommandChannel`] that shells out to `ssh user@address`.
#[derive(Debug, Clone)]
pub struct SshChannel {
    address: IpAddr,
    settings: SshSettings,
}

impl SshChannel {
    pub fn new(address: IpAddr, settings: SshSettings) -> Self {
        Self { address, settings }
    }

    /// Program and argument vector for `request`.
    fn command_line(&self, request: &CommandRequest) -> (String, Vec<String>) {
        let auth = self.settings.auth();
        let batch_mode = if matches!(auth, Some(SshAuth::Password(_))) { "no" } else { "yes" };

        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-o".to_string(),
            format!("BatchMode={batch_mode}"),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-p".to_string(),
            self.settings.port.to_string(),
        ]);
        if let Some(SshAuth::Key(key)) = &auth {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        args.push(format!("{}@{}", self.settings.user, self.address));
        args.push("--".to_string());
        args.push(remote_command_string(request, self.settings.use_sudo));

        match auth {
            Some(SshAuth::Password(_)) => {
                let mut wrapped = vec!["-e".to_string(), "ssh".to_string()];
                wrapped.extend(args);
                ("sshpass".to_string(), wrapped)
            }
            _ => ("ssh".to_string(), args),
        }
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    fn describe(&self) -> String {
        format!("ssh:{}@{}:{}", self.settings.user, self.address, self.settings.port)
    }

    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let (program, args) = self.command_line(request);
        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(std::process::Stdio::null());
        if let Some(SshAuth::Password(password)) = self.settings.auth() {
            cmd.env("SSHPASS", password);
        }

        debug!(target_addr = %self.address, command = %request, "running command over ssh");
        let output = cmd
            .output()
            .await
            .map_err(|e| CommandError::Transport(format!("failed to spawn `{program}`: {e}")))?;

        // A missing status code means the child was killed by a signal.
        let exit_status = output.status.code().unwrap_or(-1);
        let password_auth = program == "sshpass";
        if exit_status == SSH_CONNECTION_FAILURE
            || (password_auth && SSHPASS_AUTH_FAILURES.contains(&exit_status))
        {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CommandError::Transport(format!(
                "{program} to {} failed (exit {exit_status}): {}",
                self.address,
                stderr.trim()
            )));
        }

        let output = CommandOutput { exit_status, stdout: output.stdout, stderr: output.stderr };
        if self.settings.use_sudo && request.privileged && sudo_refused(&output) {
            return Err(CommandError::Denied(format!(
                "{}@{} has no passwordless sudo",
                self.settings.user, self.address
            )));
        }
        Ok(output)
    }
}

fn sudo_refused(output: &CommandOutput) -> bool {
    output.exit_status == 1
        && String::from_utf8_lossy(&output.stderr)
            .lines()
            .any(|line| line.trim() == SUDO_PROMPT_REFUSED)
}

/// Quote `s` for a POSIX shell, leaving plain words untouched.
fn shell_escape(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain { s.to_string() } else { format!("'{}'", s.replace('\'', r"'\''")) }
}

/// The single string ssh hands to the remote login shell.
fn remote_command_string(request: &CommandRequest, use_sudo: bool) -> String {
    let mut words = Vec::with_capacity(request.args.len() + 3);
    if use_sudo && request.privileged {
        words.push("sudo".to_string());
        words.push("-n".to_string());
    }
    words.push(shell_escape(&request.path));
    words.extend(request.args.iter().map(|a| shell_escape(a)));
    words.join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
