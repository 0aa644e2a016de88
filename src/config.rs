//! TOML configuration for a bootstrap run.
//!
//! ```toml
//! [backend]
//! url = "https://inventory.example:8006/api/v1"
//! username = "root@pam"
//! # password = "..."            # or KUBEVM_BACKEND_PASSWORD
//!
//! [vm]
//! name = "k3s-dev"
//! memory_mb = 4096
//! cpus = 2
//! user_data_path = "cloud-init/user-data.yaml"
//!
//! [[vm.disks]]
//! role = "boot"
//! size_gb = 20
//! image = "ubuntu-24.04-k3s"
//!
//! [vm.network]
//! name = "vmbr0"
//!
//! [channel]
//! kind = "guest"                  # or "network"
//!
//! [credential]
//! output_path = "k3s-dev.yaml"
//!
//! [timeouts.running]
//! interval_ms = 2000
//! max_attempts = 90
//! ```
//!
//! Every section is optional; missing keys take their defaults. Relative
//! paths are resolved against the directory holding the config file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::{DEFAULT_CREDENTIAL_PATH, OrchestratorConfig, Timeouts};
use crate::poll::PollPolicy;
use crate::vm::backend::BackendConfig;
use crate::vm::{
    BlockDevice, ChannelKind, DiskRole, NetworkAttachment, ProvisioningPayload, SshSettings,
    VmDescriptor,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub backend: BackendConfig,
    pub vm: VmSection,
    pub channel: ChannelSection,
    pub ssh: SshSettings,
    pub agent: AgentSection,
    pub credential: CredentialSection,
    pub timeouts: Timeouts,
    pub verify: VerifySection,
}

/// The VM to create, plus where its provisioning payload lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSection {
    pub name: String,
    pub memory_mb: u32,
    pub cpus: u32,
    pub disks: Vec<BlockDevice>,
    pub network: NetworkAttachment,
    pub user_data_path: Option<PathBuf>,
    pub meta_data_path: Option<PathBuf>,
}

impl Default for VmSection {
    fn default() -> Self {
        Self {
            name: "kubevm".to_string(),
            memory_mb: 4096,
            cpus: 2,
            disks: vec![BlockDevice { role: DiskRole::Boot, size_gb: 20, image: None }],
            network: NetworkAttachment { name: "vmbr0".to_string(), mac: None },
            user_data_path: None,
            meta_data_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub kind: ChannelKind,
}

/// How guest agent envelopes reach the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Tunnelled through the inventory API.
    #[default]
    Backend,
    /// Straight to the hypervisor's guest agent socket on this host.
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub kind: AgentKind,
    /// Socket path; `{vm_id}` is replaced with the VM identifier.
    pub socket_path: String,
    pub reply_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            kind: AgentKind::Backend,
            socket_path: "/var/run/qemu-server/{vm_id}.qga".to_string(),
            reply_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSection {
    /// Kubeconfig location inside the guest.
    pub guest_path: String,
    /// Where to write the rewritten kubeconfig. Defaults to
    /// `<data dir>/kubeconfigs/<vm name>.yaml`.
    pub output_path: Option<PathBuf>,
    pub advertise_address: Option<IpAddr>,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            guest_path: DEFAULT_CREDENTIAL_PATH.to_string(),
            output_path: None,
            advertise_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySection {
    pub enabled: bool,
    pub kubectl: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self { enabled: false, kubectl: PathBuf::from("kubectl"), request_timeout_secs: 10 }
    }
}

impl BootstrapConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Read and parse `path`, resolving relative file references against its
    /// directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut config = Self::from_toml(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        if let Some(dir) = path.parent() {
            config.resolve_relative_to(dir);
        }
        Ok(config)
    }

    fn resolve_relative_to(&mut self, dir: &Path) {
        let fix = |p: &mut Option<PathBuf>| {
            if let Some(path) = p.as_mut() {
                if path.is_relative() {
                    *path = dir.join(&*path);
                }
            }
        };
        fix(&mut self.vm.user_data_path);
        fix(&mut self.vm.meta_data_path);
        fix(&mut self.credential.output_path);
        fix(&mut self.ssh.key_path);
    }

    /// Reject settings that can only fail later, mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.backend.url.trim().is_empty() {
            return invalid("backend.url is empty".to_string());
        }
        if self.vm.name.trim().is_empty() {
            return invalid("vm.name is empty".to_string());
        }
        if self.vm.memory_mb == 0 || self.vm.cpus == 0 {
            return invalid("vm.memory_mb and vm.cpus must be positive".to_string());
        }
        if !self.vm.disks.iter().any(|d| d.role == DiskRole::Boot) {
            return invalid("vm.disks needs a disk with role = \"boot\"".to_string());
        }
        if let Some(disk) = self.vm.disks.iter().find(|d| d.size_gb == 0) {
            return invalid(format!("vm.disks: {:?} disk has size_gb = 0", disk.role));
        }
        if !self.credential.guest_path.starts_with('/') {
            return invalid(format!(
                "credential.guest_path `{}` is not absolute",
                self.credential.guest_path
            ));
        }

        let waits = [
            ("running", &self.timeouts.running),
            ("address", &self.timeouts.address),
            ("reachable", &self.timeouts.reachable),
            ("credential", &self.timeouts.credential),
            ("exec_status", &self.timeouts.exec_status),
        ];
        for (name, policy) in waits {
            validate_policy(name, policy)?;
        }

        if self.channel.kind == ChannelKind::Network && self.ssh.auth().is_none() {
            return invalid("network channel needs ssh.key_path or ssh.password".to_string());
        }
        if self.agent.kind == AgentKind::Socket && self.agent.socket_path.trim().is_empty() {
            return invalid("agent.kind = \"socket\" needs agent.socket_path".to_string());
        }
        Ok(())
    }

    /// Build the descriptor for `create`, reading the provisioning files.
    pub fn descriptor(&self) -> Result<VmDescriptor, ConfigError> {
        let read = |path: &Option<PathBuf>| -> Result<String, ConfigError> {
            match path {
                Some(p) => std::fs::read_to_string(p)
                    .map_err(|source| ConfigError::Read { path: p.clone(), source }),
                None => Ok(String::new()),
            }
        };
        Ok(VmDescriptor {
            id: None,
            name: self.vm.name.clone(),
            memory_mb: self.vm.memory_mb,
            cpus: self.vm.cpus,
            disks: self.vm.disks.clone(),
            network: self.vm.network.clone(),
            provisioning: ProvisioningPayload {
                user_data: read(&self.vm.user_data_path)?,
                meta_data: read(&self.vm.meta_data_path)?,
            },
        })
    }

    pub fn orchestrator_config(&self, output_path: PathBuf) -> OrchestratorConfig {
        OrchestratorConfig {
            channel: self.channel.kind,
            credential_path: self.credential.guest_path.clone(),
            output_path,
            advertise_address: self.credential.advertise_address,
            ssh: self.ssh.clone(),
            timeouts: self.timeouts.clone(),
        }
    }

    pub fn agent_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.reply_timeout_secs.max(1))
    }
}

fn validate_policy(name: &str, policy: &PollPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(ConfigError::Invalid(format!(
            "timeouts.{name}.max_attempts must be at least 1"
        )));
    }
    if !policy.backoff.is_finite() || policy.backoff < 1.0 {
        return Err(ConfigError::Invalid(format!(
            "timeouts.{name}.backoff must be a finite value >= 1.0 (got {})",
            policy.backoff
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[backend]
url = "https://inv.example:8006/api/v1"
username = "root@pam"
accept_invalid_certs = true

[vm]
name = "k3s-dev"
memory_mb = 8192
cpus = 4
user_data_path = "user-data.yaml"

[[vm.disks]]
role = "boot"
size_gb = 32
image = "ubuntu-24.04-k3s"

[[vm.disks]]
role = "data"
size_gb = 100

[vm.network]
name = "vmbr1"
mac = "52:54:00:12:34:56"

[channel]
kind = "network"

[ssh]
user = "k3s"
key_path = "id_ed25519"

[credential]
advertise_address = "203.0.113.7"

[timeouts.credential]
interval_ms = 1000
max_attempts = 10
backoff = 2.0
max_interval_ms = 8000

[verify]
enabled = true
"#;

    #[test]
    fn parses_full_file() {
        let cfg = BootstrapConfig::from_toml(FULL).expect("parse");
        assert_eq!(cfg.backend.username, "root@pam");
        assert!(cfg.backend.accept_invalid_certs);
        assert_eq!(cfg.vm.disks.len(), 2);
        assert_eq!(cfg.vm.disks[1].role, DiskRole::Data);
        assert_eq!(cfg.vm.network.mac.as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(cfg.channel.kind, ChannelKind::Network);
        assert_eq!(cfg.ssh.user, "k3s");
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.credential.guest_path, DEFAULT_CREDENTIAL_PATH);
        assert_eq!(cfg.credential.advertise_address, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(cfg.timeouts.credential.max_interval_ms, Some(8000));
        assert_eq!(cfg.timeouts.running, Timeouts::default().running);
        assert!(cfg.verify.enabled);
        cfg.validate().expect("valid");
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = BootstrapConfig::from_toml("").expect("parse");
        assert_eq!(cfg.channel.kind, ChannelKind::Guest);
        assert_eq!(cfg.agent.kind, AgentKind::Backend);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn network_channel_without_auth_rejected() {
        let cfg = BootstrapConfig::from_toml("[channel]\nkind = \"network\"\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ssh.key_path"), "got: {err}");
    }

    #[test]
    fn zero_attempt_budget_rejected() {
        let cfg = BootstrapConfig::from_toml("[timeouts.address]\nmax_attempts = 0\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.address"), "got: {err}");
    }

    #[test]
    fn shrinking_backoff_rejected() {
        let cfg = BootstrapConfig::from_toml("[timeouts.running]\nbackoff = 0.5\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_boot_disk_rejected() {
        let cfg =
            BootstrapConfig::from_toml("[[vm.disks]]\nrole = \"data\"\nsize_gb = 10\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_channel_is_parse_error() {
        assert!(BootstrapConfig::from_toml("[channel]\nkind = \"serial\"\n").is_err());
    }

    #[test]
    fn load_resolves_relative_paths_and_reads_payload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("user-data.yaml"), "#cloud-config\npackages: [curl]\n")
            .unwrap();
        let cfg_path = dir.path().join("config.toml");
        std::fs::write(&cfg_path, FULL).unwrap();

        let cfg = BootstrapConfig::load(&cfg_path).expect("load");
        assert_eq!(cfg.ssh.key_path.as_deref(), Some(dir.path().join("id_ed25519").as_path()));

        let descriptor = cfg.descriptor().expect("descriptor");
        assert_eq!(descriptor.id, None);
        assert_eq!(descriptor.name, "k3s-dev");
        assert!(descriptor.provisioning.user_data.starts_with("#cloud-config"));
        assert!(descriptor.provisioning.meta_data.is_empty());
    }

    #[test]
    fn missing_payload_file_is_read_error() {
        let mut cfg = BootstrapConfig::default();
        cfg.vm.user_data_path = Some(PathBuf::from("/nonexistent/user-data"));
        assert!(matches!(cfg.descriptor(), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = BootstrapConfig::from_toml(FULL).unwrap();
        let again = BootstrapConfig::from_toml(&cfg.to_toml()).expect("roundtrip");
        assert_eq!(again.vm.disks, cfg.vm.disks);
        assert_eq!(again.timeouts, cfg.timeouts);
    }
}
