//! VM management module for kubevm-bootstrap.
//!
//! Provides the VM data model shared by every stage, the control-plane client
//! for the inventory backend, and the two command channels (guest agent and
//! ssh) used to read files out of the running guest.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod command;
pub mod guest_agent;
pub mod ssh;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Identity and shape of a VM provisioning request.
///
/// Built by the caller before creation and serialized as the body of the
/// backend's create call. `id` stays `None` until the backend has accepted
/// the request; the orchestrator observes identifiers and addresses, it never
/// invents them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Backend-assigned identifier. Absent until creation succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name of the instance.
    pub name: String,

    /// Memory allocation in megabytes.
    pub memory_mb: u32,

    /// Number of virtual CPUs.
    pub cpus: u32,

    /// Block devices in attachment order. The first `Boot` disk is the boot
    /// source.
    pub disks: Vec<BlockDevice>,

    /// The single network attachment.
    pub network: NetworkAttachment,

    /// Cloud-init style user-data and meta-data, passed through untouched.
    #[serde(default)]
    pub provisioning: ProvisioningPayload,
}

/// Role of a block device within the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    /// Boot source, usually cloned from a pre-uploaded image.
    Boot,
    /// Scratch or data disk.
    Data,
}

/// A single block device attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub role: DiskRole,

    /// Size in gigabytes.
    pub size_gb: u64,

    /// Reference to a pre-uploaded disk image in the backend's image store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// The VM's network attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Backend network (bridge, subnet, port group) to attach to.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// Opaque provisioning blobs handed to the guest on first boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningPayload {
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub meta_data: String,
}

/// Lifecycle state as reported by the inventory backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Absent,
    Creating,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Absent => "absent",
            VmState::Creating => "creating",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A point-in-time observation of a VM.
///
/// Eventually consistent: a VM may report `Running` long before any address
/// shows up, and the address list may contain only loopback or link-local
/// entries for a while after that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub state: VmState,

    #[serde(default)]
    pub addresses: Vec<IpAddr>,

    /// Backend-provided detail, typically populated for `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VmStatus {
    /// Status of a VM the backend does not know about.
    pub fn absent() -> Self {
        Self { state: VmState::Absent, addresses: Vec::new(), message: None }
    }

    /// The first externally reachable address, preferring IPv4.
    pub fn routable_address(&self) -> Option<IpAddr> {
        select_routable_address(&self.addresses)
    }
}

/// Pick an address other hosts can reach, preferring IPv4 over IPv6.
///
/// Loopback, link-local, unspecified and multicast entries are skipped, so an
/// address list that holds only those yields `None`.
pub fn select_routable_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .filter(|ip| is_routable(ip))
        .min_by_key(|ip| ip.is_ipv6())
        .copied()
}

fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            // fe80::/10
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || link_local)
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use backend::{BackendError, InventoryClient, VmBackend};
pub use command::{ChannelKind, CommandChannel, CommandError, CommandOutput, CommandRequest};
pub use guest_agent::{AgentTransport, GuestExecChannel, QgaSocketTransport};
pub use ssh::{SshAuth, SshChannel, SshSettings};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
