//! kubevm-bootstrap: provision a VM running a lightweight Kubernetes control
//! plane and pull a usable admin kubeconfig out of it.
//!
//! The [`orchestrator`] sequences everything. It talks to the hypervisor
//! inventory through [`vm::VmBackend`] and reaches into the guest through a
//! [`vm::CommandChannel`]: the guest agent ([`vm::GuestExecChannel`]), which
//! needs no network, or ssh ([`vm::SshChannel`]).

pub mod config;
pub mod credential;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod poll;
pub mod verify;
pub mod vm;

pub use error::{BootstrapError, Stage};
pub use orchestrator::{BootstrapReport, Orchestrator, OrchestratorConfig, Timeouts};
pub use poll::{PollError, PollPolicy, poll_until};
