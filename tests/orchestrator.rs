//! End-to-end orchestrator runs against an in-memory backend and guest.
//!
//! `FakeBackend` replays a scripted sequence of status snapshots, optionally
//! preceded by scripted query failures.
//! `FakeGuest` answers guest-agent envelopes the way a real agent would,
//! backed by a tiny in-memory filesystem in which the kubeconfig appears
//! after a configurable number of `test -s` checks. All tests run with
//! paused time so poll sleeps cost nothing.

#![cfg(unix)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use kubevm_bootstrap::orchestrator::NetworkConnector;
use kubevm_bootstrap::verify::{ClusterVerifier, VerifyError};
use kubevm_bootstrap::vm::guest_agent::AgentCommand;
use kubevm_bootstrap::vm::{
    AgentTransport, BackendError, BlockDevice, ChannelKind, CommandChannel, CommandError,
    CommandOutput, CommandRequest, DiskRole, NetworkAttachment, ProvisioningPayload, VmBackend,
    VmDescriptor, VmState, VmStatus,
};
use kubevm_bootstrap::{BootstrapError, Orchestrator, OrchestratorConfig, PollPolicy, Stage};

const K3S_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

const K3S_YAML: &str = "\
apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==
    server: https://127.0.0.1:6443
  name: default
kind: Config
";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

fn status(state: VmState, addresses: &[&str]) -> VmStatus {
    VmStatus {
        state,
        addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
        message: None,
    }
}

struct FakeBackend {
    script: Mutex<VecDeque<VmStatus>>,
    /// Returned by the next status queries, before the script resumes.
    failures: Mutex<VecDeque<BackendError>>,
    status_calls: AtomicUsize,
    create_calls: AtomicUsize,
    start_calls: AtomicUsize,
    /// Set once a status carrying any address has been handed out.
    address_served: Arc<AtomicBool>,
}

impl FakeBackend {
    /// The last scripted status repeats forever.
    fn new(script: Vec<VmStatus>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            failures: Mutex::new(VecDeque::new()),
            status_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            address_served: Arc::new(AtomicBool::new(false)),
        })
    }

    fn fail_next(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.failures.lock().unwrap().extend(errors);
    }
}

#[async_trait]
impl VmBackend for FakeBackend {
    async fn create(&self, _descriptor: &VmDescriptor) -> Result<String, BackendError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok("vm-101".to_string())
    }

    async fn start(&self, _vm_id: &str) -> Result<(), BackendError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, _vm_id: &str) -> Result<VmStatus, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 { script.pop_front().unwrap() } else { script[0].clone() };
        if !next.addresses.is_empty() {
            self.address_served.store(true, Ordering::SeqCst);
        }
        Ok(next)
    }

    async fn delete(&self, _vm_id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Guest with an agent and a one-file filesystem.
struct FakeGuest {
    /// `test -s` checks that fail before the kubeconfig exists.
    missing_for: AtomicUsize,
    files: Mutex<HashMap<String, String>>,
    pending: Mutex<HashMap<i64, (i32, String, String)>>,
    next_pid: AtomicUsize,
    execs: Mutex<Vec<String>>,
    /// Whether an address had been observed when the kubeconfig was read.
    address_flag: Mutex<Option<Arc<AtomicBool>>>,
    address_seen_at_read: Mutex<Option<bool>>,
}

impl FakeGuest {
    fn new(missing_for: usize) -> Arc<Self> {
        Arc::new(Self {
            missing_for: AtomicUsize::new(missing_for),
            files: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_pid: AtomicUsize::new(1000),
            execs: Mutex::new(Vec::new()),
            address_flag: Mutex::new(None),
            address_seen_at_read: Mutex::new(None),
        })
    }

    fn watch_addresses(&self, flag: Arc<AtomicBool>) {
        *self.address_flag.lock().unwrap() = Some(flag);
    }

    /// Run `path args` in the "guest", returning (exit, stdout, stderr).
    fn run(&self, path: &str, args: &[String]) -> (i32, String, String) {
        self.execs.lock().unwrap().push(format!("{path} {}", args.join(" ")));
        match (path, args) {
            ("echo", _) => (0, format!("{}\n", args.join(" ")), String::new()),
            ("test", [flag, file]) if flag == "-s" => {
                let remaining = self.missing_for.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.missing_for.store(remaining - 1, Ordering::SeqCst);
                    return (1, String::new(), String::new());
                }
                self.files.lock().unwrap().insert(file.clone(), K3S_YAML.to_string());
                (0, String::new(), String::new())
            }
            ("cat", [file]) => {
                let flag = self.address_flag.lock().unwrap();
                let seen = flag.as_ref().map(|f| f.load(Ordering::SeqCst));
                *self.address_seen_at_read.lock().unwrap() = seen;
                match self.files.lock().unwrap().get(file) {
                    Some(contents) => (0, contents.clone(), String::new()),
                    None => (1, String::new(), format!("cat: {file}: No such file or directory\n")),
                }
            }
            _ => (127, String::new(), format!("{path}: command not found\n")),
        }
    }
}

#[async_trait]
impl AgentTransport for FakeGuest {
    async fn send(
        &self,
        _vm_id: &str,
        command: &AgentCommand,
    ) -> Result<serde_json::Value, CommandError> {
        match command {
            AgentCommand::GuestExec(args) => {
                let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as i64;
                let result = self.run(&args.path, &args.arg);
                self.pending.lock().unwrap().insert(pid, result);
                Ok(json!({"return": {"pid": pid}}))
            }
            AgentCommand::GuestExecStatus(args) => {
                let (code, out, err) = self
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&args.pid)
                    .ok_or_else(|| CommandError::Protocol(format!("unknown pid {}", args.pid)))?;
                Ok(json!({"return": {
                    "exited": true,
                    "exitcode": code,
                    "out-data": BASE64.encode(out),
                    "err-data": BASE64.encode(err),
                }}))
            }
        }
    }
}

/// Agent that answers every envelope with a reply missing its fields.
#[derive(Default)]
struct GarbledAgent {
    calls: AtomicUsize,
}

#[async_trait]
impl AgentTransport for GarbledAgent {
    async fn send(
        &self,
        _vm_id: &str,
        _command: &AgentCommand,
    ) -> Result<serde_json::Value, CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"return": {"process": "?"}}))
    }
}

/// Network channel stand-in: refuses connections for a while, then behaves
/// like the guest.
struct FakeSsh {
    guest: Arc<FakeGuest>,
    refusals: AtomicUsize,
    connected_to: IpAddr,
    passwordless_sudo: bool,
}

#[async_trait]
impl CommandChannel for FakeSsh {
    fn describe(&self) -> String {
        format!("fake-ssh:{}", self.connected_to)
    }

    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let remaining = self.refusals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refusals.store(remaining - 1, Ordering::SeqCst);
            return Err(CommandError::Transport("connection refused".into()));
        }
        if request.privileged && !self.passwordless_sudo {
            return Err(CommandError::Denied("ubuntu has no passwordless sudo".into()));
        }
        let (exit_status, stdout, stderr) = self.guest.run(&request.path, &request.args);
        Ok(CommandOutput { exit_status, stdout: stdout.into_bytes(), stderr: stderr.into_bytes() })
    }
}

struct FixedVerifier(Result<String, i32>);

#[async_trait]
impl ClusterVerifier for FixedVerifier {
    async fn verify(&self, kubeconfig: &Path) -> Result<String, VerifyError> {
        assert!(kubeconfig.exists(), "verify runs after the kubeconfig is written");
        self.0.clone().map_err(|status| VerifyError::Failed {
            program: "kubectl".into(),
            status,
            stderr: "Unable to connect to the server".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn descriptor() -> VmDescriptor {
    VmDescriptor {
        id: None,
        name: "k3s-test".into(),
        memory_mb: 2048,
        cpus: 2,
        disks: vec![BlockDevice {
            role: DiskRole::Boot,
            size_gb: 20,
            image: Some("k3s-base".into()),
        }],
        network: NetworkAttachment { name: "vmbr0".into(), mac: None },
        provisioning: ProvisioningPayload::default(),
    }
}

fn config(channel: ChannelKind, output: &Path) -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::new(channel, output);
    let fast = PollPolicy::fixed(Duration::from_secs(1), 10);
    cfg.timeouts.running = fast;
    cfg.timeouts.address = fast;
    cfg.timeouts.reachable = fast;
    cfg.timeouts.credential = fast;
    cfg.timeouts.exec_status = PollPolicy::fixed(Duration::from_millis(100), 5);
    cfg
}

fn fake_ssh(
    guest: Arc<FakeGuest>,
    refusals: usize,
    targets: Arc<Mutex<Vec<IpAddr>>>,
) -> NetworkConnector {
    Arc::new(move |address| {
        targets.lock().unwrap().push(address);
        Arc::new(FakeSsh {
            guest: guest.clone(),
            refusals: AtomicUsize::new(refusals),
            connected_to: address,
            passwordless_sudo: true,
        }) as Arc<dyn CommandChannel>
    })
}

fn mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn network_path_rewrites_loopback_to_vm_address() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![
        status(VmState::Creating, &[]),
        status(VmState::Running, &[]),
        status(VmState::Running, &["127.0.0.1", "fe80::1"]),
        status(VmState::Running, &["127.0.0.1", "10.0.0.5"]),
    ]);
    let guest = FakeGuest::new(2);
    let targets = Arc::new(Mutex::new(Vec::new()));

    let cfg = config(ChannelKind::Network, &output);
    let orchestrator = Orchestrator::new(backend.clone(), guest.clone(), cfg)
        .with_network_connector(fake_ssh(guest.clone(), 3, targets.clone()));
    let report = orchestrator.bootstrap(&descriptor()).await.expect("bootstrap should succeed");

    assert_eq!(report.vm_id, "vm-101");
    assert_eq!(report.address, "10.0.0.5".parse::<IpAddr>().unwrap());
    assert_eq!(*targets.lock().unwrap(), vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    let stages: Vec<Stage> = report.stages.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Created,
            Stage::Running,
            Stage::Addressed,
            Stage::Reachable,
            Stage::CredentialAvailable,
            Stage::Retrieved,
            Stage::Rewritten,
        ]
    );

    let written = std::fs::read_to_string(&output).unwrap();
    assert!(written.contains("server: https://10.0.0.5:6443"));
    assert!(!written.contains("127.0.0.1"));
    assert_eq!(written, K3S_YAML.replace("127.0.0.1", "10.0.0.5"));
    assert_eq!(mode(&output), 0o600);

    assert_eq!(backend.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn error_state_aborts_running_wait_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let mut failed = status(VmState::Error, &[]);
    failed.message = Some("disk clone failed".into());
    let backend = FakeBackend::new(vec![
        status(VmState::Creating, &[]),
        failed,
        status(VmState::Running, &["10.0.0.5"]),
    ]);
    let guest = FakeGuest::new(0);

    let cfg = config(ChannelKind::Guest, &output);
    let orchestrator = Orchestrator::new(backend.clone(), guest.clone(), cfg);
    let err = orchestrator.bootstrap(&descriptor()).await.expect_err("error state is fatal");

    match &err {
        BootstrapError::VmFailed { stage, detail } => {
            assert_eq!(*stage, Stage::Running);
            assert_eq!(detail, "disk clone failed");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("`running`"));
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 2, "no polls after the error state");
    assert!(guest.execs.lock().unwrap().is_empty());
    assert!(!output.exists(), "nothing written on failure");
}

#[tokio::test(start_paused = true)]
async fn guest_channel_retrieves_before_any_address_exists() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![
        status(VmState::Running, &[]),
        status(VmState::Running, &[]),
        status(VmState::Running, &["10.0.0.5"]),
    ]);
    let guest = FakeGuest::new(3);
    guest.watch_addresses(backend.address_served.clone());

    let cfg = config(ChannelKind::Guest, &output);
    let orchestrator = Orchestrator::new(backend.clone(), guest.clone(), cfg);
    let report = orchestrator.bootstrap(&descriptor()).await.expect("bootstrap should succeed");

    assert_eq!(*guest.address_seen_at_read.lock().unwrap(), Some(false));
    let stages: Vec<Stage> = report.stages.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Created,
            Stage::Running,
            Stage::CredentialAvailable,
            Stage::Retrieved,
            Stage::Addressed,
            Stage::Rewritten,
        ]
    );
    assert!(!report.reached(Stage::Reachable));
    assert!(std::fs::read_to_string(&output).unwrap().contains("https://10.0.0.5:6443"));

    let execs = guest.execs.lock().unwrap();
    assert_eq!(execs.iter().filter(|e| e.starts_with("test -s")).count(), 4);
    assert_eq!(execs.last().unwrap(), &format!("cat {K3S_PATH}"));
}

#[tokio::test(start_paused = true)]
async fn advertise_address_skips_address_wait() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &[])]);
    let guest = FakeGuest::new(0);
    let mut cfg = config(ChannelKind::Guest, &output);
    cfg.advertise_address = Some("203.0.113.9".parse().unwrap());

    let report = Orchestrator::new(backend.clone(), guest, cfg)
        .bootstrap(&descriptor())
        .await
        .expect("bootstrap should succeed");

    assert_eq!(
        backend.status_calls.load(Ordering::SeqCst),
        1,
        "only the running wait queries status"
    );
    assert!(std::fs::read_to_string(&output).unwrap().contains("https://203.0.113.9:6443"));
    assert!(report.reached(Stage::Addressed));
}

#[tokio::test(start_paused = true)]
async fn credential_wait_times_out_with_attempt_count() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.5"])]);
    let guest = FakeGuest::new(usize::MAX);

    let err = Orchestrator::new(backend, guest.clone(), config(ChannelKind::Guest, &output))
        .bootstrap(&descriptor())
        .await
        .expect_err("kubeconfig never appears");

    match err {
        BootstrapError::Timeout { stage, attempts, elapsed } => {
            assert_eq!(stage, Stage::CredentialAvailable);
            assert_eq!(attempts, 10);
            assert!(elapsed >= Duration::from_secs(9));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(guest.execs.lock().unwrap().len(), 10);
    assert!(!output.exists());
}

#[tokio::test(start_paused = true)]
async fn resume_skips_create_and_start_for_running_vm() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.7"])]);
    let guest = FakeGuest::new(0);

    let report = Orchestrator::new(backend.clone(), guest, config(ChannelKind::Guest, &output))
        .bootstrap_existing("vm-55")
        .await
        .expect("resume should succeed");

    assert_eq!(report.vm_id, "vm-55");
    assert_eq!(backend.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.stages[0].stage, Stage::Created);
}

#[tokio::test(start_paused = true)]
async fn resume_of_unknown_vm_fails_at_created() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(vec![VmStatus::absent()]);

    let cfg = config(ChannelKind::Guest, &dir.path().join("k.yaml"));
    let err = Orchestrator::new(backend, FakeGuest::new(0), cfg)
        .bootstrap_existing("vm-404")
        .await
        .expect_err("unknown VM");

    assert!(matches!(err, BootstrapError::UnknownVm { stage: Stage::Created, .. }));
}

#[tokio::test(start_paused = true)]
async fn failed_verification_is_reported_and_keeps_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.5"])]);
    let report = Orchestrator::new(backend, FakeGuest::new(0), config(ChannelKind::Guest, &output))
        .with_verifier(Arc::new(FixedVerifier(Err(1))))
        .bootstrap(&descriptor())
        .await
        .expect("verification failure does not fail the run");

    let outcome = report.verification.as_ref().expect("verification ran");
    assert!(!outcome.passed());
    assert!(outcome.detail().contains("Unable to connect"));
    assert!(!report.reached(Stage::Verified));
    assert!(output.exists());
}

#[tokio::test(start_paused = true)]
async fn successful_verification_reaches_verified() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.5"])]);
    let report = Orchestrator::new(backend, FakeGuest::new(0), config(ChannelKind::Guest, &output))
        .with_verifier(Arc::new(FixedVerifier(Ok("1 node(s): node/k3s-test".into()))))
        .bootstrap(&descriptor())
        .await
        .expect("bootstrap should succeed");

    assert!(report.verification.as_ref().is_some_and(|v| v.passed()));
    assert_eq!(report.stages.last().map(|t| t.stage), Some(Stage::Verified));
}

#[tokio::test]
async fn descriptor_with_id_is_rejected_before_create() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new(vec![status(VmState::Running, &[])]);
    let mut d = descriptor();
    d.id = Some("vm-101".into());

    let cfg = config(ChannelKind::Guest, &dir.path().join("k"));
    let err = Orchestrator::new(backend.clone(), FakeGuest::new(0), cfg)
        .bootstrap(&d)
        .await
        .expect_err("already created");

    assert!(matches!(err, BootstrapError::Config(_)));
    assert_eq!(backend.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_status_errors_count_as_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![
        status(VmState::Creating, &[]),
        status(VmState::Running, &["10.0.0.5"]),
    ]);
    backend.fail_next([
        BackendError::Transport("connection reset by peer".into()),
        BackendError::Rejected { status: 503, body: "inventory busy".into() },
    ]);

    let cfg = config(ChannelKind::Guest, &output);
    let report = Orchestrator::new(backend.clone(), FakeGuest::new(0), cfg)
        .bootstrap(&descriptor())
        .await
        .expect("transient failures are retried");

    assert!(report.reached(Stage::Running));
    // Two failures, `creating`, `running`, then one query for the address.
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 5);
    assert!(std::fs::read_to_string(&output).unwrap().contains("https://10.0.0.5:6443"));
}

#[tokio::test(start_paused = true)]
async fn permanent_status_errors_abort_running_wait() {
    let failures = [
        BackendError::Protocol("expected value at line 1 column 1".into()),
        BackendError::Rejected { status: 500, body: "internal error".into() },
    ];
    for failure in failures {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("k3s-test.yaml");
        let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.5"])]);
        backend.fail_next([failure]);
        let guest = FakeGuest::new(0);

        let cfg = config(ChannelKind::Guest, &output);
        let err = Orchestrator::new(backend.clone(), guest.clone(), cfg)
            .bootstrap(&descriptor())
            .await
            .expect_err("undecodable or rejected status is fatal");

        match &err {
            BootstrapError::Backend { stage, source } => {
                assert_eq!(*stage, Stage::Running);
                assert!(!source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.stage(), Some(Stage::Running));
        assert_eq!(backend.status_calls.load(Ordering::SeqCst), 1, "no retry after {err}");
        assert!(guest.execs.lock().unwrap().is_empty());
        assert!(!output.exists());
    }
}

#[tokio::test(start_paused = true)]
async fn malformed_agent_reply_aborts_credential_wait() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.5"])]);
    let agent = Arc::new(GarbledAgent::default());

    let err = Orchestrator::new(backend, agent.clone(), config(ChannelKind::Guest, &output))
        .bootstrap(&descriptor())
        .await
        .expect_err("garbled agent replies are fatal");

    match err {
        BootstrapError::Command { stage, source } => {
            assert_eq!(stage, Stage::CredentialAvailable);
            assert!(matches!(source, CommandError::Protocol(_)), "got: {source}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    assert!(!output.exists());
}

#[tokio::test(start_paused = true)]
async fn login_without_sudo_is_reachable_but_fails_credential_wait() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("k3s-test.yaml");

    let backend = FakeBackend::new(vec![status(VmState::Running, &["10.0.0.5"])]);
    let guest = FakeGuest::new(0);
    let ssh_guest = guest.clone();
    let connect: NetworkConnector = Arc::new(move |address| {
        Arc::new(FakeSsh {
            guest: ssh_guest.clone(),
            refusals: AtomicUsize::new(1),
            connected_to: address,
            passwordless_sudo: false,
        }) as Arc<dyn CommandChannel>
    });

    let err = Orchestrator::new(backend, guest.clone(), config(ChannelKind::Network, &output))
        .with_network_connector(connect)
        .bootstrap(&descriptor())
        .await
        .expect_err("kubeconfig is root-only");

    match err {
        BootstrapError::Command { stage, source } => {
            assert_eq!(stage, Stage::CredentialAvailable);
            assert!(matches!(source, CommandError::Denied(_)), "got: {source}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(*guest.execs.lock().unwrap(), vec!["echo ready".to_string()]);
    assert!(!output.exists());
}
