//! kubevm-bootstrap: create a k3s VM and fetch its kubeconfig.
//!
//! ```text
//! kubevm-bootstrap up                       # create, wait, retrieve, rewrite
//! kubevm-bootstrap up --vm-id 104           # resume an existing VM
//! kubevm-bootstrap status 104
//! kubevm-bootstrap down 104
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use kubevm_bootstrap::config::{AgentKind, BootstrapConfig};
use kubevm_bootstrap::paths::AppPaths;
use kubevm_bootstrap::verify::KubectlVerifier;
use kubevm_bootstrap::vm::{
    AgentTransport, ChannelKind, InventoryClient, QgaSocketTransport, VmBackend,
};
use kubevm_bootstrap::{BootstrapReport, Orchestrator, Stage, logging};

/// Provision a Kubernetes VM and retrieve its admin kubeconfig
#[derive(Parser, Debug)]
#[command(name = "kubevm-bootstrap", version)]
struct Args {
    /// Config file (default: ~/.config/kubevm-bootstrap/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Inventory backend password
    #[arg(long, env = "KUBEVM_BACKEND_PASSWORD", hide_env_values = true, global = true)]
    backend_password: Option<String>,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create (or resume) a VM and write its kubeconfig
    Up {
        /// Resume this existing VM instead of creating a new one
        #[arg(long)]
        vm_id: Option<String>,

        /// Channel used to reach into the guest
        #[arg(long)]
        channel: Option<ChannelKind>,

        /// Where to write the kubeconfig
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run `kubectl get nodes` against the new kubeconfig
        #[arg(long)]
        verify: bool,

        /// ssh password for the network channel
        #[arg(long, env = "KUBEVM_SSH_PASSWORD", hide_env_values = true)]
        ssh_password: Option<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a VM
    Down { vm_id: String },

    /// Show a VM's state and addresses
    Status {
        vm_id: String,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let paths = AppPaths::resolve();
    let _log_guard = logging::init(paths.as_ref().map(|p| p.logs.as_path()), args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(run(args, paths))
}

async fn run(args: Args, paths: Option<AppPaths>) -> Result<()> {
    let mut config = load_config(args.config.as_deref(), paths.as_ref())?;
    if args.backend_password.is_some() {
        config.backend.password = args.backend_password.clone();
    }

    match args.command {
        Cmd::Up { vm_id, channel, output, verify, ssh_password, json } => {
            if let Some(kind) = channel {
                config.channel.kind = kind;
            }
            if ssh_password.is_some() {
                config.ssh.password = ssh_password;
            }
            config.verify.enabled |= verify;
            config.validate()?;

            let output = match output.or_else(|| config.credential.output_path.clone()) {
                Some(path) => path,
                None => {
                    let paths = paths.as_ref().context("HOME is not set; pass --output")?;
                    paths.ensure().context("creating application directories")?;
                    paths.default_output(&config.vm.name)
                }
            };

            let orchestrator = build_orchestrator(&config, output)?;
            let outcome = match vm_id {
                Some(id) => orchestrator.bootstrap_existing(&id).await,
                None => {
                    let descriptor = config.descriptor()?;
                    orchestrator.bootstrap(&descriptor).await
                }
            };
            let report = match outcome {
                Ok(report) => report,
                Err(err) => {
                    if let Some(stage) = err.stage().filter(|s| *s != Stage::Created) {
                        warn!(%stage, "bootstrap stopped; VM left in place, resume with --vm-id");
                    }
                    return Err(err).context("bootstrap failed");
                }
            };

            print_report(&report, json)?;
            if report.verification.as_ref().is_some_and(|v| !v.passed()) {
                warn!("kubeconfig written but verification failed");
            }
        }
        Cmd::Down { vm_id } => {
            let client = InventoryClient::new(&config.backend).context("inventory client")?;
            client.delete(&vm_id).await.with_context(|| format!("deleting VM {vm_id}"))?;
            println!("deleted {vm_id}");
        }
        Cmd::Status { vm_id, json } => {
            let client = InventoryClient::new(&config.backend).context("inventory client")?;
            let status = client
                .status(&vm_id)
                .await
                .with_context(|| format!("querying VM {vm_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{vm_id}: {}", status.state);
                for address in &status.addresses {
                    println!("  {address}");
                }
                if let Some(message) = &status.message {
                    println!("  ({message})");
                }
            }
        }
    }
    Ok(())
}

fn load_config(
    explicit: Option<&std::path::Path>,
    paths: Option<&AppPaths>,
) -> Result<BootstrapConfig> {
    if let Some(path) = explicit {
        return BootstrapConfig::load(path).context("loading config");
    }
    match paths.map(AppPaths::default_config_file) {
        Some(path) if path.exists() => BootstrapConfig::load(&path).context("loading config"),
        Some(path) => {
            info!(path = %path.display(), "no config file, using defaults");
            Ok(BootstrapConfig::default())
        }
        None => Ok(BootstrapConfig::default()),
    }
}

fn build_orchestrator(config: &BootstrapConfig, output: PathBuf) -> Result<Orchestrator> {
    let client = Arc::new(InventoryClient::new(&config.backend).context("inventory client")?);
    let backend: Arc<dyn VmBackend> = client.clone();
    let agent: Arc<dyn AgentTransport> = match config.agent.kind {
        AgentKind::Backend => client,
        AgentKind::Socket => {
            if !cfg!(unix) {
                bail!("agent.kind = \"socket\" needs a Unix host");
            }
            Arc::new(QgaSocketTransport::new(
                config.agent.socket_path.clone(),
                config.agent_reply_timeout(),
            ))
        }
    };

    let mut orchestrator = Orchestrator::new(backend, agent, config.orchestrator_config(output));
    if config.verify.enabled {
        orchestrator = orchestrator.with_verifier(Arc::new(KubectlVerifier::new(
            config.verify.kubectl.clone(),
            Duration::from_secs(config.verify.request_timeout_secs),
        )));
    }
    Ok(orchestrator)
}

fn print_report(report: &BootstrapReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("VM {} ready at {} ({} channel)", report.vm_id, report.address, report.channel);
    for timing in &report.stages {
        println!("  {:<22} {:>8} ms", timing.stage.to_string(), timing.elapsed_ms);
    }
    println!("  {:<22} {:>8} ms", "total", report.total_ms());
    println!("kubeconfig: {}", report.output_path.display());
    match &report.verification {
        Some(outcome) if outcome.passed() => println!("verified: {}", outcome.detail()),
        Some(outcome) => println!("verification failed: {}", outcome.detail()),
        None => {}
    }
    Ok(())
}
