//! Application directory structure for kubevm-bootstrap.
//!
//! - Config:       `~/.config/kubevm-bootstrap/config.toml`  (human-editable, XDG-style)
//! - Data:         `~/Library/Application Support/dev.kubevm.bootstrap/` on macOS,
//!   `$XDG_DATA_HOME/kubevm-bootstrap/` elsewhere
//! - Kubeconfigs:  `<data>/kubeconfigs/<vm name>.yaml`
//! - Logs:         `~/Library/Logs/kubevm-bootstrap/` or `<data>/logs/`

use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "dev.kubevm.bootstrap";
const APP_NAME: &str = "kubevm-bootstrap";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config directory.
    pub config: PathBuf,
    /// Machine-managed application data root.
    pub data: PathBuf,
    /// Rewritten kubeconfigs, one per VM.
    pub kubeconfigs: PathBuf,
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let data = resolve_data_dir(&home);
        Some(Self {
            config: resolve_config_dir(&home),
            kubeconfigs: data.join("kubeconfigs"),
            logs: resolve_log_dir(&home, &data),
            data,
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.kubeconfigs, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        Ok(())
    }

    /// `config.toml` inside the config directory.
    pub fn default_config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Where the kubeconfig for `vm_name` goes when none is configured.
    pub fn default_output(&self, vm_name: &str) -> PathBuf {
        let stem: String = vm_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stem = if stem.is_empty() { "kubeconfig".to_string() } else { stem };
        self.kubeconfigs.join(format!("{stem}.yaml"))
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path, _data: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(_home: &Path, data: &Path) -> PathBuf {
    data.join("logs")
}
