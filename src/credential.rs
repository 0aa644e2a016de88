//! Kubeconfig endpoint rewriting and restricted, atomic output.
//!
//! The control plane writes its admin kubeconfig with a loopback server URL
//! (`https://127.0.0.1:6443`). Before the file is useful anywhere else the
//! host part of that URL has to become the VM's reachable address.
//!
//! Rewriting is a targeted substitution on the raw text: only a placeholder
//! host sitting between `scheme://` and `:port` changes. The document is
//! never parsed and re-serialized, so comments, key order, quoting and
//! embedded certificate blobs come out byte-for-byte identical.

use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Hosts a freshly bootstrapped control plane advertises to itself.
pub const PLACEHOLDER_HOSTS: &[&str] = &["127.0.0.1", "localhost", "[::1]"];

static PLACEHOLDER_URL: LazyLock<Regex> = LazyLock::new(|| {
    let hosts = PLACEHOLDER_HOSTS
        .iter()
        .map(|h| regex::escape(h))
        .collect::<Vec<_>>()
        .join("|");
    // Host must be followed directly by `:port`, so 127.0.0.10 or
    // localhost.example do not match. Any text may precede the scheme.
    Regex::new(&format!(
        r"(?P<scheme>[A-Za-z][A-Za-z0-9+.-]*://)(?:{hosts}):(?P<port>[0-9]+)"
    ))
    .expect("placeholder URL pattern is valid")
});

/// Format `address` for use as a URL host, bracketing IPv6.
pub fn url_host(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

/// Replace every placeholder host in `scheme://host:port` position with
/// `target`.
///
/// Everything else, including placeholder tokens outside URL host position,
/// is left alone. Applying the rewrite twice with the same target yields the
/// same text as applying it once.
pub fn rewrite_endpoints(document: &str, target: &str) -> String {
    let host = url_host(target);
    PLACEHOLDER_URL
        .replace_all(document, |caps: &regex::Captures<'_>| {
            format!("{}{}:{}", &caps["scheme"], host, &caps["port"])
        })
        .into_owned()
}

/// [`rewrite_endpoints`] for an IP address.
pub fn rewrite_for_address(document: &str, address: IpAddr) -> String {
    rewrite_endpoints(document, &address.to_string())
}

/// Whether any placeholder endpoint is still present.
pub fn has_placeholder_endpoint(document: &str) -> bool {
    PLACEHOLDER_URL.is_match(document)
}

/// Write `contents` to `path` so readers see either the old file or the
/// complete new one, never a partial write.
///
/// The data goes to a temporary file in the same directory, created with
/// owner-only permissions, which is then renamed over `path`.
pub fn write_private_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".kubeconfig-")
        .suffix(".tmp")
        .tempfile_in(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
