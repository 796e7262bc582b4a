//! Precondition checks, run before anything touches the host.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::ProvisionError;

/// Minimum free space on `/` (1 GiB).
const MIN_FREE_DISK_SPACE: u64 = 1024 * 1024 * 1024;

const CONNECT_TIMEOUT_SECS: u64 = 5;

pub const OS_RELEASE: &str = "/etc/os-release";

/// Endpoints a full run needs: the package mirror and the ACME directory.
const ENDPOINTS: &[(&str, u16)] = &[("deb.debian.org", 443), ("acme-v02.api.letsencrypt.org", 443)];

#[derive(Debug, Serialize)]
pub struct PreflightReport {
    pub ready: bool,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    fn pass(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.to_string(),
        }
    }

    fn fail(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.to_string(),
        }
    }
}

impl PreflightReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        Self {
            ready: checks.iter().all(|c| c.passed),
            checks,
        }
    }

    /// Turn failed checks into one precondition error.
    pub fn require(&self) -> Result<()> {
        let failed: Vec<String> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        Err(ProvisionError::Precondition(failed.join("; ")).into())
    }
}

/// Every check, in a fixed order.
pub async fn run_checks() -> PreflightReport {
    let mut checks = vec![
        check_root(),
        check_os(Path::new(OS_RELEASE)),
        check_disk_space(Path::new("/")),
    ];
    for (host, port) in ENDPOINTS {
        checks.push(check_reachable(host, *port).await);
    }
    PreflightReport::new(checks)
}

fn is_root() -> bool {
    // SAFETY: geteuid() reads the effective user ID; no preconditions, never fails.
    unsafe { libc::geteuid() == 0 }
}

pub fn check_root() -> CheckResult {
    if is_root() {
        CheckResult::pass("root", "Running as root")
    } else {
        CheckResult::fail("root", "Must run as root (use sudo)")
    }
}

/// For commands that mutate the host.
pub fn require_root() -> Result<()> {
    if !is_root() {
        return Err(ProvisionError::Precondition(
            "This operation requires root privileges. Please run with sudo.".into(),
        )
        .into());
    }
    Ok(())
}

/// `KEY=value` pairs of an os-release file, quotes removed.
pub fn parse_os_release(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

/// Debian, Ubuntu and their derivatives are supported.
pub fn judge_os(text: &str) -> CheckResult {
    let fields = parse_os_release(text);
    let id = fields.get("ID").map(String::as_str).unwrap_or("");
    let like = fields.get("ID_LIKE").map(String::as_str).unwrap_or("");
    let name = fields
        .get("PRETTY_NAME")
        .cloned()
        .unwrap_or_else(|| id.to_string());

    let supported = matches!(id, "debian" | "ubuntu")
        || like.split_whitespace().any(|l| l == "debian" || l == "ubuntu");
    if supported {
        CheckResult::pass("os", &name)
    } else {
        CheckResult::fail(
            "os",
            &format!("Unsupported system '{}' (Debian or Ubuntu required)", name),
        )
    }
}

pub fn check_os(path: &Path) -> CheckResult {
    match std::fs::read_to_string(path) {
        Ok(text) => judge_os(&text),
        Err(e) => CheckResult::fail("os", &format!("Cannot read {}: {}", path.display(), e)),
    }
}

pub fn check_disk_space(path: &Path) -> CheckResult {
    let Ok(c_path) = CString::new(path.as_os_str().to_string_lossy().as_bytes()) else {
        return CheckResult::fail("disk", "Invalid path");
    };

    let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result != 0 {
        return CheckResult::fail("disk", "Cannot check disk space");
    }
    // SAFETY: statvfs returned 0, so it filled the struct.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let free_space = stat.f_bavail as u64 * stat.f_frsize as u64;
    let free_mb = free_space / (1024 * 1024);
    if free_space < MIN_FREE_DISK_SPACE {
        CheckResult::fail(
            "disk",
            &format!(
                "Insufficient disk space: {} MB available (min {} MB)",
                free_mb,
                MIN_FREE_DISK_SPACE / (1024 * 1024)
            ),
        )
    } else {
        CheckResult::pass("disk", &format!("{} MB available", free_mb))
    }
}

pub async fn check_reachable(host: &str, port: u16) -> CheckResult {
    let name = format!("network {}", host);
    let connect = TcpStream::connect((host, port));
    match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect).await {
        Ok(Ok(_)) => CheckResult::pass(&name, &format!("{}:{} reachable", host, port)),
        Ok(Err(e)) => CheckResult::fail(&name, &format!("{}:{} unreachable: {}", host, port, e)),
        Err(_) => CheckResult::fail(
            &name,
            &format!("{}:{} timed out after {}s", host, port, CONNECT_TIMEOUT_SECS),
        ),
    }
}
