//! Debian package management through apt/dpkg.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT, NETWORK_TIMEOUT};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait PackageManager: Send + Sync {
    fn is_installed(&self, package: &str) -> Result<bool>;

    /// Install `packages` non-interactively. Already-installed ones are fine.
    fn install(&self, packages: &[String]) -> Result<()>;
}

/// Install whichever of `packages` are missing. Returns what was installed.
pub fn ensure_installed(pm: &dyn PackageManager, packages: &[&str]) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for package in packages {
        if pm.is_installed(package)? {
            debug!("{} already installed", package);
        } else {
            missing.push(package.to_string());
        }
    }
    if !missing.is_empty() {
        info!("Installing {}", missing.join(", "));
        pm.install(&missing)?;
    }
    Ok(missing)
}

pub struct Apt {
    exec: Arc<dyn CommandExecutor>,
    index_refreshed: AtomicBool,
}

impl Apt {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            exec,
            index_refreshed: AtomicBool::new(false),
        }
    }

    fn refresh_index(&self) -> Result<()> {
        if self.index_refreshed.load(Ordering::Relaxed) {
            return Ok(());
        }
        run_checked(self.exec.as_ref(), "apt-get", &["update", "-q"], NETWORK_TIMEOUT)?;
        self.index_refreshed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl PackageManager for Apt {
    fn is_installed(&self, package: &str) -> Result<bool> {
        let output = self.exec.execute(
            "dpkg-query",
            &["-W".to_string(), "-f=${Status}".to_string(), package.to_string()],
            LOCAL_TIMEOUT,
        )?;
        Ok(output.success && output.stdout.contains("install ok installed"))
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        self.refresh_index()?;
        let mut args = vec!["install", "-y", "-q", "--no-install-recommends"];
        args.extend(packages.iter().map(String::as_str));
        run_checked(self.exec.as_ref(), "apt-get", &args, NETWORK_TIMEOUT)?;
        Ok(())
    }
}
