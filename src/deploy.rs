//! Site deployment: mirror a local build directory to the web root over SSH.
//!
//! Runs on the operator's machine, not on the provisioned host.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::cmd_abstraction::{CommandExecutor, CommandOutput, NETWORK_TIMEOUT};
use crate::error::ProvisionError;
use crate::validation::{validate_domain, validate_ip, validate_ssh_port, validate_username};

/// Never shipped to the server.
pub const EXCLUDES: &[&str] = &[
    ".git",
    ".gitignore",
    ".env",
    ".env.*",
    "node_modules",
    ".DS_Store",
    "*.log",
    "*.swp",
    ".vscode",
    ".idea",
];

/// rsync exit codes that mean the connection, not the transfer, failed.
const NETWORK_EXIT_CODES: &[i32] = &[10, 12, 30, 35, 255];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub host: String,
    pub user: String,
    pub remote_path: String,
    pub source: PathBuf,
    pub port: u16,
    /// Show what would change without transferring.
    pub dry_run: bool,
}

impl DeployTarget {
    pub fn validate(&self) -> Result<()> {
        if validate_ip(&self.host).is_err() {
            validate_domain(&self.host)
                .with_context(|| format!("Invalid remote host '{}'", self.host))?;
        }
        validate_username(&self.user)?;
        validate_ssh_port(self.port)?;

        let remote = std::path::Path::new(&self.remote_path);
        if !remote.is_absolute() || self.remote_path.split('/').any(|c| c == "..") {
            return Err(ProvisionError::Validation(format!(
                "Remote path must be absolute without '..': {}",
                self.remote_path
            ))
            .into());
        }
        if !self.source.is_dir() {
            return Err(ProvisionError::Validation(format!(
                "Source directory not found: {}",
                self.source.display()
            ))
            .into());
        }
        Ok(())
    }

    pub fn rsync_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-avz".into(),
            "--delete".into(),
            "--human-readable".into(),
            "--stats".into(),
            "-e".into(),
            format!("ssh -p {}", self.port),
        ];
        if self.dry_run {
            args.push("--dry-run".into());
        }
        for pattern in EXCLUDES {
            args.push(format!("--exclude={}", pattern));
        }
        // Trailing slash: copy the directory's contents, not the directory.
        let mut source = self.source.display().to_string();
        if !source.ends_with('/') {
            source.push('/');
        }
        args.push(source);
        args.push(format!(
            "{}@{}:{}/",
            self.user,
            self.host,
            self.remote_path.trim_end_matches('/')
        ));
        args
    }
}

/// Run the transfer. Any non-zero rsync exit is an error.
pub fn deploy(exec: &dyn CommandExecutor, target: &DeployTarget) -> Result<CommandOutput> {
    target.validate()?;
    if target.dry_run {
        info!("Previewing deployment (no changes are made)");
    }
    info!(
        "Syncing {} to {}@{}:{}",
        target.source.display(),
        target.user,
        target.host,
        target.remote_path
    );

    let args = target.rsync_args();
    let output = exec.execute("rsync", &args, NETWORK_TIMEOUT)?;
    if output.success {
        return Ok(output);
    }

    let detail = format!("rsync {}", output.diagnostic());
    match output.code {
        Some(code) if NETWORK_EXIT_CODES.contains(&code) => {
            warn!("Could not reach {}:{}", target.host, target.port);
            Err(ProvisionError::Network(detail).into())
        }
        _ => Err(ProvisionError::Command(detail).into()),
    }
}
