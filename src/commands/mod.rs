//! CLI command implementations.
//!
//! Each command is a thin composition of library calls. Commands that change
//! the host go through a [`Session`], which holds the run lock for as long as
//! it lives.

pub mod certificate;
pub mod deploy;
pub mod init;
pub mod module;
pub mod preflight;
pub mod provision;
pub mod status;

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::context::ConfigContext;
use crate::error::RetriableFailure;
use crate::fs_abstraction::real_fs;
use crate::lock::{LockGuard, DEFAULT_LOCK_FILE};
use crate::modules::Host;
use crate::mutator::FileMutator;
use crate::net::DnsStatus;
use crate::preflight::require_root;
use crate::state::StateStore;
use crate::system::{Collaborators, HostPaths, StdinConfirm};

/// Global options shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub context: PathBuf,
    pub state: PathBuf,
    pub assume_yes: bool,
}

/// A locked, root-privileged session against the real host.
pub struct Session {
    pub ctx: ConfigContext,
    pub paths: HostPaths,
    pub sys: Collaborators,
    state_path: PathBuf,
    _lock: LockGuard,
}

impl Session {
    pub fn open(opts: &GlobalOpts) -> Result<Self> {
        require_root()?;
        let ctx = ConfigContext::load(&opts.context)?;
        let lock = LockGuard::acquire(DEFAULT_LOCK_FILE)?;
        let exec = Arc::new(RealCommandExecutor::new());
        let confirm = Arc::new(StdinConfirm {
            assume_yes: opts.assume_yes,
        });
        Ok(Self {
            ctx,
            paths: HostPaths::system(),
            sys: Collaborators::system(exec, confirm),
            state_path: opts.state.clone(),
            _lock: lock,
        })
    }

    pub fn host(&self, dns: DnsStatus) -> Host<'_> {
        Host {
            ctx: &self.ctx,
            paths: &self.paths,
            files: FileMutator::new(real_fs()),
            state: StateStore::new(real_fs(), self.state_path.clone()),
            sys: &self.sys,
            dns,
        }
    }
}

/// Run blocking host work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Provisioning task panicked")?
}

/// Report reloads still owed; they make the run retriable.
pub fn settle_reloads(pending: &[String]) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    println!();
    println!("Pending reloads: {}", pending.join(", "));
    Err(RetriableFailure {
        label: "Configuration written but not loaded".into(),
        source: anyhow!("reload still pending for {}", pending.join(", ")),
    }
    .into())
}
