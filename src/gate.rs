//! Validate-then-commit for configuration that can lock the operator out.
//!
//! A guarded change is applied in four steps: stage the new files (every
//! overwrite is backed up by the mutator), ask the service to check its own
//! configuration, then either commit (reload) or undo every staged change.
//! The service never loads a configuration its checker rejected.
//!
//! A failed commit after a passing check is not undone: the files on disk are
//! valid, the running service simply did not pick them up. The gate's state
//! key is set to [`PENDING_RELOAD`] and the reload is retried on the next run.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::ProvisionError;
use crate::mutator::{Change, FileMutator};
use crate::state::StateStore;
use crate::system::{RemoteAccessDaemon, Verdict, WebServer};

pub const COMMITTED: &str = "committed";
pub const PENDING_RELOAD: &str = "pending-reload";

/// Gate keys whose reload is still owed.
pub fn pending_reloads(state: &StateStore<'_>) -> Result<Vec<String>> {
    Ok(state
        .entries()?
        .into_iter()
        .filter(|(_, v)| v == PENDING_RELOAD)
        .map(|(k, _)| k)
        .collect())
}

/// A service that can check and then load its own configuration.
pub trait GuardedService {
    fn name(&self) -> &str;
    fn validate(&self) -> Result<Verdict>;
    fn commit(&self) -> Result<()>;
}

/// sshd, checked against its main configuration file.
pub struct SshdService<'a> {
    pub daemon: &'a dyn RemoteAccessDaemon,
    pub main_config: PathBuf,
}

impl GuardedService for SshdService<'_> {
    fn name(&self) -> &str {
        "sshd"
    }

    fn validate(&self) -> Result<Verdict> {
        self.daemon.validate_config(&self.main_config)
    }

    fn commit(&self) -> Result<()> {
        self.daemon.reload()
    }
}

pub struct NginxService<'a> {
    pub server: &'a dyn WebServer,
}

impl GuardedService for NginxService<'_> {
    fn name(&self) -> &str {
        "nginx"
    }

    fn validate(&self) -> Result<Verdict> {
        self.server.validate_config()
    }

    fn commit(&self) -> Result<()> {
        self.server.reload()
    }
}

/// How to undo one staged change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revert {
    /// The file (or symlink) was created by the stage.
    Delete(PathBuf),
    /// The file was replaced; the backup holds the old content.
    Restore { backup: PathBuf, path: PathBuf },
    /// A symlink was removed by the stage.
    Relink { target: PathBuf, link: PathBuf },
}

impl From<Change> for Revert {
    fn from(change: Change) -> Self {
        match change {
            Change::Created(path) => Revert::Delete(path),
            Change::Replaced { path, backup } => Revert::Restore { backup, path },
        }
    }
}

impl Revert {
    fn apply(&self, files: &FileMutator<'_>) -> Result<()> {
        match self {
            Revert::Delete(path) => files.remove_file(path).map(drop),
            Revert::Restore { backup, path } => files.restore(backup, path),
            Revert::Relink { target, link } => files
                .fs()
                .symlink(target, link)
                .with_context(|| format!("Failed to recreate symlink {:?}", link)),
        }
    }
}

/// Staged changes, in the order they were made.
#[derive(Debug, Default)]
pub struct Staged {
    reverts: Vec<Revert>,
}

impl Staged {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutator change, if there was one.
    pub fn track(&mut self, change: Option<Change>) {
        if let Some(change) = change {
            self.reverts.push(change.into());
        }
    }

    pub fn push(&mut self, revert: Revert) {
        self.reverts.push(revert);
    }

    pub fn is_empty(&self) -> bool {
        self.reverts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reverts.len()
    }

    /// Undo in reverse order. Keeps going past failures and reports the first.
    fn rollback(self, files: &FileMutator<'_>) -> Result<()> {
        let mut first_error = None;
        for revert in self.reverts.iter().rev() {
            if let Err(e) = revert.apply(files) {
                error!("Revert step {:?} failed: {:#}", revert, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Nothing to stage and nothing pending.
    Unchanged,
    Committed,
    /// Validated and left on disk, but the reload failed.
    CommitFailed(String),
}

pub struct Gate<'a> {
    files: &'a FileMutator<'a>,
    state: &'a StateStore<'a>,
}

impl<'a> Gate<'a> {
    pub fn new(files: &'a FileMutator<'a>, state: &'a StateStore<'a>) -> Self {
        Self { files, state }
    }

    /// Stage with `stage`, validate, then commit or revert.
    ///
    /// `state_key` records the gate's last result. Rejection by the
    /// validator is fatal and leaves the files as they were before `stage`.
    pub fn apply<F>(
        &self,
        service: &dyn GuardedService,
        state_key: &str,
        stage: F,
    ) -> Result<GateOutcome>
    where
        F: FnOnce(&FileMutator<'_>, &mut Staged) -> Result<()>,
    {
        let mut staged = Staged::new();
        if let Err(e) = stage(self.files, &mut staged) {
            // A half-written stage must not survive either.
            if let Err(revert_err) = staged.rollback(self.files) {
                error!("Could not undo partial stage: {:#}", revert_err);
            }
            return Err(e.context(format!("Staging {} configuration", service.name())));
        }

        if staged.is_empty() {
            if self.state.get(state_key)?.as_deref() == Some(PENDING_RELOAD) {
                info!("Retrying pending {} reload", service.name());
                return self.commit(service, state_key);
            }
            info!("{} configuration unchanged", service.name());
            return Ok(GateOutcome::Unchanged);
        }

        info!(
            "Validating staged {} configuration ({} change(s))",
            service.name(),
            staged.len()
        );
        let verdict = match service.validate() {
            Ok(v) => v,
            Err(e) => {
                self.rollback_or_report(service, staged)?;
                return Err(e.context(format!(
                    "Could not run the {} configuration check (change reverted)",
                    service.name()
                )));
            }
        };

        match verdict {
            Verdict::Pass => self.commit(service, state_key),
            Verdict::Fail(detail) => {
                warn!("{} rejected the staged configuration, reverting", service.name());
                self.rollback_or_report(service, staged)?;
                Err(ProvisionError::StagedConfigRejected {
                    service: service.name().to_string(),
                    detail,
                }
                .into())
            }
        }
    }

    fn rollback_or_report(&self, service: &dyn GuardedService, staged: Staged) -> Result<()> {
        staged.rollback(self.files).with_context(|| {
            format!(
                "Reverting {} configuration failed; inspect the .backup.* files before reloading",
                service.name()
            )
        })
    }

    fn commit(&self, service: &dyn GuardedService, state_key: &str) -> Result<GateOutcome> {
        match service.commit() {
            Ok(()) => {
                self.state.put(state_key, COMMITTED)?;
                info!("{} reloaded with the new configuration", service.name());
                Ok(GateOutcome::Committed)
            }
            Err(e) => {
                error!(
                    "{} configuration is valid but reloading failed: {:#}. \
                     It will be retried on the next run.",
                    service.name(),
                    e
                );
                self.state.put(state_key, PENDING_RELOAD)?;
                Ok(GateOutcome::CommitFailed(format!("{:#}", e)))
            }
        }
    }
}

/// Stage a whole file.
pub fn stage_file(
    files: &FileMutator<'_>,
    staged: &mut Staged,
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<()> {
    staged.track(files.stage_file(path, content, mode)?);
    Ok(())
}
