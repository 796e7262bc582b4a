//! Runs provisioning modules in their fixed order.
//!
//! Per module: `not-started -> running -> complete | skipped`. A module only
//! reaches `complete` after its completion record is written; an error leaves
//! it `running` and aborts the run. There is no mid-module checkpoint: a
//! re-run starts the module over and relies on each step being idempotent.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::modules::{Host, ModuleId, Outcome};
use crate::signal::ShutdownToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleState {
    NotStarted,
    Running,
    Complete,
    Skipped,
}

impl ModuleState {
    pub fn transition(self, to: ModuleState) -> Result<ModuleState> {
        let legal = matches!(
            (self, to),
            (ModuleState::NotStarted, ModuleState::Running)
                | (ModuleState::Running, ModuleState::Complete)
                | (ModuleState::Running, ModuleState::Skipped)
        );
        if !legal {
            return Err(ProvisionError::State(format!(
                "module cannot go from {} to {}",
                self, to
            ))
            .into());
        }
        Ok(to)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::NotStarted => "not-started",
            ModuleState::Running => "running",
            ModuleState::Complete => "complete",
            ModuleState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    pub module: ModuleId,
    pub state: ModuleState,
    /// Skip reason.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub modules: Vec<ModuleReport>,
    /// Stopped by a signal before every module ran.
    pub interrupted: bool,
}

impl RunReport {
    pub fn state_of(&self, id: ModuleId) -> ModuleState {
        self.modules
            .iter()
            .find(|r| r.module == id)
            .map(|r| r.state)
            .unwrap_or(ModuleState::NotStarted)
    }
}

pub struct Sequencer<'a, 'h> {
    host: &'a Host<'h>,
    token: ShutdownToken,
}

impl<'a, 'h> Sequencer<'a, 'h> {
    pub fn new(host: &'a Host<'h>, token: ShutdownToken) -> Self {
        Self { host, token }
    }

    /// Every module, in order. Stops at the first error.
    pub fn run_all(&self) -> Result<RunReport> {
        let mut report = RunReport::default();
        for id in ModuleId::ORDER {
            if self.token.is_cancelled() {
                warn!("Interrupted before {}; re-run to resume", id);
                report.interrupted = true;
                break;
            }
            report.modules.push(self.run_one(id)?);
        }
        Ok(report)
    }

    /// One module, standalone.
    pub fn run_one(&self, id: ModuleId) -> Result<ModuleReport> {
        let state = ModuleState::NotStarted.transition(ModuleState::Running)?;
        info!("==> {}", id);

        let outcome = id
            .apply(self.host)
            .with_context(|| format!("Module {} failed", id))?;
        self.record(id, state, outcome)
    }

    /// Write the completion or skip record of a module that ran.
    pub fn record(&self, id: ModuleId, state: ModuleState, outcome: Outcome) -> Result<ModuleReport> {
        let store = &self.host.state;
        match outcome {
            Outcome::Complete => {
                let key = id.complete_key();
                if store.exists(&key)? {
                    info!("{} already recorded as complete", id);
                } else {
                    store.put(&key, &Utc::now().to_rfc3339())?;
                }
                store.remove(&id.skipped_key())?;
                let state = state.transition(ModuleState::Complete)?;
                info!("[OK] {}", id);
                Ok(ModuleReport {
                    module: id,
                    state,
                    detail: None,
                })
            }
            Outcome::Skipped(reason) => {
                if !id.is_optional() {
                    warn!("{} is not optional but skipped itself", id);
                }
                store.put(&id.skipped_key(), &reason)?;
                let state = state.transition(ModuleState::Skipped)?;
                warn!("[SKIPPED] {}: {}", id, reason);
                Ok(ModuleReport {
                    module: id,
                    state,
                    detail: Some(reason),
                })
            }
        }
    }
}
