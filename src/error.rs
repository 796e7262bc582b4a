//! Error types and step policies for bastion.
//!
//! Every external step runs under a [`Policy`]. [`run_step`] is the single
//! place where a step failure is turned into "swallow", "retry later" or
//! "abort the run".

use anyhow::Result;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{service} rejected the staged configuration (change reverted): {detail}")]
    StagedConfigRejected { service: String, detail: String },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {secs}s: {what}")]
    Timeout { what: String, secs: u64 },

    #[error("Anchor line '{anchor}' not found in {path}")]
    MissingAnchor { path: String, anchor: String },

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("State store error: {0}")]
    State(String),
}

impl ProvisionError {
    /// Intrinsic policy of this error kind.
    pub fn policy(&self) -> Policy {
        match self {
            ProvisionError::Network(_) | ProvisionError::Timeout { .. } => Policy::Retriable,
            _ => Policy::Fatal,
        }
    }
}

/// How a failed step affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Abort the run.
    Fatal,
    /// Abort the run; the operator may simply re-run later.
    Retriable,
    /// Log and continue.
    BestEffort,
}

/// A failure that will go away on a later re-run (network, timeouts).
#[derive(Error, Debug)]
#[error("{label}: {source:#} (re-run to retry)")]
pub struct RetriableFailure {
    pub label: String,
    #[source]
    pub source: anyhow::Error,
}

/// Run one step and dispatch its failure on `policy`.
///
/// Errors carrying a retriable [`ProvisionError`] are reported as retriable
/// even under `Policy::Fatal`.
pub fn run_step<T, F>(policy: Policy, label: &str, f: F) -> Result<Option<T>>
where
    F: FnOnce() -> Result<T>,
{
    match f() {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let intrinsic = e
                .downcast_ref::<ProvisionError>()
                .map(ProvisionError::policy)
                .unwrap_or(Policy::Fatal);
            match (policy, intrinsic) {
                (Policy::BestEffort, _) => {
                    warn!("{} failed (ignored): {:#}", label, e);
                    Ok(None)
                }
                (Policy::Retriable, _) | (Policy::Fatal, Policy::Retriable) => {
                    Err(RetriableFailure {
                        label: label.to_string(),
                        source: e,
                    }
                    .into())
                }
                _ => Err(e.context(label.to_string())),
            }
        }
    }
}

/// Process exit code for an error that reached `main`.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let retriable = err.chain().any(|cause| {
        cause.is::<RetriableFailure>()
            || cause
                .downcast_ref::<ProvisionError>()
                .is_some_and(|e| e.policy() == Policy::Retriable)
    });
    if retriable {
        75
    } else {
        1
    }
}
