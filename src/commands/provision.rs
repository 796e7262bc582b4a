//! Provision command: every module, in order.

use anyhow::{anyhow, Result};
use tracing::info;

use super::{blocking, settle_reloads, GlobalOpts, Session};
use crate::error::RetriableFailure;
use crate::gate::pending_reloads;
use crate::net::dns_status;
use crate::preflight::run_checks;
use crate::sequencer::{ModuleState, RunReport, Sequencer};
use crate::signal::{ShutdownGuard, ShutdownToken};

pub fn print_summary(report: &RunReport) {
    println!();
    for entry in &report.modules {
        match (&entry.state, &entry.detail) {
            (ModuleState::Skipped, Some(reason)) => {
                println!("[SKIPPED] {}: {}", entry.module, reason)
            }
            (state, _) => println!("[{}] {}", state.to_string().to_uppercase(), entry.module),
        }
    }
}

pub async fn run(opts: &GlobalOpts) -> Result<()> {
    let session = Session::open(opts)?;
    run_checks().await.require()?;
    let dns = dns_status(&session.ctx).await;

    let _signals = ShutdownGuard::new();
    let token = ShutdownToken::new();
    let (report, pending) = blocking(move || {
        let host = session.host(dns);
        let report = Sequencer::new(&host, token).run_all()?;
        Ok((report, pending_reloads(&host.state)?))
    })
    .await?;

    print_summary(&report);
    if report.interrupted {
        return Err(RetriableFailure {
            label: "Provisioning interrupted".into(),
            source: anyhow!("stopped at a module boundary"),
        }
        .into());
    }
    settle_reloads(&pending)?;
    info!("Provisioning complete");
    Ok(())
}
