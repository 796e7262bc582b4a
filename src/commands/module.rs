//! Module command: run one module standalone.

use anyhow::Result;

use super::{blocking, settle_reloads, GlobalOpts, Session};
use crate::gate::pending_reloads;
use crate::modules::ModuleId;
use crate::net::{dns_status, DnsStatus};
use crate::sequencer::{ModuleState, Sequencer};
use crate::signal::ShutdownToken;

pub async fn run(id: ModuleId, opts: &GlobalOpts) -> Result<()> {
    let session = Session::open(opts)?;
    // Only the certificate module looks at DNS.
    let dns = if id == ModuleId::Certificate {
        dns_status(&session.ctx).await
    } else {
        DnsStatus::Ready
    };

    let (report, pending) = blocking(move || {
        let host = session.host(dns);
        let report = Sequencer::new(&host, ShutdownToken::new()).run_one(id)?;
        Ok((report, pending_reloads(&host.state)?))
    })
    .await?;

    match (report.state, report.detail) {
        (ModuleState::Skipped, Some(reason)) => println!("[SKIPPED] {}: {}", id, reason),
        _ => println!("[OK] {}", id),
    }
    settle_reloads(&pending)
}
