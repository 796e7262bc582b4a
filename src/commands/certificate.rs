//! Certificate command: operator-driven lifecycle transitions.

use anyhow::Result;

use super::{blocking, GlobalOpts, Session};
use crate::cli::CertificateAction;
use crate::error::ProvisionError;
use crate::modules::{certificate, ModuleId};
use crate::net::{dns_status, DnsStatus};
use crate::sequencer::{ModuleState, Sequencer};
use crate::signal::ShutdownToken;
use crate::system::Verdict;

pub async fn run(action: CertificateAction, opts: &GlobalOpts) -> Result<()> {
    let session = Session::open(opts)?;
    let dns = match action {
        CertificateAction::Obtain { .. } => match dns_status(&session.ctx).await {
            DnsStatus::NotReady(reason) => {
                return Err(ProvisionError::Precondition(format!(
                    "DNS is not ready, the ACME challenge would fail: {}",
                    reason
                ))
                .into())
            }
            ready => ready,
        },
        _ => DnsStatus::Ready,
    };

    blocking(move || {
        let host = session.host(dns);
        match action {
            CertificateAction::Obtain { force_renewal } => {
                let outcome = certificate::obtain(&host, force_renewal)?;
                Sequencer::new(&host, ShutdownToken::new()).record(
                    ModuleId::Certificate,
                    ModuleState::Running,
                    outcome,
                )?;
                println!("[OK] TLS enabled for {}", host.ctx.server_names().join(", "));
            }
            CertificateAction::RenewTest => match certificate::renew_test(&host)? {
                Verdict::Pass => println!("[OK] Renewal dry run succeeded"),
                Verdict::Fail(detail) => {
                    return Err(ProvisionError::Command(format!(
                        "Renewal dry run failed: {}",
                        detail
                    ))
                    .into())
                }
            },
            CertificateAction::Revoke => {
                if certificate::revoke(&host)? {
                    println!("[OK] Certificate revoked; the site is served over HTTP only");
                } else {
                    println!("Nothing revoked");
                }
            }
            CertificateAction::Status { json } => {
                let report = certificate::status(&host)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("Domain:      {}", report.domain);
                    println!("State:       {}", report.state);
                    println!("TLS enabled: {}", report.tls_enabled);
                    if let Some(cert) = &report.certificate {
                        println!("Names:       {}", cert.domains.join(", "));
                        println!("Validity:    {}", cert.validity);
                        if let Some(expires) = cert.expires {
                            println!("Expires:     {}", expires.format("%Y-%m-%d %H:%M UTC"));
                        }
                    }
                    println!(
                        "Renewal:     {}",
                        report
                            .renewal_tested
                            .as_deref()
                            .map(|t| format!("dry run passed at {}", t))
                            .unwrap_or_else(|| "not tested".into())
                    );
                }
            }
        }
        Ok(())
    })
    .await
}
