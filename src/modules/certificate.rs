//! TLS certificate lifecycle, driven through the ACME client.
//!
//! ```text
//! absent -> requested -> issued -> renewing -> issued
//!              |            |
//!              v            v
//!           absent       revoked
//! ```
//!
//! The driver never stores certificate material; it only observes the ACME
//! client's lineage and asks for transitions. Revocation is terminal for the
//! lineage: module runs skip until the operator explicitly obtains a new one.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use super::webserver::{TLS_ANCHOR, TLS_TAG};
use super::{Host, ModuleId, Outcome, MANAGED_HEADER};
use crate::error::{run_step, Policy, ProvisionError};
use crate::gate::{stage_file, GateOutcome, NginxService, COMMITTED};
use crate::mutator::Anchor;
use crate::net::DnsStatus;
use crate::system::packages::ensure_installed;
use crate::system::{CertificateInfo, IssueRequest, Verdict};

pub const TLS_GATE_KEY: &str = "TLS_INCLUDE";
const DOMAINS_KEY: &str = "CERTIFICATE_DOMAINS";
const REVOKED_KEY: &str = "CERTIFICATE_REVOKED";
const RENEWAL_TESTED_KEY: &str = "CERTIFICATE_RENEWAL_TESTED";

const PRE_HOOK: &str = "#!/bin/sh
# The webroot challenge is answered by nginx; refuse to renew with a broken config.
exec nginx -t -q
";

const DEPLOY_HOOK: &str = "#!/bin/sh
exec systemctl reload nginx
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateState {
    Absent,
    Requested,
    Issued,
    Renewing,
    Revoked,
}

impl CertificateState {
    pub fn can_transition(self, to: CertificateState) -> bool {
        use CertificateState::*;
        matches!(
            (self, to),
            (Absent, Requested)
                | (Requested, Issued)
                | (Requested, Absent)
                | (Issued, Requested)
                | (Issued, Renewing)
                | (Renewing, Issued)
                | (Issued, Revoked)
        )
    }

    fn transition(self, to: CertificateState) -> Result<CertificateState> {
        if !self.can_transition(to) {
            return Err(ProvisionError::State(format!(
                "certificate cannot go from {} to {}",
                self, to
            ))
            .into());
        }
        Ok(to)
    }
}

impl fmt::Display for CertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateState::Absent => "absent",
            CertificateState::Requested => "requested",
            CertificateState::Issued => "issued",
            CertificateState::Renewing => "renewing",
            CertificateState::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// What `certificate status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    pub domain: String,
    pub state: CertificateState,
    pub certificate: Option<CertificateInfo>,
    pub tls_enabled: bool,
    pub renewal_tested: Option<String>,
}

fn observe(host: &Host<'_>) -> Result<(CertificateState, Option<CertificateInfo>)> {
    if host.state.exists(REVOKED_KEY)? {
        return Ok((CertificateState::Revoked, None));
    }
    let found = host.sys.acme.find(&host.ctx.domain)?;
    let state = if found.is_some() {
        CertificateState::Issued
    } else {
        CertificateState::Absent
    };
    Ok((state, found))
}

/// Module entry: obtain when DNS is ready and nothing was revoked.
pub fn apply(host: &Host<'_>) -> Result<Outcome> {
    if let Some(revoked_at) = host.state.get(REVOKED_KEY)? {
        return Ok(Outcome::Skipped(format!(
            "certificate was revoked at {}; run `bastion certificate obtain` to issue a new one",
            revoked_at
        )));
    }
    if let DnsStatus::NotReady(reason) = &host.dns {
        return Ok(Outcome::Skipped(reason.clone()));
    }
    obtain(host, false)
}

/// Acquire (or reuse) the certificate and switch the site to TLS.
///
/// An existing lineage is only replaced after confirmation, either because
/// `force` asks for it or because it no longer covers every server name.
pub fn obtain(host: &Host<'_>, force: bool) -> Result<Outcome> {
    ensure_installed(host.sys.packages.as_ref(), &["certbot"])?;
    let site = host.paths.site_file(&host.ctx.domain);
    if !host.files.fs().exists(&site) {
        return Err(ProvisionError::Precondition(format!(
            "{} is missing; run the web-server module first",
            host.paths.host_view(&site).display()
        ))
        .into());
    }

    let (mut state, existing) = observe(host)?;
    if state == CertificateState::Revoked {
        info!("Starting a new certificate lineage after revocation");
        state = CertificateState::Absent;
    }

    let names = host.ctx.server_names();
    let reissue = match &existing {
        None => Some(false),
        Some(cert) if cert.is_valid() && cert.covers(&names) && !force => {
            info!(
                "Certificate for {} already issued ({})",
                host.ctx.domain, cert.validity
            );
            None
        }
        Some(cert) => {
            let question = format!(
                "A certificate for {} already exists ({}, covers {}). Request a new one? \
                 Repeated requests count against the CA's rate limits.",
                host.ctx.domain,
                cert.validity,
                cert.domains.join(", ")
            );
            if host.sys.confirm.confirm(&question) {
                Some(true)
            } else if cert.is_valid() {
                warn!("Keeping the existing certificate for {}", host.ctx.domain);
                None
            } else {
                return Err(ProvisionError::Precondition(format!(
                    "the certificate for {} is {} and re-issuing was declined",
                    host.ctx.domain, cert.validity
                ))
                .into());
            }
        }
    };

    if let Some(force_renewal) = reissue {
        state = state.transition(CertificateState::Requested)?;
        let request = IssueRequest {
            cert_name: host.ctx.domain.clone(),
            domains: names.clone(),
            webroot: host.ctx.web_root.clone(),
            email: host.ctx.admin_email.clone(),
            force_renewal,
        };
        let issued = run_step(Policy::Retriable, "Requesting the certificate", || {
            host.sys.acme.issue(&request)
        });
        if let Err(e) = issued {
            state.transition(CertificateState::Absent)?;
            return Err(e);
        }
        state = state.transition(CertificateState::Issued)?;
        info!("Certificate for {} is {}", names.join(", "), state);
    }
    host.state.remove(REVOKED_KEY)?;

    install_hooks(host)?;
    enable_tls(host)?;
    host.state.put(DOMAINS_KEY, &names.join(","))?;

    if !host.state.exists(RENEWAL_TESTED_KEY)? {
        run_step(Policy::BestEffort, "Renewal self-test", || renew_test(host))?;
    }
    Ok(Outcome::Complete)
}

/// Hooks are generated artifacts and simply overwritten.
fn install_hooks(host: &Host<'_>) -> Result<()> {
    let hooks = &host.paths.letsencrypt_hooks;
    host.files
        .write_file(&hooks.join("pre/bastion-check-nginx.sh"), PRE_HOOK, Some(0o755))?;
    host.files.write_file(
        &hooks.join("deploy/bastion-reload-nginx.sh"),
        DEPLOY_HOOK,
        Some(0o755),
    )?;
    Ok(())
}

pub fn render_tls_snippet(host: &Host<'_>) -> String {
    let live = host
        .paths
        .host_view(&host.paths.certificate_dir(&host.ctx.domain));
    format!(
        "{header}
listen 443 ssl;
listen [::]:443 ssl;
ssl_certificate {live}/fullchain.pem;
ssl_certificate_key {live}/privkey.pem;
ssl_protocols TLSv1.2 TLSv1.3;
ssl_prefer_server_ciphers off;
ssl_session_cache shared:bastion_tls:10m;
ssl_session_timeout 1d;
ssl_session_tickets off;
add_header Strict-Transport-Security \"max-age=63072000\" always;
",
        header = MANAGED_HEADER,
        live = live.display()
    )
}

fn enable_tls(host: &Host<'_>) -> Result<()> {
    let paths = host.paths;
    let snippet = paths.tls_snippet(&host.ctx.domain);
    let site = paths.site_file(&host.ctx.domain);
    let content = render_tls_snippet(host);
    let include = format!("include {};", paths.host_view(&snippet).display());
    let service = NginxService {
        server: host.sys.web.as_ref(),
    };

    let outcome = host
        .gate()
        .apply(&service, TLS_GATE_KEY, |files, staged| {
            stage_file(files, staged, &snippet, &content, Some(0o644))?;
            staged.track(files.stage_block_insert(
                &site,
                TLS_TAG,
                &include,
                Anchor::BeforeLast(TLS_ANCHOR),
                None,
            )?);
            Ok(())
        })
        .context("Enabling TLS on the site")?;
    if let GateOutcome::CommitFailed(reason) = outcome {
        warn!("nginx is not serving TLS yet ({})", reason);
    }
    Ok(())
}

/// Dry-run renewal. A failure is reported, never fatal.
pub fn renew_test(host: &Host<'_>) -> Result<Verdict> {
    let (state, _) = observe(host)?;
    let renewing = state.transition(CertificateState::Renewing)?;
    info!("Certificate is {}, simulating renewal", renewing);
    let verdict = host.sys.acme.renew_dry_run(&host.ctx.domain)?;
    match &verdict {
        Verdict::Pass => {
            host.state.put(RENEWAL_TESTED_KEY, &Utc::now().to_rfc3339())?;
            info!("Renewal dry run succeeded");
        }
        Verdict::Fail(detail) => {
            warn!(
                "Renewal dry run failed; the current certificate is unaffected: {}",
                detail
            );
        }
    }
    renewing.transition(CertificateState::Issued)?;
    Ok(verdict)
}

/// Take TLS off the site, then revoke and delete the lineage.
///
/// Returns whether anything was revoked.
pub fn revoke(host: &Host<'_>) -> Result<bool> {
    let (state, existing) = observe(host)?;
    let Some(cert) = existing else {
        info!("No certificate for {} to revoke", host.ctx.domain);
        return Ok(false);
    };
    let question = format!(
        "Revoke the certificate for {} ({})? The site falls back to plain HTTP.",
        cert.domains.join(", "),
        cert.validity
    );
    if !host.sys.confirm.confirm(&question) {
        info!("Revocation cancelled");
        return Ok(false);
    }
    let revoked = state.transition(CertificateState::Revoked)?;

    let site = host.paths.site_file(&host.ctx.domain);
    let service = NginxService {
        server: host.sys.web.as_ref(),
    };
    let outcome = host
        .gate()
        .apply(&service, TLS_GATE_KEY, |files, staged| {
            staged.track(files.stage_block_removal(&site, TLS_TAG)?);
            Ok(())
        })
        .context("Removing TLS from the site")?;
    // The site no longer includes TLS, whatever happens to the revocation.
    if !matches!(outcome, GateOutcome::CommitFailed(_)) {
        host.state.remove(TLS_GATE_KEY)?;
    }
    let snippet = host.paths.tls_snippet(&host.ctx.domain);
    host.files.backup(&snippet)?;
    host.files.remove_file(&snippet)?;

    run_step(Policy::Retriable, "Revoking the certificate", || {
        host.sys.acme.revoke(&cert.name)
    })?;

    for key in [
        DOMAINS_KEY.to_string(),
        RENEWAL_TESTED_KEY.to_string(),
        ModuleId::Certificate.complete_key(),
    ] {
        host.state.remove(&key)?;
    }
    host.state.put(REVOKED_KEY, &Utc::now().to_rfc3339())?;
    info!("Certificate for {} is {}", host.ctx.domain, revoked);
    Ok(true)
}

pub fn status(host: &Host<'_>) -> Result<CertificateReport> {
    let (state, certificate) = observe(host)?;
    Ok(CertificateReport {
        domain: host.ctx.domain.clone(),
        state,
        certificate,
        tls_enabled: host.state.get(TLS_GATE_KEY)?.as_deref() == Some(COMMITTED),
        renewal_tested: host.state.get(RENEWAL_TESTED_KEY)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::TestHost;
    use crate::modules::webserver;

    fn with_site() -> TestHost {
        let t = TestHost::new();
        webserver::apply(&t.host()).unwrap();
        t.fake.take_mutations();
        t
    }

    #[test]
    fn test_transitions() {
        use CertificateState::*;
        assert!(Absent.can_transition(Requested));
        assert!(Issued.can_transition(Renewing));
        assert!(!Absent.can_transition(Issued));
        assert!(!Revoked.can_transition(Requested));
        assert!(!Renewing.can_transition(Revoked));
    }

    #[test]
    fn test_dns_not_ready_skips_without_changes() {
        let mut t = with_site();
        t.dns = DnsStatus::NotReady("example.com resolves to nothing".into());
        let before = t.snapshot();

        let outcome = apply(&t.host()).unwrap();
        assert_eq!(
            outcome,
            Outcome::Skipped("example.com resolves to nothing".into())
        );
        assert_eq!(t.snapshot(), before);
        assert!(t.fake.take_mutations().is_empty());
    }

    #[test]
    fn test_obtain_enables_tls() {
        let t = with_site();
        let host = t.host();
        assert_eq!(apply(&host).unwrap(), Outcome::Complete);

        let issued = t.fake.state().issued.clone();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].domains, vec!["example.com", "www.example.com"]);
        assert!(!issued[0].force_renewal);

        let site = t.read(&t.paths.site_file("example.com"));
        assert!(site.contains("include /etc/nginx/snippets/bastion-tls-example.com.conf;"));
        let snippet = t.read(&t.paths.tls_snippet("example.com"));
        assert!(snippet.contains("ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;"));
        assert!(t
            .paths
            .letsencrypt_hooks
            .join("deploy/bastion-reload-nginx.sh")
            .exists());
        assert_eq!(
            host.state.get(DOMAINS_KEY).unwrap().as_deref(),
            Some("example.com,www.example.com")
        );
        assert!(host.state.exists(RENEWAL_TESTED_KEY).unwrap());
    }

    #[test]
    fn test_second_run_does_not_reissue() {
        let t = with_site();
        let host = t.host();
        apply(&host).unwrap();
        t.fake.take_mutations();

        apply(&host).unwrap();
        assert_eq!(t.fake.state().issued.len(), 1);
        assert!(t.fake.state().questions.is_empty());
        assert!(t.fake.take_mutations().is_empty());
    }

    #[test]
    fn test_forced_reissue_needs_confirmation() {
        let t = with_site();
        let host = t.host();
        apply(&host).unwrap();

        obtain(&host, true).unwrap();
        assert_eq!(t.fake.state().questions.len(), 1);
        assert_eq!(t.fake.state().issued.len(), 1);

        t.fake.state().confirm_answer = true;
        obtain(&host, true).unwrap();
        let issued = t.fake.state().issued.clone();
        assert_eq!(issued.len(), 2);
        assert!(issued[1].force_renewal);
    }

    #[test]
    fn test_expired_and_declined_is_refused() {
        let t = with_site();
        t.fake.state().certificate = Some(CertificateInfo {
            name: "example.com".into(),
            domains: vec!["example.com".into(), "www.example.com".into()],
            validity: "INVALID: EXPIRED".into(),
            ..Default::default()
        });
        let err = apply(&t.host()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Precondition(_))
        ));
    }

    #[test]
    fn test_issue_failure_is_retriable_and_leaves_site_alone() {
        let t = with_site();
        t.fake.state().acme_offline = true;
        let site_before = t.read(&t.paths.site_file("example.com"));

        let err = apply(&t.host()).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 75);
        assert_eq!(t.read(&t.paths.site_file("example.com")), site_before);
    }

    #[test]
    fn test_rejected_tls_include_is_reverted() {
        let t = with_site();
        let site_before = t.read(&t.paths.site_file("example.com"));
        t.fake.state().nginx_verdict =
            Verdict::Fail("cannot load certificate \"fullchain.pem\"".into());

        assert!(apply(&t.host()).is_err());
        assert_eq!(t.read(&t.paths.site_file("example.com")), site_before);
        assert!(!t.paths.tls_snippet("example.com").exists());
    }

    #[test]
    fn test_failed_dry_run_is_only_a_warning() {
        let t = with_site();
        t.fake.state().renew_verdict = Verdict::Fail("Challenge failed".into());
        let host = t.host();
        assert_eq!(apply(&host).unwrap(), Outcome::Complete);
        assert!(!host.state.exists(RENEWAL_TESTED_KEY).unwrap());
    }

    #[test]
    fn test_revoke_then_explicit_obtain() {
        let t = with_site();
        let host = t.host();
        apply(&host).unwrap();
        t.fake.state().confirm_answer = true;

        assert!(revoke(&host).unwrap());
        let site = t.read(&t.paths.site_file("example.com"));
        assert!(!site.contains("bastion-tls"));
        assert!(t.fake.state().certificate.is_none());
        assert!(host.state.get(DOMAINS_KEY).unwrap().is_none());
        assert_eq!(status(&host).unwrap().state, CertificateState::Revoked);

        assert!(matches!(apply(&host).unwrap(), Outcome::Skipped(_)));
        assert_eq!(obtain(&host, false).unwrap(), Outcome::Complete);
        assert!(!host.state.exists(REVOKED_KEY).unwrap());
        assert_eq!(status(&host).unwrap().state, CertificateState::Issued);
    }

    #[test]
    fn test_revoke_declined_changes_nothing() {
        let t = with_site();
        let host = t.host();
        apply(&host).unwrap();
        let before = t.snapshot();

        assert!(!revoke(&host).unwrap());
        assert_eq!(t.snapshot(), before);
        assert!(t.fake.state().certificate.is_some());
    }

    #[test]
    fn test_failed_revocation_still_reports_plain_http() {
        let t = with_site();
        let host = t.host();
        apply(&host).unwrap();
        assert!(status(&host).unwrap().tls_enabled);
        t.fake.state().confirm_answer = true;
        t.fake.state().acme_offline = true;

        let err = revoke(&host).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 75);
        let report = status(&host).unwrap();
        assert!(!report.tls_enabled);
        assert!(report.certificate.is_some());

        // Retry once ACME is reachable again.
        t.fake.state().acme_offline = false;
        assert!(revoke(&host).unwrap());
        assert_eq!(status(&host).unwrap().state, CertificateState::Revoked);
    }

    #[test]
    fn test_revoke_backs_up_tls_snippet() {
        let t = with_site();
        let host = t.host();
        apply(&host).unwrap();
        let snippet = t.paths.tls_snippet("example.com");
        let content = t.read(&snippet);
        t.fake.state().confirm_answer = true;

        assert!(revoke(&host).unwrap());
        assert!(!snippet.exists());
        let prefix = format!(
            "{}.backup.",
            snippet.file_name().unwrap().to_string_lossy()
        );
        let backups: Vec<_> = std::fs::read_dir(snippet.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(&prefix))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read_to_string(&backups[0]).unwrap(), content);
    }
}
