//! ACME client (certbot) in webroot mode.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::Verdict;
use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT, NETWORK_TIMEOUT};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub cert_name: String,
    pub domains: Vec<String>,
    pub webroot: PathBuf,
    pub email: String,
    /// Replace an existing, still-valid certificate.
    pub force_renewal: bool,
}

/// One certificate lineage as reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub name: String,
    pub domains: Vec<String>,
    pub expires: Option<DateTime<Utc>>,
    /// Client's own verdict, e.g. `VALID: 89 days`.
    pub validity: String,
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
}

impl CertificateInfo {
    pub fn covers(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.domains.contains(n))
    }

    pub fn is_valid(&self) -> bool {
        self.validity.starts_with("VALID")
    }

    /// Parse `certbot certificates` output. Lineages are returned in order.
    pub fn parse_listing(text: &str) -> Vec<CertificateInfo> {
        let mut found: Vec<CertificateInfo> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if key == "Certificate Name" {
                found.push(CertificateInfo {
                    name: value.to_string(),
                    ..Default::default()
                });
                continue;
            }
            let Some(current) = found.last_mut() else {
                continue;
            };
            match key {
                "Domains" => {
                    current.domains = value.split_whitespace().map(str::to_string).collect()
                }
                "Expiry Date" => {
                    // "2026-01-17 09:12:33+00:00 (VALID: 89 days)"
                    let (stamp, verdict) = match value.split_once(" (") {
                        Some((stamp, rest)) => (stamp, rest.trim_end_matches(')')),
                        None => (value, ""),
                    };
                    current.expires = DateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%:z")
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                    current.validity = verdict.to_string();
                }
                "Certificate Path" => current.certificate_path = Some(PathBuf::from(value)),
                "Private Key Path" => current.private_key_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        found
    }
}

#[cfg_attr(test, automock)]
pub trait AcmeClient: Send + Sync {
    fn issue(&self, request: &IssueRequest) -> Result<()>;

    /// Simulated renewal against the staging endpoint.
    fn renew_dry_run(&self, cert_name: &str) -> Result<Verdict>;

    fn find(&self, cert_name: &str) -> Result<Option<CertificateInfo>>;

    /// Revoke and delete the lineage.
    fn revoke(&self, cert_name: &str) -> Result<()>;
}

pub struct Certbot {
    exec: Arc<dyn CommandExecutor>,
}

impl Certbot {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }
}

impl AcmeClient for Certbot {
    fn issue(&self, request: &IssueRequest) -> Result<()> {
        let webroot = request.webroot.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec![
            "certonly",
            "--webroot",
            "-w",
            webroot.as_str(),
            "--cert-name",
            request.cert_name.as_str(),
            "--email",
            request.email.as_str(),
            "--agree-tos",
            "--no-eff-email",
            "--non-interactive",
            "--keep-until-expiring",
        ];
        for domain in &request.domains {
            args.push("-d");
            args.push(domain.as_str());
        }
        if request.force_renewal {
            args.retain(|a| *a != "--keep-until-expiring");
            args.push("--force-renewal");
        }
        run_checked(self.exec.as_ref(), "certbot", &args, NETWORK_TIMEOUT)?;
        Ok(())
    }

    fn renew_dry_run(&self, cert_name: &str) -> Result<Verdict> {
        let output = self.exec.execute(
            "certbot",
            &[
                "renew".to_string(),
                "--dry-run".to_string(),
                "--no-random-sleep-on-renew".to_string(),
                "--cert-name".to_string(),
                cert_name.to_string(),
            ],
            NETWORK_TIMEOUT,
        )?;
        Ok(if output.success {
            Verdict::Pass
        } else {
            Verdict::Fail(output.diagnostic())
        })
    }

    fn find(&self, cert_name: &str) -> Result<Option<CertificateInfo>> {
        let output = run_checked(
            self.exec.as_ref(),
            "certbot",
            &["certificates", "--cert-name", cert_name],
            LOCAL_TIMEOUT,
        )?;
        Ok(CertificateInfo::parse_listing(&output.stdout)
            .into_iter()
            .find(|c| c.name == cert_name))
    }

    fn revoke(&self, cert_name: &str) -> Result<()> {
        run_checked(
            self.exec.as_ref(),
            "certbot",
            &[
                "revoke",
                "--cert-name",
                cert_name,
                "--non-interactive",
                "--delete-after-revoke",
            ],
            NETWORK_TIMEOUT,
        )?;
        Ok(())
    }
}
