//! In-memory stand-ins for every collaborator, for scenario tests.
//!
//! One [`FakeHost`] implements all collaborator traits and records each
//! state-changing call in [`FakeState::mutations`].

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::acme::{AcmeClient, CertificateInfo, IssueRequest};
use super::host_os::HostOs;
use super::packages::PackageManager;
use super::packet_filter::{FirewallStatus, PacketFilter, Rule};
use super::prompt::Confirm;
use super::remote_access::RemoteAccessDaemon;
use super::services::ServiceManager;
use super::web_server::WebServer;
use super::{Collaborators, Verdict};
use crate::error::ProvisionError;

#[derive(Debug)]
pub struct FakeState {
    pub installed: BTreeSet<String>,
    pub firewall: FirewallStatus,
    pub users: BTreeMap<String, Vec<String>>,
    pub timezone: String,
    pub enabled: BTreeSet<String>,
    pub active: BTreeSet<String>,
    pub certificate: Option<CertificateInfo>,
    pub issued: Vec<IssueRequest>,

    pub sshd_verdict: Verdict,
    pub nginx_verdict: Verdict,
    pub sudoers_verdict: Verdict,
    pub renew_verdict: Verdict,
    /// Units whose reload/restart fails.
    pub failing_reloads: BTreeSet<String>,
    /// Fail ACME issuance and revocation with a network error.
    pub acme_offline: bool,
    pub confirm_answer: bool,
    /// File `ufw reset` reinstalls from the package, with its stock content.
    pub ufw_template: Option<(PathBuf, String)>,

    pub questions: Vec<String>,
    pub mutations: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            installed: BTreeSet::new(),
            firewall: FirewallStatus::default(),
            users: BTreeMap::new(),
            timezone: "Etc/UTC".to_string(),
            enabled: BTreeSet::new(),
            active: BTreeSet::new(),
            certificate: None,
            issued: Vec::new(),
            sshd_verdict: Verdict::Pass,
            nginx_verdict: Verdict::Pass,
            sudoers_verdict: Verdict::Pass,
            renew_verdict: Verdict::Pass,
            failing_reloads: BTreeSet::new(),
            acme_offline: false,
            confirm_answer: false,
            ufw_template: None,
            questions: Vec::new(),
            mutations: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain the mutation log.
    pub fn take_mutations(&self) -> Vec<String> {
        std::mem::take(&mut self.state().mutations)
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            packages: self.clone(),
            firewall: self.clone(),
            sshd: self.clone(),
            web: self.clone(),
            acme: self.clone(),
            services: self.clone(),
            os: self.clone(),
            confirm: self.clone(),
        }
    }

    fn record(&self, what: String) {
        self.state().mutations.push(what);
    }

    fn reload_unit(&self, unit: &str) -> Result<()> {
        if self.state().failing_reloads.contains(unit) {
            bail!(ProvisionError::Command(format!(
                "systemctl reload {} (exit 1: Job for {}.service failed)",
                unit, unit
            )));
        }
        self.record(format!("reload {}", unit));
        Ok(())
    }
}

impl PackageManager for FakeHost {
    fn is_installed(&self, package: &str) -> Result<bool> {
        Ok(self.state().installed.contains(package))
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        self.state().installed.extend(packages.iter().cloned());
        self.record(format!("install {}", packages.join(" ")));
        Ok(())
    }
}

impl PacketFilter for FakeHost {
    fn reset(&self) -> Result<()> {
        let template = self.state().ufw_template.clone();
        if let Some((path, content)) = template {
            std::fs::write(path, content)?;
        }
        self.state().firewall = FirewallStatus::default();
        self.record("ufw reset".into());
        Ok(())
    }

    fn set_default(&self, direction: &str, policy: &str) -> Result<()> {
        {
            let mut state = self.state();
            match direction {
                "incoming" => state.firewall.default_incoming = Some(policy.to_string()),
                "outgoing" => state.firewall.default_outgoing = Some(policy.to_string()),
                other => bail!("unknown direction {}", other),
            }
        }
        self.record(format!("ufw default {} {}", policy, direction));
        Ok(())
    }

    fn add_rule(&self, rule: &Rule, _comment: &str) -> Result<()> {
        // Appends unconditionally so duplicate additions stay visible.
        self.state().firewall.rules.push(rule.clone());
        self.record(format!("ufw {} {}", rule.action, rule.spec()));
        Ok(())
    }

    fn enable(&self) -> Result<()> {
        self.state().firewall.active = true;
        self.record("ufw enable".into());
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        self.reload_unit("ufw")
    }

    fn status(&self) -> Result<FirewallStatus> {
        Ok(self.state().firewall.clone())
    }
}

impl RemoteAccessDaemon for FakeHost {
    fn validate_config(&self, _main_config: &Path) -> Result<Verdict> {
        Ok(self.state().sshd_verdict.clone())
    }

    fn reload(&self) -> Result<()> {
        self.reload_unit("ssh")
    }
}

impl WebServer for FakeHost {
    fn validate_config(&self) -> Result<Verdict> {
        Ok(self.state().nginx_verdict.clone())
    }

    fn reload(&self) -> Result<()> {
        self.reload_unit("nginx")
    }
}

impl AcmeClient for FakeHost {
    fn issue(&self, request: &IssueRequest) -> Result<()> {
        if self.state().acme_offline {
            bail!(ProvisionError::Network(
                "Failed to connect to acme-v02.api.letsencrypt.org".into()
            ));
        }
        {
            let mut state = self.state();
            state.certificate = Some(CertificateInfo {
                name: request.cert_name.clone(),
                domains: request.domains.clone(),
                expires: None,
                validity: "VALID: 89 days".into(),
                certificate_path: None,
                private_key_path: None,
            });
            state.issued.push(request.clone());
        }
        self.record(format!("certbot certonly {}", request.domains.join(",")));
        Ok(())
    }

    fn renew_dry_run(&self, _cert_name: &str) -> Result<Verdict> {
        Ok(self.state().renew_verdict.clone())
    }

    fn find(&self, cert_name: &str) -> Result<Option<CertificateInfo>> {
        Ok(self
            .state()
            .certificate
            .clone()
            .filter(|c| c.name == cert_name))
    }

    fn revoke(&self, cert_name: &str) -> Result<()> {
        if self.state().acme_offline {
            bail!(ProvisionError::Network(
                "Failed to connect to acme-v02.api.letsencrypt.org".into()
            ));
        }
        self.state().certificate = None;
        self.record(format!("certbot revoke {}", cert_name));
        Ok(())
    }
}

impl ServiceManager for FakeHost {
    fn is_active(&self, unit: &str) -> Result<bool> {
        Ok(self.state().active.contains(unit))
    }

    fn is_enabled(&self, unit: &str) -> Result<bool> {
        Ok(self.state().enabled.contains(unit))
    }

    fn enable_now(&self, unit: &str) -> Result<()> {
        {
            let mut state = self.state();
            state.enabled.insert(unit.to_string());
            state.active.insert(unit.to_string());
        }
        self.record(format!("enable {}", unit));
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        if self.state().failing_reloads.contains(unit) {
            bail!(ProvisionError::Command(format!("systemctl restart {} (exit 1)", unit)));
        }
        self.state().active.insert(unit.to_string());
        self.record(format!("restart {}", unit));
        Ok(())
    }
}

impl HostOs for FakeHost {
    fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().users.contains_key(name))
    }

    fn create_user(&self, name: &str, groups: &[String]) -> Result<()> {
        self.state()
            .users
            .insert(name.to_string(), groups.to_vec());
        self.record(format!("useradd {}", name));
        Ok(())
    }

    fn home_dir(&self, name: &str) -> Result<PathBuf> {
        if !self.state().users.contains_key(name) {
            bail!(ProvisionError::Command(format!("no such user {}", name)));
        }
        Ok(PathBuf::from("/home").join(name))
    }

    fn current_timezone(&self) -> Result<String> {
        Ok(self.state().timezone.clone())
    }

    fn set_timezone(&self, tz: &str) -> Result<()> {
        self.state().timezone = tz.to_string();
        self.record(format!("timedatectl set-timezone {}", tz));
        Ok(())
    }

    fn apply_sysctl(&self, path: &Path) -> Result<()> {
        self.record(format!("sysctl -p {}", path.display()));
        Ok(())
    }

    fn chown(&self, path: &Path, owner: &str, _recursive: bool) -> Result<()> {
        self.record(format!("chown {} {}", owner, path.display()));
        Ok(())
    }

    fn check_sudoers(&self, _path: &Path) -> Result<Verdict> {
        Ok(self.state().sudoers_verdict.clone())
    }
}

impl Confirm for FakeHost {
    fn confirm(&self, question: &str) -> bool {
        let mut state = self.state();
        state.questions.push(question.to_string());
        state.confirm_answer
    }
}
