//! Adapters for the host services bastion drives.
//!
//! Each collaborator is a trait with one real implementation that shells out
//! through [`CommandExecutor`](crate::cmd_abstraction::CommandExecutor). The
//! provisioning modules only ever see the traits, bundled in
//! [`Collaborators`].

pub mod acme;
pub mod host_os;
pub mod packages;
pub mod packet_filter;
pub mod paths;
pub mod prompt;
pub mod remote_access;
pub mod services;
pub mod web_server;

#[cfg(test)]
pub mod fake;

use std::sync::Arc;

use crate::cmd_abstraction::CommandExecutor;

pub use acme::{AcmeClient, CertificateInfo, Certbot, IssueRequest};
pub use host_os::{HostOs, LinuxHost};
pub use packages::{Apt, PackageManager};
pub use packet_filter::{FirewallStatus, PacketFilter, Rule, RuleAction, Ufw};
pub use paths::HostPaths;
pub use prompt::{Confirm, StdinConfirm};
pub use remote_access::{OpenSsh, RemoteAccessDaemon};
pub use services::{ServiceManager, Systemctl};
pub use web_server::{Nginx, WebServer};

/// Result of a service's own configuration check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// The checker ran and rejected the configuration.
    Fail(String),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Everything the modules need to act on the host.
#[derive(Clone)]
pub struct Collaborators {
    pub packages: Arc<dyn PackageManager>,
    pub firewall: Arc<dyn PacketFilter>,
    pub sshd: Arc<dyn RemoteAccessDaemon>,
    pub web: Arc<dyn WebServer>,
    pub acme: Arc<dyn AcmeClient>,
    pub services: Arc<dyn ServiceManager>,
    pub os: Arc<dyn HostOs>,
    pub confirm: Arc<dyn Confirm>,
}

impl Collaborators {
    /// Real collaborators sharing one executor.
    pub fn system(exec: Arc<dyn CommandExecutor>, confirm: Arc<dyn Confirm>) -> Self {
        Self {
            packages: Arc::new(Apt::new(exec.clone())),
            firewall: Arc::new(Ufw::new(exec.clone())),
            sshd: Arc::new(OpenSsh::new(exec.clone())),
            web: Arc::new(Nginx::new(exec.clone())),
            acme: Arc::new(Certbot::new(exec.clone())),
            services: Arc::new(Systemctl::new(exec.clone())),
            os: Arc::new(LinuxHost::new(exec)),
            confirm,
        }
    }
}
