//! Provisioning modules, one per host concern.
//!
//! Modules never run commands or touch files directly: they go through the
//! [`Host`] handle, which bundles the context, the guarded file mutator, the
//! state store and the collaborator adapters.

pub mod certificate;
pub mod firewall;
pub mod hardening;
pub mod intrusion;
pub mod updates;
pub mod webserver;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;

use crate::context::ConfigContext;
use crate::gate::Gate;
use crate::mutator::FileMutator;
use crate::net::DnsStatus;
use crate::state::StateStore;
use crate::system::{Collaborators, HostPaths};

/// The modules, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleId {
    Hardening,
    Firewall,
    IntrusionPrevention,
    WebServer,
    Certificate,
    Updates,
}

impl ModuleId {
    pub const ORDER: [ModuleId; 6] = [
        ModuleId::Hardening,
        ModuleId::Firewall,
        ModuleId::IntrusionPrevention,
        ModuleId::WebServer,
        ModuleId::Certificate,
        ModuleId::Updates,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModuleId::Hardening => "hardening",
            ModuleId::Firewall => "firewall",
            ModuleId::IntrusionPrevention => "intrusion-prevention",
            ModuleId::WebServer => "web-server",
            ModuleId::Certificate => "certificate",
            ModuleId::Updates => "updates",
        }
    }

    fn state_prefix(self) -> &'static str {
        match self {
            ModuleId::Hardening => "HARDENING",
            ModuleId::Firewall => "FIREWALL",
            ModuleId::IntrusionPrevention => "INTRUSION_PREVENTION",
            ModuleId::WebServer => "WEB_SERVER",
            ModuleId::Certificate => "CERTIFICATE",
            ModuleId::Updates => "UPDATES",
        }
    }

    /// State key holding the first completion time.
    pub fn complete_key(self) -> String {
        format!("{}_COMPLETE", self.state_prefix())
    }

    /// State key holding the reason of the last skip.
    pub fn skipped_key(self) -> String {
        format!("{}_SKIPPED", self.state_prefix())
    }

    /// Modules whose preconditions may legitimately be unmet.
    pub fn is_optional(self) -> bool {
        matches!(self, ModuleId::Certificate)
    }

    pub fn apply(self, host: &Host<'_>) -> Result<Outcome> {
        match self {
            ModuleId::Hardening => hardening::apply(host),
            ModuleId::Firewall => firewall::apply(host),
            ModuleId::IntrusionPrevention => intrusion::apply(host),
            ModuleId::WebServer => webserver::apply(host),
            ModuleId::Certificate => certificate::apply(host),
            ModuleId::Updates => updates::apply(host),
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// Preconditions unmet; nothing was changed.
    Skipped(String),
}

/// Everything a module may act on.
pub struct Host<'a> {
    pub ctx: &'a ConfigContext,
    pub paths: &'a HostPaths,
    pub files: FileMutator<'a>,
    pub state: StateStore<'a>,
    pub sys: &'a Collaborators,
    pub dns: DnsStatus,
}

impl<'a> Host<'a> {
    pub fn gate(&self) -> Gate<'_> {
        Gate::new(&self.files, &self.state)
    }
}

/// Generated-file banner.
pub(crate) const MANAGED_HEADER: &str =
    "# Managed by bastion. Local edits are overwritten on the next run.";


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_fixed() {
        let names: Vec<&str> = ModuleId::ORDER.iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec![
                "hardening",
                "firewall",
                "intrusion-prevention",
                "web-server",
                "certificate",
                "updates"
            ]
        );
    }

    #[test]
    fn test_state_keys() {
        assert_eq!(ModuleId::Hardening.complete_key(), "HARDENING_COMPLETE");
        assert_eq!(
            ModuleId::IntrusionPrevention.complete_key(),
            "INTRUSION_PREVENTION_COMPLETE"
        );
        assert_eq!(ModuleId::Certificate.skipped_key(), "CERTIFICATE_SKIPPED");
    }

    #[test]
    fn test_only_certificate_is_optional() {
        let optional: Vec<ModuleId> = ModuleId::ORDER
            .iter()
            .copied()
            .filter(|m| m.is_optional())
            .collect();
        assert_eq!(optional, vec![ModuleId::Certificate]);
    }

    #[test]
    fn test_fresh_host_has_default_site_enabled() {
        let t = testing::TestHost::new();
        let link = t.paths.default_site_link();
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(t.fake.state().mutations.is_empty());
    }

    #[test]
    fn test_value_enum_names_match() {
        for id in ModuleId::ORDER {
            let parsed = ModuleId::from_str(id.name(), false).unwrap();
            assert_eq!(parsed, id);
        }
    }
}
