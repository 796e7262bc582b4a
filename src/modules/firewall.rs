//! Host firewall: deny inbound by default, allow SSH (rate-limited) and web.

use anyhow::{bail, Result};
use tracing::{info, warn};

use super::{intrusion, Host, ModuleId, Outcome};
use crate::system::packages::ensure_installed;
use crate::system::{Rule, RuleAction};

const DEFAULT_SSH_PORT: u16 = 22;

/// Ports sshd may be listening on right now.
///
/// `SSH_PORT` is only recorded once sshd has reloaded onto it. Until then
/// the daemon still listens on the recorded port (22 before any hardening),
/// which therefore stays open beside the configured one.
pub fn ssh_ports(host: &Host<'_>) -> Result<Vec<u16>> {
    let mut ports = vec![host.ctx.ssh_port];
    let committed = host
        .state
        .get("SSH_PORT")?
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_SSH_PORT);
    if committed != host.ctx.ssh_port {
        warn!(
            "sshd still listens on port {}; keeping it open until sshd moves to {}",
            committed, host.ctx.ssh_port
        );
        ports.push(committed);
    }
    Ok(ports)
}

pub fn desired_rules(ssh_ports: &[u16]) -> Vec<Rule> {
    let mut rules: Vec<Rule> = ssh_ports
        .iter()
        .map(|p| Rule::tcp(*p, RuleAction::Limit))
        .collect();
    rules.push(Rule::tcp(80, RuleAction::Allow));
    rules.push(Rule::tcp(443, RuleAction::Allow));
    rules
}

fn comment_for(rule: &Rule) -> &'static str {
    match rule.port {
        80 => "http",
        443 => "https",
        _ => "ssh",
    }
}

pub fn apply(host: &Host<'_>) -> Result<Outcome> {
    ensure_installed(host.sys.packages.as_ref(), &["ufw"])?;
    let fw = host.sys.firewall.as_ref();

    let ports = ssh_ports(host)?;
    let wanted = desired_rules(&ports);
    if fw.status()?.matches(&wanted) {
        info!("Firewall already enforces the expected rules");
    } else {
        // Rebuilt from scratch so rules from earlier ports cannot linger.
        fw.reset()?;
        fw.set_default("incoming", "deny")?;
        fw.set_default("outgoing", "allow")?;
        for rule in &wanted {
            fw.add_rule(rule, comment_for(rule))?;
        }
        // A reset reinstalls before.rules from the package template.
        if host.state.exists(&ModuleId::IntrusionPrevention.complete_key())? {
            intrusion::ensure_rate_limit(host)?;
        }
        fw.enable()?;

        let status = fw.status()?;
        if !status.matches(&wanted) {
            bail!(
                "Firewall rules after enabling do not match the expected set: {:?}",
                status.rules
            );
        }
        info!(
            "Firewall enabled: {}",
            wanted
                .iter()
                .map(|r| format!("{} {}", r.action, r.spec()))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
    host.state.put("FIREWALL_SSH_PORTS", &ports.join(","))?;
    Ok(Outcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::PENDING_RELOAD;
    use crate::modules::hardening::SSHD_GATE_KEY;
    use crate::modules::testing::TestHost;
    use crate::mutator::ManagedDocument;

    fn expected() -> Vec<Rule> {
        vec![
            Rule::tcp(2222, RuleAction::Limit),
            Rule::tcp(80, RuleAction::Allow),
            Rule::tcp(443, RuleAction::Allow),
        ]
    }

    /// A host whose sshd already listens on the configured port.
    fn hardened() -> TestHost {
        let t = TestHost::new();
        t.host().state.put("SSH_PORT", "2222").unwrap();
        t
    }

    #[test]
    fn test_exact_allow_list() {
        let t = hardened();
        apply(&t.host()).unwrap();

        let state = t.fake.state();
        assert!(state.firewall.active);
        assert_eq!(state.firewall.default_incoming.as_deref(), Some("deny"));
        assert_eq!(state.firewall.rules, expected());
    }

    #[test]
    fn test_before_hardening_keeps_port_22() {
        let t = TestHost::new();
        apply(&t.host()).unwrap();
        let rules = t.fake.state().firewall.rules.clone();
        assert!(rules.contains(&Rule::tcp(22, RuleAction::Limit)));
        assert!(rules.contains(&Rule::tcp(2222, RuleAction::Limit)));
    }

    #[test]
    fn test_rerun_adds_nothing() {
        let t = hardened();
        let host = t.host();
        apply(&host).unwrap();
        t.fake.take_mutations();

        apply(&host).unwrap();
        assert!(t.fake.take_mutations().is_empty());
        assert_eq!(t.fake.state().firewall.rules, expected());
    }

    #[test]
    fn test_port_change_keeps_committed_port_until_sshd_moves() {
        let mut t = hardened();
        apply(&t.host()).unwrap();

        t.ctx.ssh_port = 2200;
        apply(&t.host()).unwrap();
        let rules = t.fake.state().firewall.rules.clone();
        assert!(rules.contains(&Rule::tcp(2200, RuleAction::Limit)));
        assert!(rules.contains(&Rule::tcp(2222, RuleAction::Limit)));

        // sshd reloaded onto the new port: the old rule goes.
        t.host().state.put("SSH_PORT", "2200").unwrap();
        apply(&t.host()).unwrap();
        let rules = t.fake.state().firewall.rules.clone();
        assert!(rules.contains(&Rule::tcp(2200, RuleAction::Limit)));
        assert!(!rules.iter().any(|r| r.port == 2222));
        assert_eq!(rules.len(), 3);
    }

    #[test]
    fn test_pending_sshd_reload_keeps_old_port() {
        let t = TestHost::new();
        let host = t.host();
        host.state.put(SSHD_GATE_KEY, PENDING_RELOAD).unwrap();

        apply(&host).unwrap();
        let rules = t.fake.state().firewall.rules.clone();
        assert!(rules.contains(&Rule::tcp(22, RuleAction::Limit)));
        assert!(rules.contains(&Rule::tcp(2222, RuleAction::Limit)));
        assert_eq!(
            host.state.get("FIREWALL_SSH_PORTS").unwrap().as_deref(),
            Some("2222,22")
        );
    }

    #[test]
    fn test_manual_rule_is_cleared() {
        let t = hardened();
        apply(&t.host()).unwrap();
        t.fake
            .state()
            .firewall
            .rules
            .push(Rule::tcp(3306, RuleAction::Allow));

        apply(&t.host()).unwrap();
        assert_eq!(t.fake.state().firewall.rules, expected());
    }

    #[test]
    fn test_rebuild_restores_http_rate_limit() {
        let mut t = hardened();
        apply(&t.host()).unwrap();
        intrusion::apply(&t.host()).unwrap();
        t.host()
            .state
            .put(&ModuleId::IntrusionPrevention.complete_key(), "2026-01-01T00:00:00+00:00")
            .unwrap();

        // The port change forces a reset, which wipes before.rules.
        t.ctx.ssh_port = 2200;
        apply(&t.host()).unwrap();

        let rules = t.read(&t.paths.ufw_before_rules);
        let doc = ManagedDocument::parse(&rules).unwrap();
        assert_eq!(doc.block_count("bastion-http-ratelimit"), 1);
    }

    #[test]
    fn test_rebuild_before_intrusion_leaves_rules_alone() {
        let mut t = hardened();
        apply(&t.host()).unwrap();
        t.ctx.ssh_port = 2200;
        apply(&t.host()).unwrap();
        assert_eq!(
            t.read(&t.paths.ufw_before_rules),
            crate::modules::testing::BEFORE_RULES
        );
    }
}
