//! Host packet filter (ufw).

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RuleAction {
    Allow,
    /// Allow, but drop sources that open too many connections.
    Limit,
    Deny,
}

impl RuleAction {
    fn verb(self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Limit => "limit",
            RuleAction::Deny => "deny",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// One inbound rule, e.g. `2222/tcp` rate-limited.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Rule {
    pub port: u16,
    pub proto: String,
    pub action: RuleAction,
}

impl Rule {
    pub fn tcp(port: u16, action: RuleAction) -> Self {
        Self {
            port,
            proto: "tcp".to_string(),
            action,
        }
    }

    pub fn spec(&self) -> String {
        format!("{}/{}", self.port, self.proto)
    }
}

/// Parsed `ufw status verbose`. IPv6 duplicates of IPv4 rules are folded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirewallStatus {
    pub active: bool,
    pub default_incoming: Option<String>,
    pub default_outgoing: Option<String>,
    pub rules: Vec<Rule>,
}

impl FirewallStatus {
    pub fn parse(text: &str) -> Self {
        let mut status = FirewallStatus::default();
        let mut in_table = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(state) = trimmed.strip_prefix("Status:") {
                status.active = state.trim() == "active";
            } else if let Some(defaults) = trimmed.strip_prefix("Default:") {
                // "deny (incoming), allow (outgoing), disabled (routed)"
                for part in defaults.split(',') {
                    let mut words = part.split_whitespace();
                    match (words.next(), words.next()) {
                        (Some(policy), Some("(incoming)")) => {
                            status.default_incoming = Some(policy.to_string())
                        }
                        (Some(policy), Some("(outgoing)")) => {
                            status.default_outgoing = Some(policy.to_string())
                        }
                        _ => {}
                    }
                }
            } else if trimmed.starts_with("--") {
                in_table = true;
            } else if in_table && !trimmed.is_empty() {
                if let Some(rule) = parse_rule_line(trimmed) {
                    if !status.rules.contains(&rule) {
                        status.rules.push(rule);
                    }
                }
            }
        }
        status
    }

    /// Whether the inbound rules are exactly `expected` under default-deny.
    pub fn matches(&self, expected: &[Rule]) -> bool {
        let mut have = self.rules.clone();
        let mut want = expected.to_vec();
        have.sort();
        want.sort();
        self.active && self.default_incoming.as_deref() == Some("deny") && have == want
    }
}

fn parse_rule_line(line: &str) -> Option<Rule> {
    let mut tokens = line.split_whitespace();
    let to = tokens.next()?;
    let mut action = tokens.next()?;
    if action == "(v6)" {
        action = tokens.next()?;
    }
    let action = match action {
        "ALLOW" => RuleAction::Allow,
        "LIMIT" => RuleAction::Limit,
        "DENY" | "REJECT" => RuleAction::Deny,
        _ => return None,
    };
    let (port, proto) = to.split_once('/')?;
    Some(Rule {
        port: port.parse().ok()?,
        proto: proto.to_string(),
        action,
    })
}

#[cfg_attr(test, automock)]
pub trait PacketFilter: Send + Sync {
    /// Drop every rule and disable filtering.
    fn reset(&self) -> Result<()>;
    fn set_default(&self, direction: &str, policy: &str) -> Result<()>;
    fn add_rule(&self, rule: &Rule, comment: &str) -> Result<()>;
    fn enable(&self) -> Result<()>;
    /// Re-read rule files; a no-op while disabled.
    fn reload(&self) -> Result<()>;
    fn status(&self) -> Result<FirewallStatus>;
}

pub struct Ufw {
    exec: Arc<dyn CommandExecutor>,
}

impl Ufw {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    fn ufw(&self, args: &[&str]) -> Result<String> {
        Ok(run_checked(self.exec.as_ref(), "ufw", args, LOCAL_TIMEOUT)?.stdout)
    }
}

impl PacketFilter for Ufw {
    fn reset(&self) -> Result<()> {
        self.ufw(&["--force", "reset"]).map(drop)
    }

    fn set_default(&self, direction: &str, policy: &str) -> Result<()> {
        self.ufw(&["default", policy, direction]).map(drop)
    }

    fn add_rule(&self, rule: &Rule, comment: &str) -> Result<()> {
        let spec = rule.spec();
        self.ufw(&[rule.action.verb(), &spec, "comment", comment])
            .map(drop)
    }

    fn enable(&self) -> Result<()> {
        self.ufw(&["--force", "enable"]).map(drop)
    }

    fn reload(&self) -> Result<()> {
        self.ufw(&["reload"]).map(drop)
    }

    fn status(&self) -> Result<FirewallStatus> {
        Ok(FirewallStatus::parse(&self.ufw(&["status", "verbose"])?))
    }
}
