//! Intrusion prevention: fail2ban jails plus a packet-filter rate limit on
//! new web connections.

use anyhow::Result;
use tracing::info;

use super::{Host, Outcome, MANAGED_HEADER};
use crate::mutator::Anchor;
use crate::system::packages::ensure_installed;

const UNIT: &str = "fail2ban";
const RATE_LIMIT_TAG: &str = "bastion-http-ratelimit";

/// New connections per source to ports 80/443: at most 60 per 10 s.
const RATE_LIMIT_RULES: &str = "\
-A ufw-before-input -p tcp -m multiport --dports 80,443 -m conntrack --ctstate NEW -m recent --name bastion_http --set
-A ufw-before-input -p tcp -m multiport --dports 80,443 -m conntrack --ctstate NEW -m recent --name bastion_http --update --seconds 10 --hitcount 60 -j DROP";

pub fn render_jail(host: &Host<'_>, with_web_jails: bool) -> String {
    let mut ignore = vec!["127.0.0.1/8".to_string(), "::1".to_string()];
    ignore.extend(host.ctx.trusted_networks.iter().map(|n| n.to_string()));

    let mut jail = format!(
        "{header}
[DEFAULT]
bantime  = 1h
findtime = 10m
maxretry = 5
banaction = ufw
ignoreip = {ignore}

[sshd]
enabled = true
port    = {port}
backend = systemd
mode    = aggressive
",
        header = MANAGED_HEADER,
        ignore = ignore.join(" "),
        port = host.ctx.ssh_port,
    );

    // fail2ban refuses to start when a jail's log file is missing.
    if with_web_jails {
        for (name, log) in [
            ("nginx-http-auth", "error.log"),
            ("nginx-limit-req", "error.log"),
            ("nginx-botsearch", "access.log"),
        ] {
            jail.push_str(&format!(
                "\n[{name}]\nenabled = true\nport    = http,https\nlogpath = /var/log/nginx/{log}\nbackend = auto\n",
                name = name,
                log = log
            ));
        }
    }
    jail
}

/// Bring jail.local in line with the host. Restarts fail2ban on change.
pub fn sync_jails(host: &Host<'_>) -> Result<bool> {
    let with_web = host.files.fs().exists(&host.paths.nginx_log_dir);
    let jail = render_jail(host, with_web);
    let changed = host
        .files
        .write_file(&host.paths.fail2ban_jail, &jail, Some(0o644))?;
    if changed {
        host.sys.services.restart(UNIT)?;
        info!("fail2ban restarted with updated jails");
    }
    Ok(changed)
}

/// Weave the web rate limit into before.rules. Does not reload ufw.
pub fn ensure_rate_limit(host: &Host<'_>) -> Result<bool> {
    host.files.insert_block(
        &host.paths.ufw_before_rules,
        RATE_LIMIT_TAG,
        RATE_LIMIT_RULES,
        Anchor::BeforeLast("COMMIT"),
        Some("--name bastion_http"),
    )
}

pub fn apply(host: &Host<'_>) -> Result<Outcome> {
    ensure_installed(host.sys.packages.as_ref(), &[UNIT, "ufw"])?;

    sync_jails(host)?;
    if !(host.sys.services.is_enabled(UNIT)? && host.sys.services.is_active(UNIT)?) {
        host.sys.services.enable_now(UNIT)?;
    }

    if ensure_rate_limit(host)? {
        host.sys.firewall.reload()?;
    }
    Ok(Outcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::modules::testing::{TestHost, BEFORE_RULES};
    use crate::mutator::ManagedDocument;

    #[test]
    fn test_jail_mentions_port_and_trusted_networks() {
        let t = TestHost::new();
        let jail = render_jail(&t.host(), true);
        assert!(jail.contains("port    = 2222"));
        assert!(jail.contains("ignoreip = 127.0.0.1/8 ::1 198.51.100.0/24"));
        assert!(jail.contains("[nginx-botsearch]"));
        assert!(!render_jail(&t.host(), false).contains("[nginx-"));
    }

    #[test]
    fn test_apply_inserts_one_block_before_commit() {
        let t = TestHost::new();
        let host = t.host();
        apply(&host).unwrap();
        apply(&host).unwrap();

        let rules = t.read(&t.paths.ufw_before_rules);
        let mut doc = ManagedDocument::parse(&rules).unwrap();
        assert_eq!(doc.block_count(RATE_LIMIT_TAG), 1);
        assert!(rules.find("# END bastion-http-ratelimit").unwrap() < rules.rfind("COMMIT").unwrap());
        doc.remove_block(RATE_LIMIT_TAG);
        assert_eq!(doc.render(), BEFORE_RULES);

        let reloads = t
            .fake
            .state()
            .mutations
            .iter()
            .filter(|m| *m == "reload ufw")
            .count();
        assert_eq!(reloads, 1);
    }

    #[test]
    fn test_second_run_restarts_nothing() {
        let t = TestHost::new();
        let host = t.host();
        apply(&host).unwrap();
        t.fake.take_mutations();
        apply(&host).unwrap();
        assert!(t.fake.take_mutations().is_empty());
    }

    #[test]
    fn test_missing_commit_anchor_is_fatal() {
        let t = TestHost::new();
        std::fs::write(&t.paths.ufw_before_rules, "*filter\n").unwrap();
        let err = apply(&t.host()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::MissingAnchor { .. })
        ));
        assert_eq!(t.read(&t.paths.ufw_before_rules), "*filter\n");
    }
}
