//! Base hardening: deploy account, key-only SSH on the configured port,
//! kernel tunables, timezone.
//!
//! The SSH daemon configuration is the one change that can lock the operator
//! out, so it only goes live through the validate-then-commit gate, and only
//! once the deploy account holds at least one public key.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Host, Outcome, MANAGED_HEADER};
use crate::error::{run_step, Policy, ProvisionError};
use crate::gate::{stage_file, GateOutcome, GuardedService, SshdService};
use crate::mutator::Anchor;
use crate::system::packages::ensure_installed;
use crate::system::{Rule, RuleAction, Verdict};

const PACKAGES: &[&str] = &["openssh-server", "sudo", "curl"];

pub const SSHD_GATE_KEY: &str = "SSHD_CONFIG";
const SUDOERS_GATE_KEY: &str = "SUDOERS_CONFIG";
const INCLUDE_TAG: &str = "bastion-include";
const INCLUDE_DIRECTIVE: &str = "Include /etc/ssh/sshd_config.d/*.conf";

const SYSCTL: &str = "\
net.ipv4.tcp_syncookies = 1
net.ipv4.conf.all.rp_filter = 1
net.ipv4.conf.default.rp_filter = 1
net.ipv4.conf.all.accept_redirects = 0
net.ipv4.conf.default.accept_redirects = 0
net.ipv4.conf.all.send_redirects = 0
net.ipv4.conf.all.accept_source_route = 0
net.ipv6.conf.all.accept_redirects = 0
net.ipv6.conf.all.accept_source_route = 0
net.ipv4.icmp_echo_ignore_broadcasts = 1
net.ipv4.conf.all.log_martians = 1
kernel.kptr_restrict = 2
kernel.dmesg_restrict = 1
fs.protected_hardlinks = 1
fs.protected_symlinks = 1
";

pub fn apply(host: &Host<'_>) -> Result<Outcome> {
    ensure_installed(host.sys.packages.as_ref(), PACKAGES)?;
    configure_timezone(host)?;
    ensure_deploy_user(host)?;
    install_authorized_keys(host)?;
    grant_sudo(host)?;
    apply_kernel_hardening(host)?;
    harden_sshd(host)?;
    Ok(Outcome::Complete)
}

fn configure_timezone(host: &Host<'_>) -> Result<()> {
    let wanted = &host.ctx.timezone;
    let current = host.sys.os.current_timezone()?;
    let same = current == *wanted || (wanted == "UTC" && current == "Etc/UTC");
    if same {
        info!("Timezone already {}", current);
    } else {
        host.sys.os.set_timezone(wanted)?;
        info!("Timezone set to {}", wanted);
    }
    host.state.put("TIMEZONE", wanted)?;
    Ok(())
}

fn ensure_deploy_user(host: &Host<'_>) -> Result<()> {
    let user = &host.ctx.deploy_user;
    if host.sys.os.user_exists(user)? {
        info!("User {} already exists", user);
    } else {
        host.sys.os.create_user(user, &["sudo".to_string()])?;
        info!("Created user {}", user);
    }
    host.state.put("DEPLOY_USER", user)?;
    Ok(())
}

fn deploy_keys_path(host: &Host<'_>) -> Result<PathBuf> {
    let home = host.sys.os.home_dir(&host.ctx.deploy_user)?;
    Ok(host.paths.rooted(&home).join(".ssh/authorized_keys"))
}

fn public_keys(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

/// Copy root's keys to the deploy user, then refuse to go on without one.
fn install_authorized_keys(host: &Host<'_>) -> Result<()> {
    let target = deploy_keys_path(host)?;
    let root_keys = host
        .files
        .read(&host.paths.root_authorized_keys)?
        .unwrap_or_default();

    let mut added = 0;
    for key in public_keys(&root_keys) {
        if host.files.upsert_line(&target, key)? {
            added += 1;
        }
    }

    let installed = host.files.read(&target)?.unwrap_or_default();
    if public_keys(&installed).next().is_none() {
        return Err(ProvisionError::Precondition(format!(
            "{} has no SSH public key. Add one to {} (or root's authorized_keys) \
             before password logins are disabled",
            host.ctx.deploy_user,
            host.paths.host_view(&target).display()
        ))
        .into());
    }

    if added > 0 {
        let fs = host.files.fs();
        if let Some(ssh_dir) = target.parent() {
            fs.set_permissions_mode(ssh_dir, 0o700)?;
        }
        fs.set_permissions_mode(&target, 0o600)?;
        let ssh_dir = host
            .paths
            .host_view(target.parent().unwrap_or(Path::new("/")));
        host.sys.os.chown(&ssh_dir, &host.ctx.deploy_user, true)?;
        info!("Installed {} key(s) for {}", added, host.ctx.deploy_user);
    }
    Ok(())
}

/// sudoers drop-in, syntax-checked before it can take effect.
struct SudoersCheck<'a> {
    host: &'a Host<'a>,
    path: PathBuf,
}

impl GuardedService for SudoersCheck<'_> {
    fn name(&self) -> &str {
        "sudoers"
    }

    fn validate(&self) -> Result<Verdict> {
        self.host.sys.os.check_sudoers(&self.host.paths.host_view(&self.path))
    }

    fn commit(&self) -> Result<()> {
        // sudo reads drop-ins on every invocation.
        Ok(())
    }
}

/// Key-only accounts have no password to give sudo.
fn grant_sudo(host: &Host<'_>) -> Result<()> {
    let path = host.paths.sudoers_dropin(&host.ctx.deploy_user);
    let content = format!(
        "{}\n{} ALL=(ALL) NOPASSWD:ALL\n",
        MANAGED_HEADER, host.ctx.deploy_user
    );
    let check = SudoersCheck {
        host,
        path: path.clone(),
    };
    host.gate().apply(&check, SUDOERS_GATE_KEY, |files, staged| {
        stage_file(files, staged, &path, &content, Some(0o440))
    })?;
    Ok(())
}

fn apply_kernel_hardening(host: &Host<'_>) -> Result<()> {
    let path = &host.paths.sysctl_hardening;
    let content = format!("{}\n{}", MANAGED_HEADER, SYSCTL);
    if host.files.write_file(path, &content, Some(0o644))? {
        let on_host = host.paths.host_view(path);
        run_step(Policy::BestEffort, "Applying kernel tunables", || {
            host.sys.os.apply_sysctl(&on_host)
        })?;
    }
    Ok(())
}

/// sshd must never move to a port an active firewall blocks.
fn open_ssh_port(host: &Host<'_>) -> Result<()> {
    if !host.sys.packages.is_installed("ufw")? {
        return Ok(());
    }
    let fw = host.sys.firewall.as_ref();
    let port = host.ctx.ssh_port;
    // ufw stops at the first matching rule.
    let admits = |rules: &[Rule]| {
        rules
            .iter()
            .find(|r| r.port == port)
            .is_some_and(|r| r.action != RuleAction::Deny)
    };

    let status = fw.status()?;
    if !status.active || admits(&status.rules) {
        return Ok(());
    }
    info!("Opening {}/tcp in the firewall before sshd moves there", port);
    fw.add_rule(&Rule::tcp(port, RuleAction::Limit), "ssh")?;
    if !admits(&fw.status()?.rules) {
        return Err(ProvisionError::Precondition(format!(
            "The firewall is active and does not admit port {}/tcp; sshd was not moved",
            port
        ))
        .into());
    }
    Ok(())
}

pub fn render_sshd_fragment(port: u16, user: &str) -> String {
    format!(
        "{header}
Port {port}
PermitRootLogin no
PasswordAuthentication no
KbdInteractiveAuthentication no
PubkeyAuthentication yes
PermitEmptyPasswords no
MaxAuthTries 3
LoginGraceTime 30
X11Forwarding no
AllowUsers {user}
ClientAliveInterval 300
ClientAliveCountMax 2
",
        header = MANAGED_HEADER,
        port = port,
        user = user
    )
}

fn harden_sshd(host: &Host<'_>) -> Result<()> {
    let paths = host.paths;
    if !host.files.fs().exists(&paths.sshd_config) {
        return Err(ProvisionError::Precondition(format!(
            "{} not found; is openssh-server installed?",
            paths.host_view(&paths.sshd_config).display()
        ))
        .into());
    }

    open_ssh_port(host)?;

    let fragment = render_sshd_fragment(host.ctx.ssh_port, &host.ctx.deploy_user);
    let service = SshdService {
        daemon: host.sys.sshd.as_ref(),
        main_config: paths.host_view(&paths.sshd_config),
    };

    let outcome = host
        .gate()
        .apply(&service, SSHD_GATE_KEY, |files, staged| {
            // sshd keeps the first value it reads, so the include goes on top.
            staged.track(files.stage_block_insert(
                &paths.sshd_config,
                INCLUDE_TAG,
                INCLUDE_DIRECTIVE,
                Anchor::StartOfFile,
                Some("Include /etc/ssh/sshd_config.d/"),
            )?);
            stage_file(files, staged, &paths.sshd_fragment, &fragment, Some(0o644))
        })
        .context("Hardening the SSH daemon")?;

    let port = host.ctx.ssh_port.to_string();
    let port_changed = host.state.get("SSH_PORT")?.as_deref() != Some(port.as_str());
    match outcome {
        GateOutcome::Committed | GateOutcome::Unchanged => {
            host.state.put("SSH_PORT", &port)?;
            if port_changed && outcome == GateOutcome::Committed {
                warn!(
                    "SSH now listens on port {}. Keep this session open and check a new login: \
                     ssh -p {} {}@{}",
                    host.ctx.ssh_port, host.ctx.ssh_port, host.ctx.deploy_user, host.ctx.server_ip
                );
            }
        }
        GateOutcome::CommitFailed(reason) => {
            warn!(
                "sshd still runs its previous configuration ({}); the firewall keeps the old port open",
                reason
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::{TestHost, ROOT_KEY, SSHD_CONFIG};
    use crate::mutator::ManagedDocument;

    #[test]
    fn test_fragment_content() {
        let fragment = render_sshd_fragment(2222, "deploy");
        assert!(fragment.contains("\nPort 2222\n"));
        assert!(fragment.contains("PermitRootLogin no"));
        assert!(fragment.contains("PasswordAuthentication no"));
        assert!(fragment.contains("AllowUsers deploy"));
    }

    #[test]
    fn test_first_run() {
        let t = TestHost::new();
        let host = t.host();
        assert_eq!(apply(&host).unwrap(), Outcome::Complete);

        assert_eq!(
            t.read(&t.paths.sshd_fragment),
            render_sshd_fragment(2222, "deploy")
        );
        // Stock Debian config already includes the drop-in directory.
        assert_eq!(t.read(&t.paths.sshd_config), SSHD_CONFIG);

        let keys = t.read(&t.paths.rooted(Path::new("/home/deploy/.ssh/authorized_keys")));
        assert_eq!(keys, format!("{}\n", ROOT_KEY));

        let state = t.fake.state();
        assert!(state.users.contains_key("deploy"));
        assert_eq!(state.timezone, "Etc/UTC");
        assert!(state.installed.contains("openssh-server"));
        assert!(state.mutations.iter().any(|m| m == "reload ssh"));
        drop(state);

        assert_eq!(host.state.get("SSH_PORT").unwrap().as_deref(), Some("2222"));
        assert_eq!(host.state.get(SSHD_GATE_KEY).unwrap().as_deref(), Some("committed"));
        assert!(t
            .read(&t.paths.sudoers_dropin("deploy"))
            .contains("deploy ALL=(ALL) NOPASSWD:ALL"));
    }

    #[test]
    fn test_include_added_on_top_when_missing() {
        let t = TestHost::new();
        std::fs::write(&t.paths.sshd_config, "Port 22\nUsePAM yes\n").unwrap();
        apply(&t.host()).unwrap();

        let content = t.read(&t.paths.sshd_config);
        assert!(content.starts_with("# BEGIN bastion-include\nInclude /etc/ssh/sshd_config.d/*.conf\n"));
        assert!(ManagedDocument::parse(&content).unwrap().has_block("bastion-include"));
    }

    #[test]
    fn test_rejected_fragment_is_reverted_and_fatal() {
        let t = TestHost::new();
        t.fake.state().sshd_verdict =
            Verdict::Fail("line 2: Badly formatted port number.".into());
        std::fs::write(&t.paths.sshd_config, "Port 22\n").unwrap();

        let err = apply(&t.host()).unwrap_err();
        assert!(format!("{:#}", err).contains("Badly formatted port"));
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::StagedConfigRejected { .. })
        ));

        assert!(!t.paths.sshd_fragment.exists());
        assert_eq!(t.read(&t.paths.sshd_config), "Port 22\n");
        assert!(!t.fake.state().mutations.iter().any(|m| m == "reload ssh"));
    }

    #[test]
    fn test_refuses_without_any_key() {
        let t = TestHost::new();
        std::fs::write(&t.paths.root_authorized_keys, "# no keys yet\n").unwrap();

        let err = apply(&t.host()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Precondition(_))
        ));
        assert!(!t.paths.sshd_fragment.exists());
    }

    #[test]
    fn test_kernel_tunables_written() {
        let t = TestHost::new();
        let host = t.host();
        apply(&host).unwrap();
        assert!(t.read(&t.paths.sysctl_hardening).contains("net.ipv4.tcp_syncookies = 1"));
    }

    #[test]
    fn test_reload_failure_keeps_going() {
        let t = TestHost::new();
        t.fake.state().failing_reloads.insert("ssh".into());
        let host = t.host();

        assert_eq!(apply(&host).unwrap(), Outcome::Complete);
        assert!(t.paths.sshd_fragment.exists());
        assert_eq!(
            host.state.get(SSHD_GATE_KEY).unwrap().as_deref(),
            Some(crate::gate::PENDING_RELOAD)
        );
        assert!(host.state.get("SSH_PORT").unwrap().is_none());
    }

    #[test]
    fn test_port_change_opens_firewall_first() {
        let mut t = TestHost::new();
        apply(&t.host()).unwrap();
        crate::modules::firewall::apply(&t.host()).unwrap();
        t.fake.take_mutations();

        t.ctx.ssh_port = 2200;
        apply(&t.host()).unwrap();

        let mutations = t.fake.take_mutations();
        let opened = mutations.iter().position(|m| m == "ufw limit 2200/tcp").unwrap();
        let reloaded = mutations.iter().position(|m| m == "reload ssh").unwrap();
        assert!(opened < reloaded);

        let rules = t.fake.state().firewall.rules.clone();
        assert!(rules.contains(&Rule::tcp(2200, RuleAction::Limit)));
        assert!(rules.contains(&Rule::tcp(2222, RuleAction::Limit)));
    }

    #[test]
    fn test_blocked_port_refuses_to_move_sshd() {
        let mut t = TestHost::new();
        apply(&t.host()).unwrap();
        crate::modules::firewall::apply(&t.host()).unwrap();
        t.fake
            .state()
            .firewall
            .rules
            .push(Rule::tcp(2200, RuleAction::Deny));
        t.fake.take_mutations();

        t.ctx.ssh_port = 2200;
        let err = apply(&t.host()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Precondition(_))
        ));
        assert!(t.read(&t.paths.sshd_fragment).contains("Port 2222"));
        assert!(!t.fake.take_mutations().iter().any(|m| m == "reload ssh"));
    }

    #[test]
    fn test_inactive_firewall_is_left_alone() {
        let t = TestHost::new();
        apply(&t.host()).unwrap();
        assert!(!t
            .fake
            .state()
            .mutations
            .iter()
            .any(|m| m.starts_with("ufw")));
    }
}
