//! Well-known file locations, optionally re-rooted for tests.

use std::path::{Path, PathBuf};

/// Absolute locations of every file bastion manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    root: PathBuf,
    pub sshd_config: PathBuf,
    pub sshd_fragment: PathBuf,
    pub root_authorized_keys: PathBuf,
    pub sysctl_hardening: PathBuf,
    pub sudoers_dir: PathBuf,
    pub ufw_before_rules: PathBuf,
    pub fail2ban_jail: PathBuf,
    pub nginx_sites_available: PathBuf,
    pub nginx_sites_enabled: PathBuf,
    pub nginx_snippets: PathBuf,
    pub nginx_conf_d: PathBuf,
    pub nginx_log_dir: PathBuf,
    pub letsencrypt_live: PathBuf,
    pub letsencrypt_hooks: PathBuf,
    pub apt_conf_dir: PathBuf,
}

impl HostPaths {
    /// The real host.
    pub fn system() -> Self {
        Self::under("/")
    }

    /// Every path below `root`; `/` gives the real host.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let at = |p: &str| root.join(p);
        Self {
            sshd_config: at("etc/ssh/sshd_config"),
            sshd_fragment: at("etc/ssh/sshd_config.d/99-bastion.conf"),
            root_authorized_keys: at("root/.ssh/authorized_keys"),
            sysctl_hardening: at("etc/sysctl.d/99-bastion-hardening.conf"),
            sudoers_dir: at("etc/sudoers.d"),
            ufw_before_rules: at("etc/ufw/before.rules"),
            fail2ban_jail: at("etc/fail2ban/jail.local"),
            nginx_sites_available: at("etc/nginx/sites-available"),
            nginx_sites_enabled: at("etc/nginx/sites-enabled"),
            nginx_snippets: at("etc/nginx/snippets"),
            nginx_conf_d: at("etc/nginx/conf.d"),
            nginx_log_dir: at("var/log/nginx"),
            letsencrypt_live: at("etc/letsencrypt/live"),
            letsencrypt_hooks: at("etc/letsencrypt/renewal-hooks"),
            apt_conf_dir: at("etc/apt/apt.conf.d"),
            root,
        }
    }

    /// Map an absolute host path (e.g. the web root) below the root.
    pub fn rooted(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(path),
        }
    }

    /// Inverse of [`rooted`](Self::rooted): the path as the host sees it.
    pub fn host_view(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => path.to_path_buf(),
        }
    }

    pub fn sudoers_dropin(&self, user: &str) -> PathBuf {
        self.sudoers_dir.join(format!("90-bastion-{}", user))
    }

    pub fn site_file(&self, domain: &str) -> PathBuf {
        self.nginx_sites_available.join(domain)
    }

    pub fn site_link(&self, domain: &str) -> PathBuf {
        self.nginx_sites_enabled.join(domain)
    }

    pub fn default_site_link(&self) -> PathBuf {
        self.nginx_sites_enabled.join("default")
    }

    pub fn security_headers_snippet(&self) -> PathBuf {
        self.nginx_snippets.join("bastion-security-headers.conf")
    }

    pub fn tls_snippet(&self, domain: &str) -> PathBuf {
        self.nginx_snippets.join(format!("bastion-tls-{}.conf", domain))
    }

    pub fn nginx_limits(&self) -> PathBuf {
        self.nginx_conf_d.join("bastion-limits.conf")
    }

    pub fn certificate_dir(&self, domain: &str) -> PathBuf {
        self.letsencrypt_live.join(domain)
    }

    pub fn auto_upgrades(&self) -> PathBuf {
        self.apt_conf_dir.join("20auto-upgrades")
    }

    pub fn unattended_upgrades(&self) -> PathBuf {
        self.apt_conf_dir.join("52bastion-unattended-upgrades")
    }
}
