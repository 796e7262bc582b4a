//! Configuration context: the immutable per-run description of the host.
//!
//! Persisted as `KEY=value` lines (mode 0600) so standalone module runs can
//! reuse what `bastion init` collected.

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::ProvisionError;
use crate::validation::{
    validate_domain, validate_email, validate_ip, validate_ip_or_cidr, validate_ssh_port,
    validate_timezone, validate_username, validate_web_root,
};

pub const DEFAULT_CONTEXT_FILE: &str = "/etc/bastion/context.conf";

/// Everything modules need to know about the host, fixed for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigContext {
    pub domain: String,
    pub admin_email: String,
    pub server_ip: IpAddr,
    pub ssh_port: u16,
    pub deploy_user: String,
    pub timezone: String,
    pub web_root: PathBuf,
    /// Networks the intrusion-prevention daemon never bans.
    pub trusted_networks: Vec<IpNet>,
    /// Also serve and certify `www.<domain>`.
    pub include_www: bool,
}

/// Raw, unvalidated context values as collected from the operator.
#[derive(Debug, Clone, Default)]
pub struct ContextInput {
    pub domain: String,
    pub admin_email: String,
    pub server_ip: String,
    pub ssh_port: u16,
    pub deploy_user: String,
    pub timezone: String,
    pub web_root: Option<String>,
    pub trusted_networks: Vec<String>,
    pub include_www: bool,
}

impl ConfigContext {
    /// Validate raw input into a context. Nothing touches the host here.
    pub fn from_input(input: ContextInput) -> Result<Self> {
        let domain = input.domain.trim().to_ascii_lowercase();
        validate_domain(&domain)?;
        validate_email(input.admin_email.trim())?;
        let server_ip = validate_ip(input.server_ip.trim())?;
        validate_ssh_port(input.ssh_port)?;
        validate_username(&input.deploy_user)?;
        validate_timezone(&input.timezone)?;

        let web_root = match input.web_root {
            Some(root) if !root.trim().is_empty() => PathBuf::from(root.trim()),
            _ => PathBuf::from(format!("/var/www/{}", domain)),
        };
        validate_web_root(&web_root)?;

        let trusted_networks = input
            .trusted_networks
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(validate_ip_or_cidr)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domain,
            admin_email: input.admin_email.trim().to_string(),
            server_ip,
            ssh_port: input.ssh_port,
            deploy_user: input.deploy_user,
            timezone: input.timezone,
            web_root,
            trusted_networks,
            include_www: input.include_www,
        })
    }

    /// Names the certificate and the server block cover.
    pub fn server_names(&self) -> Vec<String> {
        let mut names = vec![self.domain.clone()];
        if self.include_www {
            names.push(format!("www.{}", self.domain));
        }
        names
    }

    /// Serialize to the `KEY=value` file format.
    pub fn to_file_contents(&self) -> String {
        let trusted: Vec<String> = self.trusted_networks.iter().map(|n| n.to_string()).collect();
        format!(
            "# Generated by bastion init. Re-run 'bastion init' to change.\n\
             DOMAIN={}\n\
             ADMIN_EMAIL={}\n\
             SERVER_IP={}\n\
             SSH_PORT={}\n\
             DEPLOY_USER={}\n\
             TIMEZONE={}\n\
             WEB_ROOT={}\n\
             TRUSTED_NETWORKS={}\n\
             INCLUDE_WWW={}\n",
            self.domain,
            self.admin_email,
            self.server_ip,
            self.ssh_port,
            self.deploy_user,
            self.timezone,
            self.web_root.display(),
            trusted.join(","),
            self.include_www,
        )
    }

    /// Parse and validate the `KEY=value` file format.
    pub fn parse(content: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ProvisionError::Validation(format!(
                    "Line {}: expected KEY=value, got '{}'",
                    lineno + 1,
                    line
                ))
            })?;
            values.insert(key.trim().to_string(), unquote(value.trim()).to_string());
        }

        let required = |key: &str| -> Result<String> {
            values.get(key).cloned().ok_or_else(|| {
                ProvisionError::Validation(format!("Missing {} in context file", key)).into()
            })
        };

        let ssh_port_raw = required("SSH_PORT")?;
        let ssh_port = ssh_port_raw.parse::<u16>().map_err(|_| {
            ProvisionError::Validation(format!("Invalid SSH_PORT '{}'", ssh_port_raw))
        })?;

        let include_www = match values.get("INCLUDE_WWW").map(String::as_str) {
            None | Some("") | Some("true") | Some("yes") | Some("1") => true,
            Some("false") | Some("no") | Some("0") => false,
            Some(other) => {
                return Err(ProvisionError::Validation(format!(
                    "Invalid INCLUDE_WWW '{}'",
                    other
                ))
                .into())
            }
        };

        Self::from_input(ContextInput {
            domain: required("DOMAIN")?,
            admin_email: required("ADMIN_EMAIL")?,
            server_ip: required("SERVER_IP")?,
            ssh_port,
            deploy_user: required("DEPLOY_USER")?,
            timezone: values.get("TIMEZONE").cloned().unwrap_or_else(|| "UTC".into()),
            web_root: values.get("WEB_ROOT").cloned(),
            trusted_networks: values
                .get("TRUSTED_NETWORKS")
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            include_www,
        })
    }

    /// Load the context file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read context file {:?} (run 'bastion init' first)",
                path
            )
        })?;
        Self::parse(&content).with_context(|| format!("Invalid context file {:?}", path))
    }

    /// Save the context file atomically with owner-only permissions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = path.as_ref();
        let parent_dir = path.parent().unwrap_or(Path::new("/etc/bastion"));
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create {:?}", parent_dir))?;

        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for context")?;
        temp_file
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        temp_file.write_all(self.to_file_contents().as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist context file: {:?}", path))?;

        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
pub(crate) fn sample() -> ConfigContext {
    ConfigContext::from_input(ContextInput {
        domain: "example.com".into(),
        admin_email: "admin@example.com".into(),
        server_ip: "203.0.113.10".into(),
        ssh_port: 2222,
        deploy_user: "deploy".into(),
        timezone: "UTC".into(),
        web_root: None,
        trusted_networks: vec!["198.51.100.0/24".into()],
        include_www: true,
    })
    .unwrap()
}
