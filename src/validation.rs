//! Centralized validation functions for bastion.
//!
//! Every value that ends up in a generated configuration file or on a command
//! line passes through here first, so nothing reaches the host unvalidated.

use anyhow::Result;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::path::{Component, Path};
use std::sync::OnceLock;

use crate::error::ProvisionError;

fn invalid(msg: String) -> anyhow::Error {
    ProvisionError::Validation(msg).into()
}

fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
            .expect("static regex")
    })
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,63}$").expect("static regex")
    })
}

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("static regex"))
}

fn timezone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:UTC|[A-Z][A-Za-z_+-]+(?:/[A-Za-z0-9_+-]+){1,2})$").expect("static regex")
    })
}

/// Validate a fully-qualified domain name (lowercase, at least one dot).
///
/// # Examples
/// ```
/// use bastion::validation::validate_domain;
/// assert!(validate_domain("example.com").is_ok());
/// assert!(validate_domain("localhost").is_err());
/// ```
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.len() > 253 || !domain_regex().is_match(domain) {
        return Err(invalid(format!(
            "Invalid domain '{}'. Use a lowercase fully-qualified name like 'example.com'",
            domain
        )));
    }
    Ok(())
}

/// Validate an administrator e-mail address.
pub fn validate_email(email: &str) -> Result<()> {
    if email.len() > 254 || !email_regex().is_match(email) || email.contains("..") {
        return Err(invalid(format!("Invalid e-mail address '{}'", email)));
    }
    Ok(())
}

/// Validate an IP address string and return the parsed IpAddr.
pub fn validate_ip(ip_str: &str) -> Result<IpAddr> {
    ip_str
        .parse()
        .map_err(|_| invalid(format!("Invalid IP address: {}", ip_str)))
}

/// Validate an IP address or CIDR string and return the parsed IpNet.
///
/// A plain address becomes a /32 (IPv4) or /128 (IPv6) network.
pub fn validate_ip_or_cidr(ip_str: &str) -> Result<IpNet> {
    if ip_str.contains('/') {
        ip_str
            .parse()
            .map_err(|_| invalid(format!("Invalid CIDR: {}", ip_str)))
    } else {
        Ok(IpNet::from(validate_ip(ip_str)?))
    }
}

/// Validate the SSH port. 80 and 443 are reserved for the web server.
pub fn validate_ssh_port(port: u16) -> Result<()> {
    match port {
        0 => Err(invalid("SSH port cannot be 0".to_string())),
        80 | 443 => Err(invalid(format!(
            "SSH port {} collides with the web server",
            port
        ))),
        _ => Ok(()),
    }
}

/// Validate a POSIX account name for the deploy user.
pub fn validate_username(name: &str) -> Result<()> {
    if name == "root" {
        return Err(invalid("Deploy user cannot be root".to_string()));
    }
    if !username_regex().is_match(name) {
        return Err(invalid(format!(
            "Invalid user name '{}'. Use lowercase letters, digits, '_' or '-'",
            name
        )));
    }
    Ok(())
}

/// Validate an IANA timezone name (`UTC` or `Area/City`).
pub fn validate_timezone(tz: &str) -> Result<()> {
    if !timezone_regex().is_match(tz) || tz.contains("..") {
        return Err(invalid(format!(
            "Invalid timezone '{}'. Use 'UTC' or an 'Area/City' name",
            tz
        )));
    }
    Ok(())
}

/// Validate the web root: absolute, no `..`, not `/` itself.
pub fn validate_web_root(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(invalid(format!(
            "Web root must be an absolute path: {}",
            path.display()
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid(format!(
            "Web root must not contain '..': {}",
            path.display()
        )));
    }
    if path.parent().is_none() {
        return Err(invalid("Web root cannot be '/'".to_string()));
    }
    let text = path.to_string_lossy();
    if text.chars().any(|c| c.is_whitespace() || c == ';' || c == '{' || c == '}') {
        return Err(invalid(format!(
            "Web root contains characters not allowed in nginx configuration: {}",
            text
        )));
    }
    Ok(())
}
