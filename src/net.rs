//! Network checks: public address discovery and DNS readiness.

use anyhow::{Context, Result};
use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::ConfigContext;
use crate::error::ProvisionError;

const HTTP_TIMEOUT_SECS: u64 = 10;
const DNS_TIMEOUT_SECS: u64 = 5;

const IP_ECHO_SERVICES: &[&str] = &["https://api.ipify.org", "https://ifconfig.me/ip"];

/// Whether the domain points at this host, as far as ACME validation cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsStatus {
    Ready,
    NotReady(String),
}

/// Ask an echo service for this host's public address.
pub async fn public_ip() -> Result<IpAddr> {
    let client = Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .user_agent(format!("bastion/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    let mut last_error = String::new();
    for url in IP_ECHO_SERVICES {
        match fetch_ip(&client, url).await {
            Ok(ip) => {
                info!("Detected public IP {} via {}", ip, url);
                return Ok(ip);
            }
            Err(e) => {
                debug!("{} failed: {:#}", url, e);
                last_error = format!("{:#}", e);
            }
        }
    }
    Err(ProvisionError::Network(format!(
        "Could not detect the public IP ({}); pass --server-ip",
        last_error
    ))
    .into())
}

async fn fetch_ip(client: &Client, url: &str) -> Result<IpAddr> {
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    body.trim()
        .parse()
        .with_context(|| format!("Unexpected answer '{}'", body.trim()))
}

async fn resolve(name: &str) -> std::result::Result<Vec<IpAddr>, String> {
    let owned = name.to_string();
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_host(&owned));
    match tokio::time::timeout(Duration::from_secs(DNS_TIMEOUT_SECS), lookup).await {
        Ok(Ok(Ok(addrs))) => Ok(addrs),
        Ok(Ok(Err(e))) => Err(format!("{} does not resolve ({})", name, e)),
        Ok(Err(_)) => Err(format!("lookup of {} failed", name)),
        Err(_) => Err(format!("lookup of {} timed out", name)),
    }
}

/// Judge one name's resolution against the expected address.
fn judge(name: &str, expected: IpAddr, resolved: std::result::Result<Vec<IpAddr>, String>) -> Option<String> {
    match resolved {
        Err(reason) => Some(reason),
        Ok(addrs) if addrs.contains(&expected) => None,
        Ok(addrs) => {
            let seen: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
            Some(format!(
                "{} resolves to {} instead of {}",
                name,
                if seen.is_empty() { "nothing".to_string() } else { seen.join(", ") },
                expected
            ))
        }
    }
}

/// Check every server name resolves to the configured address.
pub async fn dns_status(ctx: &ConfigContext) -> DnsStatus {
    for name in ctx.server_names() {
        if let Some(reason) = judge(&name, ctx.server_ip, resolve(&name).await) {
            warn!("DNS not ready: {}", reason);
            return DnsStatus::NotReady(reason);
        }
    }
    DnsStatus::Ready
}
