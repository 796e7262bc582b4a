//! Static site on nginx: web root, security headers, per-domain server block.
//!
//! The site file, its `sites-enabled` link and the shared snippets are staged
//! together and only go live once `nginx -t` accepts them.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::{intrusion, Host, Outcome, MANAGED_HEADER};
use crate::error::{run_step, Policy};
use crate::gate::{stage_file, GateOutcome, NginxService, Revert, Staged};
use crate::mutator::{Anchor, FileMutator, ManagedDocument};
use crate::system::packages::ensure_installed;

pub const SITE_GATE_KEY: &str = "NGINX_SITE";
pub const TLS_ANCHOR: &str = "# bastion:tls-anchor";
pub const TLS_TAG: &str = "bastion-tls";

const SECURITY_HEADERS: &str = "\
add_header X-Frame-Options \"SAMEORIGIN\" always;
add_header X-Content-Type-Options \"nosniff\" always;
add_header Referrer-Policy \"strict-origin-when-cross-origin\" always;
add_header Permissions-Policy \"geolocation=(), microphone=(), camera=()\" always;
";

const LIMITS: &str = "\
limit_req_zone $binary_remote_addr zone=bastion_req:10m rate=10r/s;
server_tokens off;
";

const PLACEHOLDER: &str = "<!DOCTYPE html>
<html>
<head><meta charset=\"utf-8\"><title>Coming soon</title></head>
<body><p>This site is being set up.</p></body>
</html>
";

pub fn render_site(host: &Host<'_>) -> String {
    let headers = host.paths.host_view(&host.paths.security_headers_snippet());
    format!(
        "{header}
server {{
    listen 80;
    listen [::]:80;
    server_name {names};

    root {root};
    index index.html;

    include {headers};

    location ^~ /.well-known/acme-challenge/ {{
        default_type \"text/plain\";
        allow all;
    }}

    location / {{
        limit_req zone=bastion_req burst=20 nodelay;
        try_files $uri $uri/ =404;
    }}

    location ~ /\\. {{
        deny all;
    }}

    {anchor}
}}
",
        header = MANAGED_HEADER,
        names = host.ctx.server_names().join(" "),
        root = host.ctx.web_root.display(),
        headers = headers.display(),
        anchor = TLS_ANCHOR,
    )
}

/// The rendered site, keeping a TLS include the certificate module placed.
fn site_content(host: &Host<'_>, site: &Path) -> Result<String> {
    let rendered = render_site(host);
    let existing = match host.files.read(site)? {
        Some(text) => text,
        None => return Ok(rendered),
    };
    let tls = ManagedDocument::parse(&existing)
        .with_context(|| format!("Failed to parse {:?}", site))?
        .block_body(TLS_TAG);
    match tls {
        Some(body) => {
            let mut doc = ManagedDocument::parse(&rendered)?;
            doc.insert_block(TLS_TAG, &body, Anchor::BeforeLast(TLS_ANCHOR))?;
            Ok(doc.render())
        }
        None => Ok(rendered),
    }
}

fn stage_link(files: &FileMutator<'_>, staged: &mut Staged, target: &Path, link: &Path) -> Result<()> {
    let fs = files.fs();
    if fs.is_symlink(link) {
        let current = fs
            .read_link(link)
            .with_context(|| format!("Failed to read link {:?}", link))?;
        if current == target {
            return Ok(());
        }
        fs.remove_file(link)
            .with_context(|| format!("Failed to remove {:?}", link))?;
        staged.push(Revert::Relink {
            target: current,
            link: link.to_path_buf(),
        });
    }
    fs.symlink(target, link)
        .with_context(|| format!("Failed to link {:?}", link))?;
    staged.push(Revert::Delete(link.to_path_buf()));
    info!("Enabled {}", link.display());
    Ok(())
}

fn stage_unlink(files: &FileMutator<'_>, staged: &mut Staged, link: &Path) -> Result<()> {
    let fs = files.fs();
    if !fs.is_symlink(link) {
        return Ok(());
    }
    let target = fs
        .read_link(link)
        .with_context(|| format!("Failed to read link {:?}", link))?;
    fs.remove_file(link)
        .with_context(|| format!("Failed to remove {:?}", link))?;
    staged.push(Revert::Relink {
        target,
        link: link.to_path_buf(),
    });
    info!("Disabled {}", link.display());
    Ok(())
}

fn prepare_web_root(host: &Host<'_>) -> Result<()> {
    let root = host.paths.rooted(&host.ctx.web_root);
    let fs = host.files.fs();
    if fs.exists(&root) {
        info!("Web root {} already exists", host.ctx.web_root.display());
    } else {
        fs.create_dir_all(&root)
            .with_context(|| format!("Failed to create {:?}", root))?;
        info!("Created web root {}", host.ctx.web_root.display());
    }

    let index = root.join("index.html");
    if !fs.exists(&index) {
        host.files.write_file(&index, PLACEHOLDER, Some(0o644))?;
        host.sys
            .os
            .chown(&host.ctx.web_root, &host.ctx.deploy_user, true)?;
    }
    Ok(())
}

pub fn apply(host: &Host<'_>) -> Result<Outcome> {
    ensure_installed(host.sys.packages.as_ref(), &["nginx"])?;
    prepare_web_root(host)?;

    let paths = host.paths;
    let domain = &host.ctx.domain;
    let site = paths.site_file(domain);
    let content = site_content(host, &site)?;
    let service = NginxService {
        server: host.sys.web.as_ref(),
    };

    let outcome = host
        .gate()
        .apply(&service, SITE_GATE_KEY, |files, staged| {
            stage_file(files, staged, &paths.nginx_limits(), LIMITS, Some(0o644))?;
            stage_file(
                files,
                staged,
                &paths.security_headers_snippet(),
                SECURITY_HEADERS,
                Some(0o644),
            )?;
            stage_file(files, staged, &site, &content, Some(0o644))?;
            stage_link(files, staged, &paths.host_view(&site), &paths.site_link(domain))?;
            stage_unlink(files, staged, &paths.default_site_link())
        })
        .context("Configuring the web server")?;

    if let GateOutcome::CommitFailed(reason) = outcome {
        warn!("nginx still serves its previous configuration ({})", reason);
    }
    if !(host.sys.services.is_enabled("nginx")? && host.sys.services.is_active("nginx")?) {
        host.sys.services.enable_now("nginx")?;
    }

    // The nginx jails need nginx's log directory, which exists only now.
    if host.files.fs().exists(&paths.fail2ban_jail) {
        run_step(Policy::BestEffort, "Updating fail2ban jails", || {
            intrusion::sync_jails(host)
        })?;
    }

    host.state
        .put("WEB_ROOT", &host.ctx.web_root.display().to_string())?;
    Ok(Outcome::Complete)
}
