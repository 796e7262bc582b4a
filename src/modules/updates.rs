//! Automatic security updates through unattended-upgrades.

use anyhow::Result;
use tracing::info;

use super::{Host, Outcome, MANAGED_HEADER};
use crate::system::packages::ensure_installed;

const UNIT: &str = "unattended-upgrades";

const AUTO_UPGRADES: &str = "\
APT::Periodic::Update-Package-Lists \"1\";
APT::Periodic::Download-Upgradeable-Packages \"1\";
APT::Periodic::AutocleanInterval \"7\";
APT::Periodic::Unattended-Upgrade \"1\";
";

pub fn render_policy(admin_email: &str) -> String {
    format!(
        "// {header}
Unattended-Upgrade::Mail \"{email}\";
Unattended-Upgrade::MailReport \"on-change\";
Unattended-Upgrade::AutoFixInterruptedDpkg \"true\";
Unattended-Upgrade::MinimalSteps \"true\";
Unattended-Upgrade::Remove-Unused-Kernel-Packages \"true\";
Unattended-Upgrade::Remove-Unused-Dependencies \"true\";
Unattended-Upgrade::Automatic-Reboot \"false\";
",
        header = MANAGED_HEADER.trim_start_matches("# "),
        email = admin_email
    )
}

pub fn apply(host: &Host<'_>) -> Result<Outcome> {
    ensure_installed(host.sys.packages.as_ref(), &[UNIT])?;

    let periodic = host
        .files
        .write_file(&host.paths.auto_upgrades(), AUTO_UPGRADES, Some(0o644))?;
    let policy = host.files.write_file(
        &host.paths.unattended_upgrades(),
        &render_policy(&host.ctx.admin_email),
        Some(0o644),
    )?;
    if !periodic && !policy {
        info!("Automatic updates already configured");
    }

    let services = host.sys.services.as_ref();
    if !(services.is_enabled(UNIT)? && services.is_active(UNIT)?) {
        services.enable_now(UNIT)?;
        info!("Enabled {}", UNIT);
    }
    Ok(Outcome::Complete)
}
