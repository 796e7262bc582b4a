//! Init command: collect and persist the configuration context.

use anyhow::Result;
use tracing::info;

use super::GlobalOpts;
use crate::cli::InitArgs;
use crate::context::{ConfigContext, ContextInput};
use crate::net::public_ip;

pub async fn run(args: InitArgs, opts: &GlobalOpts) -> Result<()> {
    let server_ip = match args.server_ip {
        Some(ip) => ip,
        None => {
            info!("No --server-ip given, detecting the public address");
            public_ip().await?.to_string()
        }
    };

    let ctx = ConfigContext::from_input(ContextInput {
        domain: args.domain,
        admin_email: args.email,
        server_ip,
        ssh_port: args.ssh_port,
        deploy_user: args.deploy_user,
        timezone: args.timezone,
        web_root: args.web_root,
        trusted_networks: args.trusted_networks,
        include_www: !args.no_www,
    })?;
    ctx.save(&opts.context)?;

    println!("[OK] Context saved to {}", opts.context.display());
    println!();
    print!("{}", ctx.to_file_contents());
    println!();
    println!("Next: 'bastion preflight', then 'bastion provision'.");
    Ok(())
}
