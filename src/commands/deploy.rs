//! Deploy command: push a local build to the provisioned host.

use anyhow::Result;

use super::{blocking, GlobalOpts};
use crate::cli::DeployArgs;
use crate::cmd_abstraction::RealCommandExecutor;
use crate::context::ConfigContext;
use crate::deploy::{deploy, DeployTarget};
use crate::error::ProvisionError;

/// Flags win; anything missing comes from the context file.
pub fn resolve_target(args: DeployArgs, ctx: Option<&ConfigContext>) -> Result<DeployTarget> {
    let missing = |flag: &str| {
        ProvisionError::Validation(format!(
            "--{} is required when no context file is available",
            flag
        ))
    };
    let host = match (args.host, ctx) {
        (Some(h), _) => h,
        (None, Some(c)) => c.domain.clone(),
        (None, None) => return Err(missing("host").into()),
    };
    let user = match (args.user, ctx) {
        (Some(u), _) => u,
        (None, Some(c)) => c.deploy_user.clone(),
        (None, None) => return Err(missing("user").into()),
    };
    let remote_path = match (args.remote_path, ctx) {
        (Some(p), _) => p,
        (None, Some(c)) => c.web_root.display().to_string(),
        (None, None) => return Err(missing("remote-path").into()),
    };
    let port = args.port.or(ctx.map(|c| c.ssh_port)).unwrap_or(22);

    Ok(DeployTarget {
        host,
        user,
        remote_path,
        source: args.source,
        port,
        dry_run: args.dry_run,
    })
}

pub async fn run(args: DeployArgs, opts: &GlobalOpts) -> Result<()> {
    let ctx = ConfigContext::load(&opts.context).ok();
    let target = resolve_target(args, ctx.as_ref())?;
    let dry_run = target.dry_run;

    let output = blocking(move || deploy(&RealCommandExecutor::new(), &target)).await?;
    print!("{}", output.stdout);
    if dry_run {
        println!("[OK] Dry run complete, nothing was transferred");
    } else {
        println!("[OK] Deployment complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextInput;
    use std::path::PathBuf;

    fn args() -> DeployArgs {
        DeployArgs {
            host: None,
            user: None,
            remote_path: None,
            source: PathBuf::from("./public"),
            port: None,
            dry_run: false,
        }
    }

    fn ctx() -> ConfigContext {
        ConfigContext::from_input(ContextInput {
            domain: "example.com".into(),
            admin_email: "admin@example.com".into(),
            server_ip: "203.0.113.10".into(),
            ssh_port: 2222,
            deploy_user: "deploy".into(),
            timezone: "Europe/Paris".into(),
            web_root: None,
            trusted_networks: vec![],
            include_www: true,
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_target_falls_back_to_context() {
        let ctx = ctx();
        let target = resolve_target(args(), Some(&ctx)).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.user, "deploy");
        assert_eq!(target.port, 2222);
        assert_eq!(target.remote_path, ctx.web_root.display().to_string());
    }

    #[test]
    fn test_resolve_target_flags_override_context() {
        let ctx = ctx();
        let mut a = args();
        a.host = Some("203.0.113.99".into());
        a.port = Some(2200);
        let target = resolve_target(a, Some(&ctx)).unwrap();
        assert_eq!(target.host, "203.0.113.99");
        assert_eq!(target.port, 2200);
        assert_eq!(target.user, "deploy");
    }

    #[test]
    fn test_resolve_target_without_context_needs_flags() {
        let err = resolve_target(args(), None).unwrap_err();
        assert!(err.to_string().contains("--host"));
    }
}
