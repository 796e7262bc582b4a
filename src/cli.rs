//! CLI argument parsing with clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::context::DEFAULT_CONTEXT_FILE;
use crate::modules::ModuleId;
use crate::state::DEFAULT_STATE_FILE;

#[derive(Parser)]
#[command(name = "bastion")]
#[command(author, version, about = "Provision a fresh Debian/Ubuntu host into a hardened static web server")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration context file
    #[arg(long, default_value = DEFAULT_CONTEXT_FILE, global = true)]
    pub context: PathBuf,

    /// Provisioning state file
    #[arg(long, default_value = DEFAULT_STATE_FILE, global = true)]
    pub state: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to confirmation prompts
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Collect, validate and save the configuration context
    Init(InitArgs),

    /// Check privileges, OS, disk space and network reachability
    Preflight {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run every module in order
    Provision,

    /// Run a single module
    Module {
        #[arg(value_enum)]
        id: ModuleId,
    },

    /// Certificate lifecycle
    Certificate {
        #[command(subcommand)]
        action: CertificateAction,
    },

    /// Show the context and per-module state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sync a local build directory to the web root
    Deploy(DeployArgs),

    /// Show version
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Domain served by this host
    #[arg(long)]
    pub domain: String,

    /// Administrator contact (ACME account, update reports)
    #[arg(long)]
    pub email: String,

    /// Public address of this host (detected when omitted)
    #[arg(long)]
    pub server_ip: Option<String>,

    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,

    #[arg(long, default_value = "deploy")]
    pub deploy_user: String,

    #[arg(long, default_value = "UTC")]
    pub timezone: String,

    /// Web root (default: /var/www/<domain>)
    #[arg(long)]
    pub web_root: Option<String>,

    /// Network never banned by fail2ban (repeatable)
    #[arg(long = "trusted-network")]
    pub trusted_networks: Vec<String>,

    /// Do not serve or certify www.<domain>
    #[arg(long)]
    pub no_www: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Remote host (default: the context's domain)
    #[arg(long)]
    pub host: Option<String>,

    /// Remote user (default: the context's deploy user)
    #[arg(long)]
    pub user: Option<String>,

    /// Remote path (default: the context's web root)
    #[arg(long)]
    pub remote_path: Option<String>,

    /// Local build directory
    #[arg(long, default_value = "./public")]
    pub source: PathBuf,

    /// SSH port (default: the context's SSH port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Show what would be transferred without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateAction {
    /// Obtain the certificate and enable TLS
    Obtain {
        /// Re-issue even when a valid certificate exists (asks first)
        #[arg(long)]
        force_renewal: bool,
    },
    /// Simulate a renewal
    RenewTest,
    /// Revoke the certificate and fall back to plain HTTP (asks first)
    Revoke,
    /// Show certificate metadata
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses_help() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_version_command() {
        let cli = Cli::try_parse_from(["bastion", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["bastion", "provision"]).unwrap();
        assert_eq!(cli.context, PathBuf::from("/etc/bastion/context.conf"));
        assert_eq!(cli.state, PathBuf::from("/var/lib/bastion/state.conf"));
        assert!(!cli.yes);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_init() {
        let cli = Cli::try_parse_from([
            "bastion",
            "init",
            "--domain",
            "example.com",
            "--email",
            "admin@example.com",
            "--ssh-port",
            "2222",
            "--trusted-network",
            "198.51.100.0/24",
            "--trusted-network",
            "192.0.2.7",
            "--no-www",
        ])
        .unwrap();
        match cli.command {
            Commands::Init(args) => {
                assert_eq!(args.domain, "example.com");
                assert_eq!(args.ssh_port, 2222);
                assert_eq!(args.deploy_user, "deploy");
                assert_eq!(args.timezone, "UTC");
                assert!(args.server_ip.is_none());
                assert_eq!(args.trusted_networks.len(), 2);
                assert!(args.no_www);
            }
            _ => panic!("Expected Init command"),
        }
    }

    #[test]
    fn test_cli_init_requires_domain() {
        assert!(Cli::try_parse_from(["bastion", "init", "--email", "a@example.com"]).is_err());
    }

    #[test]
    fn test_cli_module_names() {
        let cli = Cli::try_parse_from(["bastion", "module", "intrusion-prevention"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Module {
                id: ModuleId::IntrusionPrevention
            }
        ));
        assert!(Cli::try_parse_from(["bastion", "module", "database"]).is_err());
    }

    #[test]
    fn test_cli_certificate_actions() {
        let cli =
            Cli::try_parse_from(["bastion", "certificate", "obtain", "--force-renewal"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Certificate {
                action: CertificateAction::Obtain {
                    force_renewal: true
                }
            }
        ));

        let cli = Cli::try_parse_from(["bastion", "certificate", "renew-test"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Certificate {
                action: CertificateAction::RenewTest
            }
        ));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "bastion",
            "certificate",
            "revoke",
            "--yes",
            "--context",
            "/tmp/context.conf",
        ])
        .unwrap();
        assert!(cli.yes);
        assert_eq!(cli.context, PathBuf::from("/tmp/context.conf"));
    }

    #[test]
    fn test_cli_deploy() {
        let cli = Cli::try_parse_from(["bastion", "deploy", "--dry-run", "--source", "dist"]).unwrap();
        match cli.command {
            Commands::Deploy(args) => {
                assert!(args.dry_run);
                assert_eq!(args.source, PathBuf::from("dist"));
                assert!(args.host.is_none());
            }
            _ => panic!("Expected Deploy command"),
        }
    }
}
