//! bastion - provision a fresh Debian/Ubuntu host into a hardened web server.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use bastion::cli::{Cli, Commands};
use bastion::commands::{self, GlobalOpts};
use bastion::error::exit_code;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let opts = GlobalOpts {
        context: cli.context,
        state: cli.state,
        assume_yes: cli.yes,
    };

    let result = match cli.command {
        Commands::Init(args) => commands::init::run(args, &opts).await,
        Commands::Preflight { json } => commands::preflight::run(json).await,
        Commands::Provision => commands::provision::run(&opts).await,
        Commands::Module { id } => commands::module::run(id, &opts).await,
        Commands::Certificate { action } => commands::certificate::run(action, &opts).await,
        Commands::Status { json } => commands::status::run(json, &opts),
        Commands::Deploy(args) => commands::deploy::run(args, &opts).await,
        Commands::Version => {
            println!("bastion {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}
