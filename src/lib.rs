//! # bastion - host provisioner for static-content web servers
//!
//! Turns a freshly installed Debian/Ubuntu host into a hardened web server:
//! locked-down SSH, a default-deny firewall, intrusion prevention, nginx, a
//! TLS certificate and unattended security updates. Every run is idempotent
//! and resumable; a second run against a converged host changes nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap)                                                 │
//! │    └── init, preflight, provision, module, certificate,     │
//! │        status, deploy                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sequencer                                                  │
//! │    └── hardening → firewall → intrusion-prevention →        │
//! │        web-server → certificate → updates                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Gate (validate-then-commit)   State Store (KEY=value)      │
//! │  File Mutator (backups, managed blocks, atomic writes)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators (one trait each)                             │
//! │    apt, ufw, sshd, nginx, certbot, systemctl, host OS       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`commands`] - CLI command implementations
//! - [`context`] - Configuration context (load, validate, save)
//! - [`state`] - Append-style key/value progress store
//! - [`mutator`] - Guarded file mutation
//! - [`gate`] - Validate-then-commit of staged service configuration
//! - [`modules`] - The provisioning modules
//! - [`sequencer`] - Ordered module execution and completion records
//! - [`system`] - Host collaborators (package manager, firewall, services...)
//! - [`preflight`] - Precondition checks
//! - [`deploy`] - Site transfer over rsync/SSH
//! - [`lock`] - Run lock
//! - [`signal`] - Graceful shutdown signal handling

pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod context;
pub mod deploy;
pub mod error;
pub mod fs_abstraction;
pub mod gate;
pub mod lock;
pub mod modules;
pub mod mutator;
pub mod net;
pub mod preflight;
pub mod sequencer;
pub mod signal;
pub mod state;
pub mod system;
pub mod validation;

pub use cli::{Cli, Commands};
pub use context::ConfigContext;
