//! Status command: context and recorded module progress.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use super::GlobalOpts;
use crate::context::ConfigContext;
use crate::fs_abstraction::real_fs;
use crate::gate::PENDING_RELOAD;
use crate::modules::ModuleId;
use crate::sequencer::ModuleState;
use crate::state::StateStore;

#[derive(Debug, Serialize)]
pub struct ModuleStatus {
    pub module: ModuleId,
    pub state: ModuleState,
    /// First completion time, or the skip reason.
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub context: Option<ConfigContext>,
    pub modules: Vec<ModuleStatus>,
    /// Gated services whose reload is still owed.
    pub pending_reloads: Vec<String>,
}

fn module_status(entries: &[(String, String)], id: ModuleId) -> ModuleStatus {
    let lookup = |key: String| {
        entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    };
    if let Some(at) = lookup(id.complete_key()) {
        ModuleStatus {
            module: id,
            state: ModuleState::Complete,
            detail: Some(at),
        }
    } else if let Some(reason) = lookup(id.skipped_key()) {
        ModuleStatus {
            module: id,
            state: ModuleState::Skipped,
            detail: Some(reason),
        }
    } else {
        ModuleStatus {
            module: id,
            state: ModuleState::NotStarted,
            detail: None,
        }
    }
}

pub fn collect(context_path: &Path, entries: &[(String, String)]) -> StatusReport {
    StatusReport {
        context: ConfigContext::load(context_path).ok(),
        modules: ModuleId::ORDER
            .iter()
            .map(|id| module_status(entries, *id))
            .collect(),
        pending_reloads: entries
            .iter()
            .filter(|(_, v)| v == PENDING_RELOAD)
            .map(|(k, _)| k.clone())
            .collect(),
    }
}

fn print_report(report: &StatusReport) {
    println!();
    match &report.context {
        Some(ctx) => {
            println!("Domain:      {}", ctx.server_names().join(", "));
            println!("Server IP:   {}", ctx.server_ip);
            println!("SSH port:    {}", ctx.ssh_port);
            println!("Deploy user: {}", ctx.deploy_user);
            println!("Web root:    {}", ctx.web_root.display());
        }
        None => {
            println!("bastion: NOT INITIALISED");
            println!();
            println!("Run 'bastion init' first.");
            return;
        }
    }

    println!();
    println!("Modules:");
    for m in &report.modules {
        match &m.detail {
            Some(detail) => println!("  {:<22} {:<12} {}", m.module, m.state, detail),
            None => println!("  {:<22} {}", m.module, m.state),
        }
    }

    if !report.pending_reloads.is_empty() {
        println!();
        println!(
            "Pending reloads: {} (re-run to retry)",
            report.pending_reloads.join(", ")
        );
    }
}

/// Read-only; works without root as long as the files are readable.
pub fn run(json: bool, opts: &GlobalOpts) -> Result<()> {
    let entries = StateStore::new(real_fs(), opts.state.clone()).entries()?;
    let report = collect(&opts.context, &entries);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}
