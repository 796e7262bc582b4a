//! Preflight command: report precondition checks.

use anyhow::Result;

use crate::preflight::{run_checks, PreflightReport};

pub fn print_report(report: &PreflightReport) {
    let status = if report.ready { "READY" } else { "NOT READY" };
    println!("Status: {}", status);
    println!();
    for check in &report.checks {
        let icon = if check.passed { "[OK]" } else { "[FAIL]" };
        println!("{} {}: {}", icon, check.name, check.message);
    }
}

pub async fn run(json: bool) -> Result<()> {
    let report = run_checks().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    report.require()
}
