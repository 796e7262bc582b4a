//! systemd unit control.

use anyhow::Result;
use std::sync::Arc;

use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait ServiceManager: Send + Sync {
    fn is_active(&self, unit: &str) -> Result<bool>;
    fn is_enabled(&self, unit: &str) -> Result<bool>;
    /// Enable at boot and start now.
    fn enable_now(&self, unit: &str) -> Result<()>;
    fn restart(&self, unit: &str) -> Result<()>;
}

pub struct Systemctl {
    exec: Arc<dyn CommandExecutor>,
}

impl Systemctl {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    fn query(&self, verb: &str, unit: &str) -> Result<bool> {
        let output = self.exec.execute(
            "systemctl",
            &[verb.to_string(), "--quiet".to_string(), unit.to_string()],
            LOCAL_TIMEOUT,
        )?;
        Ok(output.success)
    }
}

impl ServiceManager for Systemctl {
    fn is_active(&self, unit: &str) -> Result<bool> {
        self.query("is-active", unit)
    }

    fn is_enabled(&self, unit: &str) -> Result<bool> {
        self.query("is-enabled", unit)
    }

    fn enable_now(&self, unit: &str) -> Result<()> {
        run_checked(
            self.exec.as_ref(),
            "systemctl",
            &["enable", "--now", unit],
            LOCAL_TIMEOUT,
        )?;
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        run_checked(self.exec.as_ref(), "systemctl", &["restart", unit], LOCAL_TIMEOUT)?;
        Ok(())
    }
}
