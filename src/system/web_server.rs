//! nginx.

use anyhow::Result;
use std::sync::Arc;

use super::Verdict;
use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait WebServer: Send + Sync {
    fn validate_config(&self) -> Result<Verdict>;
    fn reload(&self) -> Result<()>;
}

pub struct Nginx {
    exec: Arc<dyn CommandExecutor>,
}

impl Nginx {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }
}

impl WebServer for Nginx {
    fn validate_config(&self) -> Result<Verdict> {
        let output = self.exec.execute("nginx", &["-t".to_string()], LOCAL_TIMEOUT)?;
        // nginx -t writes its verdict to stderr even on success.
        Ok(if output.success {
            Verdict::Pass
        } else {
            Verdict::Fail(output.diagnostic())
        })
    }

    fn reload(&self) -> Result<()> {
        run_checked(self.exec.as_ref(), "systemctl", &["reload", "nginx"], LOCAL_TIMEOUT)?;
        Ok(())
    }
}
