//! OpenSSH server.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::Verdict;
use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait RemoteAccessDaemon: Send + Sync {
    /// Check the configuration rooted at `main_config` without applying it.
    fn validate_config(&self, main_config: &Path) -> Result<Verdict>;

    /// Apply the on-disk configuration. Existing sessions survive.
    fn reload(&self) -> Result<()>;
}

pub struct OpenSsh {
    exec: Arc<dyn CommandExecutor>,
}

impl OpenSsh {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    fn socket_activated(&self) -> Result<bool> {
        let output = self.exec.execute(
            "systemctl",
            &["is-active".to_string(), "--quiet".to_string(), "ssh.socket".to_string()],
            LOCAL_TIMEOUT,
        )?;
        Ok(output.success)
    }
}

impl RemoteAccessDaemon for OpenSsh {
    fn validate_config(&self, main_config: &Path) -> Result<Verdict> {
        let path = main_config.to_string_lossy().to_string();
        let output = self.exec.execute(
            "sshd",
            &["-t".to_string(), "-f".to_string(), path],
            LOCAL_TIMEOUT,
        )?;
        Ok(if output.success {
            Verdict::Pass
        } else {
            Verdict::Fail(output.diagnostic())
        })
    }

    fn reload(&self) -> Result<()> {
        // Socket activation binds the port in systemd, so a port change
        // needs the socket unit regenerated and restarted.
        if self.socket_activated()? {
            info!("ssh.socket is active; restarting it to pick up the new port");
            run_checked(self.exec.as_ref(), "systemctl", &["daemon-reload"], LOCAL_TIMEOUT)?;
            run_checked(
                self.exec.as_ref(),
                "systemctl",
                &["restart", "ssh.socket"],
                LOCAL_TIMEOUT,
            )?;
            return Ok(());
        }
        run_checked(self.exec.as_ref(), "systemctl", &["reload", "ssh"], LOCAL_TIMEOUT)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};

    #[test]
    fn test_validate_reports_sshd_diagnostic() {
        let mut exec = MockCommandExecutor::new();
        exec.expect_execute()
            .withf(|cmd, args, _| cmd == "sshd" && args == ["-t", "-f", "/etc/ssh/sshd_config"])
            .returning(|_, _, _| {
                Ok(CommandOutput::failed(
                    "/etc/ssh/sshd_config.d/99-bastion.conf line 2: Badly formatted port number.",
                    255,
                ))
            });

        let sshd = OpenSsh::new(Arc::new(exec));
        match sshd.validate_config(Path::new("/etc/ssh/sshd_config")).unwrap() {
            Verdict::Fail(msg) => assert!(msg.contains("Badly formatted port")),
            Verdict::Pass => panic!("expected failure"),
        }
    }

    #[test]
    fn test_reload_plain_service() {
        let mut exec = MockCommandExecutor::new();
        exec.expect_execute()
            .withf(|_, args, _| args[0] == "is-active")
            .returning(|_, _, _| Ok(CommandOutput::failed("", 3)));
        exec.expect_execute()
            .withf(|cmd, args, _| cmd == "systemctl" && args == ["reload", "ssh"])
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::ok("")));

        OpenSsh::new(Arc::new(exec)).reload().unwrap();
    }

    #[test]
    fn test_reload_socket_activated() {
        let mut exec = MockCommandExecutor::new();
        exec.expect_execute()
            .withf(|_, args, _| args[0] == "is-active")
            .returning(|_, _, _| Ok(CommandOutput::ok("")));
        exec.expect_execute()
            .withf(|_, args, _| args == ["daemon-reload"])
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::ok("")));
        exec.expect_execute()
            .withf(|_, args, _| args == ["restart", "ssh.socket"])
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::ok("")));

        OpenSsh::new(Arc::new(exec)).reload().unwrap();
    }
}
