//! Operating-system level chores: accounts, timezone, kernel tunables.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Verdict;
use crate::cmd_abstraction::{run_checked, CommandExecutor, LOCAL_TIMEOUT};
use crate::error::ProvisionError;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait HostOs: Send + Sync {
    fn user_exists(&self, name: &str) -> Result<bool>;
    fn create_user(&self, name: &str, groups: &[String]) -> Result<()>;
    fn home_dir(&self, name: &str) -> Result<PathBuf>;
    fn current_timezone(&self) -> Result<String>;
    fn set_timezone(&self, tz: &str) -> Result<()>;
    /// Load kernel tunables from `path`.
    fn apply_sysctl(&self, path: &Path) -> Result<()>;
    fn chown(&self, path: &Path, owner: &str, recursive: bool) -> Result<()>;
    /// Syntax-check a sudoers drop-in.
    fn check_sudoers(&self, path: &Path) -> Result<Verdict>;
}

pub struct LinuxHost {
    exec: Arc<dyn CommandExecutor>,
}

impl LinuxHost {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }
}

impl HostOs for LinuxHost {
    fn user_exists(&self, name: &str) -> Result<bool> {
        let output = self
            .exec
            .execute("id", &["-u".to_string(), name.to_string()], LOCAL_TIMEOUT)?;
        Ok(output.success)
    }

    fn create_user(&self, name: &str, groups: &[String]) -> Result<()> {
        let groups = groups.join(",");
        let mut args = vec!["--create-home", "--shell", "/bin/bash"];
        if !groups.is_empty() {
            args.push("--groups");
            args.push(groups.as_str());
        }
        args.push(name);
        run_checked(self.exec.as_ref(), "useradd", &args, LOCAL_TIMEOUT)?;
        Ok(())
    }

    fn home_dir(&self, name: &str) -> Result<PathBuf> {
        let output = run_checked(self.exec.as_ref(), "getent", &["passwd", name], LOCAL_TIMEOUT)?;
        // name:x:uid:gid:gecos:home:shell
        output
            .stdout
            .trim()
            .split(':')
            .nth(5)
            .filter(|h| h.starts_with('/'))
            .map(PathBuf::from)
            .ok_or_else(|| {
                ProvisionError::Command(format!("Unexpected passwd entry for {}", name)).into()
            })
    }

    fn current_timezone(&self) -> Result<String> {
        let output = run_checked(
            self.exec.as_ref(),
            "timedatectl",
            &["show", "--property=Timezone", "--value"],
            LOCAL_TIMEOUT,
        )?;
        Ok(output.stdout.trim().to_string())
    }

    fn set_timezone(&self, tz: &str) -> Result<()> {
        run_checked(self.exec.as_ref(), "timedatectl", &["set-timezone", tz], LOCAL_TIMEOUT)?;
        Ok(())
    }

    fn apply_sysctl(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().to_string();
        run_checked(self.exec.as_ref(), "sysctl", &["-p", path.as_str()], LOCAL_TIMEOUT)?;
        Ok(())
    }

    fn chown(&self, path: &Path, owner: &str, recursive: bool) -> Result<()> {
        let path = path.to_string_lossy().to_string();
        let spec = format!("{0}:{0}", owner);
        let mut args = Vec::new();
        if recursive {
            args.push("-R");
        }
        args.push(spec.as_str());
        args.push(path.as_str());
        run_checked(self.exec.as_ref(), "chown", &args, LOCAL_TIMEOUT)?;
        Ok(())
    }

    fn check_sudoers(&self, path: &Path) -> Result<Verdict> {
        let output = self.exec.execute(
            "visudo",
            &["-c".to_string(), "-f".to_string(), path.to_string_lossy().to_string()],
            LOCAL_TIMEOUT,
        )?;
        Ok(if output.success {
            Verdict::Pass
        } else {
            Verdict::Fail(output.diagnostic())
        })
    }
}
