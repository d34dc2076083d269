//! Update deployers
//!
//! A deployer executes a fetched payload on the device. Dispatch between
//! the variants happens in the update manager by well-known uuid; both obey
//! the same contract: return an error and the attempt counts against the
//! update's failure budget.

use crate::error::{Result, SwarmpatchError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Executes one payload path within a wall-clock budget.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, path: &Path, timeout: Duration) -> Result<()>;
}

/// Runs the payload with the system shell. Directory payloads must carry a
/// `main.sh` entry point.
pub struct ShellDeployer;

#[async_trait]
impl Deployer for ShellDeployer {
    async fn deploy(&self, path: &Path, timeout: Duration) -> Result<()> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| SwarmpatchError::Deploy(format!("{}: {e}", path.display())))?;
        let script = if meta.is_dir() {
            let main = path.join("main.sh");
            if tokio::fs::metadata(&main).await.is_err() {
                return Err(SwarmpatchError::Deploy(format!(
                    "{} has no main.sh",
                    path.display()
                )));
            }
            main
        } else {
            path.to_path_buf()
        };
        run_script(&script, timeout).await
    }
}

async fn run_script(script: &PathBuf, timeout: Duration) -> Result<()> {
    debug!("executing {} with {}s budget", script.display(), timeout.as_secs());

    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script);
    // own process group, so an expired script and its children die together
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| SwarmpatchError::Deploy(format!("cannot spawn shell: {e}")))?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(waited) => {
            let status =
                waited.map_err(|e| SwarmpatchError::Deploy(format!("wait failed: {e}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(SwarmpatchError::Deploy(format!(
                    "{} exited with {status}",
                    script.display()
                )))
            }
        }
        Err(_) => {
            warn!("{} exceeded its deployment budget", script.display());
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // kill signal to the whole process group
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.kill().await;
            Err(SwarmpatchError::Deploy(format!(
                "{} timed out after {}s",
                script.display(),
                timeout.as_secs()
            )))
        }
    }
}

/// APK (Alpine package management) deployment, reserved. The explicit
/// NotImplemented error makes an apk descriptor count as a deployment
/// failure rather than a silent success.
pub struct ApkDeployer;

#[async_trait]
impl Deployer for ApkDeployer {
    async fn deploy(&self, _path: &Path, _timeout: Duration) -> Result<()> {
        Err(SwarmpatchError::NotImplemented("apk deployer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn shell_runs_a_successful_script() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let path = script(
            &dir,
            "ok.sh",
            &format!("#!/bin/sh\ntouch {}\nexit 0\n", marker.display()),
        );

        ShellDeployer
            .deploy(&path, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "fail.sh", "#!/bin/sh\nexit 3\n");

        let err = ShellDeployer
            .deploy(&path, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmpatchError::Deploy(_)));
    }

    #[tokio::test]
    async fn directory_payload_resolves_main_sh() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir(&bundle).unwrap();
        std::fs::write(bundle.join("main.sh"), "#!/bin/sh\nexit 0\n").unwrap();

        ShellDeployer
            .deploy(&bundle, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn directory_without_main_sh_is_an_error() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir(&bundle).unwrap();

        let err = ShellDeployer
            .deploy(&bundle, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmpatchError::Deploy(_)));
    }

    #[tokio::test]
    async fn missing_payload_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = ShellDeployer
            .deploy(&dir.path().join("absent.sh"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmpatchError::Deploy(_)));
    }

    #[tokio::test]
    async fn expired_script_is_killed() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "slow.sh", "#!/bin/sh\nsleep 30\n");

        let started = std::time::Instant::now();
        let err = ShellDeployer
            .deploy(&path, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmpatchError::Deploy(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn apk_is_explicitly_not_implemented() {
        let dir = TempDir::new().unwrap();
        let err = ApkDeployer
            .deploy(dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmpatchError::NotImplemented(_)));
    }
}
