//! Process control seam for the external target.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Spawn / terminate capability for the target process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn the target. `args` is a space-separated argument string.
    async fn spawn(&self, path: &str, args: &str, cwd: Option<&Path>) -> Result<()>;

    /// Forcefully terminate the target if this capability tracks it.
    async fn terminate(&self) -> Result<()>;
}

/// Launches the game via its launcher executable and keeps the child
/// handle for forceful termination fallback.
#[derive(Default)]
pub struct LauncherProcess {
    child: Mutex<Option<Child>>,
}

impl LauncherProcess {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessControl for LauncherProcess {
    async fn spawn(&self, path: &str, args: &str, cwd: Option<&Path>) -> Result<()> {
        let mut command = Command::new(path);
        for arg in args.split_whitespace() {
            command.arg(arg);
        }

        // Default the working directory to the executable's folder; most
        // launchers resolve assets relative to themselves.
        let workdir: Option<PathBuf> = cwd
            .map(Path::to_path_buf)
            .or_else(|| Path::new(path).parent().map(Path::to_path_buf));
        if let Some(dir) = &workdir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn launcher at {path}"))?;

        info!(path = %path, args = %args, "Launcher spawned");
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Forceful termination failed");
                return Err(e.into());
            }
            info!("Target process terminated");
        }
        Ok(())
    }
}
