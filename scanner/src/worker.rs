/*!
Hardware worker child process.

The worker speaks the protocol on its stdin/stdout; its stderr is passed
through so driver diagnostics reach the operator's terminal.
*/

use crate::codec::Codec;
use shared::{Result, ScannerError};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

pub struct WorkerProcess {
    executable: PathBuf,
    child: Child,
    codec: Codec,
}

impl WorkerProcess {
    /// Launch the worker and attach a codec to its pipes
    pub fn spawn(executable: &Path, args: &[String], timeout: Duration) -> Result<Self> {
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScannerError::process(format!("failed to start {}: {}", executable.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScannerError::process("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScannerError::process("worker stdout was not captured"))?;

        info!(
            "🚀 Started worker {} (pid {})",
            executable.display(),
            child.id().unwrap_or_default()
        );

        Ok(Self {
            executable: executable.to_path_buf(),
            child,
            codec: Codec::with_timeout(stdout, stdin, timeout),
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec.clone()
    }

    /// Close the worker's stdin and give it `grace` to exit before killing it.
    /// Returns the exit status when the worker stopped on its own.
    pub async fn shutdown(mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        self.codec.close_input();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("Worker {} exited: {}", self.executable.display(), status);
                Ok(Some(status))
            }
            Err(_) => {
                warn!("Worker {} did not exit; killing it", self.executable.display());
                self.child.kill().await?;
                Ok(None)
            }
        }
    }
}
