// ABOUTME: Runs shell commands inside a sandbox with a hard timeout
// ABOUTME: Timed-out commands have their process group killed and report partial output

use crate::backends::{ExecConcurrency, ExecRequest, OutputChunk, SandboxBackend, StreamType};
use crate::error::{Result, SandboxError};
use crate::settings::SandboxSettings;
use crate::types::{CommandOutput, CommandStatus, TIMEOUT_EXIT_CODE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs `$1` in its own session so the whole group can be signalled, recording its pid in `$2`.
///
/// `$3` is the runtime dir, `$4` the workspace to start in.
const EXEC_WRAPPER: &str = r#"cd "$4" 2>/dev/null
mkdir -p "$3" 2>/dev/null
if command -v setsid >/dev/null 2>&1; then setsid sh -c "$1" & else sh -c "$1" & fi
pid=$!
echo "$pid" > "$2"
wait "$pid"
rc=$?
rm -f "$2"
exit "$rc""#;

/// TERM then KILL the process group recorded in `$1`.
const KILL_GROUP: &str = r#"pid=$(cat "$1" 2>/dev/null) || exit 0
[ -n "$pid" ] || exit 0
kill -TERM -"$pid" 2>/dev/null || kill -TERM "$pid" 2>/dev/null
sleep 1
kill -KILL -"$pid" 2>/dev/null || kill -KILL "$pid" 2>/dev/null
rm -f "$1"
exit 0"#;

/// Quote `value` for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub struct CommandExecutor {
    backend: Arc<dyn SandboxBackend>,
    runtime_dir: String,
    workspace_mount: String,
    kill_grace: Duration,
    /// Per-resource FIFO lanes for backends with single-exec semantics
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CommandExecutor {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: &SandboxSettings) -> Self {
        Self {
            backend,
            runtime_dir: settings.runtime_dir.clone(),
            workspace_mount: settings.workspace_mount.clone(),
            kill_grace: settings.kill_grace,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime_dir(&self) -> &str {
        &self.runtime_dir
    }

    /// Wait for this resource's turn when the backend runs one exec at a time.
    async fn turn(&self, backend_ref: &str) -> Option<OwnedMutexGuard<()>> {
        if self.backend.exec_concurrency() == ExecConcurrency::Parallel {
            return None;
        }
        let lane = {
            let mut lanes = self.lanes.lock().await;
            lanes.entry(backend_ref.to_string()).or_default().clone()
        };
        Some(lane.lock_owned().await)
    }

    /// Drop queue state for a resource that no longer exists.
    pub async fn forget(&self, backend_ref: &str) {
        self.lanes.lock().await.remove(backend_ref);
    }

    /// Run `command` through `sh -c` inside the resource.
    ///
    /// A command still running after `timeout` is killed and reported as
    /// [`CommandStatus::TimedOut`] with exit code 124; that is not an error.
    /// On single-exec backends the wait for the resource's turn counts
    /// against the same `timeout`.
    pub async fn run(
        &self,
        backend_ref: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let _turn = match tokio::time::timeout_at(deadline, self.turn(backend_ref)).await {
            Ok(turn) => turn,
            Err(_) => {
                warn!(backend_ref = backend_ref, command = command, timeout = ?timeout, "Command timed out waiting for its turn");
                return Ok(CommandOutput {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: String::new(),
                    status: CommandStatus::TimedOut,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let pid_file = format!("{}/exec-{}.pid", self.runtime_dir, Uuid::new_v4());
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let request = ExecRequest::shell(
            EXEC_WRAPPER,
            &[command, &pid_file, &self.runtime_dir, &self.workspace_mount],
        )
        .with_timeout(remaining);

        debug!(backend_ref = backend_ref, command = command, timeout = ?timeout, "Running command");
        let mut stream = self.backend.exec_stream(backend_ref, request).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let finished = tokio::time::timeout_at(deadline, async {
            while let Some(chunk) = stream.receiver.recv().await {
                append(&chunk, &mut stdout, &mut stderr);
            }
            (&mut stream.exit_code).await
        })
        .await;

        let (exit_code, status) = match finished {
            Ok(Ok(exit_code)) => (exit_code?, CommandStatus::Completed),
            Ok(Err(_)) => {
                return Err(SandboxError::Exec(
                    "exec ended without an exit code".to_string(),
                ))
            }
            Err(_) => {
                warn!(backend_ref = backend_ref, command = command, timeout = ?timeout, "Command timed out, killing process group");
                self.kill_group(backend_ref, &pid_file).await;

                // The lane stays held until the killed exec has wound down
                let drained = tokio::time::timeout(self.kill_grace, async {
                    while let Some(chunk) = stream.receiver.recv().await {
                        append(&chunk, &mut stdout, &mut stderr);
                    }
                    let _ = (&mut stream.exit_code).await;
                })
                .await;
                if drained.is_err() {
                    while let Ok(chunk) = stream.receiver.try_recv() {
                        append(&chunk, &mut stdout, &mut stderr);
                    }
                    warn!(backend_ref = backend_ref, "Timed-out exec still open after kill");
                }
                (TIMEOUT_EXIT_CODE, CommandStatus::TimedOut)
            }
        };

        let output = CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            backend_ref = backend_ref,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "Command finished"
        );
        Ok(output)
    }

    async fn kill_group(&self, backend_ref: &str, pid_file: &str) {
        let request = ExecRequest::shell(KILL_GROUP, &[pid_file]).with_timeout(self.kill_grace);
        let killed = tokio::time::timeout(self.kill_grace, async {
            self.backend.exec_stream(backend_ref, request).await?.collect().await
        })
        .await;

        match killed {
            Ok(Ok(_)) => info!(backend_ref = backend_ref, "Killed timed-out process group"),
            Ok(Err(e)) => warn!(backend_ref = backend_ref, error = %e, "Failed to kill process group"),
            Err(_) => warn!(
                backend_ref = backend_ref,
                grace = ?self.kill_grace,
                "Kill did not finish within grace period"
            ),
        }
    }
}

fn append(chunk: &OutputChunk, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) {
    match chunk.stream {
        StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
        StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_and_embedded_quotes() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_wrapper_runs_command_and_cleans_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("exec.pid");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(EXEC_WRAPPER)
            .arg("devbox")
            .arg("echo hi; exit 3")
            .arg(&pid_file)
            .arg(dir.path())
            .arg(dir.path())
            .output()
            .await
            .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hi\n");
        assert!(!pid_file.exists());
    }
}
