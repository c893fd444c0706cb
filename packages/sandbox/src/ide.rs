// ABOUTME: Starts, probes, queries and stops editor services inside a running sandbox
// ABOUTME: Owns the per-sandbox IDE session map and its port reservations

use crate::backends::{ResourceInfo, SandboxBackend};
use crate::error::{Result, SandboxError};
use crate::executor::{shell_quote, CommandExecutor};
use crate::retry::{poll_until, RetryError, RetryPolicy};
use crate::settings::{EditorProfile, PortRange, SandboxSettings};
use crate::types::{IdeServerInfo, IdeSession, IdeSessionStatus, SharedHandle};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// TCP probe used when an editor profile has none
const DEFAULT_PROBE: &str = "(command -v nc >/dev/null 2>&1 && nc -z 127.0.0.1 {port}) \
     || (command -v bash >/dev/null 2>&1 && bash -c 'exec 3<>/dev/tcp/127.0.0.1/{port}')";

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IdeSessionManager {
    executor: Arc<CommandExecutor>,
    backend: Arc<dyn SandboxBackend>,
    ports: PortRange,
    editors: HashMap<String, EditorProfile>,
    readiness: RetryPolicy,
    stop_wait: Duration,
    workspace_mount: String,
    runtime_dir: String,
}

impl IdeSessionManager {
    pub fn new(
        executor: Arc<CommandExecutor>,
        backend: Arc<dyn SandboxBackend>,
        settings: &SandboxSettings,
    ) -> Self {
        Self {
            executor,
            backend,
            ports: settings.ide_ports,
            editors: settings.editors.clone(),
            readiness: settings.ide_readiness.clone(),
            stop_wait: settings.ide_stop_wait,
            workspace_mount: settings.workspace_mount.clone(),
            runtime_dir: settings.runtime_dir.clone(),
        }
    }

    fn pid_file(&self, port: u16) -> String {
        format!("{}/ide-{}.pid", self.runtime_dir, port)
    }

    fn editor_file(&self, port: u16) -> String {
        format!("{}/ide-{}.editor", self.runtime_dir, port)
    }

    fn log_file(&self, port: u16) -> String {
        format!("{}/ide-{}.log", self.runtime_dir, port)
    }

    fn render(&self, template: &str, port: u16) -> String {
        template
            .replace("{port}", &port.to_string())
            .replace("{workspace}", &shell_quote(&self.workspace_mount))
    }

    fn probe_command(&self, profile: &EditorProfile, port: u16) -> String {
        self.render(profile.probe.as_deref().unwrap_or(DEFAULT_PROBE), port)
    }

    /// Start `editor_kind` on `requested_port` or the first free port in the range.
    ///
    /// Repeating the call for a session that is already running returns it unchanged.
    pub async fn setup(
        &self,
        handle: &SharedHandle,
        editor_kind: &str,
        requested_port: Option<u16>,
    ) -> Result<IdeServerInfo> {
        let profile = self.editors.get(editor_kind).ok_or_else(|| {
            let mut known: Vec<_> = self.editors.keys().map(String::as_str).collect();
            known.sort_unstable();
            SandboxError::Configuration(format!(
                "unknown editor kind '{}'; known kinds are: {}",
                editor_kind,
                known.join(", ")
            ))
        })?;

        if let Some(port) = requested_port {
            if !self.ports.contains(port) {
                return Err(SandboxError::PortConflict {
                    port,
                    reason: format!(
                        "outside the IDE port range {}-{}",
                        self.ports.start, self.ports.end
                    ),
                });
            }
        }

        let (backend_ref, resource_name) = {
            let guard = handle.read().await;
            (guard.live_ref()?, guard.resource_name.clone())
        };

        let port = match self
            .reserve(handle, editor_kind, profile, &backend_ref, requested_port)
            .await?
        {
            Reservation::Existing(info) => return Ok(info),
            Reservation::Reserved(port) => port,
        };

        info!(backend_ref = %backend_ref, port = port, editor_kind = editor_kind, "Starting IDE session");

        match self
            .launch_and_wait(&backend_ref, editor_kind, profile, port)
            .await
        {
            Ok(()) => {
                let url = match self.backend.inspect(&resource_name).await {
                    Ok(Some(resource)) => self.backend.endpoint_url(&resource, port),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(port = port, error = %e, "Could not resolve IDE url");
                        None
                    }
                };

                {
                    let mut guard = handle.write().await;
                    guard.touch();
                    if let Some(session) = guard.ide_sessions.get_mut(&port) {
                        if session.status == IdeSessionStatus::Starting {
                            session.status = IdeSessionStatus::Running;
                            session.url = url;
                            info!(port = port, editor_kind = editor_kind, "IDE session running");
                            return Ok(IdeServerInfo::from(&*session));
                        }
                    }
                }

                // Stopped while starting; the stop may have run before the pid file existed
                if let Err(kill_err) = self.terminate(&backend_ref, port).await {
                    warn!(port = port, error = %kill_err, "Failed to clean up IDE process");
                }
                Err(SandboxError::IdeStartup {
                    port,
                    message: "session was stopped during startup".to_string(),
                })
            }
            Err(e) => {
                warn!(port = port, error = %e, "IDE session failed to start");
                if let Err(kill_err) = self.terminate(&backend_ref, port).await {
                    warn!(port = port, error = %kill_err, "Failed to clean up IDE process");
                }
                let mut guard = handle.write().await;
                if let Some(session) = guard.ide_sessions.get_mut(&port) {
                    if session.status == IdeSessionStatus::Starting {
                        session.status = IdeSessionStatus::Failed;
                    }
                }
                Err(e)
            }
        }
    }

    /// Claim a port by inserting a `Starting` session, probing that nothing else listens on it.
    async fn reserve(
        &self,
        handle: &SharedHandle,
        editor_kind: &str,
        profile: &EditorProfile,
        backend_ref: &str,
        requested_port: Option<u16>,
    ) -> Result<Reservation> {
        let candidates: Vec<u16> = match requested_port {
            Some(port) => vec![port],
            None => self.ports.ports().collect(),
        };

        for port in candidates {
            {
                let mut guard = handle.write().await;

                if requested_port.is_none() {
                    let running = guard.ide_sessions.values().find(|s| {
                        s.status == IdeSessionStatus::Running && s.editor_kind == editor_kind
                    });
                    if let Some(session) = running {
                        return Ok(Reservation::Existing(IdeServerInfo::from(session)));
                    }
                }

                if let Some(existing) = guard.ide_sessions.get(&port) {
                    if existing.status == IdeSessionStatus::Running
                        && existing.editor_kind == editor_kind
                    {
                        debug!(port = port, "IDE session already running");
                        return Ok(Reservation::Existing(IdeServerInfo::from(existing)));
                    }
                    if existing.status.holds_port() {
                        if requested_port.is_some() {
                            return Err(SandboxError::PortConflict {
                                port,
                                reason: format!(
                                    "held by a {} {} session",
                                    existing.status.as_str(),
                                    existing.editor_kind
                                ),
                            });
                        }
                        continue;
                    }
                }

                guard.ide_sessions.insert(
                    port,
                    IdeSession {
                        port,
                        editor_kind: editor_kind.to_string(),
                        status: IdeSessionStatus::Starting,
                        started_at: Utc::now(),
                        url: None,
                    },
                );
            }

            if !self.port_in_use(backend_ref, profile, port).await? {
                return Ok(Reservation::Reserved(port));
            }

            handle.write().await.ide_sessions.remove(&port);
            if requested_port.is_some() {
                return Err(SandboxError::PortConflict {
                    port,
                    reason: "already bound by another process".to_string(),
                });
            }
        }

        Err(SandboxError::PortConflict {
            port: self.ports.end,
            reason: format!(
                "no free port in {}-{}",
                self.ports.start, self.ports.end
            ),
        })
    }

    async fn port_in_use(&self, backend_ref: &str, profile: &EditorProfile, port: u16) -> Result<bool> {
        let output = self
            .executor
            .run(
                backend_ref,
                &self.probe_command(profile, port),
                self.readiness.attempt_timeout,
            )
            .await?;
        Ok(output.success())
    }

    async fn launch_and_wait(
        &self,
        backend_ref: &str,
        editor_kind: &str,
        profile: &EditorProfile,
        port: u16,
    ) -> Result<()> {
        let launch = self.render(&profile.launch, port);
        let script = format!(
            "mkdir -p {rt} && cd {ws} 2>/dev/null; \
             if command -v setsid >/dev/null 2>&1; then setsid sh -c {cmd} >{log} 2>&1 </dev/null & \
             else sh -c {cmd} >{log} 2>&1 </dev/null & fi; \
             echo $! > {pid}; echo {kind} > {editor}",
            rt = shell_quote(&self.runtime_dir),
            ws = shell_quote(&self.workspace_mount),
            cmd = shell_quote(&launch),
            log = shell_quote(&self.log_file(port)),
            pid = shell_quote(&self.pid_file(port)),
            kind = shell_quote(editor_kind),
            editor = shell_quote(&self.editor_file(port)),
        );

        let launched = self.executor.run(backend_ref, &script, LAUNCH_TIMEOUT).await?;
        if !launched.success() {
            return Err(SandboxError::IdeStartup {
                port,
                message: format!(
                    "launch exited {}: {}",
                    launched.exit_code,
                    launched.stderr.trim()
                ),
            });
        }

        let probe = self.probe_command(profile, port);
        let ready = poll_until(&self.readiness, "ide readiness", |_| {
            let probe = probe.clone();
            async move {
                let output = self
                    .executor
                    .run(backend_ref, &probe, self.readiness.attempt_timeout)
                    .await?;
                Ok(output.success().then_some(()))
            }
        })
        .await;

        match ready {
            Ok(()) => Ok(()),
            Err(RetryError::Exhausted { attempts, .. }) => Err(SandboxError::IdeStartup {
                port,
                message: format!(
                    "not ready after {} attempts{}",
                    attempts,
                    self.log_tail(backend_ref, port).await
                ),
            }),
            Err(RetryError::Aborted(e)) => Err(SandboxError::IdeStartup {
                port,
                message: e.to_string(),
            }),
        }
    }

    async fn log_tail(&self, backend_ref: &str, port: u16) -> String {
        let command = format!("tail -n 20 {} 2>/dev/null", shell_quote(&self.log_file(port)));
        match self
            .executor
            .run(backend_ref, &command, Duration::from_secs(5))
            .await
        {
            Ok(output) if !output.stdout.trim().is_empty() => {
                format!("; log: {}", output.stdout.trim())
            }
            _ => String::new(),
        }
    }

    /// TERM the session's process group, wait up to the stop bound, then KILL.
    async fn terminate(&self, backend_ref: &str, port: u16) -> Result<()> {
        let wait_secs = self.stop_wait.as_secs().max(1);
        let script = format!(
            "pid=$(cat {pid} 2>/dev/null) || exit 0; [ -n \"$pid\" ] || exit 0; \
             kill -TERM -\"$pid\" 2>/dev/null || kill -TERM \"$pid\" 2>/dev/null; \
             i=0; while kill -0 -\"$pid\" 2>/dev/null || kill -0 \"$pid\" 2>/dev/null; do \
             if [ \"$i\" -ge {wait} ]; then kill -KILL -\"$pid\" 2>/dev/null || kill -KILL \"$pid\" 2>/dev/null; break; fi; \
             sleep 1; i=$((i+1)); done; rm -f {pid} {editor}",
            pid = shell_quote(&self.pid_file(port)),
            editor = shell_quote(&self.editor_file(port)),
            wait = wait_secs,
        );

        let output = self
            .executor
            .run(
                backend_ref,
                &script,
                self.stop_wait + Duration::from_secs(5),
            )
            .await?;
        if output.timed_out() {
            warn!(backend_ref = backend_ref, port = port, "IDE stop script timed out");
        }
        Ok(())
    }

    /// Session that `status` reports for `port`.
    fn selected<'a>(
        sessions: &'a BTreeMap<u16, IdeSession>,
        port: Option<u16>,
    ) -> Option<&'a IdeSession> {
        match port {
            Some(port) => sessions.get(&port),
            None => sessions.values().max_by_key(|s| s.started_at),
        }
    }

    /// Re-run the readiness probe of a `Running` session and mark it `Failed` when it no longer answers.
    pub async fn check_liveness(&self, handle: &SharedHandle, port: Option<u16>) {
        let (backend_ref, session) = {
            let guard = handle.read().await;
            let Ok(backend_ref) = guard.live_ref() else {
                return;
            };
            match Self::selected(&guard.ide_sessions, port) {
                Some(session) if session.status == IdeSessionStatus::Running => {
                    (backend_ref, session.clone())
                }
                _ => return,
            }
        };
        let Some(profile) = self.editors.get(&session.editor_kind) else {
            return;
        };

        let probe = self.probe_command(profile, session.port);
        let alive = match self
            .executor
            .run(&backend_ref, &probe, self.readiness.attempt_timeout)
            .await
        {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(port = session.port, error = %e, "IDE liveness probe could not run");
                return;
            }
        };
        if alive {
            return;
        }

        {
            let mut guard = handle.write().await;
            match guard.ide_sessions.get_mut(&session.port) {
                Some(current)
                    if current.status == IdeSessionStatus::Running
                        && current.started_at == session.started_at =>
                {
                    warn!(port = session.port, editor_kind = %session.editor_kind, "IDE session stopped answering");
                    current.status = IdeSessionStatus::Failed;
                    current.url = None;
                }
                _ => return,
            }
        }
        // Reap whatever is left of the editor so the port can be reused
        if let Err(e) = self.terminate(&backend_ref, session.port).await {
            warn!(port = session.port, error = %e, "Failed to clean up IDE process");
        }
    }

    /// Rebuild sessions for editors still running from an earlier process.
    ///
    /// Editors are found through their pid files in the runtime dir; returns the ports restored.
    pub async fn rediscover(&self, handle: &SharedHandle, resource: &ResourceInfo) -> Result<Vec<u16>> {
        let script = format!(
            "for f in {rt}/ide-*.pid; do [ -f \"$f\" ] || continue; \
             port=${{f##*/ide-}}; port=${{port%.pid}}; pid=$(cat \"$f\" 2>/dev/null); \
             [ -n \"$pid\" ] || continue; kill -0 \"$pid\" 2>/dev/null || continue; \
             echo \"$port $(cat {rt}/ide-$port.editor 2>/dev/null)\"; done; exit 0",
            rt = shell_quote(&self.runtime_dir),
        );
        let output = self
            .executor
            .run(&resource.backend_ref, &script, self.readiness.attempt_timeout)
            .await?;

        let mut restored = Vec::new();
        let mut guard = handle.write().await;
        for line in output.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(port), Some(editor_kind)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            if !self.ports.contains(port) || !self.editors.contains_key(editor_kind) {
                continue;
            }
            if guard
                .ide_sessions
                .get(&port)
                .is_some_and(|s| s.status.holds_port())
            {
                continue;
            }

            guard.ide_sessions.insert(
                port,
                IdeSession {
                    port,
                    editor_kind: editor_kind.to_string(),
                    status: IdeSessionStatus::Running,
                    started_at: Utc::now(),
                    url: self.backend.endpoint_url(resource, port),
                },
            );
            info!(port = port, editor_kind = editor_kind, "Restored running IDE session");
            restored.push(port);
        }
        restored.sort_unstable();
        Ok(restored)
    }

    /// Current state of the session on `port`, or of the most recent session when `port` is `None`.
    pub async fn status(&self, handle: &SharedHandle, port: Option<u16>) -> IdeSessionStatus {
        let guard = handle.read().await;
        if !guard.is_running() {
            return IdeSessionStatus::Stopped;
        }
        Self::selected(&guard.ide_sessions, port)
            .map(|s| s.status)
            .unwrap_or(IdeSessionStatus::Stopped)
    }

    pub async fn is_running(&self, handle: &SharedHandle, port: Option<u16>) -> bool {
        self.status(handle, port).await == IdeSessionStatus::Running
    }

    /// Stop the session on `port`, or every live session when `port` is `None`.
    ///
    /// Returns whether anything was stopped; stopping twice is harmless.
    pub async fn stop(&self, handle: &SharedHandle, port: Option<u16>) -> Result<bool> {
        let (targets, backend_ref) = {
            let guard = handle.read().await;
            let targets: Vec<u16> = guard
                .ide_sessions
                .values()
                .filter(|s| s.status.holds_port() && port.map_or(true, |p| p == s.port))
                .map(|s| s.port)
                .collect();
            let backend_ref = guard.live_ref().ok();
            (targets, backend_ref)
        };

        if targets.is_empty() {
            return Ok(false);
        }

        for &target in &targets {
            match &backend_ref {
                Some(backend_ref) => self.terminate(backend_ref, target).await?,
                None => debug!(port = target, "Sandbox not running; marking IDE session stopped"),
            }

            let mut guard = handle.write().await;
            if let Some(session) = guard.ide_sessions.get_mut(&target) {
                session.status = IdeSessionStatus::Stopped;
                session.url = None;
            }
            info!(port = target, "IDE session stopped");
        }
        Ok(true)
    }
}

enum Reservation {
    Existing(IdeServerInfo),
    Reserved(u16),
}
