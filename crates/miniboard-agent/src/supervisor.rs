use std::{
    ffi::OsString,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use miniboard_process::{InstanceId, InstanceSpec, InstanceState, InstanceStatus, LogChunk};
use tokio::{
    process::{Child, ChildStdin},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backup::{self, BackupLayout, BackupOutcome},
    error::SupervisorError,
    log_relay::{LogRelay, LogSink},
    marker::{self, Marker, RunRecord},
    platform::{self, ProcessControl},
    provision,
    settings::SupervisorSettings,
};

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn validate_spec(spec: &InstanceSpec) -> Result<(), SupervisorError> {
    let invalid = |field: &'static str, reason: &str| SupervisorError::InvalidSpec {
        field,
        reason: reason.to_string(),
    };

    if spec.instance_id.0.trim().is_empty() {
        return Err(invalid("instance_id", "must not be empty"));
    }
    if spec.port == 0 {
        return Err(invalid("port", "must be between 1 and 65535"));
    }
    if spec.save.is_empty() {
        return Err(invalid("save", "must not be empty"));
    }
    if spec.save.starts_with('.') {
        return Err(invalid("save", "must not start with a dot"));
    }
    if !spec
        .save
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-'))
    {
        return Err(invalid(
            "save",
            "only letters, digits, spaces, '_', '.' and '-' are allowed",
        ));
    }
    Ok(())
}

/// Caller-side view of a run: enough to cancel it and wait for it, nothing more.
struct RunHandle {
    instance_id: InstanceId,
    pid: u32,
    token: CancellationToken,
    worker: JoinHandle<()>,
}

impl RunHandle {
    fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.worker.is_finished()
    }

    /// Cancelled, but still writing its final backup or draining output.
    fn is_winding_down(&self) -> bool {
        self.token.is_cancelled() && !self.worker.is_finished()
    }
}

/// Runs at most one game-server process at a time.
///
/// The running phase is owned by a background task; this object only holds the
/// cancellation token, the status channel and the log queue, so every query is
/// answered without touching the child.
pub struct InstanceSupervisor {
    settings: Arc<SupervisorSettings>,
    control: Arc<dyn ProcessControl>,
    run: Mutex<Option<RunHandle>>,
    status: Arc<watch::Sender<InstanceStatus>>,
    log_tx: mpsc::UnboundedSender<LogChunk>,
    log_rx: std::sync::Mutex<mpsc::UnboundedReceiver<LogChunk>>,
}

impl InstanceSupervisor {
    pub fn new(settings: SupervisorSettings) -> Result<Self, SupervisorError> {
        Ok(Self::with_control(settings, platform::detect()?))
    }

    pub fn with_control(settings: SupervisorSettings, control: Arc<dyn ProcessControl>) -> Self {
        let (status, _) = watch::channel(InstanceStatus::idle());
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        tracing::debug!(control = control.name(), "instance supervisor ready");
        Self {
            settings: Arc::new(settings),
            control,
            run: Mutex::new(None),
            status: Arc::new(status),
            log_tx,
            log_rx: std::sync::Mutex::new(log_rx),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceStatus> {
        self.status.subscribe()
    }

    /// Next relayed chunk, if any. Never waits.
    pub fn read_log(&self) -> Option<LogChunk> {
        let mut rx = match self.log_rx.lock() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };
        rx.try_recv().ok()
    }

    /// Whether the current run's process still exists.
    pub fn is_alive(&self) -> bool {
        let st = self.status.borrow();
        st.state.is_live() && st.pid.is_some_and(|pid| self.control.is_alive(pid))
    }

    pub async fn start(&self, spec: InstanceSpec) -> Result<InstanceStatus, SupervisorError> {
        let mut run = self.run.lock().await;
        if let Some(prev) = run.as_mut() {
            if prev.is_winding_down() {
                // The old worker still publishes status and log chunks; let it finish first.
                let budget = self.settings.stop_budget();
                match tokio::time::timeout(budget, &mut prev.worker).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::error!(error = %err, "instance worker failed"),
                    Err(_) => tracing::warn!(
                        pid = prev.pid,
                        "previous run still finishing after stop budget"
                    ),
                }
            }
            if prev.is_active() || prev.is_winding_down() {
                return Err(SupervisorError::AlreadyActive {
                    instance_id: prev.instance_id.clone(),
                    pid: prev.pid,
                });
            }
        }

        validate_spec(&spec)?;
        platform::check_binary(&self.settings.binary).await?;

        let previous = self.status.send_replace(InstanceStatus::for_spec(
            &spec,
            InstanceState::Starting,
        ));

        match self.launch(&spec).await {
            Ok(handle) => {
                *run = Some(handle);
                Ok(self.status())
            }
            Err(err) => {
                tracing::warn!(
                    instance_id = %spec.instance_id,
                    code = err.code(),
                    error = %err,
                    "start failed"
                );
                self.status.send_replace(previous);
                Err(err)
            }
        }
    }

    pub async fn stop(&self) -> Result<InstanceStatus, SupervisorError> {
        let mut run = self.run.lock().await;
        let Some(handle) = run.as_mut().filter(|r| r.is_active()) else {
            return Err(SupervisorError::NoActiveInstance);
        };

        tracing::info!(instance_id = %handle.instance_id, pid = handle.pid, "stop requested");
        handle.token.cancel();

        let budget = self.settings.stop_budget();
        match tokio::time::timeout(budget, &mut handle.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "instance worker failed");
                self.status.send_modify(|st| {
                    st.state = InstanceState::Stopped;
                    st.error = Some(format!("supervisor worker failed: {err}"));
                });
            }
            Err(_) => {
                tracing::warn!(
                    budget_ms = budget.as_millis() as u64,
                    "worker still busy after stop budget"
                );
                let mut st = self.status();
                st.message = Some(format!(
                    "stop still in progress after {}s",
                    budget.as_secs()
                ));
                return Ok(st);
            }
        }

        *run = None;
        Ok(self.status())
    }

    async fn launch(&self, spec: &InstanceSpec) -> Result<RunHandle, SupervisorError> {
        let settings = &self.settings;
        let mut sink = LogSink::new(self.log_tx.clone());
        if let Some(path) = &settings.console_log {
            sink = sink.with_console_log(
                path.clone(),
                settings.log_file_max_bytes,
                settings.log_file_max_files,
            );
        }

        let wait_for_pid = self.recover_orphan(&sink).await;
        let config = provision::ensure_port_config(&settings.config_dir, spec.port).await?;

        let args = launch_args(settings, spec, &config, wait_for_pid);
        let mut cmd = tokio::process::Command::new(&settings.binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.control.configure(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            binary: settings.binary.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                binary: settings.binary.clone(),
                source: std::io::Error::other("process exited before its pid was observed"),
            });
        };

        tracing::info!(
            instance_id = %spec.instance_id,
            pid,
            port = spec.port,
            save = %spec.save,
            "server spawned"
        );

        if let Err(err) = marker::write(&settings.pid_file, pid).await {
            tracing::warn!(path = %settings.pid_file.display(), %err, "failed to write pid marker");
            sink.notice(format!("warning: pid marker not written: {err}"));
        }
        let record = RunRecord {
            instance_id: spec.instance_id.0.clone(),
            port: spec.port,
            save: spec.save.clone(),
            started_at_unix_ms: now_unix_ms(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: Some(pid),
            wait_for_pid,
            exec: settings.binary.display().to_string(),
            args: args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
        };
        if let Err(err) = marker::write_run_record(&settings.run_record_path(), &record).await {
            tracing::warn!(error = %format!("{err:#}"), "failed to write run record");
        }

        let relay = LogRelay::attach(
            sink.clone(),
            child.stdout.take(),
            child.stderr.take(),
            settings.log_chunk_bytes,
        );

        self.status.send_modify(|st| {
            st.state = InstanceState::Running;
            st.pid = Some(pid);
            st.message = wait_for_pid
                .map(|old| format!("waiting for previous server (pid {old}) to close"));
        });

        let token = CancellationToken::new();
        let worker = Worker {
            settings: self.settings.clone(),
            control: self.control.clone(),
            status: self.status.clone(),
            sink,
            backup: BackupLayout::new(settings, &spec.save),
            stdin: child.stdin.take(),
            child,
            pid,
            token: token.clone(),
            relay,
        };

        Ok(RunHandle {
            instance_id: spec.instance_id.clone(),
            pid,
            token,
            worker: tokio::spawn(worker.run()),
        })
    }

    /// Ask a server left over from an earlier agent to close, and return its
    /// pid so the new one can wait for it.
    async fn recover_orphan(&self, sink: &LogSink) -> Option<u32> {
        let path = &self.settings.pid_file;
        let pid = match marker::read(path).await {
            Marker::Absent => return None,
            Marker::Unreadable(reason) => {
                tracing::warn!(path = %path.display(), %reason, "ignoring pid marker");
                return None;
            }
            Marker::Pid(pid) if pid <= 1 || pid == std::process::id() => {
                tracing::warn!(path = %path.display(), pid, "ignoring pid marker");
                return None;
            }
            Marker::Pid(pid) => pid,
        };

        sink.notice(format!(
            "a previous server may still be running (pid {pid}), asking it to close"
        ));
        match self.control.interrupt(pid) {
            Ok(()) => tracing::info!(pid, "interrupted previous server"),
            Err(err) => tracing::warn!(pid, %err, "could not signal previous server"),
        }
        tokio::time::sleep(self.settings.orphan_grace).await;
        Some(pid)
    }
}

fn launch_args(
    settings: &SupervisorSettings,
    spec: &InstanceSpec,
    config: &std::path::Path,
    wait_for_pid: Option<u32>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--config".into(),
        config.into(),
        "--start-server".into(),
        settings.save_path(&spec.save).into(),
        "--autosave-interval".into(),
        settings.autosave_interval_min.to_string().into(),
    ];
    if let Some(pid) = wait_for_pid {
        args.push("--wait-to-close".into());
        args.push(pid.to_string().into());
    }
    args
}

enum Ending {
    Exited(ExitStatus),
    Killed(Option<ExitStatus>),
    Unresolved(String),
}

/// Owns everything mutable about a run until the process is gone.
struct Worker {
    settings: Arc<SupervisorSettings>,
    control: Arc<dyn ProcessControl>,
    status: Arc<watch::Sender<InstanceStatus>>,
    sink: LogSink,
    backup: BackupLayout,
    // Held open for the server console; dropped with the worker.
    stdin: Option<ChildStdin>,
    child: Child,
    pid: u32,
    token: CancellationToken,
    relay: LogRelay,
}

impl Worker {
    async fn run(mut self) {
        let period = self.settings.backup_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let crashed = loop {
            tokio::select! {
                _ = self.token.cancelled() => break None,
                res = self.child.wait() => break Some(res),
                _ = ticker.tick() => self.backup_pass().await,
            }
        };

        let mut exit_code = None;
        let mut error = None;
        let mut message = None;
        match crashed {
            Some(res) => {
                // Nobody asked it to stop.
                self.token.cancel();
                let what = match res {
                    Ok(st) => {
                        exit_code = st.code();
                        format!("server exited unexpectedly ({st})")
                    }
                    Err(err) => format!("lost track of the server process: {err}"),
                };
                tracing::error!(pid = self.pid, "{what}");
                self.sink.notice(format!("[ERROR] {what}"));
                error = Some(what);
            }
            None => match self.shutdown().await {
                Ending::Exited(st) => exit_code = st.code(),
                Ending::Killed(st) => {
                    exit_code = st.and_then(|s| s.code());
                    message = Some("server ignored the interrupt and was killed".to_string());
                }
                Ending::Unresolved(why) => message = Some(why),
            },
        }

        self.backup_pass().await;
        drop(self.stdin.take());
        self.relay.finish(self.settings.relay_drain_timeout).await;

        self.status.send_modify(|st| {
            st.state = InstanceState::Stopped;
            st.exit_code = exit_code;
            st.error = error;
            st.message = message;
        });
        tracing::info!(pid = self.pid, ?exit_code, "run finished");
    }

    async fn shutdown(&mut self) -> Ending {
        self.status.send_modify(|st| {
            st.state = InstanceState::Stopping;
            st.message = Some("stopping".to_string());
        });
        self.sink.notice("stop requested, interrupting server");
        if let Err(err) = self.control.interrupt_group(self.pid) {
            tracing::warn!(pid = self.pid, %err, "interrupt failed");
        }

        let grace = self.settings.stop_grace;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(st)) => return Ending::Exited(st),
            Ok(Err(err)) => {
                return Ending::Unresolved(format!("could not wait for server: {err}"));
            }
            Err(_) => {}
        }

        if !self.settings.force_kill {
            tracing::warn!(
                pid = self.pid,
                grace_ms = grace.as_millis() as u64,
                "server still running after interrupt"
            );
            return Ending::Unresolved(format!(
                "server (pid {}) still running {}ms after interrupt",
                self.pid,
                grace.as_millis()
            ));
        }

        self.sink
            .notice(format!("server did not exit within {}ms, killing it", grace.as_millis()));
        if let Err(err) = self.control.kill_group(self.pid) {
            tracing::warn!(pid = self.pid, %err, "kill failed");
        }
        match tokio::time::timeout(self.settings.force_kill_wait, self.child.wait()).await {
            Ok(Ok(st)) => Ending::Killed(Some(st)),
            Ok(Err(_)) => Ending::Killed(None),
            Err(_) => Ending::Unresolved(format!(
                "server (pid {}) survived SIGKILL; check it manually",
                self.pid
            )),
        }
    }

    async fn backup_pass(&mut self) {
        match backup::run_pass_logged(self.backup.clone()).await {
            Ok(BackupOutcome::Copied { source, .. }) => {
                let at = now_unix_ms();
                self.status
                    .send_modify(|st| st.last_backup_unix_ms = Some(at));
                self.sink.notice(format!(
                    "save {} rotated from {}",
                    self.backup.save,
                    source.display()
                ));
            }
            Ok(BackupOutcome::Skipped { reason }) => {
                self.sink.notice(format!("backup skipped: {reason}"));
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "backup pass failed");
                self.sink.notice(format!("warning: backup failed: {err:#}"));
            }
        }
    }
}
