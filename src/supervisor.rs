//! Child process supervision
//!
//! Spawns configured start commands, relays their output into per-host
//! log ring buffers, and restarts crashed children with a growing
//! backoff. A manual stop suppresses exactly one automatic restart.

use crate::config::App;
use crate::events::{now_millis, Event, EventBus, LogStream};
use crate::health::HealthState;
use crate::router::HostRouter;
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Ring buffer capacity per host
const MAX_LOGS: usize = 500;
/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Delay between the stop and start halves of a restart
const RESTART_PAUSE: Duration = Duration::from_millis(500);
/// Exit code reported when the spawn itself failed
const SPAWN_FAILURE_CODE: i32 = 127;

const RESTART_DELAY_BASE_MS: u64 = 2_000;
const RESTART_DELAY_STEP_MS: u64 = 1_000;
const RESTART_DELAY_CAP_MS: u64 = 30_000;

const NPM_LAUNCHERS: &[&str] = &["npm", "npm.cmd", "pnpm", "pnpm.cmd", "yarn", "yarn.cmd"];
const SHELL_META: &[char] = &[
    '&', '|', '>', '<', ';', '`', '$', '(', ')', '{', '}', '[', ']',
];

/// Lifecycle state of one supervised child
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    /// Not running; eligible to start
    Idle,
    /// Start in progress
    Starting,
    /// Process is alive
    Running,
    /// Exit observed or stop requested, not yet settled
    Exiting,
    /// Waiting out the backoff delay before an automatic restart
    Restarting,
}

/// One captured output line
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    /// Milliseconds since the Unix epoch
    pub ts: u64,
    pub stream: LogStream,
    pub line: String,
}

struct ChildRuntime {
    state: ChildState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_count: u32,
    manual_stop: bool,
    kill_tx: Option<watch::Sender<bool>>,
    logs: VecDeque<LogLine>,
    dropped_logs: u64,
    health: Option<HealthState>,
}

impl ChildRuntime {
    fn new() -> Self {
        Self {
            state: ChildState::Idle,
            pid: None,
            started_at: None,
            restart_count: 0,
            manual_stop: false,
            kill_tx: None,
            logs: VecDeque::new(),
            dropped_logs: 0,
            health: None,
        }
    }

    fn push_log(&mut self, line: LogLine) {
        if self.logs.len() >= MAX_LOGS {
            self.logs.pop_front();
            self.dropped_logs += 1;
        }
        self.logs.push_back(line);
    }
}

/// Manages the child processes backing supervised apps.
///
/// Designed to live behind an `Arc`; the constructor returns `Arc<Self>`
/// because restart and log-relay tasks need shared ownership.
pub struct Supervisor {
    children: DashMap<String, Mutex<ChildRuntime>>,
    router: Arc<HostRouter>,
    bus: EventBus,
}

impl Supervisor {
    pub fn new(router: Arc<HostRouter>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            children: DashMap::new(),
            router,
            bus,
        })
    }

    pub fn state(&self, host: &str) -> Option<ChildState> {
        self.children
            .get(&host.to_lowercase())
            .map(|entry| entry.lock().state)
    }

    /// Whether the child backing `host` is up (or coming up)
    pub fn is_running(&self, host: &str) -> bool {
        matches!(
            self.state(host),
            Some(ChildState::Starting | ChildState::Running)
        )
    }

    /// Snapshot log lines starting at absolute index `from`. Returns the
    /// next index to poll from along with the lines.
    pub fn logs(&self, host: &str, from: u64) -> (u64, Vec<LogLine>) {
        let Some(entry) = self.children.get(&host.to_lowercase()) else {
            return (0, Vec::new());
        };
        let runtime = entry.lock();
        let next = runtime.dropped_logs + runtime.logs.len() as u64;
        let skip = from.saturating_sub(runtime.dropped_logs) as usize;
        let lines = runtime
            .logs
            .iter()
            .skip(skip.min(runtime.logs.len()))
            .cloned()
            .collect();
        (next, lines)
    }

    pub fn record_health(&self, host: &str, state: HealthState) {
        let entry = self
            .children
            .entry(host.to_lowercase())
            .or_insert_with(|| Mutex::new(ChildRuntime::new()));
        entry.lock().health = Some(state);
    }

    pub fn health(&self, host: &str) -> Option<HealthState> {
        self.children
            .get(&host.to_lowercase())
            .and_then(|entry| entry.lock().health.clone())
    }

    /// Start the child for `host`. Configuration problems (unknown
    /// host, disabled, port conflict, externally managed) surface as
    /// errors; a failed spawn additionally emits a synthetic exit so
    /// the restart policy applies.
    pub async fn start(self: &Arc<Self>, host: &str) -> Result<()> {
        self.do_start(host, true).await
    }

    async fn do_start(self: &Arc<Self>, host: &str, reset_backoff: bool) -> Result<()> {
        let key = host.to_lowercase();
        let app = self
            .router
            .get(&key)
            .ok_or_else(|| anyhow::anyhow!("unknown host: {key}"))?;
        if app.disabled {
            anyhow::bail!("app '{key}' is disabled");
        }
        let start_cmd = app
            .start
            .clone()
            .ok_or_else(|| anyhow::anyhow!("app '{key}' is externally managed"))?;

        {
            let entry = self
                .children
                .entry(key.clone())
                .or_insert_with(|| Mutex::new(ChildRuntime::new()));
            let mut runtime = entry.lock();
            if matches!(runtime.state, ChildState::Starting | ChildState::Running) {
                debug!(host = %key, "Child already running or starting");
                return Ok(());
            }
            runtime.state = ChildState::Starting;
            runtime.manual_stop = false;
            if reset_backoff {
                runtime.restart_count = 0;
            }
        }

        if let Some(port) = app.effective_port() {
            if let Err(e) = self.check_port_conflict(&key, port) {
                self.set_state(&key, ChildState::Idle);
                return Err(e);
            }
        }

        self.maybe_install_dependencies(&key, &app).await;

        let mut child = match self.spawn_child(&key, &app, &start_cmd) {
            Ok(child) => child,
            Err(e) => {
                error!(host = %key, error = %e, "Failed to spawn child process");
                self.handle_exit(&key, Some(SPAWN_FAILURE_CODE));
                return Err(e);
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_relay(key.clone(), LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_relay(key.clone(), LogStream::Stderr, stderr);
        }

        let (kill_tx, kill_rx) = watch::channel(false);
        {
            let entry = self
                .children
                .entry(key.clone())
                .or_insert_with(|| Mutex::new(ChildRuntime::new()));
            let mut runtime = entry.lock();
            runtime.state = ChildState::Running;
            runtime.pid = pid;
            runtime.started_at = Some(Instant::now());
            runtime.kill_tx = Some(kill_tx);
        }

        info!(host = %key, pid, "Child process started");
        self.bus.emit(Event::AppStart {
            host: key.clone(),
            pid,
        });

        self.spawn_exit_watcher(key, child, kill_rx);
        Ok(())
    }

    /// Manually stop the child for `host`, suppressing the automatic
    /// restart its exit would otherwise trigger.
    pub async fn stop(&self, host: &str) {
        let key = host.to_lowercase();
        let kill_tx = {
            let Some(entry) = self.children.get(&key) else {
                return;
            };
            let mut runtime = entry.lock();
            if !matches!(runtime.state, ChildState::Starting | ChildState::Running) {
                // Cancel a pending automatic restart as well
                if runtime.state == ChildState::Restarting {
                    runtime.state = ChildState::Idle;
                    runtime.manual_stop = false;
                }
                return;
            }
            runtime.manual_stop = true;
            runtime.state = ChildState::Exiting;
            runtime.kill_tx.clone()
        };

        info!(host = %key, "Stopping child process");
        self.bus.emit(Event::AppStop { host: key.clone() });

        if let Some(tx) = kill_tx {
            let _ = tx.send(true);
        }

        // Wait for the exit watcher to settle the state
        let deadline = Instant::now() + STOP_GRACE + Duration::from_secs(2);
        while Instant::now() < deadline {
            match self.state(&key) {
                Some(ChildState::Exiting) => {
                    tokio::time::sleep(Duration::from_millis(50)).await
                }
                _ => break,
            }
        }
    }

    /// Stop then start after a short pause
    pub async fn restart(self: &Arc<Self>, host: &str) -> Result<()> {
        self.stop(host).await;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.do_start(host, true).await
    }

    /// Forced stop plus removal of all runtime state; used when the app
    /// itself is removed.
    pub async fn remove(&self, host: &str) {
        let key = host.to_lowercase();
        self.stop(&key).await;
        self.children.remove(&key);
    }

    pub async fn stop_all(&self) {
        let hosts: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        for host in hosts {
            self.stop(&host).await;
        }
    }

    fn set_state(&self, host: &str, state: ChildState) {
        if let Some(entry) = self.children.get(host) {
            entry.lock().state = state;
        }
    }

    /// Ports owned by running children must be disjoint
    fn check_port_conflict(&self, host: &str, port: u16) -> Result<()> {
        for entry in self.children.iter() {
            if entry.key() == host {
                continue;
            }
            let running = matches!(
                entry.value().lock().state,
                ChildState::Starting | ChildState::Running
            );
            if !running {
                continue;
            }
            if self
                .router
                .get(entry.key())
                .and_then(|a| a.effective_port())
                == Some(port)
            {
                anyhow::bail!("port conflict: '{}' already owns port {}", entry.key(), port);
            }
        }
        Ok(())
    }

    /// One-shot dependency bootstrap: `npm install` when a package.json
    /// exists but the dependency directory does not. Failure is logged
    /// and does not prevent the spawn.
    async fn maybe_install_dependencies(&self, host: &str, app: &App) {
        if !app.auto_install() {
            return;
        }
        let Some(cwd) = &app.cwd else { return };
        if !cwd.join("package.json").exists() || cwd.join("node_modules").exists() {
            return;
        }

        info!(host, cwd = %cwd.display(), "Installing dependencies before first start");
        let result = Command::new(npm_command())
            .arg("install")
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => info!(host, "Dependency install complete"),
            Ok(out) => warn!(host, code = ?out.status.code(), "Dependency install failed"),
            Err(e) => warn!(host, error = %e, "Dependency install could not run"),
        }
    }

    fn spawn_child(&self, host: &str, app: &App, start_cmd: &str) -> Result<Child> {
        let tokens = tokenize(start_cmd);
        if tokens.is_empty() {
            anyhow::bail!("empty start command for '{host}'");
        }
        let tokens = resolve_command(tokens, app.cwd.as_deref());

        // npm-style launchers only resolve through a shell on Windows
        let prefer_shell = cfg!(windows) && is_npm_launcher(&tokens[0]);

        match build_command(&tokens, app, prefer_shell).spawn() {
            Ok(child) => Ok(child),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(host, command = %tokens[0], "Launcher not found, retrying without shell");
                match build_command(&tokens, app, false).spawn() {
                    Ok(child) => Ok(child),
                    Err(e2)
                        if e2.kind() == std::io::ErrorKind::NotFound
                            && is_npm_launcher(&tokens[0]) =>
                    {
                        let mut direct = tokens.clone();
                        direct[0] = Path::new(node_install_dir())
                            .join(&tokens[0])
                            .to_string_lossy()
                            .into_owned();
                        debug!(host, command = %direct[0], "Retrying via direct interpreter path");
                        build_command(&direct, app, false)
                            .spawn()
                            .with_context(|| format!("failed to spawn '{}'", direct[0]))
                    }
                    Err(e2) => Err(e2).with_context(|| format!("failed to spawn '{}'", tokens[0])),
                }
            }
            Err(e) => Err(e).with_context(|| format!("failed to spawn '{}'", tokens[0])),
        }
    }

    fn spawn_log_relay<R>(self: &Arc<Self>, host: String, stream: LogStream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                supervisor.push_log(&host, stream, line);
            }
        });
    }

    fn push_log(&self, host: &str, stream: LogStream, line: String) {
        if let Some(entry) = self.children.get(host) {
            entry.lock().push_log(LogLine {
                ts: now_millis(),
                stream,
                line: line.clone(),
            });
        }
        self.bus.emit(Event::AppLog {
            host: host.to_string(),
            stream,
            line,
        });
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        host: String,
        mut child: Child,
        mut kill_rx: watch::Receiver<bool>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = wait_for_kill(&mut kill_rx) => terminate(&host, &mut child).await,
            };
            supervisor.handle_exit(&host, status.and_then(|s| s.code()));
        });
    }

    fn handle_exit(self: &Arc<Self>, host: &str, code: Option<i32>) {
        let Some(app) = self.router.get(host) else {
            self.children.remove(host);
            return;
        };

        let manual = {
            let Some(entry) = self.children.get(host) else {
                return;
            };
            let mut runtime = entry.lock();
            runtime.state = ChildState::Exiting;
            runtime.pid = None;
            runtime.kill_tx = None;
            let manual = runtime.manual_stop;
            // One-shot flag: cleared on the transition it suppressed
            runtime.manual_stop = false;
            manual
        };

        info!(host, code = ?code, "Child process exited");
        self.bus.emit(Event::AppExit {
            host: host.to_string(),
            code,
        });

        let should_restart =
            !manual && app.auto_restart() && !app.disabled && code != Some(0);

        if !should_restart {
            self.set_state(host, ChildState::Idle);
            return;
        }

        let attempt = {
            let Some(entry) = self.children.get(host) else {
                return;
            };
            let mut runtime = entry.lock();
            runtime.restart_count += 1;
            runtime.state = ChildState::Restarting;
            runtime.restart_count
        };
        let delay = restart_delay(attempt);
        warn!(
            host,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling automatic restart"
        );

        let supervisor = Arc::clone(self);
        let host = host.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A manual stop or removal in the meantime cancels the restart
            let still_pending = supervisor
                .children
                .get(&host)
                .map(|e| e.lock().state == ChildState::Restarting)
                .unwrap_or(false);
            if !still_pending {
                return;
            }
            supervisor.set_state(&host, ChildState::Idle);
            if let Err(e) = supervisor.do_start(&host, false).await {
                error!(host = %host, error = %e, "Automatic restart failed");
            }
        });
    }
}

async fn wait_for_kill(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a kill request; never resolve
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM, bounded grace, then SIGKILL
async fn terminate(host: &str, child: &mut Child) -> Option<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        debug!(host, pid, "Sending SIGTERM");
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(host, error = %e, "Error waiting for child to exit");
            None
        }
        Err(_) => {
            warn!(
                host,
                grace_secs = STOP_GRACE.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

fn build_command(tokens: &[String], app: &App, use_shell: bool) -> Command {
    let mut cmd = if use_shell {
        #[cfg(windows)]
        {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(tokens.join(" "));
            c
        }
        #[cfg(not(windows))]
        {
            let mut c = Command::new("sh");
            c.arg("-c").arg(tokens.join(" "));
            c
        }
    } else {
        let mut c = Command::new(&tokens[0]);
        c.args(&tokens[1..]);
        c
    };

    if let Some(cwd) = &app.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.env("PATH", augmented_path());
    if std::env::var_os("NODE_ENV").is_none() {
        cmd.env("NODE_ENV", "production");
    }
    cmd
}

fn augmented_path() -> std::ffi::OsString {
    let sep = if cfg!(windows) { ";" } else { ":" };
    let current = std::env::var("PATH").unwrap_or_default();
    let mut path = String::from(node_install_dir());
    if !current.is_empty() {
        path.push_str(sep);
        path.push_str(&current);
    }
    path.into()
}

fn node_install_dir() -> &'static str {
    if cfg!(windows) {
        "C:\\Program Files\\nodejs"
    } else {
        "/usr/local/bin"
    }
}

fn npm_command() -> &'static str {
    if cfg!(windows) {
        "npm.cmd"
    } else {
        "npm"
    }
}

fn is_npm_launcher(token: &str) -> bool {
    NPM_LAUNCHERS.contains(&token)
}

/// Split a command line on whitespace, honoring single and double quotes
pub(crate) fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A start script is safe to run directly only when it carries no shell
/// syntax at all.
pub(crate) fn script_is_plain(script: &str) -> bool {
    !script.contains("&&")
        && !script.contains("||")
        && !script.chars().any(|c| SHELL_META.contains(&c))
}

/// If the command is an npm-like launcher and the package's `start`
/// script is shell-free, substitute the script body so the server runs
/// as a direct child instead of under a package-manager wrapper.
pub(crate) fn resolve_command(tokens: Vec<String>, cwd: Option<&Path>) -> Vec<String> {
    let Some(first) = tokens.first() else {
        return tokens;
    };
    if !is_npm_launcher(first) {
        return tokens;
    }
    let Some(cwd) = cwd else { return tokens };
    let Ok(raw) = std::fs::read_to_string(cwd.join("package.json")) else {
        return tokens;
    };
    let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return tokens;
    };
    let Some(script) = pkg
        .get("scripts")
        .and_then(|s| s.get("start"))
        .and_then(|s| s.as_str())
    else {
        return tokens;
    };
    if !script_is_plain(script) {
        return tokens;
    }
    let direct = tokenize(script);
    if direct.is_empty() {
        return tokens;
    }
    debug!(script, "Substituting start script for direct execution");
    direct
}

/// Backoff before automatic restart `attempt` (1-based)
pub(crate) fn restart_delay(attempt: u32) -> Duration {
    let ms = RESTART_DELAY_BASE_MS + u64::from(attempt) * RESTART_DELAY_STEP_MS;
    Duration::from_millis(ms.min(RESTART_DELAY_CAP_MS))
}
