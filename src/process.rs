//! Browser process lifecycle
//!
//! Launches the browser binary, scans its stderr for the DevTools endpoint
//! announcement, and manages shutdown through an atomic state machine:
//! `Initial → Starting → Started → Exiting → Killing → Exited → Disposed`.
//! Every transition is a compare-exchange on the state cell; callers that
//! lose a transition race re-dispatch against whatever state is current, so
//! no request is dropped and no entry/exit effect runs twice.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::sync::Deferred;
use crate::LaunchConfig;

const ENDPOINT_MARKER: &str = "DevTools listening on";
const MAX_CAPTURED_LINES: usize = 200;

/// Where the process is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Initial = 0,
    Starting = 1,
    Started = 2,
    Exiting = 3,
    Killing = 4,
    Exited = 5,
    Disposed = 6,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initial,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Exiting,
            4 => Self::Killing,
            5 => Self::Exited,
            _ => Self::Disposed,
        }
    }
}

/// Clonable failure stored in the start/exit cells; converted to [`Error`]
/// at the API boundary.
#[derive(Debug, Clone)]
enum ProcessFailure {
    Launch(String),
    Timeout(u64),
    Disposed,
}

impl ProcessFailure {
    fn into_error(self) -> Error {
        match self {
            Self::Launch(message) => Error::Launch(message),
            Self::Timeout(ms) => Error::LaunchTimeout(ms),
            Self::Disposed => Error::Disposed,
        }
    }
}

type StartOutcome = std::result::Result<String, ProcessFailure>;
type ExitOutcome = std::result::Result<(), ProcessFailure>;

struct ProcessShared {
    state: AtomicU8,
    kill_tx: watch::Sender<bool>,
    start_signal: Deferred<StartOutcome>,
    exit_signal: Deferred<ExitOutcome>,
    /// Generated temp profile dir; `None` once released or when caller-supplied.
    owned_user_data_dir: Mutex<Option<PathBuf>>,
    /// Captured stderr lines for launch-failure diagnostics.
    output: Mutex<Vec<String>>,
}

impl ProcessShared {
    /// Best-effort removal of the generated profile dir. The `take` makes
    /// release idempotent under concurrent exit/dispose.
    fn release_user_data_dir(&self) {
        if let Some(dir) = self.owned_user_data_dir.lock().take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::debug!(dir = %dir.display(), error = %e, "failed to remove user data dir");
            }
        }
    }

    fn captured_output(&self) -> String {
        self.output.lock().join("\n")
    }
}

/// A launched (or about-to-be-launched) browser process
pub struct BrowserProcess {
    executable: PathBuf,
    args: Vec<String>,
    start_timeout_ms: u64,
    shared: Arc<ProcessShared>,
}

impl BrowserProcess {
    /// Prepare a process from launch configuration. Nothing is spawned
    /// until [`start`](Self::start).
    pub fn new(config: &LaunchConfig) -> Result<Self> {
        let executable = match &config.executable {
            Some(path) => path.clone(),
            None => find_browser()?,
        };

        let (user_data_dir, owned) = match &config.user_data_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let dir = std::env::temp_dir().join(format!(
                    "strix-profile-{}-{:08x}",
                    std::process::id(),
                    rand::random::<u32>()
                ));
                std::fs::create_dir_all(&dir)?;
                (dir.clone(), Some(dir))
            }
        };

        let mut args = default_args(config);
        args.push("--remote-debugging-port=0".to_string());
        args.push(format!("--user-data-dir={}", user_data_dir.display()));
        args.extend(config.args.iter().cloned());

        Ok(Self::from_parts(
            executable,
            args,
            config.start_timeout_ms,
            owned,
        ))
    }

    pub(crate) fn from_parts(
        executable: PathBuf,
        args: Vec<String>,
        start_timeout_ms: u64,
        owned_user_data_dir: Option<PathBuf>,
    ) -> Self {
        let (kill_tx, _) = watch::channel(false);
        Self {
            executable,
            args,
            start_timeout_ms,
            shared: Arc::new(ProcessShared {
                state: AtomicU8::new(ProcessState::Initial as u8),
                kill_tx,
                start_signal: Deferred::new(),
                exit_signal: Deferred::new(),
                owned_user_data_dir: Mutex::new(owned_user_data_dir),
                output: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ProcessState, to: ProcessState) -> bool {
        self.shared
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The generated profile dir, while this process still owns one.
    pub fn user_data_dir(&self) -> Option<PathBuf> {
        self.shared.owned_user_data_dir.lock().clone()
    }

    /// The announced DevTools endpoint, once known.
    pub fn endpoint(&self) -> Option<String> {
        self.shared.start_signal.get().and_then(|o| o.ok())
    }

    /// Launch the process and wait for its DevTools endpoint announcement.
    ///
    /// Exactly one caller spawns; everyone else joins the same outcome, so
    /// calling `start` twice returns the same result to both callers. The
    /// start timeout is a race, not an abort: a late announcement resolves
    /// into the already-failed cell as a no-op.
    pub async fn start(&self) -> Result<String> {
        loop {
            match self.state() {
                ProcessState::Initial => {
                    if self.transition(ProcessState::Initial, ProcessState::Starting) {
                        self.spawn();
                        break;
                    }
                }
                ProcessState::Starting | ProcessState::Started => break,
                ProcessState::Exiting | ProcessState::Killing | ProcessState::Exited => {
                    // A late joiner still gets the shared start outcome.
                    if let Some(outcome) = self.shared.start_signal.get() {
                        return outcome.map_err(ProcessFailure::into_error);
                    }
                    return Err(Error::Launch("browser process already exited".to_string()));
                }
                ProcessState::Disposed => return Err(Error::Disposed),
            }
        }

        let outcome = tokio::select! {
            outcome = self.shared.start_signal.wait() => outcome,
            _ = tokio::time::sleep(Duration::from_millis(self.start_timeout_ms)) => {
                self.shared
                    .start_signal
                    .set(Err(ProcessFailure::Timeout(self.start_timeout_ms)));
                let _ = self.kill().await;
                self.shared.start_signal.wait().await
            }
        };
        outcome.map_err(ProcessFailure::into_error)
    }

    fn spawn(&self) {
        tracing::info!(executable = %self.executable.display(), "launching browser");
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared.start_signal.set(Err(ProcessFailure::Launch(format!(
                    "failed to spawn {}: {}",
                    self.executable.display(),
                    e
                ))));
                finish_exit(&self.shared);
                return;
            }
        };

        let scanner = child.stderr.take().map(|stderr| {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(scan_output(shared, stderr))
        });

        let shared = Arc::clone(&self.shared);
        let kill_rx = self.shared.kill_tx.subscribe();
        tokio::spawn(reap(shared, child, kill_rx, scanner));
    }

    /// Wait up to `timeout` for the process to exit on its own (after a
    /// graceful protocol-level close issued by the caller), then escalate
    /// to a hard kill.
    pub async fn exit(&self, timeout: Duration) -> Result<()> {
        loop {
            match self.state() {
                ProcessState::Initial => {
                    if self.transition(ProcessState::Initial, ProcessState::Exited) {
                        // No process to clean up.
                        self.shared.release_user_data_dir();
                        self.shared
                            .start_signal
                            .set(Err(ProcessFailure::Launch("browser never started".to_string())));
                        self.shared.exit_signal.set(Ok(()));
                        return Ok(());
                    }
                }
                // No graceful channel exists before the endpoint is up.
                ProcessState::Starting => return self.kill().await,
                ProcessState::Started => {
                    if self.transition(ProcessState::Started, ProcessState::Exiting) {
                        break;
                    }
                }
                ProcessState::Exiting | ProcessState::Killing | ProcessState::Disposed => break,
                ProcessState::Exited => return Ok(()),
            }
        }

        tokio::select! {
            outcome = self.shared.exit_signal.wait() => outcome.map_err(ProcessFailure::into_error),
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!("graceful exit timed out, killing browser process");
                self.kill().await
            }
        }
    }

    /// Force-terminate the process and wait for the exit path to finish.
    pub async fn kill(&self) -> Result<()> {
        loop {
            let current = self.state();
            match current {
                ProcessState::Initial => {
                    if self.transition(ProcessState::Initial, ProcessState::Exited) {
                        self.shared.release_user_data_dir();
                        self.shared
                            .start_signal
                            .set(Err(ProcessFailure::Launch("browser never started".to_string())));
                        self.shared.exit_signal.set(Ok(()));
                        return Ok(());
                    }
                }
                ProcessState::Starting | ProcessState::Started | ProcessState::Exiting => {
                    if self.transition(current, ProcessState::Killing) {
                        let _ = self.shared.kill_tx.send(true);
                        break;
                    }
                }
                ProcessState::Killing | ProcessState::Disposed => break,
                ProcessState::Exited => return Ok(()),
            }
        }

        self.shared
            .exit_signal
            .wait()
            .await
            .map_err(ProcessFailure::into_error)
    }

    /// Tear down unconditionally: force-terminate if not already exited,
    /// release the temp directory, and fail any still-pending start/exit
    /// waiters with a disposed error.
    pub fn dispose(&self) {
        let prev = ProcessState::from_u8(
            self.shared
                .state
                .swap(ProcessState::Disposed as u8, Ordering::SeqCst),
        );
        match prev {
            ProcessState::Exited | ProcessState::Disposed => {}
            ProcessState::Initial => self.shared.release_user_data_dir(),
            _ => {
                let _ = self.shared.kill_tx.send(true);
                self.shared.release_user_data_dir();
            }
        }
        self.shared.start_signal.set(Err(ProcessFailure::Disposed));
        self.shared.exit_signal.set(Err(ProcessFailure::Disposed));
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        // Never leave a browser running behind a dropped handle; the reaper
        // task finishes the exit path and releases the profile dir.
        match self.state() {
            ProcessState::Exited | ProcessState::Disposed => {}
            _ => {
                let _ = self.shared.kill_tx.send(true);
            }
        }
    }
}

/// Scan stderr for the endpoint announcement, capturing output for
/// launch-failure diagnostics and draining the pipe afterwards so the
/// browser never blocks on it.
async fn scan_output(shared: Arc<ProcessShared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    let mut announced = false;

    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!("browser stderr: {}", line);
        {
            let mut output = shared.output.lock();
            if output.len() < MAX_CAPTURED_LINES {
                output.push(line.clone());
            }
        }

        if !announced && line.contains(ENDPOINT_MARKER) {
            if let Some(idx) = line.find("ws://") {
                let endpoint = line[idx..].trim().to_string();
                tracing::info!(endpoint = %endpoint, "browser announced DevTools endpoint");
                announced = true;
                let _ = shared.state.compare_exchange(
                    ProcessState::Starting as u8,
                    ProcessState::Started as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                shared.start_signal.set(Ok(endpoint));
            }
        }
    }

    if !announced {
        shared.start_signal.set(Err(ProcessFailure::Launch(format!(
            "browser exited before announcing a DevTools endpoint:\n{}",
            shared.captured_output()
        ))));
    }
}

/// Reaper task: owns the child, applies kill requests, and funnels every
/// termination through the exit path regardless of the state it arrived
/// from, so orphaned temp directories cannot outlive the process object.
async fn reap(
    shared: Arc<ProcessShared>,
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    scanner: Option<tokio::task::JoinHandle<()>>,
) {
    let mut kill_requested = false;
    loop {
        if kill_requested {
            let _ = child.wait().await;
            break;
        }
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::debug!(%status, "browser process exited"),
                    Err(e) => tracing::warn!(error = %e, "failed to reap browser process"),
                }
                break;
            }
            changed = kill_rx.changed() => {
                if changed.is_err() || *kill_rx.borrow() {
                    tracing::debug!("force-terminating browser process");
                    let _ = child.start_kill();
                    kill_requested = true;
                }
            }
        }
    }
    // Let the scanner drain stderr to EOF first so launch-failure
    // diagnostics carry the full captured output.
    if let Some(scanner) = scanner {
        let _ = scanner.await;
    }
    finish_exit(&shared);
}

fn finish_exit(shared: &ProcessShared) {
    shared.release_user_data_dir();
    // A pre-announcement exit resolves any pending start; no-op otherwise.
    shared.start_signal.set(Err(ProcessFailure::Launch(format!(
        "browser process exited before announcing a DevTools endpoint:\n{}",
        shared.captured_output()
    ))));
    shared.exit_signal.set(Ok(()));

    loop {
        let current = ProcessState::from_u8(shared.state.load(Ordering::SeqCst));
        if matches!(current, ProcessState::Exited | ProcessState::Disposed) {
            break;
        }
        if shared
            .state
            .compare_exchange(
                current as u8,
                ProcessState::Exited as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            break;
        }
    }
}

/// Locate a Chrome/Chromium binary on this machine
pub fn find_browser() -> Result<PathBuf> {
    let candidates = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        vec![]
    };

    for candidate in candidates {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    Err(Error::BrowserNotFound)
}

/// Default automation-friendly launch flags
fn default_args(config: &LaunchConfig) -> Vec<String> {
    let mut args = vec![
        "--disable-background-networking".into(),
        "--disable-background-timer-throttling".into(),
        "--disable-backgrounding-occluded-windows".into(),
        "--disable-breakpad".into(),
        "--disable-client-side-phishing-detection".into(),
        "--disable-default-apps".into(),
        "--disable-dev-shm-usage".into(),
        "--disable-hang-monitor".into(),
        "--disable-popup-blocking".into(),
        "--disable-prompt-on-repost".into(),
        "--disable-renderer-backgrounding".into(),
        "--disable-sync".into(),
        "--metrics-recording-only".into(),
        "--no-first-run".into(),
        "--no-default-browser-check".into(),
        "--password-store=basic".into(),
        "--use-mock-keychain".into(),
        format!(
            "--window-size={},{}",
            config.window_width, config.window_height
        ),
    ];

    if config.headless {
        args.push("--headless=new".into());
    }

    args
}
