//! Supervision of one external packaging process.
//!
//! The process is owned by a background task. Output and the final result
//! reach the caller as [`SupervisorEvent`]s over an unbounded channel, so the
//! caller never waits on the child's pipes. Stopping is cooperative first
//! (the running flag is cleared, then SIGTERM) and forced after the grace
//! period.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::model::{Command, ProcessResult, RunOutcome};

/// Default wait between a graceful stop request and a forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Error-bearing lines kept for the failure excerpt.
pub const DEFAULT_EXCERPT_LINES: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const STOP_SLACK: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("A packaging process is already running")]
    AlreadyRunning,
}

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Terminated,
    Killed,
    Completed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Killed | Self::Completed)
    }
}

/// Messages from the supervising task, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// One line of combined output
    Progress(String),

    /// Recent error-bearing lines, sent once before a failed result
    ErrorExcerpt(String),

    /// Terminal result; always the last event
    Finished(ProcessResult),
}

/// True when a line mentions an error or a failure.
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error") || lower.contains("fail")
}

/// Bounded window over the most recent error-bearing lines.
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl ErrorWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Keeps `line` if it is error-bearing.
    pub fn observe(&mut self, line: &str) {
        if self.capacity == 0 || !is_error_line(line) {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Spawns and supervises packaging processes, one at a time.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    slot: Arc<Semaphore>,
    grace_period: Duration,
    excerpt_lines: usize,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            grace_period: DEFAULT_GRACE_PERIOD,
            excerpt_lines: DEFAULT_EXCERPT_LINES,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_excerpt_lines(mut self, lines: usize) -> Self {
        self.excerpt_lines = lines;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Starts supervising `command` on a background task.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] while a previous run from
    /// this supervisor is still active.
    pub fn start(&self, command: Command) -> Result<RunHandle, SupervisorError> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| SupervisorError::AlreadyRunning)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(true);
        let (state_tx, state_rx) = watch::channel(RunState::Idle);

        let run = SupervisedRun {
            events: events_tx,
            running: running_rx,
            state: state_tx,
            grace_period: self.grace_period,
            errors: ErrorWindow::new(self.excerpt_lines),
            _permit: permit,
        };
        let task = tokio::spawn(run.run(command));

        Ok(RunHandle {
            events: events_rx,
            stopper: StopHandle {
                running: Arc::new(running_tx),
                state: state_rx,
                grace_period: self.grace_period,
            },
            task,
        })
    }
}

/// Caller side of a run: the event stream plus a way to stop it.
#[derive(Debug)]
pub struct RunHandle {
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    stopper: StopHandle,
    task: JoinHandle<ProcessResult>,
}

impl RunHandle {
    /// Next event; `None` after [`SupervisorEvent::Finished`] was delivered.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        self.events.recv().await
    }

    pub fn stopper(&self) -> StopHandle {
        self.stopper.clone()
    }

    pub fn state(&self) -> RunState {
        self.stopper.state()
    }

    pub async fn stop(&self) {
        self.stopper.stop().await;
    }

    /// Waits for the run to end, discarding undelivered events.
    pub async fn wait(self) -> ProcessResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => ProcessResult::from_outcome(
                RunOutcome::LaunchFailure {
                    reason: format!("supervisor task failed: {}", e),
                },
                Vec::new(),
            ),
        }
    }
}

/// Cloneable stop control for a run.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<watch::Sender<bool>>,
    state: watch::Receiver<RunState>,
    grace_period: Duration,
}

impl StopHandle {
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Requests termination and waits until the process is gone.
    ///
    /// Returns within the grace period plus a small slack. Calling it on a
    /// run that is not running does nothing.
    pub async fn stop(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.running.send_replace(false);

        let mut state = self.state.clone();
        let deadline = self.grace_period + STOP_SLACK;
        if timeout(deadline, state.wait_for(|s| s.is_terminal()))
            .await
            .is_err()
        {
            warn!("Stop did not observe process exit within the grace period");
        }
    }
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Stopped,
}

struct SupervisedRun {
    events: mpsc::UnboundedSender<SupervisorEvent>,
    running: watch::Receiver<bool>,
    state: watch::Sender<RunState>,
    grace_period: Duration,
    errors: ErrorWindow,
    _permit: OwnedSemaphorePermit,
}

impl SupervisedRun {
    async fn run(mut self, command: Command) -> ProcessResult {
        self.emit(SupervisorEvent::Progress(format!("Executing: {}", command)));
        info!(program = %command.program, cwd = %command.working_dir.display(), "Launching packaging backend");

        let mut child = match ProcessCommand::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %command.program, error = %e, "Failed to launch packaging backend");
                let outcome = RunOutcome::LaunchFailure {
                    reason: format!("{}: {}", command.program, e),
                };
                return self.finish(RunState::Completed, outcome);
            }
        };
        self.state.send_replace(RunState::Running);

        let (line_tx, mut lines) = mpsc::channel::<String>(256);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, line_tx.clone())));
        }
        drop(line_tx);

        let mut output_open = true;
        let exit = loop {
            tokio::select! {
                biased;

                changed = self.running.changed() => {
                    if changed.is_err() || !*self.running.borrow() {
                        break Exit::Stopped;
                    }
                }
                line = lines.recv(), if output_open => match line {
                    Some(line) => self.on_line(line),
                    None => output_open = false,
                },
                status = child.wait() => break Exit::Status(status),
            }
        };

        let (state, outcome) = match exit {
            Exit::Status(status) => {
                self.drain(&mut lines).await;
                let outcome = match status {
                    Ok(status) if status.success() => RunOutcome::Succeeded,
                    Ok(status) => RunOutcome::ExitFailure {
                        code: status.code(),
                    },
                    Err(e) => RunOutcome::LaunchFailure {
                        reason: format!("lost track of process: {}", e),
                    },
                };
                (RunState::Completed, outcome)
            }
            Exit::Stopped => {
                self.state.send_replace(RunState::Stopping);
                info!("Stopping packaging backend");
                let forced = terminate(&mut child, self.grace_period).await;
                let state = if forced {
                    RunState::Killed
                } else {
                    RunState::Terminated
                };
                (state, RunOutcome::Cancelled { forced })
            }
        };

        for reader in readers {
            reader.abort();
        }

        self.finish(state, outcome)
    }

    /// Forwards output still buffered after the child exited.
    ///
    /// Grandchildren may keep the pipes open and writing; the drain is
    /// bounded by `DRAIN_TIMEOUT` as a whole and ends early on a stop request.
    async fn drain(&mut self, lines: &mut mpsc::Receiver<String>) {
        let deadline = sleep(DRAIN_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    debug!("Output still open after exit, closing pipes");
                    break;
                }
                changed = self.running.changed() => {
                    if changed.is_err() || !*self.running.borrow() {
                        break;
                    }
                }
                line = lines.recv() => match line {
                    Some(line) => self.on_line(line),
                    None => break,
                },
            }
        }
    }

    fn on_line(&mut self, line: String) {
        self.errors.observe(&line);
        self.emit(SupervisorEvent::Progress(line));
    }

    fn finish(mut self, state: RunState, outcome: RunOutcome) -> ProcessResult {
        let errors = std::mem::replace(&mut self.errors, ErrorWindow::new(0));
        let result = ProcessResult::from_outcome(outcome, errors.into_lines());

        if !result.error_excerpt.is_empty() {
            self.emit(SupervisorEvent::ErrorExcerpt(result.error_excerpt.join("\n")));
        }
        self.emit(SupervisorEvent::Finished(result.clone()));

        info!(success = result.success, state = ?state, "{}", result.summary);
        self.state.send_replace(state);
        result
    }

    fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Sends each line of `stream` until EOF.
async fn forward_lines<S>(stream: S, lines: mpsc::Sender<String>)
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if lines.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// Graceful termination, then a forced kill after `grace`.
/// Returns `true` when the kill was needed.
async fn terminate(child: &mut Child, grace: Duration) -> bool {
    request_graceful_exit(child);

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "Process exited after stop request");
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Cannot poll process, killing");
                break;
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        sleep(POLL_INTERVAL).await;
    }

    warn!("Process ignored stop request, killing");
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
    true
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child) {
    // `id()` is `None` once the child has been reaped.
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = send_sigterm(pid) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) takes no pointers; the pid belongs to an unreaped child.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Termination request failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> Command {
        Command {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: PathBuf::from("."),
        }
    }

    async fn collect(mut handle: RunHandle) -> (Vec<SupervisorEvent>, ProcessResult) {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        let result = handle.wait().await;
        (events, result)
    }

    fn progress(events: &[SupervisorEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::Progress(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_error_line_detection() {
        assert!(is_error_line("ERROR: module not found"));
        assert!(is_error_line("Build FAILED"));
        assert!(is_error_line("failure in hook"));
        assert!(!is_error_line("INFO: Building EXE"));
    }

    #[test]
    fn test_error_window_keeps_most_recent() {
        let mut window = ErrorWindow::new(2);
        window.observe("error 1");
        window.observe("fine");
        window.observe("error 2");
        window.observe("error 3");
        assert_eq!(window.into_lines(), vec!["error 2", "error 3"]);
    }

    #[tokio::test]
    async fn test_successful_run_streams_output_in_order() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(sh("echo one; echo two; echo three")).unwrap();

        let (events, result) = collect(handle).await;

        assert!(result.success);
        assert_eq!(result.outcome, RunOutcome::Succeeded);
        let lines = progress(&events);
        assert!(lines[0].starts_with("Executing: sh -c"));
        assert_eq!(&lines[1..], &["one", "two", "three"]);
        assert!(matches!(events.last(), Some(SupervisorEvent::Finished(r)) if r.success));
    }

    #[tokio::test]
    async fn test_failed_run_carries_exit_code_and_excerpt() {
        let supervisor = ProcessSupervisor::new().with_excerpt_lines(2);
        let script = "echo 'error: a'; echo ok; echo 'ERROR: b' >&2; echo 'Build failed'; exit 3";
        let handle = supervisor.start(sh(script)).unwrap();

        let (events, result) = collect(handle).await;

        assert!(!result.success);
        assert_eq!(result.outcome, RunOutcome::ExitFailure { code: Some(3) });
        assert_eq!(result.error_excerpt.len(), 2);
        assert!(result.error_excerpt.contains(&"Build failed".to_string()));
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::ErrorExcerpt(text) if text.contains("Build failed"))));
    }

    #[tokio::test]
    async fn test_launch_failure_is_a_result_not_a_panic() {
        let supervisor = ProcessSupervisor::new();
        let command = Command {
            program: "definitely-not-a-packager-binary".to_string(),
            args: vec![],
            working_dir: PathBuf::from("."),
        };
        let handle = supervisor.start(command).unwrap();

        let (_, result) = collect(handle).await;

        assert!(!result.success);
        assert!(matches!(result.outcome, RunOutcome::LaunchFailure { .. }));
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(sh("sleep 5")).unwrap();

        assert!(matches!(
            supervisor.start(sh("true")),
            Err(SupervisorError::AlreadyRunning)
        ));

        handle.stop().await;
        let result = handle.wait().await;
        assert_eq!(result.outcome, RunOutcome::Cancelled { forced: false });
        assert!(supervisor.start(sh("true")).is_ok());
    }

    #[tokio::test]
    async fn test_stop_terminates_gracefully() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(sh("echo started; sleep 30")).unwrap();
        let stopper = handle.stopper();

        let started = Instant::now();
        stopper.stop().await;
        assert!(started.elapsed() < DEFAULT_GRACE_PERIOD);
        assert_eq!(stopper.state(), RunState::Terminated);

        let (_, result) = collect(handle).await;
        assert!(!result.success);
        assert!(result.error_excerpt.is_empty());
        assert_eq!(result.outcome, RunOutcome::Cancelled { forced: false });
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace_period() {
        let grace = Duration::from_millis(300);
        let supervisor = ProcessSupervisor::new().with_grace_period(grace);
        let mut handle = supervisor
            .start(sh("trap '' TERM; echo ready; while true; do sleep 0.1; done"))
            .unwrap();

        // Wait until the trap is installed.
        while let Some(event) = handle.next_event().await {
            if event == SupervisorEvent::Progress("ready".to_string()) {
                break;
            }
        }

        let started = Instant::now();
        handle.stop().await;
        assert!(started.elapsed() < grace + STOP_SLACK);
        assert_eq!(handle.state(), RunState::Killed);

        let result = handle.wait().await;
        assert_eq!(result.outcome, RunOutcome::Cancelled { forced: true });
    }

    #[tokio::test]
    async fn test_sigterm_ends_child() {
        let mut child = ProcessCommand::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        send_sigterm(child.id().unwrap()).unwrap();
        let status = timeout(Duration::from_secs(2), child.wait())
            .await
            .unwrap()
            .unwrap();

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn test_sigterm_rejects_out_of_range_pid() {
        let err = send_sigterm(u32::MAX).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    const BACKGROUND_WRITER: &str = "(while true; do echo tick; sleep 0.1; done) & exit 0";

    #[tokio::test]
    async fn test_background_writer_does_not_keep_run_open() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(sh(BACKGROUND_WRITER)).unwrap();

        let (events, result) = timeout(Duration::from_secs(3), collect(handle))
            .await
            .expect("run should finish once the drain window closes");

        assert!(result.success);
        assert!(matches!(events.last(), Some(SupervisorEvent::Finished(_))));
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_stop_while_draining_ends_run() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(sh(BACKGROUND_WRITER)).unwrap();
        sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        handle.stop().await;
        assert!(started.elapsed() < DEFAULT_GRACE_PERIOD);
        assert!(handle.state().is_terminal());

        let result = timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("run should be over after stop");
        assert_eq!(result.outcome, RunOutcome::Succeeded);
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor.start(sh("true")).unwrap();
        let stopper = handle.stopper();

        let (_, result) = collect(handle).await;
        assert!(result.success);

        stopper.stop().await;
        stopper.stop().await;
        assert_eq!(stopper.state(), RunState::Completed);
    }
}
