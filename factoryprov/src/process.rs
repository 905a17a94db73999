//! External tool execution with deadlines, cancellation and a diagnostics log.
//!
//! Every debug-probe interaction goes through a [`ToolRunner`]. The system
//! implementation spawns the process, merges stdout and stderr in arrival
//! order, and never waits past the invocation's deadline: a process that is
//! still running is killed and whatever it printed is returned with
//! `timed_out` set.

use {
    crate::error::{Error, Result},
    log::{debug, trace, warn},
    std::{
        env,
        fs::OpenOptions,
        io::{BufRead, BufReader, Read, Write},
        path::{Path, PathBuf},
        process::{Child, Command, Stdio},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, RecvTimeoutError},
        },
        thread,
        time::{Duration, Instant},
    },
};

/// Poll interval of the wait loop.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to keep draining pipes after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Default file name of the diagnostics log.
pub const DEFAULT_DIAGNOSTICS_FILE: &str = "factoryprov-diagnostics.log";

/// Cooperative cancellation flag shared between a job and its owner.
///
/// Cancelling also honours the process-wide interrupt checker registered
/// with [`crate::set_interrupt_checker`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0
            .store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested here or globally.
    pub fn is_cancelled(&self) -> bool {
        self.0
            .load(Ordering::SeqCst)
            || crate::is_interrupted_requested()
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// One external tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Executable path or bare name looked up on `PATH`.
    pub program: PathBuf,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// Hard deadline for the whole run.
    pub timeout: Duration,
    /// Output marker after which the run is wrapped up early.
    pub finish_marker: Option<(String, Duration)>,
}

impl ToolInvocation {
    /// Create an invocation with the given deadline.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            finish_marker: None,
        }
    }

    /// Once `marker` is seen, give the process `grace` to exit, then kill it.
    ///
    /// Some tools keep the probe open after printing their last useful line.
    #[must_use]
    pub fn with_finish_marker(mut self, marker: impl Into<String>, grace: Duration) -> Self {
        self.finish_marker = Some((marker.into(), grace));
        self
    }

    /// Space-separated command line, for logs.
    pub fn command_line(&self) -> String {
        let mut line = self
            .program
            .display()
            .to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Captured result of a tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr in arrival order.
    pub output: String,
    /// The deadline passed and the process was killed.
    pub timed_out: bool,
}

impl ToolOutput {
    /// Exited normally with code 0, or was wrapped up after its finish marker.
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && matches!(self.exit_code, Some(0) | None)
    }
}

/// Runs external tools on behalf of the flash backends.
pub trait ToolRunner: Send + Sync {
    /// Whether `program` can be spawned on this host.
    fn is_available(&self, program: &Path) -> bool;

    /// Run a tool to completion, its deadline, or cancellation.
    ///
    /// `observer` sees every output line as it arrives. Failure to spawn is
    /// [`Error::ToolNotFound`]; a non-zero exit is not an error.
    fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput>;
}

/// Append-only diagnostics log of every tool invocation.
#[derive(Debug, Clone)]
pub struct DiagnosticsLog {
    path: PathBuf,
}

impl DiagnosticsLog {
    /// Log to `path`, created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record with a single write so concurrent writers never
    /// interleave.
    pub fn append(&self, title: &str, body: &str) -> Result<()> {
        let stamp = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false);
        let mut record = format!("\n=== {title} ({stamp}) ===\n{body}");
        if !record.ends_with('\n') {
            record.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(record.as_bytes())?;
        Ok(())
    }

    fn record(&self, invocation: &ToolInvocation, result: &Result<ToolOutput>) {
        let body = match result {
            Ok(out) => format!(
                "$ {}\nexit: {}{}\n{}",
                invocation.command_line(),
                out.exit_code
                    .map_or_else(|| "killed".to_string(), |c| c.to_string()),
                if out.timed_out { " (timed out)" } else { "" },
                out.output
            ),
            Err(err) => format!("$ {}\nerror: {err}", invocation.command_line()),
        };
        let title = invocation
            .program
            .file_name()
            .map_or_else(
                || "tool".to_string(),
                |n| {
                    n.to_string_lossy()
                        .into_owned()
                },
            );
        if let Err(e) = self.append(&title, &body) {
            warn!(
                "Failed to write diagnostics log {}: {e}",
                self.path
                    .display()
            );
        }
    }
}

/// [`ToolRunner`] backed by `std::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    diagnostics: Option<DiagnosticsLog>,
}

impl SystemRunner {
    /// Runner without a diagnostics log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every invocation in `log`.
    #[must_use]
    pub fn with_diagnostics(mut self, log: DiagnosticsLog) -> Self {
        self.diagnostics = Some(log);
        self
    }

    fn spawn(invocation: &ToolInvocation) -> Result<Child> {
        Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound(
                        invocation
                            .program
                            .clone(),
                    )
                } else {
                    Error::Io(e)
                }
            })
    }

    fn wait(
        invocation: &ToolInvocation,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput> {
        let mut child = Self::spawn(invocation)?;
        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child
            .stdout
            .take()
        {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child
            .stderr
            .take()
        {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let started = Instant::now();
        let deadline = started + invocation.timeout;
        let mut result = ToolOutput::default();
        let mut finish_at: Option<Instant> = None;
        let mut exited_at: Option<Instant> = None;
        let mut streams_open = true;

        loop {
            if streams_open {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(line) => {
                        trace!("[{}] {}", invocation.program.display(), line.trim_end());
                        observer(line.trim_end());
                        if finish_at.is_none() {
                            if let Some((marker, grace)) = &invocation.finish_marker {
                                if line.contains(marker.as_str()) {
                                    finish_at = Some(Instant::now() + *grace);
                                }
                            }
                        }
                        result
                            .output
                            .push_str(&line);
                    },
                    Err(RecvTimeoutError::Timeout) => {},
                    Err(RecvTimeoutError::Disconnected) => streams_open = false,
                }
            } else {
                thread::sleep(POLL_INTERVAL);
            }

            if cancel.is_cancelled() {
                kill(&mut child);
                debug!("Cancelled {}", invocation.program.display());
                return Err(Error::Cancelled);
            }

            if exited_at.is_none() {
                if let Some(status) = child.try_wait()? {
                    result.exit_code = status.code();
                    exited_at = Some(Instant::now());
                }
            }

            let now = Instant::now();
            match exited_at {
                Some(at) if !streams_open || now >= at + DRAIN_GRACE => break,
                Some(_) => continue,
                None => {},
            }

            if finish_at.is_some_and(|at| now >= at) {
                kill(&mut child);
                result.exit_code = None;
                break;
            }

            if now >= deadline {
                warn!(
                    "{} did not finish within {:?}, killing it",
                    invocation.program.display(),
                    invocation.timeout
                );
                kill(&mut child);
                result.timed_out = true;
                break;
            }
        }

        // Pick up lines that were already queued when the loop ended.
        while let Ok(line) = rx.try_recv() {
            observer(line.trim_end());
            result
                .output
                .push_str(&line);
        }

        debug!(
            "{} finished in {:?} (exit {:?}, timed out: {})",
            invocation.program.display(),
            started.elapsed(),
            result.exit_code,
            result.timed_out
        );
        Ok(result)
    }
}

impl ToolRunner for SystemRunner {
    fn is_available(&self, program: &Path) -> bool {
        if program.components().count() > 1 || program.is_absolute() {
            return program.is_file();
        }
        let Some(paths) = env::var_os("PATH") else {
            return false;
        };
        env::split_paths(&paths).any(|dir| {
            let candidate = dir.join(program);
            candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
        })
    }

    fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(&str),
    ) -> Result<ToolOutput> {
        debug!("Executing: {}", invocation.command_line());
        let result = Self::wait(invocation, cancel, observer);
        if let Some(log) = &self.diagnostics {
            log.record(invocation, &result);
        }
        result
    }
}

fn forward_lines<R: Read + Send + 'static>(stream: R, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx
                        .send(line)
                        .is_err()
                    {
                        break;
                    }
                },
            }
        }
    });
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        trace!("kill: {e}");
    }
    let _ = child.wait();
}

#[cfg(test)]
pub(crate) mod scripted {
    //! In-memory [`ToolRunner`] that replays canned output.

    use super::*;
    use std::sync::Mutex;

    type Handler = dyn Fn(&ToolInvocation, &CancelToken) -> Result<ToolOutput> + Send + Sync;

    /// Records every invocation and answers through a handler closure.
    pub(crate) struct ScriptedRunner {
        handler: Box<Handler>,
        available: bool,
        missing: Vec<PathBuf>,
        calls: Mutex<Vec<ToolInvocation>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&ToolInvocation, &CancelToken) -> Result<ToolOutput> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                available: true,
                missing: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        /// Report only `program` as not installed.
        pub(crate) fn without(mut self, program: impl Into<PathBuf>) -> Self {
            self.missing
                .push(program.into());
            self
        }

        pub(crate) fn calls(&self) -> Vec<ToolInvocation> {
            self.calls
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default()
        }
    }

    /// Output with exit code 0.
    pub(crate) fn exited(output: &str) -> ToolOutput {
        ToolOutput {
            exit_code: Some(0),
            output: output.to_string(),
            timed_out: false,
        }
    }

    /// Output with a non-zero exit code.
    pub(crate) fn failed(output: &str) -> ToolOutput {
        ToolOutput {
            exit_code: Some(1),
            output: output.to_string(),
            timed_out: false,
        }
    }

    impl ToolRunner for ScriptedRunner {
        fn is_available(&self, program: &Path) -> bool {
            self.available
                && !self
                    .missing
                    .iter()
                    .any(|m| m == program)
        }

        fn run(
            &self,
            invocation: &ToolInvocation,
            cancel: &CancelToken,
            observer: &mut dyn FnMut(&str),
        ) -> Result<ToolOutput> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(invocation.clone());
            }
            let out = (self.handler)(invocation, cancel)?;
            for line in out
                .output
                .lines()
            {
                observer(line);
            }
            Ok(out)
        }
    }
}
