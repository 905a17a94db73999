//! Serial command channel with FIFO request/response correlation.
//!
//! A [`SerialChannel`] owns one open port through a worker thread. Callers
//! submit requests from any thread; the worker writes them one at a time and
//! only the head of the queue listens for its response, so responses are
//! matched to requests strictly in submission order. Each request's deadline
//! starts when it becomes the head. Lines that no request consumes are
//! forwarded to subscribers.
//!
//! ```text
//!  caller A ──┐                         ┌─────────────┐
//!  caller B ──┼─ submit ─▶ mpsc queue ─▶│   worker    │◀──▶ Port
//!  caller C ──┘                         │ head + FIFO │
//!                                       └──────┬──────┘
//!                                              └─▶ subscribers (unclaimed lines)
//! ```

mod lines;
pub mod matcher;

pub use matcher::{Matcher, Response, ResponseShape, json_success};

use {
    crate::{
        error::{Error, Result},
        port::Port,
    },
    lines::LineDecoder,
    log::{debug, trace, warn},
    matcher::Verdict,
    std::{
        collections::VecDeque,
        io::ErrorKind,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Receiver, Sender, TryRecvError},
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

#[cfg(feature = "native")]
use crate::port::{NativePort, SerialConfig};

/// Timing knobs for a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Deadline for ordinary AT queries.
    pub command_timeout: Duration,
    /// Deadline for `test_<name>` commands that exercise hardware.
    pub test_timeout: Duration,
    /// Deadline for the unlock handshake.
    pub unlock_timeout: Duration,
    /// Pause between opening the port and sending the unlock command.
    pub unlock_settle: Duration,
    /// Read timeout of the port while the worker polls.
    pub poll_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(15),
            unlock_timeout: Duration::from_secs(5),
            unlock_settle: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl ChannelOptions {
    /// Set the AT query deadline.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the JSON test command deadline.
    #[must_use]
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Set the unlock handshake deadline and settle delay.
    #[must_use]
    pub fn with_unlock(mut self, timeout: Duration, settle: Duration) -> Self {
        self.unlock_timeout = timeout;
        self.unlock_settle = settle;
        self
    }
}

/// The open port a channel owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSession {
    /// Port path.
    pub path: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Cleared once the channel is closed.
    pub is_open: bool,
}

struct Job {
    command: String,
    matcher: Matcher,
    timeout: Duration,
    reply: Sender<Result<Response>>,
}

impl Job {
    fn finish(self, result: Result<Response>) {
        // The caller may have dropped its handle; nothing to do then.
        let _ = self
            .reply
            .send(result);
    }
}

/// Handle to a submitted request.
#[derive(Debug)]
pub struct PendingResponse {
    command: String,
    rx: Receiver<Result<Response>>,
}

impl PendingResponse {
    /// Block until the worker resolves or rejects the request.
    pub fn wait(self) -> Result<Response> {
        self.rx
            .recv()
            .unwrap_or_else(|_| {
                Err(Error::Connection(format!(
                    "channel closed before `{}` completed",
                    self.command
                )))
            })
    }
}

/// One serial port, one worker, one request in flight.
pub struct SerialChannel {
    jobs: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<Sender<String>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    session: Mutex<SerialSession>,
    options: ChannelOptions,
}

impl SerialChannel {
    /// Open a native serial port.
    #[cfg(feature = "native")]
    pub fn open(config: &SerialConfig, options: ChannelOptions) -> Result<Self> {
        let config = config
            .clone()
            .with_timeout(options.poll_interval);
        let port = NativePort::open(&config)?;
        Self::with_port(Box::new(port), options)
    }

    /// Open a native serial port and perform the unlock handshake.
    #[cfg(feature = "native")]
    pub fn open_unlocked(
        config: &SerialConfig,
        options: ChannelOptions,
        secret: &str,
    ) -> Result<Self> {
        let channel = Self::open(config, options)?;
        channel.unlock(secret)?;
        Ok(channel)
    }

    /// Start a channel on an already-open port.
    pub fn with_port(mut port: Box<dyn Port>, options: ChannelOptions) -> Result<Self> {
        port.set_timeout(options.poll_interval)?;
        if let Err(e) = port.clear_buffers() {
            debug!("Could not clear buffers on {}: {e}", port.name());
        }
        let session = SerialSession {
            path: port
                .name()
                .to_string(),
            baud_rate: port.baud_rate(),
            is_open: true,
        };

        let (jobs, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker {
            port,
            rx,
            shutdown: Arc::clone(&shutdown),
            subscribers: Arc::clone(&subscribers),
            queue: VecDeque::new(),
            active: None,
            decoder: LineDecoder::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("serial:{}", session.path))
            .spawn(move || worker.run())?;

        debug!(
            "Serial channel open on {} at {} baud",
            session.path, session.baud_rate
        );
        Ok(Self {
            jobs,
            shutdown,
            subscribers,
            worker: Mutex::new(Some(handle)),
            session: Mutex::new(session),
            options,
        })
    }

    /// Timing options this channel was opened with.
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Snapshot of the session state.
    pub fn session(&self) -> SerialSession {
        self.session
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|p| {
                p.into_inner()
                    .clone()
            })
    }

    /// Whether the channel still accepts requests.
    pub fn is_open(&self) -> bool {
        !self
            .shutdown
            .load(Ordering::SeqCst)
    }

    /// Queue a request without waiting for it.
    pub fn submit(
        &self,
        command: &str,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<PendingResponse> {
        if !self.is_open() {
            return Err(Error::Connection("serial channel is closed".into()));
        }
        let (reply, rx) = mpsc::channel();
        let job = Job {
            command: command.to_string(),
            matcher,
            timeout,
            reply,
        };
        self.jobs
            .send(job)
            .map_err(|_| Error::Connection("serial worker has stopped".into()))?;
        Ok(PendingResponse {
            command: command.to_string(),
            rx,
        })
    }

    /// Send `command` and wait for the line `matcher` accepts.
    pub fn send_and_await(
        &self,
        command: &str,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<Response> {
        self.submit(command, matcher, timeout)?
            .wait()
    }

    /// One-time unlock handshake; the channel is closed if it fails.
    pub fn unlock(&self, secret: &str) -> Result<()> {
        thread::sleep(self.options.unlock_settle);
        let command = format!("AT+UNLOCK={secret}");
        debug!("Sending unlock handshake");
        match self.send_and_await(&command, Matcher::Terminal, self.options.unlock_timeout) {
            Ok(_) => {
                debug!("Device unlocked");
                Ok(())
            },
            Err(e) => {
                warn!("Unlock handshake failed: {e}");
                self.close();
                Err(Error::DeviceUnlockFailed(e.to_string()))
            },
        }
    }

    /// Receive every line no request consumed.
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self
            .subscribers
            .lock()
        {
            subs.push(tx);
        }
        rx
    }

    /// Stop the worker, fail every queued request, and release the port.
    pub fn close(&self) {
        if self
            .shutdown
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        let handle = self
            .worker
            .lock()
            .ok()
            .and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if handle
                .join()
                .is_err()
            {
                warn!("Serial worker panicked");
            }
        }
        if let Ok(mut session) = self
            .session
            .lock()
        {
            session.is_open = false;
            debug!("Serial channel on {} closed", session.path);
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct Active {
    job: Job,
    deadline: Instant,
}

struct Worker {
    port: Box<dyn Port>,
    rx: Receiver<Job>,
    shutdown: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<Sender<String>>>>,
    queue: VecDeque<Job>,
    active: Option<Active>,
    decoder: LineDecoder,
}

impl Worker {
    fn run(mut self) {
        let mut buf = [0u8; 256];
        loop {
            if self
                .shutdown
                .load(Ordering::SeqCst)
            {
                self.fail_all("serial channel closed");
                break;
            }

            let senders_gone = self.intake();
            if senders_gone
                && self
                    .active
                    .is_none()
                && self
                    .queue
                    .is_empty()
            {
                break;
            }
            self.activate_next();

            match self
                .port
                .read(&mut buf)
            {
                Ok(0) => {},
                Ok(n) => {
                    for line in self
                        .decoder
                        .push(&buf[..n])
                    {
                        self.dispatch(line);
                    }
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => {
                    warn!("Serial read failed: {e}");
                    self.fail_all(&format!("serial read failed: {e}"));
                    self.shutdown
                        .store(true, Ordering::SeqCst);
                    break;
                },
            }

            self.expire();
        }

        if let Err(e) = self
            .port
            .close()
        {
            debug!("Closing port: {e}");
        }
    }

    /// Move newly submitted jobs into the queue. Returns true once every
    /// sender is gone.
    fn intake(&mut self) -> bool {
        loop {
            match self
                .rx
                .try_recv()
            {
                Ok(job) => self
                    .queue
                    .push_back(job),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn activate_next(&mut self) {
        while self
            .active
            .is_none()
        {
            let Some(job) = self
                .queue
                .pop_front()
            else {
                return;
            };
            trace!("TX: {}", job.command);
            let frame = format!("{}\r\n", job.command);
            match self
                .port
                .write_all_bytes(frame.as_bytes())
            {
                Ok(()) => {
                    self.active = Some(Active {
                        deadline: Instant::now() + job.timeout,
                        job,
                    });
                },
                Err(e) => {
                    warn!("Failed to send `{}`: {e}", job.command);
                    job.finish(Err(e));
                },
            }
        }
    }

    fn dispatch(&mut self, line: String) {
        trace!("RX: {line}");
        let verdict = self
            .active
            .as_ref()
            .map_or(Verdict::Ignore, |a| {
                a.job
                    .matcher
                    .classify(&line)
            });
        match verdict {
            Verdict::Resolve(response) => {
                if let Some(active) = self
                    .active
                    .take()
                {
                    active
                        .job
                        .finish(Ok(response));
                }
            },
            Verdict::Reject(response) => {
                if let Some(active) = self
                    .active
                    .take()
                {
                    let command = active
                        .job
                        .command
                        .clone();
                    active
                        .job
                        .finish(Err(Error::Command { command, response }));
                }
            },
            Verdict::Ignore => self.broadcast(line),
        }
    }

    fn broadcast(&self, line: String) {
        if let Ok(mut subs) = self
            .subscribers
            .lock()
        {
            subs.retain(|tx| {
                tx.send(line.clone())
                    .is_ok()
            });
        }
    }

    fn expire(&mut self) {
        let expired = self
            .active
            .as_ref()
            .is_some_and(|a| Instant::now() >= a.deadline);
        if expired {
            if let Some(active) = self
                .active
                .take()
            {
                debug!("No response to `{}`", active.job.command);
                let message = format!(
                    "no response to `{}` within {:?}",
                    active.job.command, active.job.timeout
                );
                active
                    .job
                    .finish(Err(Error::Timeout(message)));
            }
        }
    }

    fn fail_all(&mut self, reason: &str) {
        if let Some(active) = self
            .active
            .take()
        {
            active
                .job
                .finish(Err(Error::Connection(reason.to_string())));
        }
        self.intake();
        for job in self
            .queue
            .drain(..)
        {
            job.finish(Err(Error::Connection(reason.to_string())));
        }
    }
}
