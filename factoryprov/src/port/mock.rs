//! Scripted in-memory port for channel and protocol tests.

use {
    crate::{error::Result, port::Port},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    },
};

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    /// Reply scripts consumed one per written line. `None` means no answer.
    replies: VecDeque<Option<Vec<(Duration, String)>>>,
    /// Bytes released to the reader once their instant has passed.
    pending: Vec<(Instant, Vec<u8>)>,
    closed: bool,
}

impl MockState {
    fn on_line_written(&mut self) {
        let Some(script) = self
            .replies
            .pop_front()
        else {
            return;
        };
        let now = Instant::now();
        for (delay, line) in script
            .into_iter()
            .flatten()
        {
            self.pending
                .push((now + delay, format!("{line}\r\n").into_bytes()));
        }
    }
}

/// Port whose responses are scripted by a [`MockHandle`].
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
    timeout: Duration,
}

/// Test-side handle to script and inspect a [`MockPort`].
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub(crate) fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
                timeout: Duration::from_millis(5),
            },
            MockHandle { state },
        )
    }
}

impl MockHandle {
    /// Answer the next written command with `lines`, each after `delay`.
    pub(crate) fn reply(&self, lines: &[&str], delay: Duration) -> &Self {
        let script = lines
            .iter()
            .map(|l| (delay, (*l).to_string()))
            .collect();
        self.lock()
            .replies
            .push_back(Some(script));
        self
    }

    /// Answer the next written command with explicitly timed lines.
    pub(crate) fn reply_timed(&self, lines: &[(u64, &str)]) -> &Self {
        let script = lines
            .iter()
            .map(|(ms, l)| (Duration::from_millis(*ms), (*l).to_string()))
            .collect();
        self.lock()
            .replies
            .push_back(Some(script));
        self
    }

    /// Leave the next written command unanswered.
    pub(crate) fn silent(&self) -> &Self {
        self.lock()
            .replies
            .push_back(None);
        self
    }

    /// Emit an unsolicited line after `delay`.
    pub(crate) fn inject(&self, line: &str, delay: Duration) {
        self.lock()
            .pending
            .push((Instant::now() + delay, format!("{line}\r\n").into_bytes()));
    }

    /// Everything written so far, split into lines.
    pub(crate) fn written_lines(&self) -> Vec<String> {
        let state = self.lock();
        String::from_utf8_lossy(&state.written)
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock()
            .closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let now = Instant::now();
                state
                    .pending
                    .sort_by_key(|(at, _)| *at);
                if let Some(idx) = state
                    .pending
                    .iter()
                    .position(|(at, _)| *at <= now)
                {
                    let (at, mut bytes) = state
                        .pending
                        .remove(idx);
                    let n = bytes
                        .len()
                        .min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        bytes.drain(..n);
                        state
                            .pending
                            .insert(0, (at, bytes));
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock timeout"));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for &b in buf {
            state
                .written
                .push(b);
            if b == b'\n' {
                state.on_line_written();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        115200
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .closed = true;
        Ok(())
    }
}
