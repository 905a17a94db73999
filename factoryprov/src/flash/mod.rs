//! Firmware flashing through external debug-probe tools.
//!
//! [`FlashOrchestrator`] owns the device-profile registry and drives one job
//! at a time through `Detecting -> Connecting -> Erasing -> Downloading ->
//! Verifying -> Complete`. Connecting walks a fixed strategy matrix on the
//! primary backend (adapter speed x reset mode) and, when all of it fails,
//! the connect tokens of the secondary vendor CLI. Every strategy is tried at
//! most once per job.
//!
//! ```no_run
//! use std::sync::{Arc, mpsc};
//! use factoryprov::{
//!     flash::{FlashOrchestrator, FlashRequest, FlashSettings, ProfileId},
//!     process::SystemRunner,
//! };
//!
//! let runner = Arc::new(SystemRunner::new());
//! let orchestrator = FlashOrchestrator::new(FlashSettings::default(), runner);
//! let (events, progress) = mpsc::channel();
//! let request = FlashRequest::new("droplet.bin", ProfileId::Droplet);
//! let report = orchestrator.flash(&request, events)?;
//! for event in progress.try_iter() {
//!     println!("{}: {}", event.stage_name(), event.message);
//! }
//! println!("connected via {}", report.strategy);
//! # Ok::<(), factoryprov::Error>(())
//! ```

mod cube;
mod openocd;
mod profile;
mod strategy;

pub use {
    cube::{PROBE_DELAYS, connect_tokens},
    profile::{
        DetectedProfile, DeviceProfile, IDENTIFY_RULES, Identification, ProfileId, Rule, identify,
    },
    strategy::{AttemptOutcome, Backend, ConnectAttempt, PRIMARY_SPEEDS_KHZ, ResetMode, Strategy},
};
use {
    crate::{
        error::{Error, FailedJob, Result},
        identity::{DEFAULT_VERSION_BYTE, DeviceAddress, Uid, parse_words},
        process::{CancelToken, ToolOutput, ToolRunner},
    },
    cube::Secondary,
    log::{debug, error, info, warn},
    openocd::Primary,
    regex::Regex,
    serde::{Serialize, Serializer, ser::SerializeStruct},
    std::{
        fmt, fs,
        path::{Path, PathBuf},
        sync::{
            Arc, LazyLock, Mutex, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Receiver, Sender},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Stage of a flash job. Stages only move forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashStage {
    /// No job running.
    Idle,
    /// Searching for the target.
    Detecting,
    /// A strategy identified the target.
    Connecting,
    /// Erasing flash.
    Erasing,
    /// Writing the image.
    Downloading,
    /// Reading back.
    Verifying,
    /// Finished successfully.
    Complete,
    /// Aborted.
    Failed,
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::Connecting => "connecting",
            Self::Erasing => "erasing",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        })
    }
}

/// What a progress event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The job entered a stage.
    Stage(FlashStage),
    /// Non-fatal condition worth showing to the operator.
    Warning,
    /// The connection search moved on to another strategy.
    Retry,
}

/// Progress event of a flash job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Human-readable detail.
    pub message: String,
}

impl FlashEvent {
    /// `stage` field of the `{stage, message}` contract.
    pub fn stage_name(&self) -> String {
        match self.kind {
            EventKind::Stage(stage) => stage.to_string(),
            EventKind::Warning => "warning".to_string(),
            EventKind::Retry => "retry".to_string(),
        }
    }
}

impl Serialize for FlashEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("FlashEvent", 2)?;
        s.serialize_field("stage", &self.stage_name())?;
        s.serialize_field("message", &self.message)?;
        s.end()
    }
}

/// Tool locations, deadlines and pacing.
#[derive(Debug, Clone)]
pub struct FlashSettings {
    /// Primary tool executable.
    pub openocd: PathBuf,
    /// Script directory passed with `-s`.
    pub scripts: PathBuf,
    /// Debug adapter interface script.
    pub interface: String,
    /// Secondary vendor CLI executable.
    pub cube_cli: PathBuf,
    /// Deadline of one primary probe or memory read.
    pub probe_timeout: Duration,
    /// Deadline of a primary program or unlock run.
    pub program_timeout: Duration,
    /// Deadline of one secondary connect probe or read.
    pub secondary_probe_timeout: Duration,
    /// Deadline of a secondary download.
    pub secondary_program_timeout: Duration,
    /// Pause between primary strategies.
    pub attempt_pause: Duration,
    /// Delay before each probe of one secondary token.
    pub secondary_probe_delays: Vec<Duration>,
    /// Wait after flashing before the UID is read.
    pub settle_delay: Duration,
    /// Version byte folded into derived addresses.
    pub version_byte: u8,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            openocd: PathBuf::from("openocd"),
            scripts: PathBuf::from("/usr/share/openocd/scripts"),
            interface: "interface/stlink.cfg".to_string(),
            cube_cli: PathBuf::from("STM32_Programmer_CLI"),
            probe_timeout: Duration::from_secs(10),
            program_timeout: Duration::from_secs(60),
            secondary_probe_timeout: Duration::from_secs(8),
            secondary_program_timeout: Duration::from_secs(180),
            attempt_pause: Duration::from_millis(500),
            secondary_probe_delays: PROBE_DELAYS.to_vec(),
            settle_delay: Duration::from_secs(2),
            version_byte: DEFAULT_VERSION_BYTE,
        }
    }
}

impl FlashSettings {
    /// Set the primary tool path.
    #[must_use]
    pub fn with_openocd(mut self, path: impl Into<PathBuf>) -> Self {
        self.openocd = path.into();
        self
    }

    /// Set the primary script directory.
    #[must_use]
    pub fn with_scripts(mut self, path: impl Into<PathBuf>) -> Self {
        self.scripts = path.into();
        self
    }

    /// Set the adapter interface script.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Set the secondary tool path.
    #[must_use]
    pub fn with_cube_cli(mut self, path: impl Into<PathBuf>) -> Self {
        self.cube_cli = path.into();
        self
    }

    /// Set the pause between primary strategies and the secondary probe delays.
    #[must_use]
    pub fn with_pacing(mut self, attempt_pause: Duration, probe_delays: Vec<Duration>) -> Self {
        self.attempt_pause = attempt_pause;
        self.secondary_probe_delays = probe_delays;
        self
    }

    /// Set the wait between flashing and reading the UID.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the version byte for derived addresses.
    #[must_use]
    pub fn with_version_byte(mut self, version_byte: u8) -> Self {
        self.version_byte = version_byte;
        self
    }
}

/// What to flash onto which profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Firmware image.
    pub firmware: PathBuf,
    /// Target profile selected by the caller.
    pub profile: ProfileId,
}

impl FlashRequest {
    /// New request.
    pub fn new(firmware: impl Into<PathBuf>, profile: ProfileId) -> Self {
        Self {
            firmware: firmware.into(),
            profile,
        }
    }
}

/// Successful flash job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashReport {
    /// Profile the caller selected.
    pub profile: ProfileId,
    /// Image that was written.
    pub firmware: PathBuf,
    /// Image size in bytes.
    pub firmware_size: u64,
    /// Strategy that connected.
    pub strategy: Strategy,
    /// Markers seen while connecting.
    pub identification: Identification,
    /// Best-effort guess of the attached part.
    pub detected: DetectedProfile,
    /// The guess differs from `profile`.
    pub mismatch: bool,
    /// Every connect attempt, in order.
    pub attempts: Vec<ConnectAttempt>,
    /// Output of the program run.
    pub output: String,
}

/// Result of a connection search without flashing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    /// Profile the caller selected.
    pub profile: ProfileId,
    /// Strategy that connected.
    pub strategy: Strategy,
    /// Markers seen.
    pub identification: Identification,
    /// Best-effort guess of the attached part.
    pub detected: DetectedProfile,
    /// The guess differs from `profile`.
    pub mismatch: bool,
    /// Every connect attempt, in order.
    pub attempts: Vec<ConnectAttempt>,
    /// Output of the winning probe.
    pub output: String,
}

/// Flash job result with the derived device address.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifiedFlash {
    /// The flash job.
    pub flash: FlashReport,
    /// UID words, when the profile derives addresses and the read worked.
    pub uid: Option<Uid>,
    /// Derived address.
    pub address: Option<DeviceAddress>,
    /// Why the UID could not be read.
    pub uid_error: Option<String>,
}

/// Where a protection verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtectionSource {
    /// Decoded from the option-byte register.
    OptionBytes,
    /// Inferred from the flash bank listing.
    FlashList,
    /// Nothing conclusive was read; assumed unprotected.
    Undetermined,
}

/// Read-out protection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionStatus {
    /// RDP level 0, 1 or 2.
    pub level: u8,
    /// How the level was determined.
    pub source: ProtectionSource,
    /// Raw option-byte word, when it was read.
    pub option_bytes: Option<u32>,
}

impl ProtectionStatus {
    /// Decode the RDP byte of an option-byte word.
    pub fn from_option_bytes(word: u32) -> Self {
        let level = match word & 0xFF {
            0xAA => 0,
            0xCC => 2,
            _ => 1,
        };
        Self {
            level,
            source: ProtectionSource::OptionBytes,
            option_bytes: Some(word),
        }
    }

    /// Any read-out protection is active.
    pub fn is_protected(&self) -> bool {
        self.level > 0
    }

    /// Protection can be removed by a mass erase.
    pub fn is_unlockable(&self) -> bool {
        self.level == 1
    }
}

static RDP_LEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)RDP level (\d)").expect("Invalid RDP regex"));
static ZERO_FLASH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)flash size\s*=\s*0\s*k|size 0x0\b").expect("Invalid flash size regex")
});

/// Protection level inferred from a flash listing, if it says anything.
fn scan_protection(output: &str) -> Option<u8> {
    if let Some(level) = RDP_LEVEL_RE
        .captures(output)
        .and_then(|c| {
            c[1].parse()
                .ok()
        })
    {
        return Some(level);
    }
    let lower = output.to_ascii_lowercase();
    if lower.contains("device protected") || ZERO_FLASH_RE.is_match(output) {
        return Some(1);
    }
    None
}

/// Snapshot of orchestrator and tool state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    /// A job holds the busy flag.
    pub is_flashing: bool,
    /// Primary tool can be spawned.
    pub primary_available: bool,
    /// Secondary tool can be spawned.
    pub secondary_available: bool,
    /// Configured primary tool.
    pub primary_path: PathBuf,
    /// Configured secondary tool.
    pub secondary_path: PathBuf,
    /// Version byte for derived addresses.
    pub version_byte: u8,
}

#[derive(Debug, Default)]
struct JobState {
    busy: AtomicBool,
    cancel: Mutex<Option<CancelToken>>,
}

/// Holds the busy flag for one job; releasing it frees the orchestrator.
#[derive(Debug)]
pub struct JobGuard {
    state: Arc<JobState>,
    cancel: CancelToken,
}

impl JobGuard {
    /// Token that cancels this job.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        *self
            .state
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.state
            .busy
            .store(false, Ordering::SeqCst);
    }
}

/// A flash job running on its own thread.
#[derive(Debug)]
pub struct FlashHandle {
    events: Receiver<FlashEvent>,
    cancel: CancelToken,
    join: JoinHandle<Result<FlashReport>>,
}

impl FlashHandle {
    /// Progress events; the channel closes when the job ends.
    pub fn events(&self) -> &Receiver<FlashEvent> {
        &self.events
    }

    /// Kill the running tool; the job ends `Failed`.
    pub fn cancel(&self) {
        self.cancel
            .cancel();
    }

    /// Wait for the job to end.
    pub fn wait(self) -> Result<FlashReport> {
        self.join
            .join()
            .unwrap_or_else(|_| Err(Error::FlashFailed("flash thread panicked".to_string())))
    }
}

/// Stage tracking and event emission for one job.
struct Job {
    stage: FlashStage,
    events: Option<Sender<FlashEvent>>,
    attempts: Vec<ConnectAttempt>,
    last_output: String,
}

impl Job {
    fn new(events: Option<Sender<FlashEvent>>) -> Self {
        Self {
            stage: FlashStage::Idle,
            events,
            attempts: Vec::new(),
            last_output: String::new(),
        }
    }

    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        if let Some(tx) = &self.events {
            let _ = tx.send(FlashEvent {
                kind,
                message: message.into(),
            });
        }
    }

    fn advance(&mut self, stage: FlashStage, message: &str) {
        if stage <= self.stage || self.stage == FlashStage::Failed {
            return;
        }
        info!("Flash stage {stage}: {message}");
        self.stage = stage;
        self.emit(EventKind::Stage(stage), message);
    }

    fn notify(&self, kind: EventKind, message: &str) {
        match kind {
            EventKind::Warning => warn!("{message}"),
            _ => debug!("{message}"),
        }
        self.emit(kind, message);
    }

    fn record(&mut self, strategy: Strategy, outcome: AttemptOutcome, output: &ToolOutput) {
        let attempt = ConnectAttempt { strategy, outcome };
        debug!("Attempt {}", attempt);
        self.attempts
            .push(attempt);
        self.last_output
            .clone_from(&output.output);
    }

    fn fail(mut self, cause: Error) -> Error {
        let stage = self.stage;
        error!("Flash job failed while {stage}: {cause}");
        self.stage = FlashStage::Failed;
        self.emit(EventKind::Stage(FlashStage::Failed), cause.to_string());
        Error::JobFailed(Box::new(FailedJob {
            stage,
            cause,
            attempts: self.attempts,
            output: self.last_output,
        }))
    }
}

/// The strategy that connected and what it saw.
struct Connection {
    strategy: Strategy,
    identification: Identification,
    output: String,
}

/// Drives flash jobs through the external tools.
pub struct FlashOrchestrator {
    settings: FlashSettings,
    runner: Arc<dyn ToolRunner>,
    state: Arc<JobState>,
    last_strategy: Mutex<Option<Strategy>>,
}

impl FlashOrchestrator {
    /// Create an orchestrator; construct one per process and share it.
    pub fn new(settings: FlashSettings, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            settings,
            runner,
            state: Arc::new(JobState::default()),
            last_strategy: Mutex::new(None),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &FlashSettings {
        &self.settings
    }

    /// Atomically claim the busy flag.
    pub fn try_begin_job(&self) -> Result<JobGuard> {
        self.state
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy)?;
        let cancel = CancelToken::new();
        *self
            .state
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        Ok(JobGuard {
            state: Arc::clone(&self.state),
            cancel,
        })
    }

    /// Whether a job holds the busy flag.
    pub fn is_busy(&self) -> bool {
        self.state
            .busy
            .load(Ordering::SeqCst)
    }

    /// Cancel the active job. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(token) => {
                info!("Cancelling flash job");
                token.cancel();
                true
            },
            None => false,
        }
    }

    /// Tool availability and configuration.
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            is_flashing: self.is_busy(),
            primary_available: self
                .runner
                .is_available(&self.settings.openocd),
            secondary_available: self
                .runner
                .is_available(&self.settings.cube_cli),
            primary_path: self
                .settings
                .openocd
                .clone(),
            secondary_path: self
                .settings
                .cube_cli
                .clone(),
            version_byte: self
                .settings
                .version_byte,
        }
    }

    /// Flash `request`, streaming progress to `events`.
    pub fn flash(&self, request: &FlashRequest, events: Sender<FlashEvent>) -> Result<FlashReport> {
        let guard = self.try_begin_job()?;
        self.run_flash(request, Some(events), guard.cancel_token())
    }

    /// Flash on a background thread.
    ///
    /// A busy orchestrator is reported here, before any thread starts.
    pub fn spawn_flash(self: &Arc<Self>, request: FlashRequest) -> Result<FlashHandle> {
        let guard = self.try_begin_job()?;
        let cancel = guard
            .cancel_token()
            .clone();
        let (tx, rx) = mpsc::channel();
        let this = Arc::clone(self);
        let join = thread::Builder::new()
            .name("flash-job".to_string())
            .spawn(move || {
                let result = this.run_flash(&request, Some(tx), guard.cancel_token());
                drop(guard);
                result
            })?;
        Ok(FlashHandle {
            events: rx,
            cancel,
            join,
        })
    }

    /// Flash, then read the UID and derive the device address when the
    /// profile supports it.
    pub fn flash_and_identify(
        &self,
        request: &FlashRequest,
        events: Sender<FlashEvent>,
    ) -> Result<IdentifiedFlash> {
        let guard = self.try_begin_job()?;
        let cancel = guard.cancel_token();
        let flash = self.run_flash(request, Some(events), cancel)?;
        let profile = request
            .profile
            .profile();
        if !profile.supports_derived_address {
            return Ok(IdentifiedFlash {
                flash,
                uid: None,
                address: None,
                uid_error: None,
            });
        }

        cancel.sleep(self.settings.settle_delay)?;
        match self.read_uid_with(profile, cancel) {
            Ok(uid) => {
                let address = uid.derive_address(self.settings.version_byte);
                info!("UID {uid} -> device address {address}");
                Ok(IdentifiedFlash {
                    flash,
                    uid: Some(uid),
                    address: Some(address),
                    uid_error: None,
                })
            },
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!("Flashed, but reading the UID failed: {e}");
                Ok(IdentifiedFlash {
                    flash,
                    uid: None,
                    address: None,
                    uid_error: Some(e.to_string()),
                })
            },
        }
    }

    /// Run the connection search alone.
    pub fn detect(&self, profile_id: ProfileId) -> Result<DetectionReport> {
        let guard = self.try_begin_job()?;
        let profile = profile_id.profile();
        self.ensure_tools()?;
        let mut job = Job::new(None);
        job.advance(FlashStage::Detecting, &format!("Detecting {}", profile.display_name));
        let conn = match self.connect(profile, guard.cancel_token(), &mut job) {
            Ok(conn) => conn,
            Err(e) => return Err(job.fail(e)),
        };
        let detected = identify(&conn.identification);
        Ok(DetectionReport {
            profile: profile_id,
            strategy: conn.strategy,
            identification: conn.identification,
            detected,
            mismatch: detected.mismatches(profile_id),
            attempts: job.attempts,
            output: conn.output,
        })
    }

    /// Read the three UID words of the attached target.
    pub fn read_uid(&self, profile_id: ProfileId) -> Result<Uid> {
        let guard = self.try_begin_job()?;
        self.read_uid_with(profile_id.profile(), guard.cancel_token())
    }

    /// Read the option bytes and decode the read-out protection level.
    pub fn check_protection(&self, profile_id: ProfileId) -> Result<ProtectionStatus> {
        let guard = self.try_begin_job()?;
        self.protection_with(profile_id.profile(), guard.cancel_token())
    }

    /// Remove level-1 read-out protection. The target's flash is erased.
    pub fn unlock_flash(&self, profile_id: ProfileId) -> Result<ProtectionStatus> {
        let guard = self.try_begin_job()?;
        let cancel = guard.cancel_token();
        let profile = profile_id.profile();
        let primary = Primary::new(self.runner.as_ref(), &self.settings, profile);
        if !primary.is_available() {
            return Err(Error::ToolNotFound(
                self.settings
                    .openocd
                    .clone(),
            ));
        }

        let before = self.protection_with(profile, cancel)?;
        match before.level {
            0 => {
                info!("{} is not protected", profile.display_name);
                return Ok(before);
            },
            2 => {
                return Err(Error::FlashFailed(
                    "read-out protection level 2 is permanent and cannot be removed".to_string(),
                ));
            },
            _ => {},
        }

        let attempts = [
            (PRIMARY_SPEEDS_KHZ[0], ResetMode::ConnectUnderReset),
            (PRIMARY_SPEEDS_KHZ[0], ResetMode::NoneSeparate),
            (PRIMARY_SPEEDS_KHZ[1], ResetMode::ConnectUnderReset),
            (PRIMARY_SPEEDS_KHZ[1], ResetMode::NoneSeparate),
        ];
        for (speed, reset) in attempts {
            info!("Unlocking flash at {speed} kHz, {reset}");
            match primary.unlock(speed, reset, cancel) {
                Ok(_) => {},
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Unlock run failed: {e}");
                    continue;
                },
            }
            let after = self.protection_with(profile, cancel)?;
            if !after.is_protected() {
                info!("Flash protection removed");
                return Ok(after);
            }
            cancel.sleep(self.settings.attempt_pause)?;
        }
        Err(Error::FlashFailed(
            "flash protection is still active (a power cycle may be required)".to_string(),
        ))
    }

    /// Leave the target running after a session. Best effort.
    pub fn release_target(&self, profile_id: ProfileId) -> bool {
        let guard = match self.try_begin_job() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Not releasing target: {e}");
                return false;
            },
        };
        let primary = Primary::new(self.runner.as_ref(), &self.settings, profile_id.profile());
        if !primary.is_available() {
            debug!("Primary tool missing, nothing to release with");
            return false;
        }
        match primary.release(guard.cancel_token()) {
            Ok(out) if out.exited_cleanly() => true,
            Ok(out) => {
                warn!("Target release exited with {:?}", out.exit_code);
                false
            },
            Err(e) => {
                warn!("Target release failed: {e}");
                false
            },
        }
    }

    fn ensure_tools(&self) -> Result<()> {
        if self
            .runner
            .is_available(&self.settings.openocd)
            || self
                .runner
                .is_available(&self.settings.cube_cli)
        {
            Ok(())
        } else {
            Err(Error::ProbeNotFound {
                primary: self
                    .settings
                    .openocd
                    .display()
                    .to_string(),
                secondary: self
                    .settings
                    .cube_cli
                    .display()
                    .to_string(),
            })
        }
    }

    fn run_flash(
        &self,
        request: &FlashRequest,
        events: Option<Sender<FlashEvent>>,
        cancel: &CancelToken,
    ) -> Result<FlashReport> {
        let profile = request
            .profile
            .profile();
        let size = check_firmware(&request.firmware, profile)?;
        let mut job = Job::new(events);

        let capacity = profile.flash_size_bytes;
        if size * 10 > capacity * 9 {
            job.notify(
                EventKind::Warning,
                &format!(
                    "Firmware uses {:.1}% of {} flash ({size} of {capacity} bytes)",
                    usage_percent(size, capacity),
                    profile.display_name
                ),
            );
        }

        self.ensure_tools()?;
        job.advance(FlashStage::Detecting, &format!("Detecting {}", profile.display_name));
        let conn = match self.connect(profile, cancel, &mut job) {
            Ok(conn) => conn,
            Err(e) => return Err(job.fail(e)),
        };

        let detected = identify(&conn.identification);
        let mismatch = detected.mismatches(request.profile);
        if mismatch {
            job.notify(
                EventKind::Warning,
                &format!("Detected {detected} but {} was selected", request.profile),
            );
        }
        job.advance(FlashStage::Connecting, &format!("Connected via {}", conn.strategy));

        let firmware = firmware_arg(&request.firmware);
        job.advance(FlashStage::Erasing, "Erasing flash");
        let run = match &conn.strategy {
            Strategy::Primary { speed_khz, reset } => {
                Primary::new(self.runner.as_ref(), &self.settings, profile)
                    .program(*speed_khz, *reset, &firmware, cancel, &mut |stage, line| {
                        job.advance(stage, line);
                    })
                    .and_then(|out| openocd::check_program(&out).map(|()| out))
            },
            Strategy::Secondary { token } => Secondary::new(self.runner.as_ref(), &self.settings)
                .program(
                    token,
                    &firmware,
                    profile.flash_base_address,
                    cancel,
                    &mut |stage, line| job.advance(stage, line),
                )
                .and_then(|out| cube::check_program(&out).map(|()| out)),
        };
        let output = match run {
            Ok(out) => out.output,
            Err(e) => {
                return Err(job.fail(e));
            },
        };
        job.last_output
            .clone_from(&output);
        job.advance(FlashStage::Complete, "Flash completed successfully");

        Ok(FlashReport {
            profile: request.profile,
            firmware: request
                .firmware
                .clone(),
            firmware_size: size,
            strategy: conn.strategy,
            identification: conn.identification,
            detected,
            mismatch,
            attempts: job
                .attempts
                .clone(),
            output,
        })
    }

    /// Walk the primary matrix, then the secondary tokens.
    fn connect(
        &self,
        profile: &'static DeviceProfile,
        cancel: &CancelToken,
        job: &mut Job,
    ) -> Result<Connection> {
        let primary = Primary::new(self.runner.as_ref(), &self.settings, profile);
        let secondary = Secondary::new(self.runner.as_ref(), &self.settings);

        if primary.is_available() {
            for (i, strategy) in Strategy::primary_matrix()
                .into_iter()
                .enumerate()
            {
                let Strategy::Primary { speed_khz, reset } = strategy else {
                    continue;
                };
                if i > 0 {
                    job.notify(EventKind::Retry, &format!("Trying {strategy}"));
                    cancel.sleep(self.settings.attempt_pause)?;
                }
                match primary.probe(speed_khz, reset, cancel) {
                    Ok(probe) => {
                        job.record(strategy.clone(), probe.outcome, &probe.output);
                        if probe.outcome == AttemptOutcome::Success {
                            self.remember(&strategy);
                            return Ok(Connection {
                                strategy,
                                identification: probe.identification,
                                output: probe.output.output,
                            });
                        }
                    },
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!("Probe {strategy} could not run: {e}");
                        job.record(strategy, AttemptOutcome::CoreNotFound, &ToolOutput::default());
                    },
                }
            }
        }

        if secondary.is_available() {
            job.notify(EventKind::Retry, "Falling back to the vendor CLI");
            let access_port = secondary.access_port(cancel)?;
            for token in connect_tokens(access_port) {
                let strategy = Strategy::Secondary {
                    token: token.clone(),
                };
                match secondary.probe(&token, cancel) {
                    Ok(probe) => {
                        job.record(strategy.clone(), probe.outcome, &probe.output);
                        if probe.outcome == AttemptOutcome::Success {
                            self.remember(&strategy);
                            return Ok(Connection {
                                strategy,
                                identification: probe.identification,
                                output: probe.output.output,
                            });
                        }
                        job.notify(EventKind::Retry, &format!("`{token}` did not connect"));
                    },
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!("Token `{token}` could not run: {e}");
                        job.record(strategy, AttemptOutcome::CoreNotFound, &ToolOutput::default());
                    },
                }
            }
        }

        Err(Error::StrategiesExhausted(
            job.attempts
                .len(),
        ))
    }

    fn remember(&self, strategy: &Strategy) {
        *self
            .last_strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(strategy.clone());
    }

    /// Strategies for a memory read: the last one that worked, then the rest.
    fn read_order(&self, access_port: Option<u32>) -> Vec<Strategy> {
        let last = self
            .last_strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut order: Vec<Strategy> = last
            .iter()
            .cloned()
            .collect();
        let rest = Strategy::primary_matrix()
            .into_iter()
            .chain(
                connect_tokens(access_port)
                    .into_iter()
                    .map(|token| Strategy::Secondary { token }),
            );
        for strategy in rest {
            if !order.contains(&strategy) {
                order.push(strategy);
            }
        }
        order
    }

    /// Read `count` words at `address` through the first strategy that
    /// yields a parseable dump.
    fn read_memory(
        &self,
        profile: &'static DeviceProfile,
        address: u32,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<(Vec<u32>, Strategy)> {
        self.ensure_tools()?;
        let primary = Primary::new(self.runner.as_ref(), &self.settings, profile);
        let secondary = Secondary::new(self.runner.as_ref(), &self.settings);
        let (has_primary, has_secondary) = (primary.is_available(), secondary.is_available());

        let mut tried = 0;
        for strategy in self.read_order(None) {
            let run = match &strategy {
                Strategy::Primary { speed_khz, reset } if has_primary => {
                    primary.read_words(*speed_khz, *reset, address, count, cancel)
                },
                Strategy::Secondary { token } if has_secondary => {
                    secondary.read_words(token, address, count, cancel)
                },
                _ => continue,
            };
            tried += 1;
            match run {
                Ok(out) => match parse_words(&out.output, address, count) {
                    Ok(words) => {
                        debug!("Read 0x{address:08X} via {strategy}");
                        self.remember(&strategy);
                        return Ok((words, strategy));
                    },
                    Err(e) => debug!("No dump via {strategy}: {e}"),
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("Read via {strategy} failed: {e}"),
            }
        }
        Err(Error::StrategiesExhausted(tried))
    }

    fn read_uid_with(&self, profile: &'static DeviceProfile, cancel: &CancelToken) -> Result<Uid> {
        let (words, _) = self.read_memory(profile, profile.uid_register_address, 3, cancel)?;
        let words = <[u32; 3]>::try_from(words.as_slice())
            .map_err(|_| Error::Parse(format!("expected 3 UID words, got {}", words.len())))?;
        Ok(Uid { words })
    }

    fn protection_with(
        &self,
        profile: &'static DeviceProfile,
        cancel: &CancelToken,
    ) -> Result<ProtectionStatus> {
        match self.read_memory(profile, profile.option_bytes_address, 1, cancel) {
            Ok((words, _)) => {
                let status = ProtectionStatus::from_option_bytes(words[0]);
                info!("Option bytes 0x{:08X}: RDP level {}", words[0], status.level);
                return Ok(status);
            },
            Err(e @ (Error::Cancelled | Error::ProbeNotFound { .. })) => return Err(e),
            Err(e) => debug!("Option bytes unreadable ({e}), scanning flash listing"),
        }

        let primary = Primary::new(self.runner.as_ref(), &self.settings, profile);
        if primary.is_available() {
            for (speed, reset) in [
                (PRIMARY_SPEEDS_KHZ[0], ResetMode::NoneSeparate),
                (PRIMARY_SPEEDS_KHZ[1], ResetMode::ConnectUnderReset),
            ] {
                match primary.flash_list(speed, reset, cancel) {
                    Ok(out) => {
                        if let Some(level) = scan_protection(&out.output) {
                            return Ok(ProtectionStatus {
                                level,
                                source: ProtectionSource::FlashList,
                                option_bytes: None,
                            });
                        }
                    },
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => debug!("flash list failed: {e}"),
                }
            }
        }
        Ok(ProtectionStatus {
            level: 0,
            source: ProtectionSource::Undetermined,
            option_bytes: None,
        })
    }
}

/// Size of the image, rejecting missing and oversized files.
fn check_firmware(path: &Path, profile: &DeviceProfile) -> Result<u64> {
    let meta = fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FirmwareNotFound(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })?;
    if !meta.is_file() {
        return Err(Error::FirmwareNotFound(path.to_path_buf()));
    }
    let size = meta.len();
    if size == 0 {
        return Err(Error::InvalidConfig(format!("{} is empty", path.display())));
    }
    if size > profile.flash_size_bytes {
        return Err(Error::FirmwareTooLarge {
            size,
            capacity: profile.flash_size_bytes,
        });
    }
    Ok(size)
}

#[allow(clippy::cast_precision_loss)]
fn usage_percent(size: u64, capacity: u64) -> f64 {
    size as f64 * 100.0 / capacity as f64
}

/// Firmware path as passed to the tools, with forward slashes.
fn firmware_arg(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
}
