//! Secondary backend: the vendor programming CLI.
//!
//! Used only after every primary strategy failed. Connect tokens are walked in
//! order; each token gets a few short probes with growing delays because the
//! moment the target leaves reset varies from board to board.

use {
    super::{AttemptOutcome, FlashSettings, FlashStage, Identification},
    crate::{
        error::{Error, Result},
        process::{CancelToken, ToolInvocation, ToolOutput, ToolRunner},
    },
    log::{debug, warn},
    regex::Regex,
    std::{sync::LazyLock, time::Duration},
};

/// Default delay before each probe of one token.
pub const PROBE_DELAYS: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// Printed after a verified download.
pub const SUCCESS_PHRASE: &str = "Download verified successfully";

static CONNECTED_RE: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"(?i)Device ID|Device name|Device\s*:").expect("Invalid connect regex")
    });
static ACCESS_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"(?i)Access Port Number\s*:\s*(\d+)").expect("Invalid access port regex")
    });

/// Connect tokens in the order they are tried.
pub fn connect_tokens(access_port: Option<u32>) -> Vec<String> {
    let mut tokens = Vec::with_capacity(4);
    if let Some(index) = access_port {
        tokens.push(format!("port=SWD index={index} mode=UR"));
        tokens.push(format!("port=SWD index={index}"));
    }
    tokens.push("port=SWD mode=UR".to_string());
    tokens.push("port=SWD".to_string());
    tokens
}

/// Access-port index from a `--list` dump.
pub fn parse_access_port(output: &str) -> Option<u32> {
    ACCESS_PORT_RE
        .captures(output)
        .and_then(|c| {
            c[1].parse()
                .ok()
        })
}

/// Result of probing one token.
#[derive(Debug, Clone)]
pub struct TokenProbe {
    /// Combined outcome of all probes of the token.
    pub outcome: AttemptOutcome,
    /// Markers from the successful probe, if any.
    pub identification: Identification,
    /// Output of the last probe.
    pub output: ToolOutput,
}

pub struct Secondary<'a> {
    runner: &'a dyn ToolRunner,
    settings: &'a FlashSettings,
}

impl<'a> Secondary<'a> {
    pub fn new(runner: &'a dyn ToolRunner, settings: &'a FlashSettings) -> Self {
        Self { runner, settings }
    }

    pub fn is_available(&self) -> bool {
        self.runner
            .is_available(&self.settings.cube_cli)
    }

    fn run(
        &self,
        args: Vec<String>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ToolOutput> {
        let invocation = ToolInvocation::new(self.settings.cube_cli.clone(), args, timeout);
        self.runner
            .run(&invocation, cancel, &mut |_| {})
    }

    /// Discover the probe's access-port index.
    pub fn access_port(&self, cancel: &CancelToken) -> Result<Option<u32>> {
        match self.run(vec!["--list".to_string()], self.settings.secondary_probe_timeout, cancel) {
            Ok(out) => Ok(parse_access_port(&out.output)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!("Listing probes failed: {e}");
                Ok(None)
            },
        }
    }

    /// Probe `token` once per configured probe delay.
    pub fn probe(&self, token: &str, cancel: &CancelToken) -> Result<TokenProbe> {
        let mut last = ToolOutput::default();
        for (n, delay) in self
            .settings
            .secondary_probe_delays
            .iter()
            .enumerate()
        {
            cancel.sleep(*delay)?;
            let out = match self.run(
                vec!["--connect".to_string(), token.to_string()],
                self.settings.secondary_probe_timeout,
                cancel,
            ) {
                Ok(out) => out,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Probe {} with `{token}` failed to run: {e}", n + 1);
                    continue;
                },
            };
            if CONNECTED_RE.is_match(&out.output) {
                debug!("`{token}` connected on probe {}", n + 1);
                return Ok(TokenProbe {
                    outcome: AttemptOutcome::Success,
                    identification: Identification::parse(&out.output),
                    output: out,
                });
            }
            last = out;
        }
        Ok(TokenProbe {
            outcome: if last.timed_out {
                AttemptOutcome::Timeout
            } else {
                AttemptOutcome::CoreNotFound
            },
            identification: Identification::default(),
            output: last,
        })
    }

    /// Mass-erase, download and verify; [`check_program`] decides the result.
    pub fn program(
        &self,
        token: &str,
        firmware: &str,
        base: u32,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(FlashStage, &str),
    ) -> Result<ToolOutput> {
        let args = vec![
            "--connect".to_string(),
            token.to_string(),
            "--erase".to_string(),
            "all".to_string(),
            "--download".to_string(),
            firmware.to_string(),
            format!("0x{base:08X}"),
            "--verify".to_string(),
        ];
        let invocation = ToolInvocation::new(
            self.settings
                .cube_cli
                .clone(),
            args,
            self.settings
                .secondary_program_timeout,
        );
        self.runner
            .run(&invocation, cancel, &mut |line| {
                if let Some(stage) = stage_for_line(line) {
                    on_stage(stage, line);
                }
            })
    }

    /// Read `count` 32-bit words at `address`.
    pub fn read_words(
        &self,
        token: &str,
        address: u32,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<ToolOutput> {
        self.run(
            vec![
                "--connect".to_string(),
                token.to_string(),
                "-r32".to_string(),
                format!("0x{address:08X}"),
                (count * 4).to_string(),
            ],
            self.settings.secondary_probe_timeout,
            cancel,
        )
    }
}

/// Stage implied by a progress line of the vendor CLI.
pub fn stage_for_line(line: &str) -> Option<FlashStage> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("verif") {
        Some(FlashStage::Verifying)
    } else if lower.contains("download") {
        Some(FlashStage::Downloading)
    } else if lower.contains("erasing") {
        Some(FlashStage::Erasing)
    } else {
        None
    }
}

/// Interpret the output of a download run.
///
/// Success needs both the success phrase and exit code 0.
pub fn check_program(output: &ToolOutput) -> Result<()> {
    let text = &output.output;
    let verified = text.contains(SUCCESS_PHRASE);
    if verified && output.exit_code == Some(0) && !output.timed_out {
        return Ok(());
    }
    let lower = text.to_ascii_lowercase();
    if lower.contains("data mismatch") || lower.contains("verification failed") {
        return Err(Error::FlashVerifyFailed);
    }
    if output.timed_out {
        return Err(Error::Timeout("download did not finish".to_string()));
    }
    if verified {
        return Err(Error::FlashFailed(format!(
            "tool exited with {:?} after reporting success",
            output.exit_code
        )));
    }
    let reason = text
        .lines()
        .rev()
        .find(|l| l.contains("Error"))
        .unwrap_or("success phrase not found")
        .trim()
        .to_string();
    Err(Error::FlashFailed(reason))
}
