//! Primary backend: an OpenOCD-style debug server driven by `-c` commands.

use {
    super::{
        AttemptOutcome, FlashSettings, FlashStage, Identification, ResetMode,
        profile::DeviceProfile,
    },
    crate::{
        error::{Error, Result},
        process::{CancelToken, ToolInvocation, ToolOutput, ToolRunner},
    },
    log::debug,
    std::time::Duration,
};

/// Printed once the server has processed `shutdown`.
pub const FINISH_MARKER: &str = "shutdown command invoked";

/// How long to wait for a clean exit after [`FINISH_MARKER`].
pub const FINISH_GRACE: Duration = Duration::from_secs(1);

const PROGRAMMING_STARTED: &str = "** Programming Started **";
const VERIFY_STARTED: &str = "** Verify Started **";
const VERIFIED_OK: &str = "** Verified OK **";
const PROGRAMMING_FAILED: &str = "** Programming Failed **";
const VERIFY_FAILED: &str = "** Verify Failed **";
const NO_FLASH_BANK: &str = "no flash bank found";

/// Result of a single connect probe.
#[derive(Debug, Clone)]
pub struct Probe {
    /// How the probe ended.
    pub outcome: AttemptOutcome,
    /// Markers found in the output.
    pub identification: Identification,
    /// Raw tool output.
    pub output: ToolOutput,
}

/// Command builder and output interpreter for the primary tool.
pub struct Primary<'a> {
    runner: &'a dyn ToolRunner,
    settings: &'a FlashSettings,
    profile: &'static DeviceProfile,
}

impl<'a> Primary<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        settings: &'a FlashSettings,
        profile: &'static DeviceProfile,
    ) -> Self {
        Self {
            runner,
            settings,
            profile,
        }
    }

    pub fn is_available(&self) -> bool {
        self.runner
            .is_available(&self.settings.openocd)
    }

    fn session(&self, speed_khz: u32, reset: ResetMode, commands: &[String]) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            self.settings
                .scripts
                .display()
                .to_string(),
            "-f".to_string(),
            self.settings
                .interface
                .clone(),
            "-f".to_string(),
            format!("target/{}", self.profile.target_config),
            "-c".to_string(),
            format!("adapter speed {speed_khz}"),
            "-c".to_string(),
            reset
                .as_command()
                .to_string(),
            "-c".to_string(),
            "init".to_string(),
        ];
        for command in commands {
            args.push("-c".to_string());
            args.push(command.clone());
        }
        args
    }

    fn invoke(&self, args: Vec<String>, timeout: Duration) -> ToolInvocation {
        ToolInvocation::new(
            self.settings
                .openocd
                .clone(),
            args,
            timeout,
        )
        .with_finish_marker(FINISH_MARKER, FINISH_GRACE)
    }

    /// Try to start a session and read the core type.
    pub fn probe(&self, speed_khz: u32, reset: ResetMode, cancel: &CancelToken) -> Result<Probe> {
        let args =
            self.session(speed_khz, reset, &commands(&["targets", "reset halt", "shutdown"]));
        let output = self
            .runner
            .run(&self.invoke(args, self.settings.probe_timeout), cancel, &mut |_| {})?;
        let identification = Identification::parse(&output.output);
        let outcome = if identification.is_positive() {
            AttemptOutcome::Success
        } else if output.timed_out {
            AttemptOutcome::Timeout
        } else {
            AttemptOutcome::CoreNotFound
        };
        debug!("Primary probe {speed_khz} kHz / {reset}: {outcome:?}");
        Ok(Probe {
            outcome,
            identification,
            output,
        })
    }

    /// Erase, write, verify and restart the target.
    ///
    /// The raw output is returned; [`check_program`] decides the result.
    pub fn program(
        &self,
        speed_khz: u32,
        reset: ResetMode,
        firmware: &str,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(FlashStage, &str),
    ) -> Result<ToolOutput> {
        let base = self
            .profile
            .flash_base_address;
        let args = self.session(speed_khz, reset, &[
            "reset halt".to_string(),
            format!("flash write_image erase {{{firmware}}} 0x{base:08X}"),
            format!("verify_image {{{firmware}}} 0x{base:08X}"),
            "reset run".to_string(),
            "shutdown".to_string(),
        ]);
        self.runner
            .run(&self.invoke(args, self.settings.program_timeout), cancel, &mut |line| {
                if let Some(stage) = stage_for_line(line) {
                    on_stage(stage, line);
                }
            })
    }

    /// Read `count` 32-bit words at `address`.
    pub fn read_words(
        &self,
        speed_khz: u32,
        reset: ResetMode,
        address: u32,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<ToolOutput> {
        let args = self.session(speed_khz, reset, &[
            "reset halt".to_string(),
            "sleep 100".to_string(),
            format!("mdw 0x{address:08X} {count}"),
            "shutdown".to_string(),
        ]);
        self.runner
            .run(&self.invoke(args, self.settings.probe_timeout), cancel, &mut |_| {})
    }

    /// Dump the flash bank list, which reports protection on some parts.
    pub fn flash_list(
        &self,
        speed_khz: u32,
        reset: ResetMode,
        cancel: &CancelToken,
    ) -> Result<ToolOutput> {
        let args = self.session(
            speed_khz,
            reset,
            &commands(&["reset halt", "flash probe 0", "flash list", "shutdown"]),
        );
        self.runner
            .run(&self.invoke(args, self.settings.probe_timeout), cancel, &mut |_| {})
    }

    /// Drop read-out protection; the part mass-erases itself.
    pub fn unlock(
        &self,
        speed_khz: u32,
        reset: ResetMode,
        cancel: &CancelToken,
    ) -> Result<ToolOutput> {
        let unlock = format!("{} unlock 0", self.profile.flash_driver);
        let args = self.session(speed_khz, reset, &[
            "reset halt".to_string(),
            unlock,
            "reset run".to_string(),
            "sleep 500".to_string(),
            "reset halt".to_string(),
            "shutdown".to_string(),
        ]);
        self.runner
            .run(&self.invoke(args, self.settings.program_timeout), cancel, &mut |_| {})
    }

    /// Pulse reset and leave the target running.
    pub fn release(&self, cancel: &CancelToken) -> Result<ToolOutput> {
        let args = self.session(
            super::PRIMARY_SPEEDS_KHZ[0],
            ResetMode::ConnectUnderReset,
            &commands(&["reset run", "shutdown"]),
        );
        self.runner
            .run(&self.invoke(args, self.settings.probe_timeout), cancel, &mut |_| {})
    }
}

fn commands(list: &[&str]) -> Vec<String> {
    list.iter()
        .map(|c| (*c).to_string())
        .collect()
}

/// Stage implied by a progress line of the primary tool.
pub fn stage_for_line(line: &str) -> Option<FlashStage> {
    if line.contains(PROGRAMMING_STARTED) {
        Some(FlashStage::Downloading)
    } else if line.contains(VERIFY_STARTED) || line.contains(VERIFIED_OK) {
        Some(FlashStage::Verifying)
    } else {
        None
    }
}

/// Interpret the output of a program run.
pub fn check_program(output: &ToolOutput) -> Result<()> {
    let text = &output.output;
    if text.contains(VERIFY_FAILED) {
        return Err(Error::FlashVerifyFailed);
    }
    if let Some(marker) = [PROGRAMMING_FAILED, NO_FLASH_BANK]
        .into_iter()
        .find(|m| text.contains(m))
    {
        return Err(Error::FlashFailed(marker.to_string()));
    }
    if text.contains(VERIFIED_OK) {
        return Ok(());
    }
    if output.timed_out {
        return Err(Error::Timeout("programming did not finish".to_string()));
    }
    Err(Error::FlashFailed(format!(
        "no verification reported (exit code {})",
        output
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string())
    )))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            flash::ProfileId,
            process::scripted::{ScriptedRunner, exited, failed},
        },
    };

    fn settings() -> FlashSettings {
        FlashSettings::default()
            .with_openocd("/opt/openocd/bin/openocd")
            .with_scripts("/opt/openocd/scripts")
    }

    #[test]
    fn probe_arguments() {
        let runner =
            ScriptedRunner::new(|_, _| Ok(exited("Info : Cortex-M4 r0p1 processor detected")));
        let settings = settings();
        let primary = Primary::new(&runner, &settings, ProfileId::Droplet.profile());
        let probe = primary
            .probe(480, ResetMode::NoneSeparate, &CancelToken::new())
            .unwrap();
        assert_eq!(probe.outcome, AttemptOutcome::Success);

        let call = &runner.calls()[0];
        assert_eq!(call.args, vec![
            "-s",
            "/opt/openocd/scripts",
            "-f",
            "interface/stlink.cfg",
            "-f",
            "target/stm32wlx.cfg",
            "-c",
            "adapter speed 480",
            "-c",
            "reset_config none separate",
            "-c",
            "init",
            "-c",
            "targets",
            "-c",
            "reset halt",
            "-c",
            "shutdown"
        ]);
        assert_eq!(call.timeout, Duration::from_secs(10));
        assert_eq!(
            call.finish_marker
                .as_ref()
                .map(|(m, _)| m.as_str()),
            Some(FINISH_MARKER)
        );
    }

    #[test]
    fn probe_outcomes() {
        let runner = ScriptedRunner::new(|inv, _| {
            if inv
                .args
                .iter()
                .any(|a| a == "adapter speed 480")
            {
                Ok(ToolOutput {
                    exit_code: None,
                    output: "Info : clock speed 480 kHz\n".into(),
                    timed_out: true,
                })
            } else {
                Ok(failed("Error: init mode failed (unable to connect to the target)"))
            }
        });
        let settings = settings();
        let primary = Primary::new(&runner, &settings, ProfileId::ZoneController.profile());
        let cancel = CancelToken::new();
        assert_eq!(
            primary
                .probe(480, ResetMode::None, &cancel)
                .unwrap()
                .outcome,
            AttemptOutcome::Timeout
        );
        assert_eq!(
            primary
                .probe(100, ResetMode::None, &cancel)
                .unwrap()
                .outcome,
            AttemptOutcome::CoreNotFound
        );
    }

    #[test]
    fn partial_output_with_core_counts_as_connected() {
        let runner = ScriptedRunner::new(|_, _| {
            Ok(failed(
                "Info : STLINK V2J37S7\nWarn : UNEXPECTED idcode: 0x2ba01477\nInfo : device id = 0x10036497\nError: timed out while waiting for target halted",
            ))
        });
        let settings = settings();
        let primary = Primary::new(&runner, &settings, ProfileId::Droplet.profile());
        let probe = primary
            .probe(100, ResetMode::SrstOnly, &CancelToken::new())
            .unwrap();
        assert_eq!(probe.outcome, AttemptOutcome::Success);
        assert_eq!(
            probe
                .identification
                .device_id
                .as_deref(),
            Some("10036497")
        );
    }

    #[test]
    fn program_commands_and_stages() {
        let runner = ScriptedRunner::new(|_, _| {
            Ok(exited(
                "** Programming Started **\n** Programming Finished **\n** Verify Started **\n** Verified OK **\nshutdown command invoked",
            ))
        });
        let settings = settings();
        let primary = Primary::new(&runner, &settings, ProfileId::Droplet.profile());
        let mut stages = Vec::new();
        let output = primary
            .program(
                480,
                ResetMode::ConnectUnderReset,
                "C:/fw/droplet v2.bin",
                &CancelToken::new(),
                &mut |stage, _| stages.push(stage),
            )
            .unwrap();
        assert!(check_program(&output).is_ok());
        assert_eq!(stages, vec![
            FlashStage::Downloading,
            FlashStage::Verifying,
            FlashStage::Verifying
        ]);
        let args = &runner.calls()[0].args;
        assert!(
            args.contains(&"flash write_image erase {C:/fw/droplet v2.bin} 0x08000000".to_string())
        );
        assert!(args.contains(&"verify_image {C:/fw/droplet v2.bin} 0x08000000".to_string()));
        assert!(
            args.contains(&"reset_config srst_only srst_nogate connect_assert_srst".to_string())
        );
    }

    #[test]
    fn program_failure_markers() {
        let verify = exited("** Programming Started **\n** Verify Failed **");
        assert!(matches!(check_program(&verify), Err(Error::FlashVerifyFailed)));
        let bank = failed("Error: no flash bank found for address 0x08000000");
        assert!(matches!(check_program(&bank), Err(Error::FlashFailed(m)) if m == NO_FLASH_BANK));
        let slow = ToolOutput {
            exit_code: None,
            output: "** Programming Started **".into(),
            timed_out: true,
        };
        assert!(matches!(check_program(&slow), Err(Error::Timeout(_))));
        assert!(matches!(check_program(&exited("")), Err(Error::FlashFailed(_))));
    }

    #[test]
    fn unlock_uses_family_driver() {
        let runner = ScriptedRunner::new(|_, _| Ok(exited("")));
        let settings = settings();
        let primary = Primary::new(&runner, &settings, ProfileId::ZoneController.profile());
        primary
            .unlock(100, ResetMode::ConnectUnderReset, &CancelToken::new())
            .unwrap();
        assert!(
            runner.calls()[0]
                .args
                .contains(&"stm32f0x unlock 0".to_string())
        );
    }
}
