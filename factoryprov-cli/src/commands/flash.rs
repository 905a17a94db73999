//! Debug-probe commands: detect, flash, UID, protection and tool status.

use {
    crate::{Cli, CliError, config::Config, print_json, use_fancy_output},
    anyhow::{Result, anyhow},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    factoryprov::{
        Error as LibError, FlashEvent, FlashOrchestrator, FlashRequest, FlashStage, ProfileId, Uid,
        flash::{EventKind, IdentifiedFlash},
        identity::DEFAULT_VERSION_BYTE,
    },
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    std::{
        io::IsTerminal,
        path::Path,
        sync::{Arc, mpsc},
        thread,
    },
};

/// Lines of tool output shown after a failed job.
const OUTPUT_TAIL_LINES: usize = 15;

fn orchestrator(config: &Config) -> FlashOrchestrator {
    FlashOrchestrator::new(config.flash_settings(), Arc::new(config.tool_runner()))
}

/// Bar position reached when a stage starts.
fn stage_position(stage: FlashStage) -> u64 {
    match stage {
        FlashStage::Idle => 0,
        FlashStage::Detecting => 5,
        FlashStage::Connecting => 20,
        FlashStage::Erasing => 30,
        FlashStage::Downloading => 50,
        FlashStage::Verifying => 80,
        FlashStage::Complete | FlashStage::Failed => 100,
    }
}

/// Renders flash events on a progress bar, or as plain lines without a TTY.
struct Progress {
    bar: ProgressBar,
    fancy: bool,
    quiet: bool,
}

impl Progress {
    fn new(quiet: bool) -> Result<Self> {
        let fancy = !quiet && use_fancy_output();
        let bar = if fancy {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}",
                    )?
                    .progress_chars("#>-"),
            );
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar
        } else {
            ProgressBar::hidden()
        };
        Ok(Self { bar, fancy, quiet })
    }

    fn show(&self, event: &FlashEvent) {
        if self.quiet {
            return;
        }
        match event.kind {
            EventKind::Stage(stage) => {
                if self.fancy {
                    self.bar
                        .set_position(stage_position(stage));
                    self.bar
                        .set_message(event.message.clone());
                } else {
                    eprintln!("[{stage}] {}", event.message);
                }
            },
            EventKind::Warning => {
                let line = format!("{} {}", style("⚠").yellow(), event.message);
                if self.fancy {
                    self.bar
                        .println(line);
                } else {
                    eprintln!("{line}");
                }
            },
            EventKind::Retry => {
                if self.fancy {
                    self.bar
                        .set_message(event.message.clone());
                } else {
                    eprintln!("  {}", style(&event.message).dim());
                }
            },
        }
    }

    fn finish(&self, ok: bool) {
        if ok {
            self.bar
                .finish_with_message("done");
        } else {
            self.bar
                .abandon();
        }
    }
}

/// Print the attempt log and the tail of the tool output of a failed job.
fn report_failure(err: &LibError) {
    let LibError::JobFailed(job) = err else {
        return;
    };
    if !job
        .attempts
        .is_empty()
    {
        eprintln!("{}", style("Connection attempts:").bold());
        for attempt in &job.attempts {
            eprintln!("  {attempt}");
        }
    }
    let lines: Vec<&str> = job
        .output
        .lines()
        .collect();
    if !lines.is_empty() {
        eprintln!("{}", style("Tool output:").bold());
        for line in &lines[lines
            .len()
            .saturating_sub(OUTPUT_TAIL_LINES)..]
        {
            eprintln!("  {}", style(line).dim());
        }
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    target: ProfileId,
    identify: bool,
    release: bool,
    json: bool,
) -> Result<()> {
    let orch = orchestrator(config);
    let request = FlashRequest::new(firmware, target);
    let progress = Progress::new(cli.quiet || json)?;
    if !cli.quiet && !json {
        eprintln!("{} Flashing {} onto {target}", style("📦").cyan(), firmware.display());
    }

    let (tx, rx) = mpsc::channel();
    let result = thread::scope(|s| {
        let (orch, request) = (&orch, &request);
        let job = s.spawn(move || {
            if identify {
                orch.flash_and_identify(request, tx)
            } else {
                orch.flash(request, tx)
                    .map(|flash| IdentifiedFlash {
                        flash,
                        uid: None,
                        address: None,
                        uid_error: None,
                    })
            }
        });
        for event in rx {
            progress.show(&event);
        }
        job.join()
    })
    .map_err(|_| anyhow!("flash thread panicked"))?;

    progress.finish(result.is_ok());
    let flashed = match result {
        Ok(flashed) => flashed,
        Err(err) => {
            if !cli.quiet {
                report_failure(&err);
            }
            return Err(err.into());
        },
    };

    if release && !orch.release_target(target) && !cli.quiet {
        eprintln!("{} Target could not be released", style("⚠").yellow());
    }

    if json {
        return print_json(&flashed);
    }
    let report = &flashed.flash;
    println!(
        "{} Flashed {} bytes via [{}] {} after {} attempt(s)",
        style("✓").green(),
        report.firmware_size,
        report
            .strategy
            .backend(),
        report.strategy,
        report
            .attempts
            .len()
    );
    println!("Detected: {}", report.detected);
    if report.mismatch {
        println!(
            "{} Detected {} but {} was selected",
            style("⚠").yellow(),
            report.detected,
            report.profile
        );
    }
    if let (Some(uid), Some(address)) = (&flashed.uid, &flashed.address) {
        println!("UID:      {uid}");
        println!("Address:  {}", style(address).bold());
    } else if let Some(reason) = &flashed.uid_error {
        println!("{} UID not read: {reason}", style("⚠").yellow());
    }
    Ok(())
}

/// Detect command implementation.
pub(crate) fn cmd_detect(cli: &Cli, config: &Config, target: ProfileId, json: bool) -> Result<()> {
    if !cli.quiet && !json {
        eprintln!("{} Searching for {target}...", style("⏳").yellow());
    }
    let report = orchestrator(config)
        .detect(target)
        .inspect_err(|e| {
            if !cli.quiet {
                report_failure(e);
            }
        })?;
    if json {
        return print_json(&report);
    }
    println!(
        "{} Connected via [{}] {}",
        style("✓").green(),
        report
            .strategy
            .backend(),
        report.strategy
    );
    let id = &report.identification;
    println!("Core:      {}", id.core.as_deref().unwrap_or("-"));
    println!("Device ID: {}", id.device_id.as_deref().unwrap_or("-"));
    if let Some(kb) = id.flash_size_kb {
        println!("Flash:     {kb} KiB");
    }
    println!("Detected:  {}", report.detected);
    if report.mismatch {
        println!(
            "{} Detected {} but {target} was selected",
            style("⚠").yellow(),
            report.detected
        );
    }
    Ok(())
}

/// Read-uid command implementation.
pub(crate) fn cmd_read_uid(config: &Config, target: ProfileId, json: bool) -> Result<()> {
    let orch = orchestrator(config);
    let uid = orch.read_uid(target)?;
    let address = target
        .profile()
        .supports_derived_address
        .then(|| uid.derive_address(orch.settings().version_byte));
    if json {
        return print_json(serde_json::json!({ "uid": uid, "address": address }));
    }
    println!("UID:     {uid}");
    if let Some(address) = address {
        println!("Address: {}", style(address).bold());
    }
    Ok(())
}

/// Derive-address command implementation.
pub(crate) fn cmd_derive_address(
    config: &Config,
    words: &[u32],
    version_byte: Option<u8>,
    json: bool,
) -> Result<()> {
    let words: [u32; 3] = words
        .try_into()
        .map_err(|_| CliError::Usage("exactly three UID words are required".to_string()))?;
    let version_byte = version_byte
        .or(config.flash.version_byte)
        .unwrap_or(DEFAULT_VERSION_BYTE);
    let uid = Uid { words };
    let address = uid.derive_address(version_byte);
    if json {
        return print_json(serde_json::json!({
            "uid": uid,
            "versionByte": version_byte,
            "address": address,
        }));
    }
    println!("{address}");
    Ok(())
}

/// Protection command implementation.
pub(crate) fn cmd_protection(config: &Config, target: ProfileId, json: bool) -> Result<()> {
    let status = orchestrator(config).check_protection(target)?;
    if json {
        return print_json(&status);
    }
    let level = match status.level {
        0 => style("level 0 (unprotected)").green(),
        1 => style("level 1 (unlockable)").yellow(),
        _ => style("level 2 (permanent)").red(),
    };
    println!("Read-out protection: {level}");
    if let Some(word) = status.option_bytes {
        println!("Option bytes:        0x{word:08X}");
    }
    Ok(())
}

fn confirm_unlock(cli: &Cli, target: ProfileId) -> Result<()> {
    if cli.non_interactive || !std::io::stdin().is_terminal() {
        return Err(CliError::Usage(
            "unlocking erases the whole flash; pass --yes to confirm".to_string(),
        )
        .into());
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Unlocking erases all flash on the {target}. Continue?"))
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Cancelled(e.to_string()))?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("unlock cancelled".to_string()).into())
    }
}

/// Unlock command implementation.
pub(crate) fn cmd_unlock(cli: &Cli, config: &Config, target: ProfileId, yes: bool) -> Result<()> {
    if !yes {
        confirm_unlock(cli, target)?;
    }
    if !cli.quiet {
        eprintln!("{} Removing read-out protection...", style("🔓").cyan());
    }
    let status = orchestrator(config).unlock_flash(target)?;
    println!("{} Read-out protection level {}", style("✓").green(), status.level);
    Ok(())
}

/// Release command implementation.
pub(crate) fn cmd_release(cli: &Cli, config: &Config, target: ProfileId) -> Result<()> {
    if orchestrator(config).release_target(target) {
        if !cli.quiet {
            eprintln!("{} {target} released", style("✓").green());
        }
    } else if !cli.quiet {
        eprintln!("{} {target} could not be released", style("⚠").yellow());
    }
    Ok(())
}

/// Status command implementation.
pub(crate) fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let status = orchestrator(config).status();
    if json {
        return print_json(&status);
    }
    let mark = |ok: bool| {
        if ok {
            style("available").green()
        } else {
            style("missing").red()
        }
    };
    println!(
        "Primary:      {} ({})",
        mark(status.primary_available),
        status
            .primary_path
            .display()
    );
    println!(
        "Secondary:    {} ({})",
        mark(status.secondary_available),
        status
            .secondary_path
            .display()
    );
    println!("Version byte: 0x{:02X}", status.version_byte);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_positions_increase() {
        let stages = [
            FlashStage::Idle,
            FlashStage::Detecting,
            FlashStage::Connecting,
            FlashStage::Erasing,
            FlashStage::Downloading,
            FlashStage::Verifying,
            FlashStage::Complete,
        ];
        for pair in stages.windows(2) {
            assert!(stage_position(pair[0]) < stage_position(pair[1]));
        }
    }

    #[test]
    fn derive_address_rejects_wrong_word_count() {
        let err = cmd_derive_address(&Config::default(), &[1, 2], None, true).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }
}
