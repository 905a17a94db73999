//! factoryprov CLI - factory testing and flashing of control boards.
//!
//! ## Features
//!
//! - Run per-product factory test plans over the board's serial port
//! - Flash STM32 targets through a debug probe with automatic strategy search
//! - Read the chip UID and derive the LoRa device address
//! - Inspect and remove flash read-out protection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    factoryprov::{ProfileId, TestProfile},
    log::debug,
    serde::Serialize,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    thiserror::Error,
};

mod commands;
mod config;
mod serial;

use {
    config::Config,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that map to dedicated exit codes.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Wrong or missing arguments, or a choice that needs a terminal.
    #[error("{0}")]
    Usage(String),
    /// The operator aborted.
    #[error("{0}")]
    Cancelled(String),
}

/// factoryprov - factory test and flash tool for MCU-based control boards.
///
/// Environment variables:
///   FACTORYPROV_PORT              - Default serial port
///   FACTORYPROV_BAUD              - Default baud rate (default: 115200)
///   FACTORYPROV_TARGET            - Default flash target (droplet, zone-controller)
///   FACTORYPROV_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "factoryprov")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port of the board (auto-detected if not specified).
    #[arg(short, long, global = true, env = "FACTORYPROV_PORT")]
    port: Option<String>,

    /// Baud rate of the command port.
    #[arg(short, long, global = true, env = "FACTORYPROV_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "FACTORYPROV_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read the identification fields of a board over serial.
    Info {
        /// Send the unlock handshake first.
        #[arg(long)]
        unlock: bool,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run a factory test plan against a board.
    Test {
        /// Product profile (micro-edge, acb-m, zc-lcd, droplet).
        #[arg(value_parser = parse_test_profile)]
        profile: TestProfile,

        /// Print the CSV summary header and row instead of the result table.
        #[arg(long, conflicts_with = "json")]
        summary: bool,

        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Search for the target through the probe without flashing.
    Detect {
        /// Flash target profile.
        #[arg(short, long, env = "FACTORYPROV_TARGET", value_parser = parse_profile_id)]
        target: ProfileId,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Flash a firmware image through the debug probe.
    Flash {
        /// Firmware image (.bin).
        firmware: PathBuf,

        /// Flash target profile.
        #[arg(short, long, env = "FACTORYPROV_TARGET", value_parser = parse_profile_id)]
        target: ProfileId,

        /// Read the UID afterwards and print the derived device address.
        #[arg(long)]
        identify: bool,

        /// Leave the target running after flashing.
        #[arg(long)]
        release: bool,

        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read the chip UID through the debug probe.
    ReadUid {
        /// Flash target profile.
        #[arg(short, long, env = "FACTORYPROV_TARGET", value_parser = parse_profile_id)]
        target: ProfileId,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Derive the device address from three UID words.
    DeriveAddress {
        /// UID words (hex), lowest address first.
        #[arg(num_args = 3, required = true, value_parser = parse_hex_u32)]
        uid: Vec<u32>,

        /// Version byte (hex); defaults to the configured value or C0.
        #[arg(long, value_parser = parse_hex_u8)]
        version_byte: Option<u8>,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the read-out protection level of the target.
    Protection {
        /// Flash target profile.
        #[arg(short, long, env = "FACTORYPROV_TARGET", value_parser = parse_profile_id)]
        target: ProfileId,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Remove level-1 read-out protection. Erases the whole flash.
    Unlock {
        /// Flash target profile.
        #[arg(short, long, env = "FACTORYPROV_TARGET", value_parser = parse_profile_id)]
        target: ProfileId,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Reset the target and leave it running.
    Release {
        /// Flash target profile.
        #[arg(short, long, env = "FACTORYPROV_TARGET", value_parser = parse_profile_id)]
        target: ProfileId,
    },

    /// Show which flash tools are available.
    Status {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_test_profile(s: &str) -> Result<TestProfile, String> {
    s.parse()
        .map_err(|e: factoryprov::Error| e.to_string())
}

fn parse_profile_id(s: &str) -> Result<ProfileId, String> {
    s.parse()
        .map_err(|e: factoryprov::Error| e.to_string())
}

/// Parse a hexadecimal word (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let s: String = s
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex word: {e}"))
}

/// Parse a hexadecimal byte.
fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let s = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u8::from_str_radix(s, 16).map_err(|e| format!("Invalid hex byte: {e}"))
}

/// Print `data` as the JSON success envelope on stdout.
fn print_json<T: Serialize>(data: T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&factoryprov::Outcome::ok(data))?);
    Ok(())
}

/// Get the serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        non_interactive: cli.non_interactive,
    };
    let (port, prompted) = select_serial_port(&options, config)?;
    if prompted {
        ask_remember_port(&port, config)?;
    }
    Ok(port)
}

/// Exit code for a failed command: usage 2, cancelled 130, otherwise 1.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(lib_err) = err.downcast_ref::<factoryprov::Error>() {
        if matches!(lib_err.root(), factoryprov::Error::Cancelled) {
            return 130;
        }
    }
    if was_interrupted() { 130 } else { 1 }
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    factoryprov::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(path) = &cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Info { unlock, json } => {
            commands::device::cmd_info(cli, &mut config, *unlock, *json)
        },
        Commands::Test {
            profile,
            summary,
            json,
        } => commands::device::cmd_test(cli, &mut config, *profile, *summary, *json),
        Commands::Detect { target, json } => {
            commands::flash::cmd_detect(cli, &config, *target, *json)
        },
        Commands::Flash {
            firmware,
            target,
            identify,
            release,
            json,
        } => commands::flash::cmd_flash(
            cli, &config, firmware, *target, *identify, *release, *json,
        ),
        Commands::ReadUid { target, json } => {
            commands::flash::cmd_read_uid(&config, *target, *json)
        },
        Commands::DeriveAddress {
            uid,
            version_byte,
            json,
        } => commands::flash::cmd_derive_address(&config, uid, *version_byte, *json),
        Commands::Protection { target, json } => {
            commands::flash::cmd_protection(&config, *target, *json)
        },
        Commands::Unlock { target, yes } => {
            commands::flash::cmd_unlock(cli, &config, *target, *yes)
        },
        Commands::Release { target } => commands::flash::cmd_release(cli, &config, *target),
        Commands::Status { json } => commands::flash::cmd_status(&config, *json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("factoryprov v{} (verbose level: {})", env!("CARGO_PKG_VERSION"), cli.verbose);
    install_interrupt_handler();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "factoryprov",
            "flash",
            "fw.bin",
            "--target",
            "droplet",
            "--identify",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                firmware,
                target,
                identify,
                release,
                json,
            } => {
                assert_eq!(firmware, PathBuf::from("fw.bin"));
                assert_eq!(target, ProfileId::Droplet);
                assert!(identify);
                assert!(!release && !json);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_test_profile_by_display_name() {
        let cli = Cli::try_parse_from(["factoryprov", "test", "ZC-LCD", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Test {
            profile: TestProfile::ZcLcd,
            json: true,
            ..
        }));
    }

    #[test]
    fn test_cli_rejects_unknown_target() {
        assert!(Cli::try_parse_from(["factoryprov", "detect", "--target", "esp32"]).is_err());
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "factoryprov",
            "info",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "-vv",
            "--non-interactive",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(57600));
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
    }

    #[test]
    fn test_cli_derive_address_needs_three_words() {
        assert!(
            Cli::try_parse_from(["factoryprov", "derive-address", "12345678", "9ABCDEF0"]).is_err()
        );
        let cli = Cli::try_parse_from([
            "factoryprov",
            "derive-address",
            "0x12345678",
            "9abc_def0",
            "0",
            "--version-byte",
            "C1",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::DeriveAddress {
            ref uid,
            version_byte: Some(0xC1),
            ..
        } if uid == &[0x1234_5678, 0x9ABC_DEF0, 0]));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u32("0x1FFF_7590"), Ok(0x1FFF_7590));
        assert!(parse_hex_u32("xyz").is_err());
        assert!(parse_hex_u32("1_0000_0000").is_err());
        assert_eq!(parse_hex_u8("c0"), Ok(0xC0));
        assert!(parse_hex_u8("100").is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code_for(&factoryprov::Error::Cancelled.into()), 130);
        assert_eq!(exit_code_for(&factoryprov::Error::Busy.into()), 1);
    }
}
