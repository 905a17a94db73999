//! Serial port selection.
//!
//! An explicit `--port` or configured port is used as-is. Otherwise a single
//! detected port is selected automatically, several ports are offered through
//! a `dialoguer` prompt, and non-interactive mode fails with a usage error
//! instead of prompting.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    factoryprov::{PortInfo, list_ports},
    log::{debug, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Pick from `ports` without prompting: exactly one candidate is required.
fn select_non_interactive(ports: Vec<PortInfo>) -> Result<String> {
    let mut ports = ports.into_iter();
    match (ports.next(), ports.next()) {
        (Some(port), None) => Ok(port.name),
        (Some(_), Some(_)) => Err(usage_err(
            "multiple serial ports found; pass --port in non-interactive mode",
        )),
        (None, _) => Err(usage_err("no serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
///
/// Returns the port name and whether it was chosen from a prompt.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<(String, bool)> {
    if let Some(port) = &options.port {
        return Ok((port.clone(), false));
    }

    if let Some(port) = &config
        .serial
        .port
    {
        debug!("Using port from config: {port}");
        return Ok((port.clone(), false));
    }

    let ports = list_ports()?;
    if options.non_interactive {
        return select_non_interactive(ports).map(|name| (name, false));
    }

    match ports.len() {
        0 => Err(usage_err("no serial ports found; connect the board or pass --port")),
        1 => {
            let name = ports
                .into_iter()
                .map(|p| p.name)
                .next()
                .unwrap_or_default();
            info!("Auto-selected port: {name}");
            Ok((name, false))
        },
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(&ports).map(|name| (name, true))
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err("several serial ports found and no terminal to ask; pass --port"))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port prompt failed")
            }
        },
    }
}

fn select_port_interactive(ports: &[PortInfo]) -> Result<String> {
    eprintln!("{} {} serial ports detected", style("ℹ").blue(), ports.len());

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&p.to_string(), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

/// Ask whether a prompted port should be remembered in the local config.
pub fn ask_remember_port(port: &str, config: &mut Config) -> Result<()> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {port} for next time?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if remember {
        config.remember_port(port)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(0x0483),
            pid: Some(0x5740),
            manufacturer: None,
            product: Some("Virtual COM Port".to_string()),
            serial_number: None,
        }
    }

    #[test]
    fn explicit_port_wins() {
        let mut config = Config::default();
        config.serial.port = Some("/dev/ttyS9".to_string());
        let options = SerialOptions {
            port: Some("COM7".to_string()),
            non_interactive: true,
        };
        assert_eq!(select_serial_port(&options, &config).unwrap(), ("COM7".to_string(), false));
    }

    #[test]
    fn configured_port_is_used() {
        let mut config = Config::default();
        config.serial.port = Some("/dev/ttyS9".to_string());
        let options = SerialOptions {
            port: None,
            non_interactive: true,
        };
        assert_eq!(select_serial_port(&options, &config).unwrap().0, "/dev/ttyS9");
    }

    #[test]
    fn non_interactive_single_candidate() {
        assert_eq!(select_non_interactive(vec![port("/dev/ttyACM0")]).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn non_interactive_ambiguity_is_usage_error() {
        let err =
            select_non_interactive(vec![port("/dev/ttyACM0"), port("/dev/ttyACM1")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(m)) if m.contains("multiple")
        ));

        let err = select_non_interactive(Vec::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }
}
