//! Serial-side commands: device info and factory tests.

use {
    crate::{Cli, config::Config, get_port, print_json},
    anyhow::{Context, Result, bail},
    console::style,
    factoryprov::{
        CommandProtocol, SerialChannel, SerialConfig, TestProfile, TestResult, TestStatus,
        protocol::read_device_info, runner::run_session,
    },
};

fn serial_config(cli: &Cli, config: &mut Config) -> Result<SerialConfig> {
    let port = get_port(cli, config)?;
    let serial = SerialConfig::new(port, config.baud(cli.baud));
    serial.validate()?;
    if !cli.quiet {
        eprintln!("{} Using {} @ {}", style("🔌").cyan(), serial.port_name, serial.baud_rate);
    }
    Ok(serial)
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, unlock: bool, json: bool) -> Result<()> {
    let serial = serial_config(cli, config)?;
    let options = config.channel_options();
    let channel = if unlock {
        SerialChannel::open_unlocked(&serial, options, config.unlock_secret())
    } else {
        SerialChannel::open(&serial, options)
    }
    .with_context(|| format!("Failed to open {}", serial.port_name))?;

    let protocol = CommandProtocol::new(channel);
    let info = read_device_info(&protocol);
    protocol.close();

    if json {
        return print_json(&info);
    }
    for (label, value) in [
        ("Firmware", &info.firmware_version),
        ("Hardware", &info.hw_version),
        ("Unique ID", &info.unique_id),
        ("Make", &info.device_make),
        ("Model", &info.device_model),
    ] {
        println!("{:<10} {value}", style(label).bold());
    }
    Ok(())
}

fn styled_status(status: TestStatus) -> String {
    let text = format!("{:<5}", status.to_string().to_uppercase());
    match status {
        TestStatus::Pass => style(text)
            .green()
            .to_string(),
        TestStatus::Fail => style(text)
            .red()
            .to_string(),
        TestStatus::Error => style(text)
            .yellow()
            .to_string(),
        TestStatus::Pending => style(text)
            .dim()
            .to_string(),
    }
}

fn print_result(result: &TestResult) {
    let message = if result
        .message
        .is_empty()
    {
        String::new()
    } else {
        format!("  {}", style(&result.message).dim())
    };
    println!(
        "  {:<14} {} {}{message}",
        result.name,
        styled_status(result.status),
        result.display_value()
    );
}

/// Quote a CSV field when it needs it.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Test command implementation.
pub(crate) fn cmd_test(
    cli: &Cli,
    config: &mut Config,
    profile: TestProfile,
    summary: bool,
    json: bool,
) -> Result<()> {
    let serial = serial_config(cli, config)?;
    let table = !json && !summary;
    if table {
        println!("{}", style(profile.display_name()).bold());
    }

    let report = run_session(
        &serial,
        config.channel_options(),
        profile,
        config.unlock_secret(),
        &mut |result| {
            if table {
                print_result(result);
            }
        },
    )
    .with_context(|| format!("Could not start the {} test session", profile.display_name()))?;

    if json {
        print_json(&report)?;
    } else if summary {
        let row = report.summary_row();
        let header: Vec<String> = row
            .iter()
            .map(|(column, _)| csv_field(column))
            .collect();
        let values: Vec<String> = row
            .iter()
            .map(|(_, value)| csv_field(value))
            .collect();
        println!("{}", header.join(","));
        println!("{}", values.join(","));
    } else {
        let verdict = if report.pass_all {
            style("PASS")
                .green()
                .bold()
        } else {
            style("FAIL")
                .red()
                .bold()
        };
        println!("\n{} {verdict}", style("Result:").bold());
    }

    if !report.pass_all {
        bail!("{} did not pass the factory test", profile.display_name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_quoting() {
        assert_eq!(csv_field("3.30"), "3.30");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn status_text_is_padded() {
        console::set_colors_enabled(false);
        assert_eq!(styled_status(TestStatus::Pass), "PASS ");
        assert_eq!(styled_status(TestStatus::Error), "ERROR");
    }
}
