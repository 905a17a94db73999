//! Port listing command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    factoryprov::list_ports,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = list_ports().context("Failed to enumerate serial ports")?;

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serialNumber": p.serial_number,
                })
            })
            .collect();
        return crate::print_json(serde_json::json!({ "ports": ports }));
    }

    eprintln!(
        "{}",
        style("Serial ports")
            .bold()
            .underlined()
    );
    if ports.is_empty() {
        eprintln!("  {}", style("no ports found").dim());
    }
    for port in &ports {
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_ref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        println!("  {}{usb}{product}", style(&port.name).bold());
    }
    Ok(())
}
