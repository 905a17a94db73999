//! Port abstraction for serial communication with the board under test.
//!
//! The `Port` trait keeps the command channel independent of the concrete
//! serial implementation, so the channel can be driven by the native
//! `serialport` backend in production and by a scripted port in tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use factoryprov::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(b"AT+FWVERSION?\r\n")?;
//!
//!     let mut buf = [0u8; 64];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use {
    crate::error::{Error, Result},
    std::{
        fmt,
        io::{Read, Write},
        time::Duration,
    },
};

/// Baud rates the boards' command interface supports.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout used by the underlying port.
    pub timeout: Duration,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(20),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the data bits.
    #[must_use]
    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Reject settings the boards do not support before touching hardware.
    pub fn validate(&self) -> Result<()> {
        if self
            .port_name
            .trim()
            .is_empty()
        {
            return Err(Error::InvalidConfig("serial port name is empty".into()));
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(Error::InvalidConfig(format!(
                "unsupported baud rate {} (expected one of {SUPPORTED_BAUD_RATES:?})",
                self.baud_rate
            )));
        }
        Ok(())
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(Error::InvalidConfig(format!(
                "unsupported data bits {other} (expected 7 or 8)"
            ))),
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " ({vid:04X}:{pid:04X})")?;
        }
        if let Some(product) = &self.product {
            write!(f, " - {product}")?;
        }
        Ok(())
    }
}

/// Byte-level serial port used by the command channel.
///
/// `read` is expected to return `ErrorKind::TimedOut` (or `WouldBlock`) when
/// no data arrives within the configured timeout; the channel treats that as
/// an idle tick rather than a failure.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, list_ports};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_115200_8n1() {
        let config = SerialConfig::new("/dev/ttyUSB0", 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert!(
            config
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn validate_rejects_unsupported_baud() {
        let err = SerialConfig::new("COM3", 921600)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn validate_accepts_every_supported_baud() {
        for baud in SUPPORTED_BAUD_RATES {
            assert!(
                SerialConfig::new("COM3", baud)
                    .validate()
                    .is_ok(),
                "{baud} should be accepted"
            );
        }
    }

    #[test]
    fn validate_rejects_empty_port() {
        assert!(
            SerialConfig::new("  ", 9600)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn data_bits_from_u8() {
        assert_eq!(DataBits::try_from(7).unwrap(), DataBits::Seven);
        assert_eq!(DataBits::try_from(8).unwrap(), DataBits::Eight);
        assert!(DataBits::try_from(5).is_err());
    }

    #[test]
    fn port_info_display() {
        let info = PortInfo {
            name: "/dev/ttyACM0".into(),
            vid: Some(0x0483),
            pid: Some(0x374B),
            manufacturer: None,
            product: Some("STLINK-V3".into()),
            serial_number: None,
        };
        assert_eq!(info.to_string(), "/dev/ttyACM0 (0483:374B) - STLINK-V3");
    }
}
