//! # factoryprov
//!
//! Factory provisioning and test engine for MCU-based control boards.
//!
//! The crate has two independent halves:
//!
//! - **Serial testing**: a line-oriented [`channel::SerialChannel`] with FIFO
//!   request/response correlation, the AT-style [`protocol::CommandProtocol`]
//!   on top of it, and the [`runner::FactoryTestRunner`] that executes a
//!   per-product test plan and produces a [`runner::TestReport`].
//! - **Flashing**: the [`flash::FlashOrchestrator`], which drives an
//!   OpenOCD-style debug server (falling back to the vendor programming CLI)
//!   through a fixed matrix of connection strategies, and the
//!   [`identity`] helpers that turn the chip UID into a device address.
//!
//! External tools are spawned through [`process::ToolRunner`], which enforces
//! deadlines, honours cancellation and keeps a diagnostics log.
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use factoryprov::{
//!     ChannelOptions, CommandProtocol, FactoryTestRunner, SerialChannel, SerialConfig,
//!     TestProfile,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
//!     let channel = SerialChannel::open(&config, ChannelOptions::default())?;
//!     let device = CommandProtocol::new(channel);
//!
//!     let report = FactoryTestRunner::new(&device).run(&TestProfile::MicroEdge.plan());
//!     for result in &report.results {
//!         println!("{:<16} {:<8} {}", result.name, result.status, result.display_value());
//!     }
//!     println!("pass: {}", report.pass_all);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod channel;
pub mod error;
pub mod flash;
pub mod identity;
pub mod port;
pub mod process;
pub mod protocol;
pub mod runner;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Every
/// [`process::CancelToken`] observes it, so tool runs and serial waits end
/// promptly.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, list_ports};
pub use {
    channel::{ChannelOptions, SerialChannel},
    error::{Error, Outcome, Result},
    flash::{
        DetectedProfile, FlashEvent, FlashOrchestrator, FlashReport, FlashRequest, FlashSettings,
        FlashStage, ProfileId, Strategy,
    },
    identity::{DeviceAddress, Uid, derive_address},
    port::{Port, PortInfo, SerialConfig},
    process::{CancelToken, SystemRunner, ToolRunner},
    protocol::{CommandProtocol, DeviceCommands, DeviceInfo},
    runner::{FactoryTestRunner, TestPlan, TestProfile, TestReport, TestResult, TestStatus},
};
