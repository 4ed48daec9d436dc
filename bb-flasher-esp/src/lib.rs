//! Library to flash [Espressif] chips over a serial port by driving the [esptool] executable.
//!
//! The heavy lifting (chip sync, SLIP framing, stub loader, compression and MD5 verification) is
//! done by esptool itself. This crate only builds the invocations, streams the output and turns it
//! into structured [`Status`] updates and a [`Chip`] description.
//!
//! [Espressif]: https://www.espressif.com/
//! [esptool]: https://github.com/espressif/esptool

pub mod esptool;
pub(crate) mod helpers;

pub use esptool::{Chip, Error, Esptool, FlashSetting, WriteOptions};

/// Flashing status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Preparing,
    /// Percentage reported by esptool for the segment being written.
    Flashing(u8),
    Verifying,
}
