use std::io;

use thiserror::Error;

use crate::Mode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the session.
///
/// Resource acquisition errors abort the current operation. [`Error::TeardownError`] is never
/// returned, it is only logged while a mode is being torn down.
#[derive(Error, Debug)]
pub enum Error {
    /// No serial port is selected, or the user dismissed the device chooser
    #[error("No serial port selected")]
    NoPortSelected,
    /// The environment has no serial port support
    #[error("Serial ports are not supported here: {0}")]
    UnsupportedEnvironment(String),
    /// Another mode currently owns the port
    #[error("Cannot start {requested} while {current} is active")]
    ModeConflict { current: Mode, requested: Mode },
    /// The serial driver refused to open the port
    #[error("Failed to open port at {baud_rate} baud: {source}")]
    PortOpenError {
        baud_rate: u32,
        #[source]
        source: io::Error,
    },
    /// Baud rate is not a positive integer
    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(String),
    /// Sending requires an active serial monitor
    #[error("Writer not available")]
    WriterUnavailable,
    /// Writing to the serial monitor failed
    #[error("Send error: {0}")]
    SendError(#[source] io::Error),
    /// The flashing engine could not sync with the chip
    #[error("Failed to connect to chip: {0}")]
    ConnectError(String),
    /// Firmware bytes could not be retrieved
    #[error("Failed to fetch {locator}: {reason}")]
    FetchError { locator: String, reason: String },
    /// The flashing engine reported a write failure
    #[error("Failed to write flash: {0}")]
    WriteError(String),
    /// The chip could not be reset
    #[error("Failed to reset chip: {0}")]
    ResetError(String),
    /// A release step failed during teardown
    #[error("Error {step}: {source}")]
    TeardownError {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    /// The port was disconnected while the operation was running
    #[error("Aborted before completing")]
    Aborted,
}

/// Render an engine or fetcher error together with its context chain.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
