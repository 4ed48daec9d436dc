//! Contracts for the serial port and the device chooser supplied by the host environment.

use std::{fmt::Display, io};

use tokio::io::{AsyncRead, AsyncWrite};

/// Static descriptor of a selected port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PortInfo {
    /// Port name or path (e.g. `/dev/ttyUSB0`, `COM3`)
    pub name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
}

impl PortInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub const fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }
}

impl Display for PortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn hex(x: Option<u16>) -> String {
            x.map(|x| format!("0x{x:04x}"))
                .unwrap_or_else(|| "N/A".to_string())
        }

        write!(
            f,
            "{} (VID: {}, PID: {})",
            self.name,
            hex(self.vendor_id),
            hex(self.product_id)
        )
    }
}

/// An openable, closable duplex byte stream representing the physical connection.
///
/// While open, the stream is handed out at most once through [`take_stream`] and given back with
/// [`return_stream`]. Holding the stream is the equivalent of holding the reader and writer locks.
///
/// [`take_stream`]: PortHandle::take_stream
/// [`return_stream`]: PortHandle::return_stream
pub trait PortHandle: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn info(&self) -> &PortInfo;

    fn is_open(&self) -> bool;

    /// Open the port at the given baud rate.
    fn open(&mut self, baud_rate: u32) -> impl Future<Output = io::Result<()>> + Send;

    /// Borrow the byte stream. `None` if the port is closed or the stream is already out.
    fn take_stream(&mut self) -> Option<Self::Stream>;

    fn return_stream(&mut self, stream: Self::Stream);

    /// Close the port. Closing a closed port is not an error.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Reasons the device chooser can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChooserError {
    /// User dismissed the prompt
    Cancelled,
    /// No serial capability in this environment
    Unsupported(String),
}

/// Environment-provided prompt that yields a port handle.
pub trait DeviceChooser {
    type Port: PortHandle;

    fn request_port(&self) -> impl Future<Output = Result<Self::Port, ChooserError>> + Send;
}
