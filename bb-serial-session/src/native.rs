//! Serial ports of the host, through [`tokio_serial`].

use std::io;

use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream};
use tracing::{debug, info};

use crate::{ChooserError, DeviceChooser, PortHandle, PortInfo};

impl From<SerialPortInfo> for PortInfo {
    fn from(value: SerialPortInfo) -> Self {
        let mut info = PortInfo::new(value.port_name);

        if let SerialPortType::UsbPort(usb) = value.port_type {
            info.vendor_id = Some(usb.vid);
            info.product_id = Some(usb.pid);
            info.product = usb.product;
        }

        info
    }
}

/// Serial ports currently present on the system.
pub fn list_ports() -> io::Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

/// A host serial port, opened lazily at the requested baud rate.
pub struct NativePort {
    info: PortInfo,
    stream: Option<SerialStream>,
    open: bool,
}

impl NativePort {
    pub const fn new(info: PortInfo) -> Self {
        Self {
            info,
            stream: None,
            open: false,
        }
    }

    /// Device path to hand to programs that open the port themselves.
    pub fn path(&self) -> &str {
        &self.info.name
    }
}

impl PortHandle for NativePort {
    type Stream = SerialStream;

    fn info(&self) -> &PortInfo {
        &self.info
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self, baud_rate: u32) -> io::Result<()> {
        if self.open {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "port is already open",
            ));
        }

        let stream = tokio_serial::new(&self.info.name, baud_rate)
            .open_native_async()
            .map_err(io::Error::from)?;
        debug!("Opened {} at {baud_rate} baud", self.info.name);

        self.stream = Some(stream);
        self.open = true;

        Ok(())
    }

    fn take_stream(&mut self) -> Option<Self::Stream> {
        self.stream.take()
    }

    fn return_stream(&mut self, stream: Self::Stream) {
        if self.open {
            self.stream = Some(stream);
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.open {
            debug!("Closing {}", self.info.name);
        }

        self.stream = None;
        self.open = false;

        Ok(())
    }
}

type Picker = Box<dyn Fn(&[PortInfo]) -> Option<usize> + Send + Sync>;

/// Device chooser for host serial ports.
pub struct NativeChooser {
    selection: Selection,
}

enum Selection {
    Name(String),
    Pick(Picker),
}

impl NativeChooser {
    /// Select the port with this name. The port does not need to be enumerable.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            selection: Selection::Name(name.into()),
        }
    }

    /// Let `pick` choose among the available ports. Returning `None` cancels.
    pub fn pick<F>(pick: F) -> Self
    where
        F: Fn(&[PortInfo]) -> Option<usize> + Send + Sync + 'static,
    {
        Self {
            selection: Selection::Pick(Box::new(pick)),
        }
    }

    fn choose(&self) -> Result<PortInfo, ChooserError> {
        let ports = list_ports().map_err(|e| ChooserError::Unsupported(e.to_string()));

        match &self.selection {
            Selection::Name(name) => {
                let info = ports
                    .ok()
                    .and_then(|x| x.into_iter().find(|p| &p.name == name))
                    .unwrap_or_else(|| PortInfo::new(name.as_str()));
                Ok(info)
            }
            Selection::Pick(pick) => {
                let ports = ports?;
                if ports.is_empty() {
                    info!("No serial ports found");
                    return Err(ChooserError::Cancelled);
                }

                pick(&ports)
                    .and_then(|i| ports.get(i).cloned())
                    .ok_or(ChooserError::Cancelled)
            }
        }
    }
}

impl DeviceChooser for NativeChooser {
    type Port = NativePort;

    async fn request_port(&self) -> Result<Self::Port, ChooserError> {
        self.choose().map(NativePort::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn by_name_without_device() {
        let chooser = NativeChooser::by_name("/dev/does-not-exist");
        let port = chooser.request_port().await.unwrap();

        assert_eq!(port.path(), "/dev/does-not-exist");
        assert!(!port.is_open());
    }

    #[tokio::test]
    async fn open_missing_device() {
        let mut port = NativePort::new(PortInfo::new("/dev/does-not-exist"));

        assert!(port.open(115200).await.is_err());
        assert!(!port.is_open());
        assert!(port.take_stream().is_none());
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn pick_none_cancels() {
        let chooser = NativeChooser::pick(|_| None);

        // Either no ports (cancelled), an enumeration failure, or a dismissed prompt
        assert!(chooser.request_port().await.is_err());
    }
}
