//! # Introduction
//!
//! This crate manages the lifecycle of a serial connection to a microcontroller. A session holds
//! one selected port and lends it to one of two mutually exclusive activities:
//!
//! - Flashing: an external engine syncs with the ROM bootloader and writes a firmware image.
//! - Monitoring: device output is decoded and streamed to the application, user input is written
//!   back to the device.
//!
//! All transitions go through a [`Coordinator`], which guarantees that the port, its reader and its
//! writer are released whatever the outcome of an operation.
//!
//! # Usage
//!
//! ```no_run
//! use bb_serial_session::{Coordinator, FirmwareImage, native::{NativeChooser, NativePort}};
//! use bb_serial_session::esptool::EsptoolFactory;
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Coordinator::<NativePort>::new();
//!     session
//!         .request_port(&NativeChooser::by_name("/dev/ttyUSB0"))
//!         .await
//!         .unwrap();
//!
//!     let img = FirmwareImage::from_locator("https://example.com/blink.bin");
//!     let chip = session
//!         .flash(
//!             &img,
//!             460800,
//!             &EsptoolFactory::default(),
//!             &bb_downloader::Downloader::new(),
//!             None,
//!         )
//!         .await
//!         .unwrap();
//!
//!     println!("Flashed {chip}");
//!     session.reset(&EsptoolFactory::default()).await.unwrap();
//!     session.disconnect().await;
//! }
//! ```
//!
//! # Features
//!
//! - `native`: Serial ports of the host through tokio-serial. Enabled by **default**.
//! - `esptool`: Flashing engine driving the esptool program. Enabled by **default**.
//! - `downloader`: Fetch firmware over HTTP(S) or from local files with [`bb_downloader`].
//!   Enabled by **default**.

mod coordinator;
mod decode;
mod engine;
mod error;
mod flash;
mod monitor;
mod port;
mod session;

#[cfg(feature = "esptool")]
pub mod esptool;
#[cfg(feature = "downloader")]
mod fetch;
#[cfg(feature = "native")]
pub mod native;

pub use coordinator::Coordinator;
pub use decode::Utf8StreamDecoder;
pub use engine::*;
pub use error::{Error, Result};
pub use flash::DEFAULT_FLASH_BAUD_RATE;
pub use monitor::{DEFAULT_MONITOR_BAUD_RATE, parse_baud_rate};
pub use port::{ChooserError, DeviceChooser, PortHandle, PortInfo};
pub use session::{Mode, ModeToken, SessionStatus};
