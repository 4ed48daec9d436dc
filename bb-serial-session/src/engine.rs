//! Contracts for the flashing engine and the firmware fetcher, and the data passed through them.

use std::fmt::Display;

use futures::channel::mpsc;

use crate::PortHandle;

/// Baud rate used by the ROM bootloader before the engine switches to the requested rate.
pub const ROM_BAUD_RATE: u32 = 115200;
/// Flash offset of the application partition.
pub const DEFAULT_OFFSET: u32 = 0x10000;

/// Identity of the connected chip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChipInfo {
    pub name: String,
    pub mac: String,
    pub features: Vec<String>,
}

impl Display for ChipInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.mac.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.mac)
        }
    }
}

/// Flash write progress in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Progress {
    pub written: usize,
    pub total: usize,
}

impl Progress {
    pub const fn new(written: usize, total: usize) -> Self {
        Self { written, total }
    }

    /// Whole percent written, rounded down. An empty write is complete.
    pub const fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }

        let p = (self.written as u128 * 100) / self.total as u128;
        if p > 100 { 100 } else { p as u8 }
    }
}

/// A flash parameter the engine can keep as found in the image header or override.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum FlashSetting {
    #[default]
    Keep,
    Value(String),
}

/// Everything the engine needs for a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    pub data: Vec<u8>,
    pub offset: u32,
    pub flash_size: FlashSetting,
    pub flash_mode: FlashSetting,
    pub flash_freq: FlashSetting,
    pub erase_all: bool,
    pub compress: bool,
    /// Hex MD5 digest of `data`, for verification after the write
    pub md5: String,
}

impl FlashJob {
    pub fn new(data: Vec<u8>, offset: u32) -> Self {
        use md5::{Digest, Md5};

        let md5 = const_hex::encode(Md5::digest(&data));

        Self {
            data,
            offset,
            flash_size: FlashSetting::Keep,
            flash_mode: FlashSetting::Keep,
            flash_freq: FlashSetting::Keep,
            erase_all: false,
            compress: true,
            md5,
        }
    }
}

/// Transport settings handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub baud_rate: u32,
    pub rom_baud_rate: u32,
}

impl EngineOptions {
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            rom_baud_rate: ROM_BAUD_RATE,
        }
    }
}

/// Firmware image that can be flashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareImage {
    pub name: String,
    /// URL or path of the binary
    pub locator: String,
    pub offset: u32,
}

impl FirmwareImage {
    pub fn new(name: impl Into<String>, locator: impl Into<String>, offset: u32) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            offset,
        }
    }

    /// Image at [`DEFAULT_OFFSET`], named after the last component of `locator`.
    pub fn from_locator(locator: impl Into<String>) -> Self {
        let locator = locator.into();
        let name = locator
            .trim_end_matches('/')
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            name,
            locator,
            offset: DEFAULT_OFFSET,
        }
    }
}

impl Display for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ 0x{:x}", self.name, self.offset)
    }
}

/// The chip protocol driver.
///
/// An engine owns the port it was built with until [`release`](Self::release) hands it back.
pub trait FlashEngine: Send {
    type Port: PortHandle;

    /// Reset into the bootloader, sync and identify the chip.
    fn connect_and_sync(&mut self) -> impl Future<Output = anyhow::Result<ChipInfo>> + Send;

    /// Write the job. Progress values are in bytes of `job.data`.
    fn write_flash(
        &mut self,
        job: FlashJob,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Restart the chip into the application.
    fn hard_reset(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Disconnect the transport and give the port back.
    fn release(self) -> Self::Port;
}

/// Builds an engine around a port.
pub trait EngineFactory<P: PortHandle> {
    type Engine: FlashEngine<Port = P>;

    fn build(&self, port: P, options: EngineOptions) -> Self::Engine;
}

/// Resolves a locator to firmware bytes.
pub trait FirmwareFetcher {
    fn fetch(&self, locator: &str) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

/// Flashing status updates in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashingStatus {
    Preparing,
    Connected(ChipInfo),
    Downloading,
    /// Image size in bytes
    Downloaded(usize),
    FlashingProgress(Progress),
    Finished(ChipInfo),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent() {
        assert_eq!(Progress::new(0, 1000).percent(), 0);
        assert_eq!(Progress::new(250, 1000).percent(), 25);
        assert_eq!(Progress::new(999, 1000).percent(), 99);
        assert_eq!(Progress::new(1000, 1000).percent(), 100);
        assert_eq!(Progress::new(1, 3).percent(), 33);
        assert_eq!(Progress::new(0, 0).percent(), 100);
    }

    #[test]
    fn job_defaults() {
        let job = FlashJob::new(b"hello".to_vec(), DEFAULT_OFFSET);

        assert_eq!(job.md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(job.flash_mode, FlashSetting::Keep);
        assert!(job.compress);
        assert!(!job.erase_all);
    }

    #[test]
    fn image_from_locator() {
        let img = FirmwareImage::from_locator("https://example.com/fw/blink.bin");
        assert_eq!(img.name, "blink.bin");
        assert_eq!(img.offset, 0x10000);

        let img = FirmwareImage::from_locator("./firmware/app.bin");
        assert_eq!(img.to_string(), "app.bin @ 0x10000");
    }
}
