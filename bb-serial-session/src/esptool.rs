//! Flashing engine backed by the esptool program.
//!
//! esptool opens the serial device by itself, so the engine closes the session's handle before
//! every operation. The handle stays selected and is reopened by the next activity that needs it.

use std::path::PathBuf;

use anyhow::Context;
use bb_flasher_esp::{Esptool, Status, WriteOptions};
use futures::{StreamExt, channel::mpsc};
use tracing::debug;

use crate::{
    ChipInfo, EngineFactory, EngineOptions, FlashEngine, FlashJob, FlashSetting, PortHandle,
    Progress, native::NativePort,
};

/// Builds [`EsptoolEngine`]s for native ports.
#[derive(Debug, Clone, Default)]
pub struct EsptoolFactory {
    program: Option<PathBuf>,
}

impl EsptoolFactory {
    /// Use a different esptool executable, e.g. `esptool` from esptool v5.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }
}

impl EngineFactory<NativePort> for EsptoolFactory {
    type Engine = EsptoolEngine;

    fn build(&self, port: NativePort, options: EngineOptions) -> Self::Engine {
        let mut tool = Esptool::new(port.path(), options.baud_rate);
        if let Some(program) = &self.program {
            tool = tool.with_program(program);
        }

        debug!(
            "esptool engine for {} at {} baud (ROM {} baud)",
            port.path(),
            options.baud_rate,
            options.rom_baud_rate
        );

        EsptoolEngine { port, tool }
    }
}

pub struct EsptoolEngine {
    port: NativePort,
    tool: Esptool,
}

impl EsptoolEngine {
    async fn release_device(&mut self) -> anyhow::Result<()> {
        self.port
            .close()
            .await
            .with_context(|| format!("Failed to release {}", self.port.path()))
    }
}

impl From<bb_flasher_esp::Chip> for ChipInfo {
    fn from(value: bb_flasher_esp::Chip) -> Self {
        Self {
            name: value.name,
            mac: value.mac,
            features: value.features,
        }
    }
}

fn setting(x: FlashSetting) -> bb_flasher_esp::FlashSetting {
    match x {
        FlashSetting::Keep => bb_flasher_esp::FlashSetting::Keep,
        FlashSetting::Value(v) => bb_flasher_esp::FlashSetting::Value(v),
    }
}

impl FlashEngine for EsptoolEngine {
    type Port = NativePort;

    async fn connect_and_sync(&mut self) -> anyhow::Result<ChipInfo> {
        self.release_device().await?;

        let chip = self.tool.chip_info().await?;
        Ok(chip.into())
    }

    async fn write_flash(
        &mut self,
        job: FlashJob,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> anyhow::Result<()> {
        self.release_device().await?;

        let total = job.data.len();
        let opts = WriteOptions {
            flash_size: setting(job.flash_size),
            flash_mode: setting(job.flash_mode),
            flash_freq: setting(job.flash_freq),
            erase_all: job.erase_all,
            compress: job.compress,
        };
        debug!("Image md5: {}", job.md5);

        let (tx, mut rx) = mpsc::channel(20);
        let forward = async move {
            while let Some(status) = rx.next().await {
                if let Status::Flashing(pct) = status {
                    let written = total * usize::from(pct) / 100;
                    let _ = progress.unbounded_send(Progress::new(written, total));
                }
            }
        };

        let (res, _) = futures::join!(
            self.tool.write_flash(&job.data, job.offset, &opts, Some(tx)),
            forward
        );

        res.context("esptool write_flash")
    }

    async fn hard_reset(&mut self) -> anyhow::Result<()> {
        self.release_device().await?;

        self.tool.hard_reset().await?;
        Ok(())
    }

    fn release(self) -> Self::Port {
        self.port
    }
}
