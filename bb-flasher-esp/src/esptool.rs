//! Thin async wrapper around the esptool command line.
//!
//! Every operation spawns a fresh esptool process which opens the serial port by itself, so the
//! port must not be held open by the caller while an operation runs. Dropping a running operation
//! kills the child process.

use std::{
    ffi::OsString,
    io::{self, Write},
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use futures::channel::mpsc;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, info};

use crate::{
    Status,
    helpers::{chan_send, failure_message, parse_chip, parse_progress},
};

/// Program used when none is configured.
pub const DEFAULT_PROGRAM: &str = "esptool.py";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for esptool operations
pub enum Error {
    /// esptool could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// esptool exited with a failure
    #[error("esptool failed ({status}): {message}")]
    Failed { status: ExitStatus, message: String },
    /// esptool output did not contain a chip description
    #[error("Could not identify the connected chip")]
    UnknownChip,
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
}

/// Chip identity as reported by esptool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chip {
    pub name: String,
    pub mac: String,
    pub features: Vec<String>,
}

/// A flash parameter that esptool can either keep as found in the image header or override.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FlashSetting {
    #[default]
    Keep,
    Value(String),
}

impl FlashSetting {
    fn as_arg(&self) -> &str {
        match self {
            FlashSetting::Keep => "keep",
            FlashSetting::Value(x) => x,
        }
    }
}

/// Options for [`Esptool::write_flash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub flash_size: FlashSetting,
    pub flash_mode: FlashSetting,
    pub flash_freq: FlashSetting,
    pub erase_all: bool,
    pub compress: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            flash_size: FlashSetting::Keep,
            flash_mode: FlashSetting::Keep,
            flash_freq: FlashSetting::Keep,
            erase_all: false,
            compress: true,
        }
    }
}

/// esptool invocation settings for a single serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esptool {
    program: PathBuf,
    port: String,
    baud: u32,
}

impl Esptool {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            port: port.into(),
            baud,
        }
    }

    /// Use a different esptool executable, e.g. `esptool` from esptool v5.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Connect, sync and read the chip description. The chip is left in the bootloader.
    pub async fn chip_info(&self) -> Result<Chip> {
        info!("Connecting to chip on {}", self.port);

        let lines = self
            .run(["--after", "no_reset", "read_mac"], None)
            .await?;

        parse_chip(lines.iter().map(String::as_str)).ok_or(Error::UnknownChip)
    }

    /// Write `data` at `offset`. Progress is reported per written block.
    pub async fn write_flash(
        &self,
        data: &[u8],
        offset: u32,
        opts: &WriteOptions,
        mut chan: Option<mpsc::Sender<Status>>,
    ) -> Result<()> {
        chan_send(chan.as_mut(), Status::Preparing);

        let mut img = tempfile::NamedTempFile::new()?;
        img.write_all(data)?;
        img.flush()?;

        let mut args: Vec<OsString> = [
            "--after",
            "no_reset",
            "write_flash",
            "--flash_mode",
            opts.flash_mode.as_arg(),
            "--flash_freq",
            opts.flash_freq.as_arg(),
            "--flash_size",
            opts.flash_size.as_arg(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        if opts.erase_all {
            args.push("--erase-all".into());
        }
        args.push((if opts.compress { "-z" } else { "-u" }).into());
        args.push(format!("0x{offset:x}").into());
        args.push(img.path().into());

        info!("Writing {} bytes at 0x{offset:x}", data.len());
        let lines = self.run(args, chan.as_mut()).await?;

        if lines.iter().any(|x| x.contains("Hash of data verified")) {
            chan_send(chan.as_mut(), Status::Verifying);
            info!("Hash of data verified");
        }

        Ok(())
    }

    /// Toggle the reset lines so the chip boots the application.
    pub async fn hard_reset(&self) -> Result<()> {
        info!("Hard resetting chip on {}", self.port);

        self.run(["--after", "hard_reset", "read_mac"], None)
            .await
            .map(|_| ())
    }

    async fn run<I, S>(
        &self,
        args: I,
        mut chan: Option<&mut mpsc::Sender<Status>>,
    ) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--chip")
            .arg("auto")
            .arg("--port")
            .arg(&self.port)
            .arg("--baud")
            .arg(self.baud.to_string())
            .arg("--before")
            .arg("default_reset")
            .args(args.into_iter().map(Into::into))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {:?}", cmd.as_std());

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| io::Error::other("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| io::Error::other("no stderr"))?;

        let (out, err) = tokio::join!(
            collect_lines(stdout, |line| {
                if let Some(p) = parse_progress(line) {
                    chan_send(chan.as_deref_mut(), Status::Flashing(p));
                }
            }),
            collect_lines(stderr, |_| {}),
        );
        let (mut out, err) = (out?, err?);
        let status = child.wait().await?;

        if !status.success() {
            out.extend(err);
            let message = failure_message(out.iter().map(String::as_str))
                .unwrap_or_else(|| "no output".to_string());
            return Err(Error::Failed { status, message });
        }

        Ok(out)
    }
}

/// Read all lines of an esptool stream. Progress updates may be separated by `\r` only.
async fn collect_lines<R, F>(stream: R, mut on_line: F) -> io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut lines = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        for line in String::from_utf8_lossy(&buf).split('\r') {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            debug!("esptool: {line}");
            on_line(line);
            lines.push(line.to_string());
        }
    }

    Ok(lines)
}
