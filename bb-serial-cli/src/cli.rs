use std::path::PathBuf;

use bb_serial_session::{DEFAULT_FLASH_BAUD_RATE, DEFAULT_MONITOR_BAUD_RATE};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    #[command(subcommand)]
    /// Specifies the subcommand to execute.
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Command to list serial ports present on the system.
    ListPorts {
        #[arg(long)]
        /// Only print port names seperated by newline
        no_frills: bool,
    },

    /// Command to list firmware images offered by the catalog.
    Catalog {
        #[command(flatten)]
        catalog: CatalogArgs,
    },

    /// Command to flash a firmware image.
    Flash {
        #[command(flatten)]
        port: PortArgs,

        #[command(flatten)]
        img: SelectedImage,

        #[command(flatten)]
        catalog: CatalogArgs,

        #[arg(long, default_value_t = DEFAULT_FLASH_BAUD_RATE, value_parser = baud_rate)]
        /// Baud rate used while writing.
        baud: u32,

        #[arg(long)]
        /// Reset the chip into the new firmware once flashing is done.
        reset: bool,

        #[arg(long)]
        /// Suppress standard output messages for a quieter experience.
        quiet: bool,

        #[command(flatten)]
        esptool: EsptoolArgs,
    },

    /// Command to reset the chip into its application.
    Reset {
        #[command(flatten)]
        port: PortArgs,

        #[command(flatten)]
        esptool: EsptoolArgs,
    },

    /// Command to open a serial console. Lines typed on stdin are sent to the device.
    Monitor {
        #[command(flatten)]
        port: PortArgs,

        #[arg(long, default_value_t = DEFAULT_MONITOR_BAUD_RATE, value_parser = baud_rate)]
        /// Baud rate of the console.
        baud: u32,

        #[arg(long)]
        /// Do not append a newline to sent lines.
        no_newline: bool,
    },

    /// Command to start an interactive session to flash, reset and monitor one device.
    Session {
        #[command(flatten)]
        port: PortArgs,

        #[command(flatten)]
        catalog: CatalogArgs,

        #[command(flatten)]
        esptool: EsptoolArgs,
    },

    /// Command to generate shell completion
    GenerateCompletion {
        /// Specifies the target shell type for completion
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PortArgs {
    #[arg(long, short)]
    /// The serial port (e.g., `/dev/ttyUSB0` or `COM3`). Prompts if not given.
    pub port: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CatalogArgs {
    #[arg(long)]
    /// Firmware catalog to use instead of the one in the configuration directory.
    pub catalog: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EsptoolArgs {
    #[arg(long, env = "ESPTOOL", default_value = "esptool.py")]
    /// The esptool executable.
    pub esptool: PathBuf,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct FirmwareSource {
    #[arg(long)]
    /// Name of an image in the firmware catalog.
    pub image: Option<String>,
    #[arg(long)]
    /// Path or URL of a firmware binary.
    pub file: Option<String>,
}

#[derive(Args, Debug)]
pub struct SelectedImage {
    #[command(flatten)]
    pub src: FirmwareSource,
    #[arg(long, requires = "file", value_parser = offset)]
    /// Flash offset for `--file` (e.g., `0x10000`).
    pub offset: Option<u32>,
}

fn baud_rate(s: &str) -> Result<u32, String> {
    bb_serial_session::parse_baud_rate(s).map_err(|e| e.to_string())
}

fn offset(s: &str) -> Result<u32, String> {
    bb_config::catalog::parse_offset(s).ok_or_else(|| format!("Invalid offset: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Opt::command().debug_assert();
    }

    #[test]
    fn flash_args() {
        let opt = Opt::try_parse_from([
            "bb-serial-cli",
            "flash",
            "--port",
            "/dev/ttyUSB0",
            "--file",
            "./blink.bin",
            "--offset",
            "0x20000",
        ])
        .unwrap();

        let Commands::Flash { port, img, baud, .. } = opt.command else {
            panic!("expected flash");
        };
        assert_eq!(port.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(img.src.file.as_deref(), Some("./blink.bin"));
        assert_eq!(img.offset, Some(0x20000));
        assert_eq!(baud, DEFAULT_FLASH_BAUD_RATE);
    }

    #[test]
    fn image_and_file_conflict() {
        let res = Opt::try_parse_from([
            "bb-serial-cli",
            "flash",
            "--image",
            "Blink",
            "--file",
            "./blink.bin",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn offset_needs_file() {
        let res = Opt::try_parse_from([
            "bb-serial-cli",
            "flash",
            "--image",
            "Blink",
            "--offset",
            "0x1000",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn invalid_baud() {
        let res = Opt::try_parse_from(["bb-serial-cli", "monitor", "--baud", "0"]);
        assert!(res.is_err());
    }
}
