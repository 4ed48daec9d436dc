//! Interactive session keeping one port selected across flashing, resetting and monitoring.
//!
//! While the monitor runs, typed lines go to the device. Lines starting with `/` are commands.

use bb_config::Catalog;
use bb_serial_session::{
    DEFAULT_FLASH_BAUD_RATE, DEFAULT_MONITOR_BAUD_RATE, FirmwareImage, Mode, esptool::EsptoolFactory,
    parse_baud_rate,
};
use console::Term;
use tokio::io::AsyncBufReadExt;

use crate::{Session, cli::PortArgs};

const HELP: &str = "Commands:
  connect [PORT]        select a serial port
  disconnect            stop everything and forget the port
  status                show port, chip and mode
  catalog               list firmware images
  flash NAME|FILE [OFF] flash a catalog image or a binary at an offset
  baud RATE             baud rate used for flashing
  reset                 reset the chip into its application
  monitor [RATE]        start the serial monitor
  stop                  stop the serial monitor
  send TEXT             send text to the device
  newline on|off        append a newline to sent text
  help                  show this message
  quit                  leave";

struct Repl {
    session: Session,
    catalog: Catalog,
    factory: EsptoolFactory,
    term: Term,
    flash_baud: u32,
    newline: bool,
}

pub(crate) async fn run(
    catalog: Catalog,
    factory: EsptoolFactory,
    port: PortArgs,
) -> anyhow::Result<()> {
    let mut repl = Repl {
        session: Session::new(),
        catalog,
        factory,
        term: Term::stderr(),
        flash_baud: DEFAULT_FLASH_BAUD_RATE,
        newline: true,
    };

    repl.term.write_line(HELP)?;
    if port.port.is_some() {
        repl.connect(&port).await;
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();

        let monitoring = repl.session.mode().await == Mode::Monitoring;
        let cmd = match line.strip_prefix('/') {
            Some(x) => x,
            None if monitoring => {
                if let Err(e) = repl.session.send(line, repl.newline).await {
                    repl.report(e);
                }
                continue;
            }
            None => line,
        };

        if !repl.command(cmd).await? {
            break;
        }
    }

    repl.session.disconnect().await;
    Ok(())
}

impl Repl {
    fn report(&self, e: impl std::fmt::Display) {
        let _ = self.term.write_line(&format!("Error: {e}"));
    }

    fn say(&self, msg: &str) {
        let _ = self.term.write_line(msg);
    }

    /// Run one command. Returns `false` on quit.
    async fn command(&mut self, line: &str) -> anyhow::Result<bool> {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return Ok(true);
        };
        let rest = line.trim_start()[cmd.len()..].trim();

        match cmd {
            "quit" | "exit" => return Ok(false),
            "help" => self.say(HELP),
            "connect" => {
                let port = PortArgs {
                    port: words.next().map(String::from),
                };
                self.connect(&port).await;
            }
            "disconnect" => self.session.disconnect().await,
            "status" => self.status().await,
            "catalog" => {
                for img in &self.catalog.images {
                    self.say(&format!("{} ({})", img.name, self.catalog.locator(img)));
                }
            }
            "baud" => match parse_baud_rate(rest) {
                Ok(x) => {
                    self.flash_baud = x;
                    self.say(&format!("Flashing at {x} baud"));
                }
                Err(e) => self.report(e),
            },
            "flash" => {
                let mut args = words;
                match args.next() {
                    Some(target) => self.flash(target, args.next()).await,
                    None => self.report("flash needs an image name or file"),
                }
            }
            "reset" => match self.session.reset(&self.factory).await {
                Ok(()) => self.say("Chip reset."),
                Err(e) => self.report(e),
            },
            "monitor" => {
                let baud = if rest.is_empty() {
                    Ok(DEFAULT_MONITOR_BAUD_RATE)
                } else {
                    parse_baud_rate(rest)
                };
                self.monitor(baud).await;
            }
            "stop" => self.session.stop_monitor(true).await,
            "send" => {
                if let Err(e) = self.session.send(rest, self.newline).await {
                    self.report(e);
                }
            }
            "newline" => match rest {
                "on" => self.newline = true,
                "off" => self.newline = false,
                _ => self.report("newline takes on or off"),
            },
            x => self.report(format!("Unknown command {x}, try help")),
        }

        Ok(true)
    }

    async fn connect(&self, port: &PortArgs) {
        match crate::select_port(&self.session, port).await {
            Ok(info) => self.say(&format!("Connected to {info}")),
            Err(e) => self.report(e),
        }
    }

    async fn status(&self) {
        let status = self.session.status().await;

        match &status.port {
            Some(p) => self.say(&format!("Port: {p}")),
            None => self.say("Port: none"),
        }
        if let Some(chip) = &status.chip {
            self.say(&format!("Chip: {chip}"));
            if !chip.features.is_empty() {
                self.say(&format!("Features: {}", chip.features.join(", ")));
            }
        }
        self.say(&format!("Mode: {}", status.mode));
        if status.reset_available {
            self.say("Reset available");
        }
    }

    async fn flash(&self, target: &str, offset: Option<&str>) {
        let image = match crate::catalog_image(&self.catalog, target) {
            Ok(x) => x,
            Err(_) => {
                let mut image = FirmwareImage::from_locator(target);
                if let Some(offset) = offset {
                    match bb_config::catalog::parse_offset(offset) {
                        Some(x) => image.offset = x,
                        None => return self.report(format!("Invalid offset {offset}")),
                    }
                }
                image
            }
        };

        if let Err(e) =
            crate::flash(&self.session, &image, self.flash_baud, &self.factory, false).await
        {
            self.report(e);
        }
    }

    async fn monitor(&self, baud: bb_serial_session::Result<u32>) {
        let baud = match baud {
            Ok(x) => x,
            Err(e) => return self.report(e),
        };

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        match self.session.start_monitor(baud, tx).await {
            Ok(_) => {
                tokio::spawn(crate::print_output(rx));
                self.say(&format!(
                    "Serial Monitor at {baud} baud. Type to send, /stop to stop."
                ));
            }
            Err(e) => self.report(e),
        }
    }
}
