mod cli;
mod repl;

use std::path::PathBuf;

use anyhow::Context;
use bb_config::Catalog;
use bb_downloader::Downloader;
use bb_serial_session::{
    Coordinator, FirmwareImage, FlashingStatus, Mode, PortInfo,
    esptool::EsptoolFactory,
    native::{NativeChooser, NativePort},
};
use clap::{CommandFactory, Parser};
use cli::{Commands, Opt, PortArgs, SelectedImage};
use futures::{StreamExt, channel::mpsc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub(crate) type Session = Coordinator<NativePort>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to register tracing_subscriber")?;

    match opt.command {
        Commands::ListPorts { no_frills } => list_ports(no_frills),
        Commands::Catalog { catalog } => list_catalog(catalog.catalog),
        Commands::Flash {
            port,
            img,
            catalog,
            baud,
            reset,
            quiet,
            esptool,
        } => {
            let catalog = load_catalog(catalog.catalog)?;
            let image = resolve_image(&catalog, img)?;
            let factory = EsptoolFactory::with_program(esptool.esptool);

            let session = Session::new();
            select_port(&session, &port).await?;

            let res = flash(&session, &image, baud, &factory, quiet).await;
            let res = match res {
                Ok(()) if reset => session.reset(&factory).await.map_err(Into::into),
                x => x,
            };

            session.disconnect().await;
            res
        }
        Commands::Reset { port, esptool } => {
            let factory = EsptoolFactory::with_program(esptool.esptool);

            let session = Session::new();
            select_port(&session, &port).await?;

            let res = session.reset(&factory).await;
            session.disconnect().await;
            res.map_err(Into::into)
        }
        Commands::Monitor {
            port,
            baud,
            no_newline,
        } => {
            let session = Session::new();
            select_port(&session, &port).await?;

            let res = monitor(&session, baud, !no_newline).await;
            session.disconnect().await;
            res
        }
        Commands::Session {
            port,
            catalog,
            esptool,
        } => {
            let catalog = load_catalog(catalog.catalog)?;
            let factory = EsptoolFactory::with_program(esptool.esptool);

            repl::run(catalog, factory, port).await
        }
        Commands::GenerateCompletion { shell } => {
            generate_completion(shell);
            Ok(())
        }
    }
}

/// Select the port given on the command line, or ask which one to use.
pub(crate) async fn select_port(session: &Session, args: &PortArgs) -> anyhow::Result<PortInfo> {
    let info = match &args.port {
        Some(name) => session.request_port(&NativeChooser::by_name(name)).await?,
        None => session.request_port(&NativeChooser::pick(pick_port)).await?,
    };

    Ok(info)
}

fn pick_port(ports: &[PortInfo]) -> Option<usize> {
    let term = console::Term::stderr();

    for (i, p) in ports.iter().enumerate() {
        term.write_line(&format!("[{}] {p}", i + 1)).ok()?;
    }
    term.write_str(&format!("Select port [1-{}]: ", ports.len()))
        .ok()?;

    let line = term.read_line().ok()?;
    let idx: usize = line.trim().parse().ok()?;

    idx.checked_sub(1).filter(|x| *x < ports.len())
}

pub(crate) fn load_catalog(path: Option<PathBuf>) -> anyhow::Result<Catalog> {
    if let Some(p) = path {
        return Catalog::load(p).map_err(Into::into);
    }

    let default = directories::ProjectDirs::from("org", "beagleboard", "bb-serial-cli")
        .map(|x| x.config_dir().join(bb_config::CATALOG_FILE))
        .filter(|x| x.exists());

    match default {
        Some(p) => Catalog::load(p).map_err(Into::into),
        None => Ok(Catalog::default()),
    }
}

fn resolve_image(catalog: &Catalog, img: SelectedImage) -> anyhow::Result<FirmwareImage> {
    match (img.src.image, img.src.file) {
        (Some(name), _) => catalog_image(catalog, &name),
        (None, Some(file)) => {
            let mut image = FirmwareImage::from_locator(file);
            if let Some(offset) = img.offset {
                image.offset = offset;
            }
            Ok(image)
        }
        (None, None) => anyhow::bail!("No firmware image selected"),
    }
}

pub(crate) fn catalog_image(catalog: &Catalog, name: &str) -> anyhow::Result<FirmwareImage> {
    let img = catalog
        .find(name)
        .with_context(|| format!("No image named {name} in the catalog"))?;

    Ok(FirmwareImage::new(
        img.name.clone(),
        catalog.locator(img),
        img.offset,
    ))
}

pub(crate) async fn flash(
    session: &Session,
    image: &FirmwareImage,
    baud: u32,
    factory: &EsptoolFactory,
    quiet: bool,
) -> anyhow::Result<()> {
    let fetcher = Downloader::new();
    let term = console::Term::stdout();

    if quiet {
        session.flash(image, baud, factory, &fetcher, None).await?;
        return Ok(());
    }

    term.write_line(&format!("Preparing to flash: {} from {}", image.name, image.locator))?;

    let (tx, rx) = mpsc::channel(20);
    let progress = tokio::spawn(show_progress(rx));

    let res = session.flash(image, baud, factory, &fetcher, Some(tx)).await;
    progress.await?;

    let chip = res?;
    term.write_line(&format!("{} flashed successfully onto {chip}!", image.name))?;

    Ok(())
}

async fn show_progress(mut rx: mpsc::Receiver<FlashingStatus>) {
    let term = console::Term::stdout();
    let bar_style = indicatif::ProgressStyle::with_template("{msg:15}  [{wide_bar}] [{percent:3} %]")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());

    let mut bar: Option<indicatif::ProgressBar> = None;
    let mut stage = 0;

    while let Some(status) = rx.next().await {
        let line = match &status {
            FlashingStatus::FlashingProgress(p) => {
                let b = bar.get_or_insert_with(|| {
                    stage += 1;
                    let b = indicatif::ProgressBar::new(100);
                    b.set_style(bar_style.clone());
                    b.set_message(format!("[{stage}] Flashing"));
                    b
                });
                b.set_position(u64::from(p.percent()));
                continue;
            }
            FlashingStatus::Preparing => "Preparing".to_string(),
            FlashingStatus::Connected(chip) => {
                let mut x = format!("Connected: {}", chip.name);
                if !chip.mac.is_empty() {
                    x.push_str(&format!(", MAC {}", chip.mac));
                }
                if !chip.features.is_empty() {
                    x.push_str(&format!(", {}", chip.features.join(", ")));
                }
                x
            }
            FlashingStatus::Downloading => "Downloading".to_string(),
            FlashingStatus::Downloaded(size) => format!("Downloaded {size} bytes"),
            FlashingStatus::Finished(_) => {
                if let Some(b) = bar.take() {
                    b.finish();
                }
                continue;
            }
        };

        stage += 1;
        let _ = term.write_line(&format!("[{stage}] {line}"));
    }

    if let Some(b) = bar.take() {
        b.abandon();
    }
}

/// Echo device output until stdin closes, Ctrl-C is pressed or the port fails.
async fn monitor(session: &Session, baud: u32, newline: bool) -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    session.start_monitor(baud, tx).await?;
    let printer = tokio::spawn(print_output(rx));

    let term = console::Term::stderr();
    term.write_line("Serial Monitor started. Press Ctrl-C or close stdin to stop.")?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut mode = session.mode_changes();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = mode.wait_for(|x| *x == Mode::Idle) => {
                term.write_line("Serial Monitor ended.")?;
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = session.send(&line, newline).await {
                        term.write_line(&format!("{e}"))?;
                    }
                }
                None => break,
            },
        }
    }

    session.stop_monitor(true).await;
    printer.await?;

    Ok(())
}

/// Write monitor output to stdout as it arrives. Ends when the read pump stops.
pub(crate) async fn print_output(mut rx: tokio::sync::mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();

    while let Some(text) = rx.recv().await {
        if stdout.write_all(text.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

fn list_ports(no_frills: bool) -> anyhow::Result<()> {
    const NAME_HEADER: &str = "Port";
    const VID_HEADER: &str = "VID";
    const PID_HEADER: &str = "PID";
    const PRODUCT_HEADER: &str = "Product";

    let term = console::Term::stdout();
    let ports = bb_serial_session::native::list_ports().context("Failed to list serial ports")?;

    if no_frills {
        for p in ports {
            term.write_line(&p.name)?;
        }
        return Ok(());
    }

    let hex = |x: Option<u16>| x.map(|x| format!("{x:04x}")).unwrap_or_default();
    let rows: Vec<[String; 4]> = ports
        .into_iter()
        .map(|x| {
            [
                x.name.clone(),
                hex(x.vendor_id),
                hex(x.product_id),
                x.product.clone().unwrap_or_default(),
            ]
        })
        .collect();

    let headers = [NAME_HEADER, VID_HEADER, PID_HEADER, PRODUCT_HEADER];
    let widths: Vec<usize> = (0..headers.len())
        .map(|i| {
            rows.iter()
                .map(|x| console::measure_text_width(&x[i]))
                .chain([headers[i].len()])
                .max()
                .unwrap_or_default()
        })
        .collect();

    let table_border = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| std::iter::repeat_n('-', w + 2).collect::<String>())
            .collect::<Vec<_>>()
            .join("+")
    );
    let row = |cells: &[&str]| {
        let cells: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| console::pad_str(c, *w, console::Alignment::Left, None).into_owned())
            .collect();
        format!("| {} |", cells.join(" | "))
    };

    term.write_line(&table_border)?;
    term.write_line(&row(&headers))?;
    term.write_line(&table_border)?;
    for r in &rows {
        let cells: Vec<&str> = r.iter().map(String::as_str).collect();
        term.write_line(&row(&cells))?;
    }
    term.write_line(&table_border)?;

    Ok(())
}

fn list_catalog(path: Option<PathBuf>) -> anyhow::Result<()> {
    let term = console::Term::stdout();
    let catalog = load_catalog(path)?;

    if catalog.images.is_empty() {
        term.write_line("No firmware images in the catalog")?;
        return Ok(());
    }

    for img in &catalog.images {
        term.write_line(&format!(
            "{}\n    {} @ 0x{:x}",
            img.name,
            catalog.locator(img),
            img.offset
        ))?;
    }

    Ok(())
}

fn generate_completion(target: clap_complete::Shell) {
    let mut cmd = Opt::command();
    const BIN_NAME: &str = env!("CARGO_PKG_NAME");

    clap_complete::generate(target, &mut cmd, BIN_NAME, &mut std::io::stdout())
}
