//! Serial monitor: streams decoded device output to a sink and writes user input to the port.

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    sync::{Mutex, mpsc::UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    Coordinator, Error, Mode, ModeToken, PortHandle, Result, Utf8StreamDecoder,
    coordinator::log_teardown,
    session::{Activity, MonitorResources, SharedWriter},
};

/// Baud rate used by the monitor unless told otherwise.
pub const DEFAULT_MONITOR_BAUD_RATE: u32 = 115200;

const READ_BUF_SIZE: usize = 4096;

/// Parse user supplied baud rate text.
pub fn parse_baud_rate(text: &str) -> Result<u32> {
    match text.trim().parse::<u32>() {
        Ok(x) if x > 0 => Ok(x),
        _ => Err(Error::InvalidBaudRate(text.to_string())),
    }
}

impl<P: PortHandle> Coordinator<P> {
    /// Open the port at `baud_rate` and start echoing device output into `sink`.
    ///
    /// An already open port is closed and reopened so the new rate takes effect.
    pub async fn start_monitor(
        &self,
        baud_rate: u32,
        sink: UnboundedSender<String>,
    ) -> Result<ModeToken> {
        if baud_rate == 0 {
            return Err(Error::InvalidBaudRate(baud_rate.to_string()));
        }

        let mut session = self.lock().await;
        let token = session.begin(Mode::Monitoring)?;

        info!("Serial Monitor: Opening port at {baud_rate} baud...");
        let stream = match session.port.as_mut() {
            Some(port) => open_stream(port, baud_rate).await,
            None => Err(Error::NoPortSelected),
        };
        let stream = match stream {
            Ok(x) => x,
            Err(e) => {
                session.abort(token);
                warn!("Serial Monitor: {e}");
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(read_pump(
            self.clone(),
            token,
            reader,
            sink,
            cancel.clone(),
        ));

        session.activity = Activity::Monitor(MonitorResources {
            writer: Arc::new(Mutex::new(Some(writer))),
            pump,
            cancel,
        });
        session.reset_available = false;

        info!("Serial Monitor: Started.");
        Ok(token)
    }

    /// Write `text` to the device, followed by `\n` if `append_newline` is set.
    ///
    /// The session stays usable while the write is pending. Stopping the monitor cancels it.
    pub async fn send(&self, text: &str, append_newline: bool) -> Result<()> {
        let (writer, cancel) = {
            let session = self.lock().await;
            let Activity::Monitor(res) = &session.activity else {
                return Err(Error::WriterUnavailable);
            };
            (res.writer.clone(), res.cancel.clone())
        };

        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        if append_newline {
            data.push(b'\n');
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::SendError(io::Error::new(
                io::ErrorKind::Interrupted,
                "Serial Monitor stopped before the write completed",
            ))),
            res = write_all(&writer, &data) => res,
        }
    }

    /// Stop the monitor. Does nothing unless monitoring.
    ///
    /// When this returns, the read pump has ended and nothing more is written to the sink.
    pub async fn stop_monitor(&self, close_port: bool) {
        let detached = {
            let mut session = self.lock().await;
            if session.mode() != Mode::Monitoring {
                return;
            }

            let token = session.current_token();
            session.begin_exit(&token)
        };

        if let Some(activity) = detached {
            drop(self.finish_exit(activity, close_port).await);
            info!("Serial Monitor: Stopped.");
        }
    }
}

async fn open_stream<P: PortHandle>(port: &mut P, baud_rate: u32) -> Result<P::Stream> {
    if port.is_open() {
        if let Err(e) = port.close().await {
            log_teardown("closing port before reopening", e);
        }
    }

    port.open(baud_rate)
        .await
        .map_err(|source| Error::PortOpenError { baud_rate, source })?;

    port.take_stream().ok_or_else(|| Error::PortOpenError {
        baud_rate,
        source: io::Error::new(io::ErrorKind::ResourceBusy, "port stream is in use"),
    })
}

async fn write_all<S: AsyncWrite>(writer: &SharedWriter<S>, data: &[u8]) -> Result<()> {
    let mut guard = writer.lock().await;
    let Some(w) = guard.as_mut() else {
        return Err(Error::WriterUnavailable);
    };

    w.write_all(data).await.map_err(Error::SendError)?;
    w.flush().await.map_err(Error::SendError)
}

/// Forward decoded chunks until cancelled, the stream ends or a read fails.
///
/// Always hands the reader back so the stream can be reassembled.
async fn read_pump<P: PortHandle>(
    coordinator: Coordinator<P>,
    token: ModeToken,
    mut reader: ReadHalf<P::Stream>,
    sink: UnboundedSender<String>,
    cancel: CancellationToken,
) -> ReadHalf<P::Stream> {
    let mut decoder = Utf8StreamDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            n = reader.read(&mut buf) => n,
        };

        match n {
            Ok(0) => {
                info!("Serial Monitor: Stream closed.");
                break;
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    let _ = sink.send(text);
                }
            }
            Err(e) => {
                warn!("Serial Monitor Error: {e}");
                // Teardown joins this task, so it cannot run here
                tokio::spawn(async move { coordinator.exit_mode(&token, true).await });
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = sink.send(rest);
    }

    reader
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rates() {
        assert_eq!(parse_baud_rate("115200").unwrap(), 115200);
        assert_eq!(parse_baud_rate(" 9600 ").unwrap(), 9600);
        assert!(matches!(parse_baud_rate("0"), Err(Error::InvalidBaudRate(_))));
        assert!(matches!(parse_baud_rate("fast"), Err(Error::InvalidBaudRate(_))));
        assert!(matches!(parse_baud_rate("-1"), Err(Error::InvalidBaudRate(_))));
        assert!(matches!(parse_baud_rate(""), Err(Error::InvalidBaudRate(_))));
    }
}
