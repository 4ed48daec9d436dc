//! Flash orchestrator: lends the port to an engine and drives connect, fetch and write.

use futures::{SinkExt, StreamExt, channel::mpsc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    ChipInfo, Coordinator, EngineFactory, EngineOptions, Error, FirmwareFetcher, FirmwareImage,
    FlashEngine, FlashJob, FlashingStatus, Mode, ModeToken, PortHandle, Progress, ROM_BAUD_RATE,
    Result,
    error::describe,
    session::{Activity, FlashLease, LeaseOutcome},
};

/// Baud rate used for writing unless told otherwise.
pub const DEFAULT_FLASH_BAUD_RATE: u32 = 460800;

/// A port lent to an engine.
///
/// Gives the port back to the session when released or dropped, so cleanup also happens if the
/// flashing future is dropped halfway.
struct Lease<P: PortHandle, E: FlashEngine<Port = P>> {
    coordinator: Coordinator<P>,
    token: ModeToken,
    engine: Option<E>,
    revoked: Option<oneshot::Sender<P>>,
}

impl<P: PortHandle, E: FlashEngine<Port = P>> Lease<P, E> {
    async fn release(mut self, outcome: LeaseOutcome) {
        // The engine stays in the lease until the lock is held, so dropping this future while it
        // waits still lets `Drop` hand the port back.
        let coordinator = self.coordinator.clone();
        let mut session = coordinator.lock().await;

        let Some(engine) = self.engine.take() else {
            return;
        };

        session.restore_lent_port(self.token, engine.release(), self.revoked.take(), outcome);
    }
}

impl<P: PortHandle, E: FlashEngine<Port = P>> Drop for Lease<P, E> {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };

        let port = engine.release();
        let token = self.token;
        let revoked = self.revoked.take();

        if let Some(mut session) = self.coordinator.try_lock() {
            session.restore_lent_port(token, port, revoked, LeaseOutcome::Failed);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    coordinator.lock().await.restore_lent_port(
                        token,
                        port,
                        revoked,
                        LeaseOutcome::Failed,
                    );
                });
            }
            Err(_) => warn!("No runtime to return the port to the session, dropping it"),
        }
    }
}

impl<P: PortHandle> Coordinator<P> {
    /// Enter Flashing and take the port out of the session.
    async fn lend_port(&self) -> Result<(ModeToken, P, CancellationToken, oneshot::Sender<P>)> {
        let mut session = self.lock().await;
        let token = session.begin(Mode::Flashing)?;

        let Some(port) = session.port.take() else {
            session.abort(token);
            return Err(Error::NoPortSelected);
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        session.activity = Activity::Flash(FlashLease {
            cancel: cancel.clone(),
            port: rx,
        });
        session.reset_available = false;

        Ok((token, port, cancel, tx))
    }

    /// Flash `image` at `baud_rate`.
    ///
    /// Status updates are sent to `chan` in order. Whatever the outcome, the session is back in
    /// Idle when this returns. On success the chip is recorded and a reset becomes available.
    pub async fn flash<F, X>(
        &self,
        image: &FirmwareImage,
        baud_rate: u32,
        factory: &F,
        fetcher: &X,
        mut chan: Option<mpsc::Sender<FlashingStatus>>,
    ) -> Result<ChipInfo>
    where
        F: EngineFactory<P>,
        X: FirmwareFetcher,
    {
        if baud_rate == 0 {
            return Err(Error::InvalidBaudRate(baud_rate.to_string()));
        }

        let (token, port, cancel, revoked) = self.lend_port().await?;
        info!("Flashing {image}...");

        let mut lease = Lease {
            coordinator: self.clone(),
            token,
            engine: Some(factory.build(port, EngineOptions::new(baud_rate))),
            revoked: Some(revoked),
        };

        let res = match lease.engine.as_mut() {
            Some(engine) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Aborted),
                    res = flash_image(engine, image, fetcher, &mut chan) => res,
                }
            }
            None => Err(Error::Aborted),
        };

        match res {
            Ok(chip) => {
                lease.release(LeaseOutcome::Flashed(chip.clone())).await;
                info!("Flashing complete! Chip is ready to reset.");
                chan_send(&mut chan, FlashingStatus::Finished(chip.clone())).await;
                Ok(chip)
            }
            Err(e) => {
                lease.release(LeaseOutcome::Failed).await;
                warn!("Flashing failed: {e}");
                Err(e)
            }
        }
    }

    /// Restart the chip into its application.
    pub async fn reset<F>(&self, factory: &F) -> Result<()>
    where
        F: EngineFactory<P>,
    {
        let (token, port, cancel, revoked) = self.lend_port().await?;
        info!("Resetting chip...");

        let mut lease = Lease {
            coordinator: self.clone(),
            token,
            engine: Some(factory.build(port, EngineOptions::new(ROM_BAUD_RATE))),
            revoked: Some(revoked),
        };

        let res = match lease.engine.as_mut() {
            Some(engine) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Aborted),
                    res = engine.hard_reset() => res.map_err(|e| Error::ResetError(describe(&e))),
                }
            }
            None => Err(Error::Aborted),
        };

        match res {
            Ok(()) => {
                lease.release(LeaseOutcome::Reset).await;
                info!("Chip reset.");
                Ok(())
            }
            Err(e) => {
                lease.release(LeaseOutcome::Failed).await;
                warn!("Reset failed: {e}");
                Err(e)
            }
        }
    }
}

async fn chan_send(chan: &mut Option<mpsc::Sender<FlashingStatus>>, msg: FlashingStatus) {
    if let Some(c) = chan {
        let _ = c.send(msg).await;
    }
}

async fn flash_image<E, X>(
    engine: &mut E,
    image: &FirmwareImage,
    fetcher: &X,
    chan: &mut Option<mpsc::Sender<FlashingStatus>>,
) -> Result<ChipInfo>
where
    E: FlashEngine,
    X: FirmwareFetcher,
{
    chan_send(chan, FlashingStatus::Preparing).await;

    info!("Connecting to chip...");
    let chip = engine
        .connect_and_sync()
        .await
        .map_err(|e| Error::ConnectError(describe(&e)))?;
    info!("Connected to {chip}");
    chan_send(chan, FlashingStatus::Connected(chip.clone())).await;

    chan_send(chan, FlashingStatus::Downloading).await;
    info!("Fetching {}...", image.locator);
    let data = fetcher
        .fetch(&image.locator)
        .await
        .map_err(|e| Error::FetchError {
            locator: image.locator.clone(),
            reason: describe(&e),
        })?;
    chan_send(chan, FlashingStatus::Downloaded(data.len())).await;

    let job = FlashJob::new(data, image.offset);
    info!(
        "Writing {} bytes at 0x{:x} (md5 {})",
        job.data.len(),
        job.offset,
        job.md5
    );
    write_with_progress(engine, job, chan).await?;

    Ok(chip)
}

async fn write_with_progress<E: FlashEngine>(
    engine: &mut E,
    job: FlashJob,
    chan: &mut Option<mpsc::Sender<FlashingStatus>>,
) -> Result<()> {
    let mut tracker = ProgressTracker::new(job.data.len());
    let (tx, mut rx) = mpsc::unbounded();

    let write = engine.write_flash(job, tx);
    tokio::pin!(write);

    let res = loop {
        tokio::select! {
            res = &mut write => break res,
            Some(p) = rx.next() => {
                if let Some(p) = tracker.update(p) {
                    chan_send(chan, FlashingStatus::FlashingProgress(p)).await;
                }
            }
        }
    };

    while let Ok(p) = rx.try_recv() {
        if let Some(p) = tracker.update(p) {
            chan_send(chan, FlashingStatus::FlashingProgress(p)).await;
        }
    }

    res.map_err(|e| Error::WriteError(describe(&e)))?;

    if let Some(p) = tracker.complete() {
        chan_send(chan, FlashingStatus::FlashingProgress(p)).await;
    }

    Ok(())
}

/// Normalises engine progress to bytes of the image: scaled, clamped and never decreasing.
#[derive(Debug)]
struct ProgressTracker {
    total: usize,
    last: Option<usize>,
}

impl ProgressTracker {
    const fn new(total: usize) -> Self {
        Self { total, last: None }
    }

    fn update(&mut self, p: Progress) -> Option<Progress> {
        let written = if p.total == self.total {
            p.written
        } else if p.total == 0 {
            return None;
        } else {
            (p.written as u128 * self.total as u128 / p.total as u128) as usize
        };
        let written = written.min(self.total);

        if self.last.is_some_and(|x| written <= x) {
            return None;
        }

        self.last = Some(written);
        Some(Progress::new(written, self.total))
    }

    /// The final `total/total` value, unless it was already reported.
    fn complete(&mut self) -> Option<Progress> {
        if self.last == Some(self.total) {
            return None;
        }

        self.last = Some(self.total);
        Some(Progress::new(self.total, self.total))
    }
}
