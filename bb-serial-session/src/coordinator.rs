//! The lifecycle coordinator: sole owner of the session and all mode transitions.

use std::{io, sync::Arc};

use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{info, warn};

use crate::{
    ChooserError, DeviceChooser, Error, Mode, ModeToken, PortHandle, PortInfo, Result,
    SessionStatus,
    session::{Activity, Session},
};

/// Handle to a serial session.
///
/// Cloning is cheap and every clone refers to the same session.
pub struct Coordinator<P: PortHandle> {
    session: Arc<Mutex<Session<P>>>,
    mode_rx: watch::Receiver<Mode>,
}

impl<P: PortHandle> Clone for Coordinator<P> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            mode_rx: self.mode_rx.clone(),
        }
    }
}

impl<P: PortHandle> Default for Coordinator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PortHandle> std::fmt::Debug for Coordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("mode", &*self.mode_rx.borrow())
            .finish_non_exhaustive()
    }
}

/// What came back from a detached activity.
enum Released<P: PortHandle> {
    Nothing,
    Stream(P::Stream),
    Port(P),
    Lost,
}

pub(crate) fn log_teardown(step: &'static str, source: io::Error) {
    let err = Error::TeardownError { step, source };
    warn!("{err}");
}

impl<P: PortHandle> Coordinator<P> {
    /// A new idle session without a port.
    pub fn new() -> Self {
        let (session, mode_rx) = Session::new();

        Self {
            session: Arc::new(Mutex::new(session)),
            mode_rx,
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Session<P>> {
        self.session.lock().await
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, Session<P>>> {
        self.session.try_lock().ok()
    }

    pub async fn status(&self) -> SessionStatus {
        self.lock().await.status()
    }

    pub async fn mode(&self) -> Mode {
        self.lock().await.mode()
    }

    /// Watch mode changes, including those caused by a failing read pump.
    pub fn mode_changes(&self) -> watch::Receiver<Mode> {
        self.mode_rx.clone()
    }

    /// Ask the environment for a port and select it.
    ///
    /// A previously selected port is closed and replaced. Not allowed while a mode is active.
    pub async fn request_port<C>(&self, chooser: &C) -> Result<PortInfo>
    where
        C: DeviceChooser<Port = P>,
    {
        ensure_idle(self.lock().await.mode())?;

        info!("Requesting serial port...");
        let port = chooser.request_port().await.map_err(|e| match e {
            ChooserError::Cancelled => Error::NoPortSelected,
            ChooserError::Unsupported(x) => Error::UnsupportedEnvironment(x),
        })?;
        let port_info = port.info().clone();

        let mut session = self.lock().await;
        ensure_idle(session.mode())?;

        if let Some(mut old) = session.port.take() {
            if let Err(e) = old.close().await {
                log_teardown("closing previous port", e);
            }
        }

        session.port = Some(port);
        session.info = Some(port_info.clone());
        session.chip = None;
        session.reset_available = false;

        info!("Port selected: {port_info}");
        Ok(port_info)
    }

    /// Move from Idle into `target`.
    ///
    /// The caller attaches the mode's resources afterwards and must eventually pass the token to
    /// [`exit_mode`](Self::exit_mode).
    pub async fn enter_mode(&self, target: Mode) -> Result<ModeToken> {
        self.lock().await.begin(target)
    }

    /// Release everything held by the mode `token` refers to and return to Idle.
    ///
    /// Idempotent. Stale tokens are ignored. Every release step runs even if an earlier one failed;
    /// failures are logged and never returned.
    pub async fn exit_mode(&self, token: &ModeToken, close_port: bool) {
        let detached = self.lock().await.begin_exit(token);
        if let Some(activity) = detached {
            drop(self.finish_exit(activity, close_port).await);
        }
    }

    /// Tear down detached resources. Runs without the lock until the final step.
    pub(crate) async fn finish_exit(
        &self,
        activity: Activity<P>,
        close_port: bool,
    ) -> MutexGuard<'_, Session<P>> {
        let released = match activity {
            Activity::Monitor(res) => {
                res.cancel.cancel();
                // Cancelled senders drop their guard, so this does not wait on a stalled write
                let writer = res.writer.lock().await.take();
                match (res.pump.await, writer) {
                    (Ok(reader), Some(writer)) => Released::Stream(reader.unsplit(writer)),
                    (Ok(_), None) => {
                        log_teardown(
                            "releasing writer",
                            io::Error::new(io::ErrorKind::NotFound, "writer is gone"),
                        );
                        Released::Nothing
                    }
                    (Err(e), _) => {
                        log_teardown("releasing reader", io::Error::other(e));
                        Released::Nothing
                    }
                }
            }
            Activity::Flash(lease) => {
                lease.cancel.cancel();
                match lease.port.await {
                    Ok(port) => Released::Port(port),
                    Err(_) => Released::Lost,
                }
            }
            Activity::Idle | Activity::Stopping => Released::Nothing,
        };

        let mut session = self.lock().await;

        match released {
            Released::Nothing => {}
            Released::Stream(stream) => match session.port.as_mut() {
                Some(port) => port.return_stream(stream),
                None => log_teardown(
                    "releasing writer",
                    io::Error::new(io::ErrorKind::NotFound, "port is gone"),
                ),
            },
            Released::Port(port) => session.port = Some(port),
            Released::Lost => {
                log_teardown(
                    "returning port",
                    io::Error::new(io::ErrorKind::BrokenPipe, "engine dropped the port"),
                );
                session.info = None;
                session.reset_available = false;
            }
        }

        if close_port {
            if let Some(port) = session.port.as_mut() {
                if let Err(e) = port.close().await {
                    log_teardown("closing port", e);
                }
            }
        }

        session.finish_exit();
        session
    }

    /// Forget the selected port.
    ///
    /// Stops whatever mode is active, closes the port and clears the chip information. A running
    /// flash fails with [`Error::Aborted`].
    pub async fn disconnect(&self) {
        let (detached, mut mode_rx) = {
            let mut session = self.lock().await;

            session.info = None;
            session.chip = None;
            session.reset_available = false;

            let detached = match session.mode() {
                Mode::Idle => None,
                _ => {
                    let token = session.current_token();
                    session.begin_exit(&token)
                }
            };
            (detached, session.subscribe())
        };

        let mut session = match detached {
            Some(activity) => self.finish_exit(activity, true).await,
            None => {
                // Another teardown may be running
                if mode_rx.wait_for(|x| *x == Mode::Idle).await.is_err() {
                    warn!("Session state channel closed");
                }
                self.lock().await
            }
        };

        if let Some(mut port) = session.port.take() {
            if let Err(e) = port.close().await {
                log_teardown("closing port", e);
            }
        }
        session.info = None;

        info!("Disconnected.");
    }
}

fn ensure_idle(current: Mode) -> Result<()> {
    if current == Mode::Idle {
        Ok(())
    } else {
        Err(Error::ModeConflict {
            current,
            requested: Mode::Idle,
        })
    }
}
