//! Session state guarded by the coordinator.
//!
//! Every transition in this module is synchronous and runs while the coordinator holds the session
//! lock. Slow teardown work (joining the read pump, waiting for a lent port) happens in the
//! coordinator with the lock released.

use std::{fmt::Display, sync::Arc};

use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ChipInfo, Error, PortHandle, PortInfo, Result};

/// Activity currently owning the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    #[default]
    Idle,
    Flashing,
    Monitoring,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Idle => write!(f, "Idle"),
            Mode::Flashing => write!(f, "Flashing"),
            Mode::Monitoring => write!(f, "Serial Monitor"),
        }
    }
}

/// Proof of a successful mode transition.
///
/// Tokens are tied to a single entry into a mode. Once that mode has been left, the token is stale
/// and passing it to [`Coordinator::exit_mode`](crate::Coordinator::exit_mode) does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeToken {
    mode: Mode,
    generation: u64,
}

impl ModeToken {
    pub const fn mode(&self) -> Mode {
        self.mode
    }
}

/// Presentation snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub mode: Mode,
    /// Selected port, if any
    pub port: Option<PortInfo>,
    /// Chip identified by the last successful flash
    pub chip: Option<ChipInfo>,
    /// The chip can be reset into the freshly written application
    pub reset_available: bool,
}

/// Writer shared between senders and teardown. Teardown takes it out once pending writes are cancelled.
pub(crate) type SharedWriter<S> = Arc<Mutex<Option<WriteHalf<S>>>>;

pub(crate) struct MonitorResources<S> {
    pub(crate) writer: SharedWriter<S>,
    pub(crate) pump: JoinHandle<ReadHalf<S>>,
    pub(crate) cancel: CancellationToken,
}

/// Bookkeeping for a port lent to a flashing engine.
pub(crate) struct FlashLease<P> {
    pub(crate) cancel: CancellationToken,
    /// Resolves with the port if the lease is revoked while the engine holds it
    pub(crate) port: oneshot::Receiver<P>,
}

pub(crate) enum Activity<P: PortHandle> {
    Idle,
    Monitor(MonitorResources<P::Stream>),
    Flash(FlashLease<P>),
    /// Resources detached, teardown in progress
    Stopping,
}

/// Result of a lent port coming back.
pub(crate) enum LeaseOutcome {
    Failed,
    Flashed(ChipInfo),
    Reset,
}

pub(crate) struct Session<P: PortHandle> {
    pub(crate) port: Option<P>,
    pub(crate) info: Option<PortInfo>,
    pub(crate) chip: Option<ChipInfo>,
    pub(crate) reset_available: bool,
    pub(crate) activity: Activity<P>,
    mode: Mode,
    generation: u64,
    mode_tx: watch::Sender<Mode>,
}

impl<P: PortHandle> Session<P> {
    pub(crate) fn new() -> (Self, watch::Receiver<Mode>) {
        let (mode_tx, mode_rx) = watch::channel(Mode::Idle);

        let session = Self {
            port: None,
            info: None,
            chip: None,
            reset_available: false,
            activity: Activity::Idle,
            mode: Mode::Idle,
            generation: 0,
            mode_tx,
        };

        (session, mode_rx)
    }

    pub(crate) const fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) const fn current_token(&self) -> ModeToken {
        ModeToken {
            mode: self.mode,
            generation: self.generation,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus {
            mode: self.mode,
            port: self.info.clone(),
            chip: self.chip.clone(),
            reset_available: self.reset_available,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.mode_tx.send_replace(mode);
    }

    /// Admit `target` if the session is idle and holds a port.
    pub(crate) fn begin(&mut self, target: Mode) -> Result<ModeToken> {
        if self.mode != Mode::Idle || target == Mode::Idle {
            return Err(Error::ModeConflict {
                current: self.mode,
                requested: target,
            });
        }

        if self.port.is_none() || self.info.is_none() {
            return Err(Error::NoPortSelected);
        }

        self.generation += 1;
        self.set_mode(target);

        Ok(self.current_token())
    }

    /// Undo [`begin`](Self::begin) before any resources were attached.
    pub(crate) fn abort(&mut self, token: ModeToken) {
        if token == self.current_token() {
            self.generation += 1;
            self.activity = Activity::Idle;
            self.set_mode(Mode::Idle);
        }
    }

    /// Detach the resources of the mode identified by `token`.
    ///
    /// Returns `None` for stale tokens and for a teardown that is already running. The mode keeps
    /// its value until [`finish_exit`](Self::finish_exit) so nothing new can start in between.
    pub(crate) fn begin_exit(&mut self, token: &ModeToken) -> Option<Activity<P>> {
        if *token != self.current_token() || self.mode == Mode::Idle {
            debug!("Ignoring stale {} token", token.mode);
            return None;
        }

        if matches!(self.activity, Activity::Stopping) {
            debug!("{} is already stopping", self.mode);
            return None;
        }

        self.generation += 1;
        Some(std::mem::replace(&mut self.activity, Activity::Stopping))
    }

    pub(crate) fn finish_exit(&mut self) {
        self.activity = Activity::Idle;
        self.set_mode(Mode::Idle);
    }

    /// Take back a port lent to an engine.
    ///
    /// If the lease was revoked in the meantime, the port is handed to whoever revoked it instead.
    pub(crate) fn restore_lent_port(
        &mut self,
        token: ModeToken,
        port: P,
        revoked: Option<oneshot::Sender<P>>,
        outcome: LeaseOutcome,
    ) {
        let ours = token == self.current_token() && matches!(self.activity, Activity::Flash(_));

        if !ours {
            if let Some(tx) = revoked {
                if tx.send(port).is_err() {
                    debug!("Lease was revoked and nobody waits for the port, dropping it");
                }
            }
            return;
        }

        self.port = Some(port);
        self.generation += 1;
        self.finish_exit();

        match outcome {
            LeaseOutcome::Failed => {}
            LeaseOutcome::Flashed(chip) => {
                if self.info.is_some() {
                    self.chip = Some(chip);
                    self.reset_available = true;
                }
            }
            LeaseOutcome::Reset => self.reset_available = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::NullPort;

    fn session() -> Session<NullPort> {
        let (mut s, _) = Session::new();
        s.info = Some(PortInfo::new("null"));
        s.port = Some(NullPort::default());
        s
    }

    #[test]
    fn begin_requires_idle() {
        let mut s = session();

        let token = s.begin(Mode::Flashing).unwrap();
        assert_eq!(token.mode(), Mode::Flashing);

        assert!(matches!(
            s.begin(Mode::Monitoring),
            Err(Error::ModeConflict {
                current: Mode::Flashing,
                requested: Mode::Monitoring
            })
        ));
        assert!(matches!(
            s.begin(Mode::Flashing),
            Err(Error::ModeConflict { .. })
        ));
    }

    #[test]
    fn begin_requires_port() {
        let (mut s, _) = Session::<NullPort>::new();
        assert!(matches!(s.begin(Mode::Monitoring), Err(Error::NoPortSelected)));
        assert_eq!(s.mode(), Mode::Idle);
    }

    #[test]
    fn idle_is_not_a_target() {
        let mut s = session();
        assert!(matches!(s.begin(Mode::Idle), Err(Error::ModeConflict { .. })));
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let mut s = session();

        let token = s.begin(Mode::Monitoring).unwrap();
        assert!(s.begin_exit(&token).is_some());
        assert!(s.begin_exit(&token).is_none());
        s.finish_exit();
        assert!(s.begin_exit(&token).is_none());

        let next = s.begin(Mode::Monitoring).unwrap();
        assert_ne!(token, next);
        assert!(s.begin_exit(&token).is_none());
        assert_eq!(s.mode(), Mode::Monitoring);
    }

    #[test]
    fn abort_returns_to_idle() {
        let mut s = session();
        let mut rx = s.subscribe();

        let token = s.begin(Mode::Monitoring).unwrap();
        assert_eq!(*rx.borrow_and_update(), Mode::Monitoring);

        s.abort(token);
        assert_eq!(s.mode(), Mode::Idle);
        assert_eq!(*rx.borrow_and_update(), Mode::Idle);
        assert!(s.begin_exit(&token).is_none());
    }

    #[test]
    fn restore_after_flash() {
        let mut s = session();
        let token = s.begin(Mode::Flashing).unwrap();
        let port = s.port.take().unwrap();
        let (_tx, rx) = oneshot::channel();
        s.activity = Activity::Flash(FlashLease {
            cancel: CancellationToken::new(),
            port: rx,
        });

        let chip = ChipInfo {
            name: "ESP32-C3".to_string(),
            ..Default::default()
        };
        s.restore_lent_port(token, port, None, LeaseOutcome::Flashed(chip.clone()));

        let status = s.status();
        assert_eq!(status.mode, Mode::Idle);
        assert_eq!(status.chip, Some(chip));
        assert!(status.reset_available);
        assert!(s.port.is_some());
    }

    #[test]
    fn revoked_lease_hands_port_back() {
        let mut s = session();
        let token = s.begin(Mode::Flashing).unwrap();
        let port = s.port.take().unwrap();
        let (tx, mut rx) = oneshot::channel();
        let (_, lease_rx) = oneshot::channel();
        s.activity = Activity::Flash(FlashLease {
            cancel: CancellationToken::new(),
            port: lease_rx,
        });

        assert!(s.begin_exit(&token).is_some());
        s.restore_lent_port(token, port, Some(tx), LeaseOutcome::Failed);

        assert!(rx.try_recv().is_ok());
        assert!(s.port.is_none());
        assert!(!s.reset_available);
    }
}
