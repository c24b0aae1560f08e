//! Tunnel connection state machine
//!
//! One `TunnelConnection` bridges one guest pipe to one outbound socket.
//!
//! ```text
//! Init ──connect──► Connecting ──completion ok──► Connected
//!                       │                            │
//!                       │ completion failed          │ socket error
//!                       ▼                            ▼
//!                 ClosingFromSocket ◄────────────────┘
//!
//! any state ──guest close──► ClosingFromGuest (freed immediately)
//! ```
//!
//! Reactor interest always mirrors the state: write interest while connecting,
//! the wanted directions once connected, nothing in the closing states. Every
//! transition out of `Connecting`/`Connected` deregisters the descriptor before
//! doing anything else.

use std::io;
use std::os::fd::AsRawFd;
use std::rc::Weak;

use tracing::{debug, info, trace, warn};

use crate::pipe::buffers::{recv_buffers, send_buffers};
use crate::pipe::{GuestPipe, PipeError, PipeResult, WakeFlags};
use crate::reactor::{Interest, Readiness, Reactor, Token};

use super::socket::{ConnectProgress, TunnelSocket, TunnelTarget};

/// Lifecycle state of a tunnel connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Created, connect not yet issued
    Init,
    /// Non-blocking connect in flight
    Connecting,
    /// Bytes can flow
    Connected,
    /// Guest closed the pipe; the connection is being freed
    ClosingFromGuest,
    /// Socket failed; waiting for the guest to close its pipe
    ClosingFromSocket,
}

impl TunnelState {
    /// True for both closing states
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            TunnelState::ClosingFromGuest | TunnelState::ClosingFromSocket
        )
    }
}

/// Host side of one guest pipe
pub struct TunnelConnection {
    state: TunnelState,
    wake_wanted: WakeFlags,
    wake_actual: WakeFlags,
    socket: Option<TunnelSocket>,
    guest: Option<Weak<dyn GuestPipe>>,
    token: Token,
    target: TunnelTarget,
    nodelay: bool,
}

impl TunnelConnection {
    /// Connect to `target` and register with the reactor.
    ///
    /// A connect that fails synchronously is returned as an error and leaves
    /// nothing behind; a connect that completes synchronously goes straight
    /// to `Connected`.
    pub fn connect<R: Reactor + ?Sized>(
        target: TunnelTarget,
        nodelay: bool,
        guest: Weak<dyn GuestPipe>,
        token: Token,
        reactor: &mut R,
    ) -> io::Result<Self> {
        let mut conn = Self {
            state: TunnelState::Init,
            wake_wanted: WakeFlags::empty(),
            wake_actual: WakeFlags::empty(),
            socket: None,
            guest: Some(guest),
            token,
            target,
            nodelay,
        };

        let (socket, progress) = TunnelSocket::connect(&conn.target).map_err(|e| {
            warn!("tunnel connect to {} failed: {}", conn.target, e);
            e
        })?;
        conn.socket = Some(socket);
        conn.state = TunnelState::Connecting;
        debug!("tunnel {:?}: connecting to {}", conn.token, conn.target);

        if progress == ConnectProgress::Connected {
            conn.on_connected();
        }
        conn.update_interest(reactor)?;
        Ok(conn)
    }

    /// Adopt an already-open socket in the given state
    #[cfg(test)]
    pub(crate) fn from_parts(
        socket: TunnelSocket,
        state: TunnelState,
        guest: Weak<dyn GuestPipe>,
        token: Token,
    ) -> Self {
        Self {
            state,
            wake_wanted: WakeFlags::empty(),
            wake_actual: WakeFlags::empty(),
            socket: Some(socket),
            guest: Some(guest),
            token,
            target: TunnelTarget::Unix(std::path::PathBuf::from("<adopted>")),
            nodelay: false,
        }
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Directions the guest is waiting on
    pub fn wake_wanted(&self) -> WakeFlags {
        self.wake_wanted
    }

    /// Ready directions not yet consumed by the guest
    pub fn poll(&self) -> WakeFlags {
        self.wake_actual
    }

    /// Where this connection points
    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Send the concatenation of `buffers` to the peer
    pub fn send(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        self.check_io_state()?;
        let socket = self.socket.as_mut().ok_or(PipeError::InvalidHandle)?;
        send_buffers(socket, buffers)
    }

    /// Receive from the peer into `buffers`
    pub fn recv(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        self.check_io_state()?;
        let socket = self.socket.as_mut().ok_or(PipeError::InvalidHandle)?;
        recv_buffers(socket, buffers)
    }

    /// Ask to be woken when any of `flags` becomes ready
    pub fn arm_wake<R: Reactor + ?Sized>(
        &mut self,
        flags: WakeFlags,
        reactor: &mut R,
    ) -> io::Result<()> {
        let flags = flags & (WakeFlags::READ | WakeFlags::WRITE);
        self.wake_wanted |= flags;
        self.wake_actual.remove(flags);
        trace!(
            "tunnel {:?}: wake wanted {:?} actual {:?}",
            self.token,
            self.wake_wanted,
            self.wake_actual
        );
        self.update_interest(reactor)
    }

    /// Handle one readiness report for this connection's socket
    pub fn on_ready<R: Reactor + ?Sized>(&mut self, readiness: Readiness, reactor: &mut R) {
        match self.state {
            TunnelState::Connecting => self.finish_connect(readiness, reactor),
            TunnelState::Connected => {
                if readiness.contains(Readiness::ERROR) {
                    let cause = self
                        .socket
                        .as_ref()
                        .and_then(|s| s.take_error().ok().flatten());
                    match cause {
                        Some(e) => warn!("tunnel {:?}: socket error: {}", self.token, e),
                        None => warn!("tunnel {:?}: socket error reported", self.token),
                    }
                    self.close_from_socket(reactor);
                    return;
                }

                let mut ready = WakeFlags::empty();
                if readiness.intersects(Readiness::READ | Readiness::HANGUP) {
                    ready |= WakeFlags::READ;
                }
                if readiness.intersects(Readiness::WRITE | Readiness::HANGUP) {
                    ready |= WakeFlags::WRITE;
                }
                self.signal(ready);

                if let Err(e) = self.update_interest(reactor) {
                    warn!("tunnel {:?}: failed to update interest: {}", self.token, e);
                    self.close_from_socket(reactor);
                }
            }
            state => trace!(
                "tunnel {:?}: ignoring {:?} in {:?}",
                self.token,
                readiness,
                state
            ),
        }
    }

    /// Tear down after the guest closed its pipe. Nothing is notified.
    pub fn close_from_guest<R: Reactor + ?Sized>(mut self, reactor: &mut R) {
        self.state = TunnelState::ClosingFromGuest;
        self.guest = None;
        self.release_socket(reactor);
        debug!("tunnel {:?}: closed by guest", self.token);
    }

    /// Release everything without touching the guest pipe
    pub(crate) fn shutdown<R: Reactor + ?Sized>(&mut self, reactor: &mut R) {
        self.guest = None;
        self.release_socket(reactor);
    }

    fn finish_connect<R: Reactor + ?Sized>(&mut self, readiness: Readiness, reactor: &mut R) {
        let outcome = match self.socket.as_ref().map(TunnelSocket::take_error) {
            Some(Ok(None)) if !readiness.contains(Readiness::ERROR) => Ok(()),
            Some(Ok(None)) => Err(io::Error::other("error reported during connect")),
            Some(Ok(Some(e))) | Some(Err(e)) => Err(e),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        match outcome {
            Ok(()) => {
                self.on_connected();
                if let Err(e) = self.update_interest(reactor) {
                    warn!("tunnel {:?}: failed to update interest: {}", self.token, e);
                    self.close_from_socket(reactor);
                }
            }
            Err(e) => {
                warn!("tunnel connect to {} failed: {}", self.target, e);
                self.close_from_socket(reactor);
            }
        }
    }

    fn on_connected(&mut self) {
        self.state = TunnelState::Connected;
        if self.nodelay {
            if let Some(socket) = &self.socket {
                if let Err(e) = socket.set_nodelay() {
                    warn!("tunnel {:?}: TCP_NODELAY failed: {}", self.token, e);
                }
            }
        }
        info!("tunnel {:?}: connected to {}", self.token, self.target);
    }

    fn signal(&mut self, ready: WakeFlags) {
        self.wake_actual |= ready;
        let delivered = self.wake_wanted & ready;
        if delivered.is_empty() {
            return;
        }
        self.wake_wanted.remove(delivered);

        match self.guest.as_ref().and_then(Weak::upgrade) {
            Some(pipe) => {
                trace!("tunnel {:?}: wake {:?}", self.token, self.wake_actual);
                pipe.wake(self.wake_actual);
            }
            None => trace!("tunnel {:?}: guest pipe gone, wake dropped", self.token),
        }
    }

    fn close_from_socket<R: Reactor + ?Sized>(&mut self, reactor: &mut R) {
        self.release_socket(reactor);
        self.state = TunnelState::ClosingFromSocket;
        self.wake_wanted = WakeFlags::empty();

        if let Some(pipe) = self.guest.take().and_then(|w| w.upgrade()) {
            debug!("tunnel {:?}: force-closing guest pipe", self.token);
            pipe.close();
        }
    }

    fn release_socket<R: Reactor + ?Sized>(&mut self, reactor: &mut R) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = reactor.deregister(socket.as_raw_fd()) {
                warn!("tunnel {:?}: deregister failed: {}", self.token, e);
            }
        }
    }

    fn check_io_state(&self) -> PipeResult<()> {
        match self.state {
            TunnelState::Connected => Ok(()),
            TunnelState::Init | TunnelState::Connecting => Err(PipeError::TryAgain),
            TunnelState::ClosingFromGuest | TunnelState::ClosingFromSocket => {
                Err(PipeError::InvalidHandle)
            }
        }
    }

    fn update_interest<R: Reactor + ?Sized>(&mut self, reactor: &mut R) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };

        let interest = match self.state {
            TunnelState::Connecting => Interest::WRITE,
            TunnelState::Connected => {
                let mut interest = Interest::empty();
                if self.wake_wanted.contains(WakeFlags::WRITE) {
                    interest |= Interest::WRITE;
                }
                if self.wake_wanted.contains(WakeFlags::READ) {
                    interest |= Interest::READ;
                }
                interest
            }
            _ => Interest::empty(),
        };

        reactor.set_interest(socket.as_raw_fd(), self.token, interest)
    }
}
