//! Socket tunnels for guest pipes
//!
//! `TunnelHub` is what the guest-pipe dispatcher talks to. It owns every
//! `TunnelConnection` in a slot table keyed by generation-checked
//! `PipeHandle`s, routes reactor readiness to the connection a token names,
//! and drops reports for slots that have since been freed or reused.

pub mod connection;
pub mod socket;
pub mod transport;

use std::rc::Weak;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::BridgeConfig;
use crate::pipe::{GuestPipe, PipeError, PipeHandle, PipeResult, WakeFlags};
use crate::reactor::{EpollReactor, Readiness, Reactor, Token};
use crate::{Error, Result};

pub use self::connection::{TunnelConnection, TunnelState};
pub use self::socket::{TunnelSocket, TunnelTarget};
pub use self::transport::Transport;

struct Slot {
    generation: u32,
    conn: Option<TunnelConnection>,
}

/// Owner of all tunnel connections on one reactor
pub struct TunnelHub<R: Reactor> {
    reactor: R,
    config: BridgeConfig,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl<R: Reactor> TunnelHub<R> {
    /// Create an empty hub
    pub fn new(reactor: R, config: BridgeConfig) -> Self {
        Self {
            reactor,
            config,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Open a tunnel of `transport` for a guest pipe.
    ///
    /// Fails when the argument is unusable or the connect fails synchronously;
    /// no connection exists afterwards in that case.
    pub fn open(
        &mut self,
        transport: Transport,
        guest: Weak<dyn GuestPipe>,
        args: Option<&str>,
    ) -> Result<PipeHandle> {
        let (target, nodelay) = transport.resolve(args, &self.config)?;
        let handle = self.reserve();

        match TunnelConnection::connect(target, nodelay, guest, handle.token(), &mut self.reactor)
        {
            Ok(conn) => {
                debug!("{} tunnel opened as {:?}", transport, handle);
                self.slots[handle.index()].conn = Some(conn);
                Ok(handle)
            }
            Err(e) => {
                self.release(handle);
                Err(Error::Io(e))
            }
        }
    }

    /// Open a tunnel by guest-visible transport name
    pub fn open_named(
        &mut self,
        name: &str,
        guest: Weak<dyn GuestPipe>,
        args: Option<&str>,
    ) -> Result<PipeHandle> {
        let transport = Transport::from_name(name)
            .ok_or_else(|| Error::Transport(format!("unknown transport '{}'", name)))?;
        self.open(transport, guest, args)
    }

    /// Guest closed its pipe. The connection is freed before returning.
    pub fn close(&mut self, handle: PipeHandle) -> PipeResult<()> {
        let conn = self
            .slot_mut(handle)
            .and_then(|slot| slot.conn.take())
            .ok_or(PipeError::InvalidHandle)?;
        conn.close_from_guest(&mut self.reactor);
        self.release(handle);
        Ok(())
    }

    /// Send bytes from the guest
    pub fn send(&mut self, handle: PipeHandle, buffers: &[&[u8]]) -> PipeResult<usize> {
        self.conn_mut(handle)?.send(buffers)
    }

    /// Receive bytes for the guest
    pub fn recv(&mut self, handle: PipeHandle, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        self.conn_mut(handle)?.recv(buffers)
    }

    /// Ready directions not yet delivered to the guest
    pub fn poll(&self, handle: PipeHandle) -> PipeResult<WakeFlags> {
        self.conn(handle).map(TunnelConnection::poll)
    }

    /// Ask for a wake when any of `flags` becomes ready
    pub fn arm_wake(&mut self, handle: PipeHandle, flags: WakeFlags) -> PipeResult<()> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation())
            .ok_or(PipeError::InvalidHandle)?;
        let conn = slot.conn.as_mut().ok_or(PipeError::InvalidHandle)?;
        conn.arm_wake(flags, &mut self.reactor).map_err(|e| {
            debug!("arm_wake on {:?} failed: {}", handle, e);
            PipeError::Io
        })
    }

    /// Route one readiness report. Reports for freed slots are dropped.
    pub fn dispatch(&mut self, token: Token, readiness: Readiness) {
        let handle = PipeHandle::from_token(token);
        let Some(slot) = self
            .slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation())
        else {
            trace!("stale readiness for {:?}", handle);
            return;
        };
        if let Some(conn) = slot.conn.as_mut() {
            conn.on_ready(readiness, &mut self.reactor);
        }
    }

    /// Current state of a connection
    pub fn state(&self, handle: PipeHandle) -> Option<TunnelState> {
        self.conn(handle).ok().map(TunnelConnection::state)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    /// True when no connection is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configuration the hub was built with
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The reactor connections register with
    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    fn conn(&self, handle: PipeHandle) -> PipeResult<&TunnelConnection> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.conn.as_ref())
            .ok_or(PipeError::InvalidHandle)
    }

    fn conn_mut(&mut self, handle: PipeHandle) -> PipeResult<&mut TunnelConnection> {
        self.slot_mut(handle)
            .and_then(|s| s.conn.as_mut())
            .ok_or(PipeError::InvalidHandle)
    }

    fn slot_mut(&mut self, handle: PipeHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation())
    }

    fn reserve(&mut self) -> PipeHandle {
        if let Some(index) = self.free.pop() {
            let slot = &self.slots[index as usize];
            return PipeHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            conn: None,
        });
        PipeHandle::new(index, 0)
    }

    fn release(&mut self, handle: PipeHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index()) {
            slot.conn = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(handle.index() as u32);
        }
    }
}

impl TunnelHub<EpollReactor> {
    /// Create a hub on a fresh epoll reactor sized from `config`
    pub fn with_epoll(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let reactor = EpollReactor::with_capacity(config.max_events)?;
        Ok(Self::new(reactor, config))
    }

    /// Wait for readiness once and dispatch every report.
    ///
    /// Returns the number of reports handled.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let events = self.reactor.wait(timeout)?;
        let count = events.len();
        for (token, readiness) in events {
            self.dispatch(token, readiness);
        }
        Ok(count)
    }
}

impl<R: Reactor> Drop for TunnelHub<R> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut conn) = slot.conn.take() {
                conn.shutdown(&mut self.reactor);
            }
        }
    }
}
