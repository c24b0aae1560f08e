//! guest-bridge: host-side byte bridges for paravirtual guest I/O
//!
//! Connects guest-visible virtual devices to real host byte streams on a
//! single-threaded, non-blocking reactor.
//!
//! # Key Pieces
//!
//! - **Tunnels**: guest pipes backed by outbound loopback TCP, Unix-domain or
//!   renderer sockets, with explicit wake/poll backpressure
//! - **Stream bridge device**: MMIO character device with a bounded receive
//!   queue and an interrupt line tied to queue occupancy
//! - **Save state**: versioned per-device records in a postcard container
//!
//! # Example: Tunnel to a Local Service
//!
//! ```no_run
//! use std::rc::{Rc, Weak};
//! use std::time::Duration;
//!
//! use guest_bridge::prelude::*;
//!
//! struct Pipe;
//!
//! impl GuestPipe for Pipe {
//!     fn wake(&self, flags: WakeFlags) {
//!         println!("ready: {:?}", flags);
//!     }
//!     fn close(&self) {
//!         println!("closed by host");
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut hub = TunnelHub::with_epoll(BridgeConfig::default())?;
//!     let pipe = Rc::new(Pipe);
//!     let guest = Rc::downgrade(&pipe) as Weak<dyn GuestPipe>;
//!
//!     let handle = hub.open(Transport::Tcp, guest, Some("5555"))?;
//!     hub.arm_wake(handle, WakeFlags::WRITE)?;
//!     hub.run_once(Some(Duration::from_secs(1)))?;
//!     hub.send(handle, &[b"ping"])?;
//!     hub.close(handle)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod pipe;
pub mod reactor;
pub mod snapshot;
pub mod tunnel;

// Re-exports for convenience
pub use config::BridgeConfig;
pub use error::{Error, ProtocolViolation, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::config::{BridgeConfig, RendererEndpoint};
    pub use crate::devices::char_backend::CharBackend;
    pub use crate::devices::irq::{IrqLatch, IrqLine};
    pub use crate::devices::stream_bridge::{InstanceIds, StreamBridgeDevice};
    pub use crate::devices::GuestAddressing;
    pub use crate::error::{Error, ProtocolViolation, Result};
    pub use crate::pipe::{GuestPipe, PipeError, PipeHandle, WakeFlags};
    pub use crate::reactor::{EpollReactor, Reactor};
    pub use crate::snapshot::SaveState;
    pub use crate::tunnel::{Transport, TunnelHub, TunnelState};
}
