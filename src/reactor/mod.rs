//! Host reactor interface
//!
//! The reactor is the host's single-threaded readiness loop. Endpoints tell it
//! which directions they care about for a descriptor (`set_interest`), and the
//! owner of the endpoints turns each reported `(Token, Readiness)` pair into a
//! callback on the endpoint the token names.

pub mod epoll;

use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

pub use self::epoll::EpollReactor;

bitflags! {
    /// Directions an endpoint wants readiness reports for
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Conditions reported by the reactor for one descriptor
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Readiness: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Connection fully hung up in both directions. A peer that only
        /// shut down its write side is reported as `READ`.
        const HANGUP = 1 << 2;
        /// Socket error pending
        const ERROR = 1 << 3;
    }
}

/// Opaque value handed back with every readiness report for a descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Readiness registration, the equivalent of installing or removing
/// read/write handlers for a descriptor.
pub trait Reactor {
    /// Replace the interest set for `fd`. An empty set removes the descriptor.
    fn set_interest(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd` altogether. Unknown descriptors are ignored.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;
}
