//! Guest pipe protocol surface
//!
//! Types shared between the tunnel endpoints and the generic guest-pipe
//! dispatcher that owns the guest-visible pipe objects:
//! - `WakeFlags`: I/O directions a guest waits on or that became ready
//! - `PipeError`: recoverable errors surfaced to guest software as pipe codes
//! - `GuestPipe`: the notifications a host endpoint may deliver to the guest
//! - `PipeHandle`: generation-checked handle to a host endpoint

pub mod buffers;

use bitflags::bitflags;
use thiserror::Error;

use crate::reactor::Token;

bitflags! {
    /// Wake conditions, with the same bit values the guest driver uses.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WakeFlags: u32 {
        /// The pipe was closed by the host
        const CLOSED = 1 << 0;
        /// Data can be received
        const READ = 1 << 1;
        /// Data can be sent
        const WRITE = 1 << 2;
    }
}

/// Recoverable pipe errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// No live guest-visible counterpart, or the endpoint is closing
    #[error("invalid pipe handle")]
    InvalidHandle,
    /// No progress possible now; arm a wake and retry
    #[error("try again")]
    TryAgain,
    /// Unrecoverable transport error, including end-of-stream with nothing moved
    #[error("pipe I/O failure")]
    Io,
}

impl PipeError {
    /// Guest-visible pipe error code
    pub fn code(self) -> i32 {
        match self {
            PipeError::InvalidHandle => -1,
            PipeError::TryAgain => -2,
            PipeError::Io => -4,
        }
    }
}

/// Result of a pipe operation: bytes moved or a pipe error
pub type PipeResult<T> = std::result::Result<T, PipeError>;

/// Guest-visible pipe object, as seen from a host endpoint.
///
/// Endpoints only ever hold a `Weak` reference to it. Implementations must
/// not call back into the tunnel hub synchronously from these methods.
pub trait GuestPipe {
    /// Signal that the conditions in `flags` are now satisfied
    fn wake(&self, flags: WakeFlags);

    /// Force-close the guest pipe; pending guest waits see an error
    fn close(&self);
}

/// Generation-checked handle to one host endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeHandle {
    index: u32,
    generation: u32,
}

impl PipeHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Reactor token carrying this handle
    pub fn token(self) -> Token {
        Token(((self.generation as u64) << 32) | self.index as u64)
    }

    /// Recover the handle a token was built from
    pub fn from_token(token: Token) -> Self {
        Self {
            index: token.0 as u32,
            generation: (token.0 >> 32) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_flag_values() {
        assert_eq!(WakeFlags::CLOSED.bits(), 1);
        assert_eq!(WakeFlags::READ.bits(), 2);
        assert_eq!(WakeFlags::WRITE.bits(), 4);
    }

    #[test]
    fn test_pipe_error_codes() {
        assert_eq!(PipeError::InvalidHandle.code(), -1);
        assert_eq!(PipeError::TryAgain.code(), -2);
        assert_eq!(PipeError::Io.code(), -4);
    }

    #[test]
    fn test_handle_token_round_trip() {
        let handle = PipeHandle::new(7, 3);
        assert_eq!(PipeHandle::from_token(handle.token()), handle);
        assert_ne!(PipeHandle::new(7, 4).token(), handle.token());
    }
}
