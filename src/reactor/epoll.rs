//! epoll-backed reactor
//!
//! Level-triggered, single-threaded. Descriptors are added on their first
//! non-empty interest set, modified in place afterwards, and removed when the
//! interest set becomes empty.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::{debug, trace};

use super::{Interest, Readiness, Reactor, Token};

/// Default number of events collected per wait
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Reactor over a private epoll instance
pub struct EpollReactor {
    epfd: OwnedFd,
    registered: HashMap<RawFd, Interest>,
    events: Vec<libc::epoll_event>,
}

impl EpollReactor {
    /// Create a reactor collecting at most `DEFAULT_MAX_EVENTS` per wait
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Create a reactor collecting at most `max_events` per wait
    pub fn with_capacity(max_events: usize) -> io::Result<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 returned a fresh descriptor we now own.
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };

        debug!("epoll reactor created (max_events={})", max_events);
        Ok(Self {
            epfd,
            registered: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Number of descriptors currently watched
    pub fn watched(&self) -> usize {
        self.registered.len()
    }

    /// Current interest set for `fd`, empty when not watched
    pub fn interest(&self, fd: RawFd) -> Interest {
        self.registered.get(&fd).copied().unwrap_or_default()
    }

    /// Wait for readiness. `None` blocks until at least one event arrives.
    ///
    /// A wait interrupted by a signal returns no events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Readiness)>> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let nfds = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if nfds < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(e);
        }

        let ready = self
            .events
            .iter()
            .take(nfds as usize)
            .map(|event| {
                let bits = event.events;
                let data = event.u64;
                (Token(data), readiness_from_epoll(bits))
            })
            .collect::<Vec<_>>();

        trace!("epoll reported {} events", ready.len());
        Ok(ready)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_bits(interest),
            u64: token.0,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Reactor for EpollReactor {
    fn set_interest(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            return self.deregister(fd);
        }

        let op = if self.registered.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, token, interest)?;
        self.registered.insert(fd, interest);
        trace!("fd {} interest {:?}", fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Ok(());
        }
        let ret = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        trace!("fd {} deregistered", fd);
        Ok(())
    }
}

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.contains(Interest::READ) {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.contains(Interest::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn readiness_from_epoll(bits: u32) -> Readiness {
    let mut readiness = Readiness::empty();
    // A half-close only affects our read side: the next read sees end-of-stream.
    if bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
        readiness |= Readiness::READ;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        readiness |= Readiness::WRITE;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        readiness |= Readiness::HANGUP;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        readiness |= Readiness::ERROR;
    }
    readiness
}
