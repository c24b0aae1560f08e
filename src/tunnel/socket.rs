//! Non-blocking tunnel sockets
//!
//! Thin wrapper over a raw stream socket: non-blocking connect to a loopback
//! TCP port or a Unix path, `SO_ERROR` probing for connect completion, and
//! `Read`/`Write` through `recv`/`send` so the byte mover can drive it.

use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use tracing::trace;

/// Resolved connection target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelTarget {
    /// Loopback TCP port
    Tcp(SocketAddrV4),
    /// Unix stream socket path
    Unix(PathBuf),
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelTarget::Tcp(addr) => write!(f, "tcp:{}", addr),
            TunnelTarget::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Outcome of a non-blocking connect that did not fail outright
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectProgress {
    /// Connection completed synchronously
    Connected,
    /// Completion will be reported as writability
    InProgress,
}

/// Owned non-blocking stream socket
#[derive(Debug)]
pub struct TunnelSocket {
    fd: OwnedFd,
}

impl TunnelSocket {
    /// Issue a non-blocking connect to `target`.
    ///
    /// Any error other than "in progress" is returned, including `EAGAIN`
    /// from a Unix listener with a full backlog.
    pub fn connect(target: &TunnelTarget) -> io::Result<(Self, ConnectProgress)> {
        let domain = match target {
            TunnelTarget::Tcp(_) => libc::AF_INET,
            TunnelTarget::Unix(_) => libc::AF_UNIX,
        };
        let raw = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: socket() returned a fresh descriptor we now own.
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        };

        let ret = match target {
            TunnelTarget::Tcp(addr) => {
                let sin = sockaddr_in(addr);
                unsafe {
                    libc::connect(
                        raw,
                        &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            TunnelTarget::Unix(path) => {
                let (sun, len) = sockaddr_un(path)?;
                unsafe {
                    libc::connect(
                        raw,
                        &sun as *const libc::sockaddr_un as *const libc::sockaddr,
                        len,
                    )
                }
            }
        };

        if ret == 0 {
            trace!("connect to {} completed immediately", target);
            return Ok((socket, ConnectProgress::Connected));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            trace!("connect to {} in progress", target);
            return Ok((socket, ConnectProgress::InProgress));
        }
        Err(err)
    }

    /// Fetch and clear the pending socket error (`SO_ERROR`)
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if value == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(value)))
        }
    }

    /// Disable Nagle's algorithm
    pub fn set_nodelay(&self) -> io::Result<()> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl From<OwnedFd> for TunnelSocket {
    /// Adopt an already-connected, non-blocking stream socket
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for TunnelSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for TunnelSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for TunnelSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: all-zero is a valid sockaddr_in.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

fn sockaddr_un(path: &std::path::Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: all-zero is a valid sockaddr_un.
    let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the terminating NUL.
    if bytes.is_empty() || bytes.len() >= sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unix socket path too long or empty: {}", path.display()),
        ));
    }
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((sun, len as libc::socklen_t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn test_sockaddr_in_network_order() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0x1234);
        let sin = sockaddr_in(&addr);
        assert_eq!(u16::from_be(sin.sin_port), 0x1234);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [127, 0, 0, 1]);
    }

    #[test]
    fn test_sockaddr_un_rejects_long_path() {
        let long = PathBuf::from("/".repeat(200));
        assert!(sockaddr_un(&long).is_err());
        assert!(sockaddr_un(std::path::Path::new("")).is_err());
        assert!(sockaddr_un(std::path::Path::new("/tmp/x.sock")).is_ok());
    }

    #[test]
    fn test_connect_loopback_reports_no_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = TunnelTarget::Tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let (socket, _progress) = TunnelSocket::connect(&target).unwrap();
        let _peer = listener.accept().unwrap();
        assert!(socket.take_error().unwrap().is_none());
        socket.set_nodelay().unwrap();
    }

    #[test]
    fn test_connect_missing_unix_path_fails() {
        let target = TunnelTarget::Unix(PathBuf::from("/nonexistent/guest-bridge.sock"));
        assert!(TunnelSocket::connect(&target).is_err());
    }
}
