//! Tunnel transports
//!
//! The set of transports is closed: `tcp` (loopback port chosen by the guest),
//! `unix` (path chosen by the guest) and `opengles` (the renderer's server,
//! chosen by host configuration).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use crate::config::{BridgeConfig, RendererEndpoint};
use crate::{Error, Result};

use super::socket::TunnelTarget;

/// Guest-selectable tunnel transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// `tcp:<port>` to 127.0.0.1
    Tcp,
    /// `unix:<path>`
    Unix,
    /// Renderer channel; the guest argument is ignored
    Renderer,
}

impl Transport {
    /// Every transport, in registration order
    pub const ALL: [Transport; 3] = [Transport::Tcp, Transport::Unix, Transport::Renderer];

    /// Name the guest uses to select the transport
    pub fn name(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
            Transport::Renderer => "opengles",
        }
    }

    /// Look up a transport by guest-visible name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Whether `config` registers this transport
    pub fn is_enabled(self, config: &BridgeConfig) -> bool {
        match self {
            Transport::Unix => config.allow_unix,
            Transport::Tcp | Transport::Renderer => true,
        }
    }

    /// Turn the guest's open argument into a connection target.
    ///
    /// The second value asks for `TCP_NODELAY` on the connected socket.
    pub fn resolve(self, args: Option<&str>, config: &BridgeConfig) -> Result<(TunnelTarget, bool)> {
        if !self.is_enabled(config) {
            return Err(Error::Transport(format!(
                "transport '{}' is not enabled",
                self.name()
            )));
        }

        match self {
            Transport::Tcp => {
                let port = required(self, args)?
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| {
                        Error::Transport(format!("invalid tcp port: {}", args.unwrap_or_default()))
                    })?;
                Ok((
                    TunnelTarget::Tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
                    false,
                ))
            }
            Transport::Unix => {
                let path = required(self, args)?;
                Ok((TunnelTarget::Unix(PathBuf::from(path)), false))
            }
            Transport::Renderer => match &config.renderer {
                Some(RendererEndpoint::Tcp(port)) => Ok((
                    TunnelTarget::Tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, *port)),
                    true,
                )),
                Some(RendererEndpoint::Unix(path)) => Ok((TunnelTarget::Unix(path.clone()), false)),
                None => Err(Error::Transport(
                    "renderer endpoint is not configured".into(),
                )),
            },
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn required(transport: Transport, args: Option<&str>) -> Result<&str> {
    match args {
        Some(a) if !a.is_empty() => Ok(a),
        _ => Err(Error::Transport(format!(
            "missing argument for transport '{}'",
            transport.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Transport::from_name("tcp"), Some(Transport::Tcp));
        assert_eq!(Transport::from_name("unix"), Some(Transport::Unix));
        assert_eq!(Transport::from_name("opengles"), Some(Transport::Renderer));
        assert_eq!(Transport::from_name("udp"), None);
    }

    #[test]
    fn test_tcp_targets_loopback_only() {
        let config = BridgeConfig::default();
        let (target, nodelay) = Transport::Tcp.resolve(Some("5555"), &config).unwrap();
        assert_eq!(
            target,
            TunnelTarget::Tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5555))
        );
        assert!(!nodelay);

        assert!(Transport::Tcp.resolve(Some("10.0.0.1:80"), &config).is_err());
        assert!(Transport::Tcp.resolve(Some("0"), &config).is_err());
        assert!(Transport::Tcp.resolve(Some("70000"), &config).is_err());
    }

    #[test]
    fn test_missing_argument_fails() {
        let config = BridgeConfig::default();
        assert!(Transport::Tcp.resolve(None, &config).is_err());
        assert!(Transport::Tcp.resolve(Some(""), &config).is_err());
        assert!(Transport::Unix.resolve(Some(""), &config).is_err());
    }

    #[test]
    fn test_unix_can_be_disabled() {
        let config = BridgeConfig::new().allow_unix(false);
        assert!(Transport::Unix.resolve(Some("/tmp/s"), &config).is_err());
    }

    #[test]
    fn test_renderer_uses_configured_endpoint() {
        let missing = BridgeConfig::default();
        assert!(Transport::Renderer.resolve(None, &missing).is_err());

        let tcp = BridgeConfig::new().renderer_tcp(22468);
        let (target, nodelay) = Transport::Renderer.resolve(Some("ignored"), &tcp).unwrap();
        assert_eq!(
            target,
            TunnelTarget::Tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 22468))
        );
        assert!(nodelay);

        let unix = BridgeConfig::new().renderer_unix("/run/renderer.sock");
        let (target, nodelay) = Transport::Renderer.resolve(None, &unix).unwrap();
        assert_eq!(target, TunnelTarget::Unix(PathBuf::from("/run/renderer.sock")));
        assert!(!nodelay);
    }
}
