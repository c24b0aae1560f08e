//! Configuration for the bridge layer

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest number of stream bridge devices a board may declare
pub const MAX_STREAM_BRIDGES_LIMIT: u32 = 64;

/// Where the renderer's server listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererEndpoint {
    /// Unix stream socket path
    Unix(PathBuf),
    /// Loopback TCP port
    Tcp(u16),
}

/// Configuration for the tunnel hub and the stream bridge devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Renderer server address; the `opengles` transport fails without it
    pub renderer: Option<RendererEndpoint>,
    /// Register the `unix` transport (default: true)
    pub allow_unix: bool,
    /// Maximum stream bridge device instances (default: 4)
    pub max_stream_bridges: u32,
    /// Sign-extend 32-bit buffer pointers in legacy address mode (default: false)
    pub sign_extend_legacy_addresses: bool,
    /// Reactor event batch size (default: 64)
    pub max_events: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            renderer: None,
            allow_unix: true,
            max_stream_bridges: 4,
            sign_extend_legacy_addresses: false,
            max_events: 64,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the renderer endpoint to a Unix socket path
    pub fn renderer_unix<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.renderer = Some(RendererEndpoint::Unix(path.into()));
        self
    }

    /// Set the renderer endpoint to a loopback TCP port
    pub fn renderer_tcp(mut self, port: u16) -> Self {
        self.renderer = Some(RendererEndpoint::Tcp(port));
        self
    }

    /// Enable or disable the `unix` transport
    pub fn allow_unix(mut self, allow: bool) -> Self {
        self.allow_unix = allow;
        self
    }

    /// Set the maximum number of stream bridge devices
    pub fn max_stream_bridges(mut self, max: u32) -> Self {
        self.max_stream_bridges = max;
        self
    }

    /// Sign-extend legacy 32-bit buffer pointers
    pub fn sign_extend_legacy_addresses(mut self, enable: bool) -> Self {
        self.sign_extend_legacy_addresses = enable;
        self
    }

    /// Set the reactor event batch size
    pub fn max_events(mut self, max: usize) -> Self {
        self.max_events = max;
        self
    }

    /// Defaults overridden by `BRIDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("BRIDGE_RENDERER_UNIX").filter(|v| !v.is_empty()) {
            config = config.renderer_unix(path);
        }
        if let Some(port) = lookup("BRIDGE_RENDERER_TCP").filter(|v| !v.is_empty()) {
            let port = port.parse::<u16>().map_err(|_| {
                Error::Config(format!("BRIDGE_RENDERER_TCP is not a port: {}", port))
            })?;
            config = config.renderer_tcp(port);
        }
        if let Some(allow) = lookup("BRIDGE_ALLOW_UNIX") {
            config.allow_unix = parse_bool("BRIDGE_ALLOW_UNIX", &allow)?;
        }
        if let Some(max) = lookup("BRIDGE_MAX_STREAM_BRIDGES") {
            config.max_stream_bridges = max.parse::<u32>().map_err(|_| {
                Error::Config(format!("BRIDGE_MAX_STREAM_BRIDGES is not a number: {}", max))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file. `.yaml`/`.yml` files are parsed as YAML,
    /// anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let config: BridgeConfig = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid YAML config {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid JSON config {}: {}", path.display(), e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match &self.renderer {
            Some(RendererEndpoint::Tcp(0)) => {
                return Err(Error::Config("renderer TCP port cannot be 0".into()));
            }
            Some(RendererEndpoint::Unix(path)) if path.as_os_str().is_empty() => {
                return Err(Error::Config("renderer socket path cannot be empty".into()));
            }
            _ => {}
        }

        if self.max_stream_bridges == 0 {
            return Err(Error::Config(
                "at least one stream bridge device must be allowed".into(),
            ));
        }
        if self.max_stream_bridges > MAX_STREAM_BRIDGES_LIMIT {
            return Err(Error::Config(format!(
                "at most {} stream bridge devices supported",
                MAX_STREAM_BRIDGES_LIMIT
            )));
        }

        if self.max_events == 0 {
            return Err(Error::Config("max_events must be at least 1".into()));
        }

        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{} is not a boolean: {}", key, other))),
    }
}
