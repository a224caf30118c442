//! Server and client configuration (spec.md §8, ambient per SPEC_FULL.md).
//!
//! Both configs are `serde::Deserialize` so they can be loaded from a TOML
//! file; every field also has a sane default so a minimal file (or none at
//! all, for embedders constructing the struct directly) still works. Time
//! fields are stored in seconds so they round-trip through TOML as plain
//! integers; use the `*()` accessor to get a [`Duration`] out.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

fn default_tunnel_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_public_listen() -> SocketAddr {
    "0.0.0.0:443".parse().unwrap()
}

fn default_high_water_mark() -> usize {
    2 * 1024 * 1024
}

fn default_low_water_mark() -> usize {
    204_800
}

fn default_handshake_timeout_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_sni_read_timeout_secs() -> u64 {
    2
}

fn default_channel_write_cap() -> usize {
    64 * 1024
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_backoff_initial_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    60
}

/// Configuration for the edge-side tunnel server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the tunnel (peer-facing) listener binds to.
    #[serde(default = "default_tunnel_listen")]
    pub tunnel_listen: SocketAddr,
    /// Address the public (SNI-facing) listener binds to.
    #[serde(default = "default_public_listen")]
    pub public_listen: SocketAddr,
    /// Bytes queued on a channel before the reader side is paused.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    /// Bytes a paused channel must drain to before it is resumed.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Maximum time, in seconds, a handshake may take before the connection
    /// is dropped.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// How often, in seconds, an idle peer session is probed with a PING
    /// frame.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// How long, in seconds, a peer may go without sending any frame before
    /// its tunnel is torn down (spec.md §8 scenario 6).
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Maximum time, in seconds, to wait for a full TLS ClientHello before
    /// giving up.
    #[serde(default = "default_sni_read_timeout_secs")]
    pub sni_read_timeout_secs: u64,
    /// Per-channel write buffer cap on the public-facing side.
    #[serde(default = "default_channel_write_cap")]
    pub channel_write_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            tunnel_listen: default_tunnel_listen(),
            public_listen: default_public_listen(),
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            sni_read_timeout_secs: default_sni_read_timeout_secs(),
            channel_write_cap: default_channel_write_cap(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn sni_read_timeout(&self) -> Duration {
        Duration::from_secs(self.sni_read_timeout_secs)
    }

    /// Validates cross-field invariants a plain `Deserialize` can't express.
    pub fn validate(&self) -> Result<()> {
        if self.low_water_mark >= self.high_water_mark {
            return Err(Error::simple(ErrorKind::Config));
        }
        if self.channel_write_cap == 0 {
            return Err(Error::simple(ErrorKind::Config));
        }
        Ok(())
    }

    /// Parses a TOML document into a validated [`ServerConfig`].
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: ServerConfig = toml::from_str(s).simple_from_toml()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration for a tunnel client worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the edge server's tunnel-facing listener.
    #[serde(default = "default_tunnel_listen")]
    pub server: SocketAddr,
    /// Address of the local backend the client bridges channels to.
    #[serde(default = "default_local_backend")]
    pub local_backend: SocketAddr,
    /// Handshake token, as issued by the external token authority.
    #[serde(default)]
    pub token: String,
    /// Hex-encoded AES-256 key, minted by the token authority alongside
    /// `token` and embedded inside it; the client needs its own copy to
    /// encrypt the frames it sends.
    #[serde(default)]
    pub aes_key_hex: String,
    /// Hex-encoded AES IV, minted alongside `aes_key_hex`.
    #[serde(default)]
    pub aes_iv_hex: String,
    /// Hex-encoded handshake challenge, minted alongside the token; echoed
    /// back by the server, encrypted, to prove it derived the same key.
    #[serde(default)]
    pub challenge_hex: String,
    /// Interval, in seconds, between keepalive PING frames while the tunnel
    /// is idle.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Initial delay, in seconds, before the first reconnect attempt.
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,
    /// Upper bound, in seconds, the exponential reconnect backoff saturates
    /// at.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Per-channel write buffer cap on the backend-facing side.
    #[serde(default = "default_channel_write_cap")]
    pub channel_write_cap: usize,
    /// How long, in seconds, a keepalive PING may go unanswered before the
    /// tunnel is considered half-open and the client reconnects.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

fn default_local_backend() -> SocketAddr {
    "127.0.0.1:8443".parse().unwrap()
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: default_tunnel_listen(),
            local_backend: default_local_backend(),
            token: String::new(),
            aes_key_hex: String::new(),
            aes_iv_hex: String::new(),
            challenge_hex: String::new(),
            keepalive_secs: default_keepalive_secs(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            channel_write_cap: default_channel_write_cap(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn aes_key(&self) -> Result<[u8; 32]> {
        crate::crypto::hex::decode_fixed(&self.aes_key_hex)
    }

    pub fn aes_iv(&self) -> Result<[u8; 16]> {
        crate::crypto::hex::decode_fixed(&self.aes_iv_hex)
    }

    pub fn challenge(&self) -> Result<[u8; 32]> {
        crate::crypto::hex::decode_fixed(&self.challenge_hex)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::simple(ErrorKind::Config));
        }
        if self.backoff_initial_secs > self.backoff_max_secs {
            return Err(Error::simple(ErrorKind::Config));
        }
        if self.channel_write_cap == 0 {
            return Err(Error::simple(ErrorKind::Config));
        }
        self.aes_key()?;
        self.aes_iv()?;
        self.challenge()?;
        Ok(())
    }

    /// Parses a TOML document into a validated [`ClientConfig`].
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: ClientConfig = toml::from_str(s).simple_from_toml()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

trait TomlResultExt<T> {
    fn simple_from_toml(self) -> Result<T>;
}

impl<T> TomlResultExt<T> for std::result::Result<T, toml::de::Error> {
    fn simple_from_toml(self) -> Result<T> {
        self.map_err(|e| Error::wrapped(ErrorKind::Config, e.to_string()))
    }
}
