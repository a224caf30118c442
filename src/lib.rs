//! SNI-aware TCP reverse proxy: multiplexes many NAT-bound peers' TLS
//! services through a public edge server, each peer carried over a single
//! persistent AES-encrypted tunnel, routed by SNI with no TLS termination.
//!
//! See [`server`] for the edge-side accept loops and [`client`] for the
//! peer-side worker that dials in and bridges channels to a local backend.

pub mod channel;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod multiplexer;
pub mod peer;
pub mod peer_manager;
pub mod server;
pub mod sni;

pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, ErrorKind, Result};
