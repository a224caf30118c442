//! The two accept loops an edge server runs: the tunnel-facing listener
//! peers dial in on, and the public listener regular TLS clients connect to
//! (spec.md §2/§4).

use fernet::Fernet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::multiplexer::Multiplexer;
use crate::peer::Peer;
use crate::peer_manager::PeerManager;
use crate::server::handshake;
use crate::sni::parse_sni;

const DEFAULT_THROTTLE_RATE: u32 = 64 * 1024 * 1024;
const DEFAULT_THROTTLE_BURST: u32 = 16 * 1024 * 1024;
const THROTTLE_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Accepts peer tunnel connections forever, handshaking and registering
/// each one. Never returns unless the listener itself fails.
pub async fn run_tunnel_listener(
    listener: TcpListener,
    fernet: Arc<Fernet>,
    registry: Arc<PeerManager>,
    config: Arc<ServerConfig>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "tunnel listener accept failed");
                continue;
            }
        };
        debug!(%addr, "tunnel connection accepted");

        let fernet = fernet.clone();
        let registry = registry.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tunnel_connection(stream, &fernet, &registry, &config).await {
                warn!(%addr, error = %e, "tunnel handshake failed");
            }
        });
    }
}

async fn handle_tunnel_connection(
    mut stream: TcpStream,
    fernet: &Fernet,
    registry: &PeerManager,
    config: &ServerConfig,
) -> crate::error::Result<()> {
    let outcome = handshake::accept(&mut stream, fernet, config.handshake_timeout()).await?;

    let (read_half, write_half) = stream.into_split();
    let multiplexer = Multiplexer::spawn(
        read_half,
        write_half,
        outcome.crypto,
        config.high_water_mark,
        config.low_water_mark,
        config.channel_write_cap,
    );

    let peer = Arc::new(Peer::new(
        outcome.identity,
        outcome.hostnames,
        multiplexer,
        outcome.valid_until,
        DEFAULT_THROTTLE_RATE,
        DEFAULT_THROTTLE_BURST,
    ));
    info!(hostnames = ?peer.hostnames(), "peer registered");
    registry.register(peer);
    Ok(())
}

/// Accepts public TLS connections forever, routing each by SNI to the
/// peer that claimed that hostname.
pub async fn run_public_listener(
    listener: TcpListener,
    registry: Arc<PeerManager>,
    config: Arc<ServerConfig>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "public listener accept failed");
                continue;
            }
        };

        let registry = registry.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_public_connection(stream, &registry, &config).await {
                debug!(%addr, error = %e, "public connection dropped");
            }
        });
    }
}

async fn handle_public_connection(
    stream: TcpStream,
    registry: &PeerManager,
    config: &ServerConfig,
) -> crate::error::Result<()> {
    let sni = peek_sni(&stream, config.sni_read_timeout()).await?;
    let peer = registry
        .get_by_hostname(&sni)
        .ok_or_else(|| crate::error::Error::simple(crate::error::ErrorKind::Protocol))?;
    peer.touch();

    let channel = peer.multiplexer().create_channel(sni)?;
    bridge(stream, channel, peer, config.channel_write_cap).await
}

async fn peek_sni(
    stream: &TcpStream,
    timeout: std::time::Duration,
) -> crate::error::Result<String> {
    use crate::error::{Error, ErrorKind};

    let mut buf = vec![0u8; 512];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let n = tokio::time::timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| Error::simple(ErrorKind::Timeout))?
            .map_err(Error::from)?;

        if let Ok(sni) = parse_sni(&buf[..n]) {
            return Ok(sni);
        }
        if n < buf.len() {
            // no more bytes available yet; give the client a moment to
            // finish sending the ClientHello
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            continue;
        }
        if buf.len() >= 16 * 1024 {
            return Err(Error::simple(ErrorKind::SniParse));
        }
        buf.resize(buf.len() * 2, 0);
    }
}

async fn bridge(
    stream: TcpStream,
    channel: crate::channel::Channel,
    peer: Arc<Peer>,
    write_cap: usize,
) -> crate::error::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut sock_read, mut sock_write) = stream.into_split();
    let (mut chan_reader, chan_writer) = channel.split();

    let socket_to_channel = async move {
        let mut buf = vec![0u8; write_cap];
        loop {
            let n = match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            while !peer.try_acquire(n as u32) {
                trace!(hostnames = ?peer.hostnames(), bytes = n, "peer throttled");
                tokio::time::sleep(THROTTLE_RETRY_INTERVAL).await;
            }
            if chan_writer.write(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
        let _ = chan_writer.close();
    };

    let channel_to_socket = async move {
        while let Some(data) = chan_reader.read().await {
            if sock_write.write_all(&data).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(socket_to_channel, channel_to_socket);
    Ok(())
}
