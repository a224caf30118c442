//! The tunnel client worker: holds one persistent connection to the edge
//! server, bridging every channel the server opens to the local backend
//! (spec.md §2, the "client side" of the tunnel).

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::crypto::cipher::PeerCrypto;
use crate::error::Result;
use crate::multiplexer::Multiplexer;
use crate::server::handshake;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the client worker until cancelled, reconnecting with exponential
/// backoff whenever the tunnel connection is lost.
pub async fn run(config: ClientConfig) -> Result<()> {
    config.validate()?;

    let mut backoff = config.backoff_initial();
    loop {
        match run_once(&config).await {
            Ok(()) => {
                backoff = config.backoff_initial();
            }
            Err(e) => {
                warn!(error = %e, backoff = ?backoff, "tunnel connection lost, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.backoff_max());
            }
        }
    }
}

async fn run_once(config: &ClientConfig) -> Result<()> {
    let crypto = PeerCrypto::new(config.aes_key()?, config.aes_iv()?);
    let challenge = config.challenge()?;

    let mut stream = TcpStream::connect(config.server)
        .await
        .map_err(crate::error::Error::from)?;
    handshake::connect(&mut stream, &config.token, &crypto, &challenge, HANDSHAKE_TIMEOUT).await?;
    info!(server = %config.server, "tunnel established");

    let (read_half, write_half) = stream.into_split();
    let multiplexer = Multiplexer::spawn(
        read_half,
        write_half,
        crypto,
        2 * 1024 * 1024,
        204_800,
        config.channel_write_cap,
    );

    let mut keepalive = tokio::time::interval(config.keepalive());
    keepalive.tick().await; // the first tick fires immediately; skip it

    loop {
        tokio::select! {
            channel = multiplexer.wait_for_channel() => {
                match channel {
                    Some(channel) => {
                        let local_backend = config.local_backend;
                        tokio::spawn(async move {
                            if let Err(e) = bridge_to_backend(channel, local_backend).await {
                                debug!(error = %e, "channel bridge ended");
                            }
                        });
                    }
                    None => return Err(crate::error::Error::simple(crate::error::ErrorKind::Transport)),
                }
            }
            _ = keepalive.tick() => {
                // a missed PONG means the connection is half-open: the
                // socket looks alive but the peer has stopped answering.
                // Surfacing this as an error drives `run`'s reconnect loop.
                multiplexer.ping(config.ping_timeout()).await?;
            }
        }
    }
}

async fn bridge_to_backend(
    channel: Channel,
    local_backend: std::net::SocketAddr,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let backend = TcpStream::connect(local_backend)
        .await
        .map_err(crate::error::Error::from)?;
    let (mut backend_read, mut backend_write) = backend.into_split();
    let (mut chan_reader, chan_writer) = channel.split();

    let backend_to_channel = async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match backend_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if chan_writer.write(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
        let _ = chan_writer.close();
    };

    let channel_to_backend = async move {
        while let Some(data) = chan_reader.read().await {
            if backend_write.write_all(&data).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(backend_to_channel, channel_to_backend);
    Ok(())
}
