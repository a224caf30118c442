//! Tunnel-side handshake (spec.md §4.5): validate the client's token, then
//! prove the server derived the same symmetric key before either side
//! trusts the connection with real traffic.
//!
//! Wire sequence, entirely in the clear (there is no key yet to encrypt
//! with):
//!
//! ```text
//! client -> server: token_len: u16, token: utf8 bytes
//! server -> client: challenge_response: [u8; 32]   (challenge encrypted
//!                                                    with the derived key)
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fernet::Fernet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::crypto::cipher::PeerCrypto;
use crate::crypto::token::HandshakeToken;
use crate::error::{Error, ErrorKind, Result, ResultSimpleExt};
use std::time::Duration;

/// The result of a successful server-side handshake: everything needed to
/// stand up this peer's [`crate::multiplexer::Multiplexer`].
pub struct HandshakeOutcome {
    pub identity: [u8; 32],
    pub hostnames: Vec<String>,
    pub crypto: PeerCrypto,
    pub valid_until: u64,
}

const MAX_TOKEN_LEN: usize = 8 * 1024;

/// Runs the server side of the handshake over an already-accepted stream,
/// bounded by `timeout_duration`.
pub async fn accept<S>(
    stream: &mut S,
    fernet: &Fernet,
    timeout_duration: Duration,
) -> Result<HandshakeOutcome>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    timeout(timeout_duration, accept_inner(stream, fernet))
        .await
        .map_err(|_| Error::simple(ErrorKind::Timeout))?
}

async fn accept_inner<S>(stream: &mut S, fernet: &Fernet) -> Result<HandshakeOutcome>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let token_len = stream.read_u16().await.simple(ErrorKind::Authentication)? as usize;
    if token_len > MAX_TOKEN_LEN {
        return Err(Error::simple(ErrorKind::Authentication));
    }
    let mut token_buf = vec![0u8; token_len];
    stream
        .read_exact(&mut token_buf)
        .await
        .simple(ErrorKind::Authentication)?;
    let token_str = String::from_utf8(token_buf).simple(ErrorKind::Authentication)?;

    let decoded = HandshakeToken::validate(&token_str, fernet)?;
    let crypto = PeerCrypto::new(decoded.aes_key, decoded.aes_iv);

    let response = crypto.encrypt_no_pad(&decoded.challenge);
    stream
        .write_all(&response)
        .await
        .simple(ErrorKind::Transport)?;
    stream.flush().await.simple(ErrorKind::Transport)?;

    Ok(HandshakeOutcome {
        identity: decoded.identity,
        hostnames: decoded.hostnames,
        crypto,
        valid_until: decoded.valid_until,
    })
}

/// Runs the client side of the handshake: send the token, then verify the
/// server echoed the challenge back correctly encrypted with our key.
pub async fn connect<S>(
    stream: &mut S,
    token: &str,
    crypto: &PeerCrypto,
    challenge: &[u8; 32],
    timeout_duration: Duration,
) -> Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    timeout(
        timeout_duration,
        connect_inner(stream, token, crypto, challenge),
    )
    .await
    .map_err(|_| Error::simple(ErrorKind::Timeout))?
}

async fn connect_inner<S>(
    stream: &mut S,
    token: &str,
    crypto: &PeerCrypto,
    challenge: &[u8; 32],
) -> Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut out = Vec::with_capacity(2 + token.len());
    out.write_u16::<BigEndian>(token.len() as u16)
        .expect("writing to a Vec never fails");
    out.extend_from_slice(token.as_bytes());
    stream.write_all(&out).await.simple(ErrorKind::Transport)?;
    stream.flush().await.simple(ErrorKind::Transport)?;

    let mut response = [0u8; 32];
    stream
        .read_exact(&mut response)
        .await
        .simple(ErrorKind::Authentication)?;
    let echoed = crypto.decrypt_no_pad(&response)?;
    if echoed.as_slice() != challenge.as_slice() {
        return Err(Error::simple(ErrorKind::Authentication));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now_plus(secs: u64) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + secs
    }

    #[tokio::test]
    async fn full_handshake_roundtrip() {
        let fernet = Fernet::new(&Fernet::generate_key()).unwrap();
        let token = HandshakeToken {
            challenge: [9u8; 32],
            identity: [1u8; 32],
            valid_until: now_plus(3600),
            hostnames: vec!["example.com".into()],
            aes_key: [2u8; 32],
            aes_iv: [3u8; 16],
        };
        let token_str = token.issue(&fernet).unwrap();
        let crypto = PeerCrypto::new([2u8; 32], [3u8; 16]);

        let (mut client_side, mut server_side) = tokio::io::duplex(8192);

        let server = tokio::spawn(async move {
            accept(&mut server_side, &fernet, Duration::from_secs(5)).await
        });
        connect(
            &mut client_side,
            &token_str,
            &crypto,
            &[9u8; 32],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let outcome = server.await.unwrap().unwrap();
        assert_eq!(outcome.identity, [1u8; 32]);
        assert_eq!(outcome.hostnames, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn rejects_garbage_token() {
        let fernet = Fernet::new(&Fernet::generate_key()).unwrap();
        let (mut client_side, mut server_side) = tokio::io::duplex(8192);

        let server = tokio::spawn(async move {
            accept(&mut server_side, &fernet, Duration::from_secs(5)).await
        });

        let mut out = Vec::new();
        out.write_u16::<BigEndian>(5).unwrap();
        out.extend_from_slice(b"nope!");
        client_side.write_all(&out).await.unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
