//! End-to-end exercises of the handshake and multiplexer over a real
//! loopback TCP connection: the "one peer, one channel, bytes flow both
//! ways" happy path, and the handshake rejecting an expired token.

use snitun::client;
use snitun::config::{ClientConfig, ServerConfig};
use snitun::crypto::cipher::PeerCrypto;
use snitun::crypto::token::HandshakeToken;
use snitun::multiplexer::Multiplexer;
use snitun::peer_manager::PeerManager;
use snitun::server::handshake;
use snitun::server::listener;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn now_plus(secs: i64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    (now + secs) as u64
}

#[tokio::test]
async fn happy_path_channel_carries_bytes_both_ways() {
    let fernet = fernet::Fernet::new(&fernet::Fernet::generate_key()).unwrap();
    let aes_key = [7u8; 32];
    let aes_iv = [8u8; 16];
    let challenge = [9u8; 32];

    let token = HandshakeToken {
        challenge,
        identity: [1u8; 32],
        valid_until: now_plus(3600),
        hostnames: vec!["example.com".into()],
        aes_key,
        aes_iv,
    };
    let token_str = token.issue(&fernet).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let outcome = handshake::accept(&mut stream, &fernet, Duration::from_secs(5))
            .await
            .unwrap();
        let (read_half, write_half) = stream.into_split();
        Multiplexer::spawn(read_half, write_half, outcome.crypto, 1 << 20, 1 << 17, 1 << 16)
    });

    let mut client_stream = TcpStream::connect(addr).await.unwrap();
    let client_crypto = PeerCrypto::new(aes_key, aes_iv);
    handshake::connect(
        &mut client_stream,
        &token_str,
        &client_crypto,
        &challenge,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let (read_half, write_half) = client_stream.into_split();
    let client_mux = Multiplexer::spawn(read_half, write_half, client_crypto, 1 << 20, 1 << 17, 1 << 16);

    let server_mux = server.await.unwrap();
    let mut server_channel = server_mux.create_channel("example.com").unwrap();

    let mut client_channel = client_mux.wait_for_channel().await.unwrap();
    assert_eq!(client_channel.hostname(), "example.com");

    server_channel.write(b"hello client".to_vec()).await.unwrap();
    let received = client_channel.read().await.unwrap();
    assert_eq!(received, b"hello client");

    client_channel.write(b"hello server".to_vec()).await.unwrap();
    let received = server_channel.read().await.unwrap();
    assert_eq!(received, b"hello server");

    server_channel.close().unwrap();
    assert_eq!(client_channel.read().await, None);
}

#[tokio::test]
async fn expired_token_is_rejected_during_handshake() {
    let fernet = fernet::Fernet::new(&fernet::Fernet::generate_key()).unwrap();
    let aes_key = [1u8; 32];
    let aes_iv = [2u8; 16];
    let challenge = [3u8; 32];

    let token = HandshakeToken {
        challenge,
        identity: [4u8; 32],
        valid_until: now_plus(-10),
        hostnames: vec!["example.com".into()],
        aes_key,
        aes_iv,
    };
    let token_str = token.issue(&fernet).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake::accept(&mut stream, &fernet, Duration::from_secs(5)).await
    });

    let mut client_stream = TcpStream::connect(addr).await.unwrap();
    let crypto = PeerCrypto::new(aes_key, aes_iv);
    // the client side doesn't learn the token is expired until the server
    // drops the connection without echoing a challenge response
    let client_result = handshake::connect(
        &mut client_stream,
        &token_str,
        &crypto,
        &challenge,
        Duration::from_secs(5),
    )
    .await;
    assert!(client_result.is_err());

    let server_result = server.await.unwrap();
    assert_eq!(
        server_result.unwrap_err().kind(),
        snitun::ErrorKind::Authentication
    );
}

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

/// Builds a minimal ClientHello TLS record carrying `hostname` as its
/// `server_name` extension, the same shape `sni::parse_sni` expects.
fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
    let mut server_name_entry = Vec::new();
    server_name_entry.push(SNI_HOST_NAME);
    server_name_entry.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
    server_name_entry.extend_from_slice(hostname.as_bytes());

    let mut server_name_list = Vec::new();
    server_name_list.extend_from_slice(&(server_name_entry.len() as u16).to_be_bytes());
    server_name_list.extend_from_slice(&server_name_entry);

    let mut sni_extension = Vec::new();
    sni_extension.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    sni_extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
    sni_extension.extend_from_slice(&server_name_list);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(sni_extension.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni_extension);

    let mut handshake_msg = Vec::new();
    handshake_msg.push(HANDSHAKE_CLIENT_HELLO);
    let len = body.len();
    handshake_msg.push((len >> 16) as u8);
    handshake_msg.push((len >> 8) as u8);
    handshake_msg.push(len as u8);
    handshake_msg.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(RECORD_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake_msg.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake_msg);
    record
}

/// Stands up both accept loops of a real edge server on loopback, sharing
/// `fernet` so a caller-minted token validates against it.
async fn start_edge_server(
    fernet: Arc<fernet::Fernet>,
) -> (std::net::SocketAddr, std::net::SocketAddr, Arc<PeerManager>) {
    let registry = Arc::new(PeerManager::new());
    let server_config = Arc::new(ServerConfig::default());

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    let public_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let public_addr = public_listener.local_addr().unwrap();

    tokio::spawn(listener::run_tunnel_listener(
        tunnel_listener,
        fernet,
        registry.clone(),
        server_config.clone(),
    ));
    tokio::spawn(listener::run_public_listener(
        public_listener,
        registry.clone(),
        server_config,
    ));

    (tunnel_addr, public_addr, registry)
}

async fn wait_for_peer(registry: &PeerManager, hostname: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if registry.get_by_hostname(hostname).is_some() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("peer for {hostname} never registered");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drives the full stack a real deployment uses: the tunnel and public
/// accept loops, a registered `PeerManager`, a `client::run` worker
/// reconnecting to the edge server, and the public listener's SNI-based
/// routing -- instead of wiring `Multiplexer`/`handshake` together by hand.
#[tokio::test]
async fn full_stack_routes_outside_connection_to_backend_by_sni() {
    let aes_key = [11u8; 32];
    let aes_iv = [12u8; 16];
    let challenge = [13u8; 32];

    // in production this fernet key lives with an external token authority;
    // here the test plays that role directly so it can mint a token the
    // edge server's tunnel listener will accept
    let fernet = Arc::new(fernet::Fernet::new(&fernet::Fernet::generate_key()).unwrap());
    let (tunnel_addr, public_addr, registry) = start_edge_server(fernet.clone()).await;

    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = backend_listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                assert!(n > 0, "backend never saw the forwarded request");
                let _ = sock.write_all(b"HTTP/1.0 200 OK\r\n\r\nhi").await;
            });
        }
    });

    let token = HandshakeToken {
        challenge,
        identity: [21u8; 32],
        valid_until: now_plus(3600),
        hostnames: vec!["example.com".into()],
        aes_key,
        aes_iv,
    };
    let token_str = token.issue(&fernet).unwrap();

    let client_config = ClientConfig {
        server: tunnel_addr,
        local_backend: backend_addr,
        token: token_str,
        aes_key_hex: snitun::crypto::hex::encode(&aes_key),
        aes_iv_hex: snitun::crypto::hex::encode(&aes_iv),
        challenge_hex: snitun::crypto::hex::encode(&challenge),
        ..ClientConfig::default()
    };
    tokio::spawn(client::run(client_config));

    wait_for_peer(&registry, "example.com", Duration::from_secs(5)).await;

    let mut outside = TcpStream::connect(public_addr).await.unwrap();
    let mut request = client_hello_with_sni("example.com");
    request.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
    outside.write_all(&request).await.unwrap();

    let expected: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nhi";
    let mut response = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(5), outside.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.as_slice(), expected);
}

/// An outside connection for a hostname no peer has claimed gets dropped
/// by the public listener instead of hanging or being routed anywhere.
#[tokio::test]
async fn unknown_sni_is_dropped_by_public_listener() {
    let fernet = Arc::new(fernet::Fernet::new(&fernet::Fernet::generate_key()).unwrap());
    let (_tunnel_addr, public_addr, registry) = start_edge_server(fernet).await;

    assert!(registry.get_by_hostname("nope.com").is_none());

    let mut outside = TcpStream::connect(public_addr).await.unwrap();
    outside
        .write_all(&client_hello_with_sni("nope.com"))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), outside.read(&mut buf))
        .await
        .expect("public listener never closed the connection for an unknown hostname");
    assert_eq!(result.unwrap(), 0);
    assert!(registry.get_by_hostname("nope.com").is_none());
}
