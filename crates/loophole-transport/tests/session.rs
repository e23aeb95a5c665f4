//! Session tests against an in-process fake gateway.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use loophole_proto::{GatewayCodec, GatewayMessage};
use loophole_transport::{dial_with_retry, AcceptError, Credential, GatewaySession, SessionError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

fn test_tls_acceptor() -> TlsAcceptor {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let certs = vec![cert.der().clone()];
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();

    TlsAcceptor::from(Arc::new(config))
}

async fn read_message<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> GatewayMessage {
    loop {
        if let Some(msg) = GatewayCodec::decode(buf).unwrap() {
            return msg;
        }
        let n = stream.read_buf(buf).await.unwrap();
        assert!(n > 0, "peer closed mid-message");
    }
}

async fn send_message<S: AsyncWrite + Unpin>(stream: &mut S, msg: &GatewayMessage) {
    stream
        .write_all(&GatewayCodec::encode(msg).unwrap())
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn handshake_listener_and_stream_relay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = test_tls_acceptor();

    let gateway = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let mut buf = BytesMut::new();

        // Authentication handshake: verify the nonce signature against the
        // public key the client published.
        let public_key = match read_message(&mut tls, &mut buf).await {
            GatewayMessage::Hello {
                site_id,
                public_key,
            } => {
                assert_eq!(site_id, "abc123");
                public_key
            }
            other => panic!("expected Hello, got {:?}", other),
        };

        let nonce = b"test-nonce-0123456789".to_vec();
        send_message(&mut tls, &GatewayMessage::Challenge { nonce: nonce.clone() }).await;

        let signature = match read_message(&mut tls, &mut buf).await {
            GatewayMessage::Authenticate { signature } => signature,
            other => panic!("expected Authenticate, got {:?}", other),
        };

        let key_bytes: [u8; 32] = BASE64.decode(&public_key).unwrap().try_into().unwrap();
        let verifying = VerifyingKey::from_bytes(&key_bytes).unwrap();
        verifying
            .verify_strict(&nonce, &Signature::from_slice(&signature).unwrap())
            .unwrap();

        send_message(&mut tls, &GatewayMessage::Welcome).await;

        match read_message(&mut tls, &mut buf).await {
            GatewayMessage::ListenRequest { bind_addr } => assert_eq!(bind_addr, "127.0.0.1:80"),
            other => panic!("expected ListenRequest, got {:?}", other),
        }
        send_message(&mut tls, &GatewayMessage::ListenOk).await;

        // Relay a public connection: open stream 1, push a request, expect
        // the response, then close the stream and the transport.
        send_message(&mut tls, &GatewayMessage::StreamOpen { stream_id: 1 }).await;
        send_message(
            &mut tls,
            &GatewayMessage::StreamData {
                stream_id: 1,
                data: b"ping".to_vec(),
            },
        )
        .await;

        match read_message(&mut tls, &mut buf).await {
            GatewayMessage::StreamData { stream_id, data } => {
                assert_eq!(stream_id, 1);
                assert_eq!(data, b"pong");
            }
            other => panic!("expected StreamData, got {:?}", other),
        }

        send_message(&mut tls, &GatewayMessage::StreamClose { stream_id: 1 }).await;
        tls.shutdown().await.ok();
    });

    let credential = Credential::new(SigningKey::generate(&mut rand::rngs::OsRng));
    let mut session = GatewaySession::dial(&addr.to_string(), "abc123", &credential)
        .await
        .unwrap();
    let mut remote = session.open_remote_listener("127.0.0.1:80").await.unwrap();

    let mut stream = remote.accept().await.unwrap();
    assert_eq!(stream.stream_id(), 1);

    let data = stream.recv().await.unwrap();
    assert_eq!(&data[..], b"ping");

    stream.send(Bytes::from_static(b"pong")).await.unwrap();

    // Gateway closes the stream, then the transport.
    assert!(stream.recv().await.is_none());
    match remote.accept().await {
        Err(AcceptError::SessionClosed) => {}
        other => panic!("expected SessionClosed, got {:?}", other.map(|s| s.stream_id())),
    }

    session.close().await;
    gateway.await.unwrap();
}

#[tokio::test]
async fn denied_authentication_fails_the_dial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = test_tls_acceptor();

    let gateway = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let mut buf = BytesMut::new();

        match read_message(&mut tls, &mut buf).await {
            GatewayMessage::Hello { .. } => {}
            other => panic!("expected Hello, got {:?}", other),
        }
        send_message(
            &mut tls,
            &GatewayMessage::Denied {
                reason: "unknown site".to_string(),
            },
        )
        .await;
        tls.shutdown().await.ok();
    });

    let credential = Credential::new(SigningKey::generate(&mut rand::rngs::OsRng));
    let result = GatewaySession::dial(&addr.to_string(), "abc123", &credential).await;

    match result {
        Err(SessionError::Denied(reason)) => assert_eq!(reason, "unknown site"),
        Err(other) => panic!("expected Denied, got {:?}", other),
        Ok(_) => panic!("dial unexpectedly succeeded"),
    }

    gateway.await.unwrap();
}

#[tokio::test]
async fn dial_retries_are_bounded() {
    // Bind and immediately drop to get an address nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let credential = Credential::new(SigningKey::generate(&mut rand::rngs::OsRng));
    let started = std::time::Instant::now();
    let result = dial_with_retry(
        &addr.to_string(),
        "abc123",
        &credential,
        3,
        Duration::from_millis(10),
    )
    .await;

    assert!(result.is_err());
    // Two sleeps between three attempts; well under a second in total.
    assert!(started.elapsed() < Duration::from_secs(5));
}
