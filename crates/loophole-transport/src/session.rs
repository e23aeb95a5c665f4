//! Gateway session: dial, authenticate, open the remote listener, and route
//! logical streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use loophole_proto::{CodecError, GatewayCodec, GatewayMessage, StreamId};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::tls;

/// Bounded dial retries: the process fails loudly instead of hanging.
pub const DIAL_ATTEMPTS: usize = 5;
pub const DIAL_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid gateway address: {0}")]
    InvalidAddress(String),

    #[error("Gateway rejected authentication: {0}")]
    Denied(String),

    #[error("Gateway rejected the remote listener: {0}")]
    ListenRejected(String),

    #[error("Unexpected message from gateway: {0}")]
    Protocol(String),

    #[error("Gateway closed the connection")]
    Closed,
}

/// Errors surfaced by [`RemoteListener::accept`].
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The gateway closed the underlying transport; the caller must rebuild
    /// the session.
    #[error("gateway closed the session")]
    SessionClosed,

    /// A single stream could not be set up; the session itself is fine.
    #[error("stream setup failed: {0}")]
    Stream(String),
}

/// State shared between the session handle, its streams, and the reader task.
struct Shared {
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    streams: RwLock<HashMap<StreamId, mpsc::UnboundedSender<Bytes>>>,
}

impl Shared {
    async fn send(&self, msg: &GatewayMessage) -> Result<(), SessionError> {
        let encoded = GatewayCodec::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// An authenticated encrypted session to the gateway.
///
/// Owns the TLS transport. Dropping the session without calling
/// [`GatewaySession::close`] leaves teardown to the runtime.
pub struct GatewaySession {
    shared: Arc<Shared>,
    /// Read side, held here until the remote listener takes it over.
    read: Option<(ReadHalf<TlsStream<TcpStream>>, BytesMut)>,
    reader_task: Option<JoinHandle<()>>,
}

impl GatewaySession {
    /// Dial the gateway and run the authentication handshake.
    ///
    /// The session user name is the site identifier; ownership is proven by
    /// signing the gateway's challenge nonce with the identity key.
    pub async fn dial(
        gateway_addr: &str,
        site_id: &str,
        credential: &Credential,
    ) -> Result<Self, SessionError> {
        debug!("Dialing gateway at {}", gateway_addr);

        let tcp = TcpStream::connect(gateway_addr).await?;

        let host = gateway_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(gateway_addr);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| SessionError::InvalidAddress(gateway_addr.to_string()))?;

        let connector = TlsConnector::from(Arc::new(tls::gateway_client_config()?));
        let mut stream = connector.connect(server_name, tcp).await?;

        let mut buf = BytesMut::with_capacity(8 * 1024);

        let hello = GatewayMessage::Hello {
            site_id: site_id.to_string(),
            public_key: credential.public_key().to_string(),
        };
        stream.write_all(&GatewayCodec::encode(&hello)?).await?;
        stream.flush().await?;

        let nonce = match read_message(&mut stream, &mut buf).await? {
            GatewayMessage::Challenge { nonce } => nonce,
            GatewayMessage::Denied { reason } => return Err(SessionError::Denied(reason)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "expected Challenge, got {:?}",
                    other
                )))
            }
        };

        let authenticate = GatewayMessage::Authenticate {
            signature: credential.sign(&nonce),
        };
        stream.write_all(&GatewayCodec::encode(&authenticate)?).await?;
        stream.flush().await?;

        match read_message(&mut stream, &mut buf).await? {
            GatewayMessage::Welcome => {}
            GatewayMessage::Denied { reason } => return Err(SessionError::Denied(reason)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "expected Welcome, got {:?}",
                    other
                )))
            }
        }

        debug!("Gateway session established for site {}", site_id);

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(write_half),
                streams: RwLock::new(HashMap::new()),
            }),
            read: Some((read_half, buf)),
            reader_task: None,
        })
    }

    /// Ask the gateway to accept public connections on its side.
    ///
    /// `bind_addr` names a gateway-side address; the gateway maps public
    /// hostname traffic onto this logical listener. Takes over the read side
    /// of the transport, so it can be called once per session.
    pub async fn open_remote_listener(
        &mut self,
        bind_addr: &str,
    ) -> Result<RemoteListener, SessionError> {
        let (mut read, mut buf) = self
            .read
            .take()
            .ok_or_else(|| SessionError::Protocol("remote listener already open".into()))?;

        self.shared
            .send(&GatewayMessage::ListenRequest {
                bind_addr: bind_addr.to_string(),
            })
            .await?;

        match read_message(&mut read, &mut buf).await? {
            GatewayMessage::ListenOk => {}
            GatewayMessage::ListenError { reason } => {
                return Err(SessionError::ListenRejected(reason))
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "expected ListenOk, got {:?}",
                    other
                )))
            }
        }

        debug!("Remote listener open on gateway side {}", bind_addr);

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        self.reader_task = Some(tokio::spawn(read_loop(read, buf, shared, accept_tx)));

        Ok(RemoteListener { events: accept_rx })
    }

    /// Close the transport. Must be called before a replacement session is
    /// dialed so the gateway sees the old one go away.
    pub async fn close(&self) {
        if let Some(task) = &self.reader_task {
            task.abort();
        }
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!("Gateway session closed");
    }
}

/// Accept side of the remote listener.
pub struct RemoteListener {
    events: mpsc::UnboundedReceiver<Result<RemoteStream, String>>,
}

impl RemoteListener {
    /// Wait for the next public connection relayed by the gateway.
    pub async fn accept(&mut self) -> Result<RemoteStream, AcceptError> {
        match self.events.recv().await {
            Some(Ok(stream)) => Ok(stream),
            Some(Err(reason)) => Err(AcceptError::Stream(reason)),
            None => Err(AcceptError::SessionClosed),
        }
    }
}

/// One logical stream: a public connection relayed through the session.
pub struct RemoteStream {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

impl RemoteStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Next chunk from the public client; `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send bytes back toward the public client.
    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        self.shared
            .send(&GatewayMessage::StreamData {
                stream_id: self.stream_id,
                data: data.to_vec(),
            })
            .await
    }

    /// Tell the gateway this stream is done.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.rx.close();
        self.shared.streams.write().await.remove(&self.stream_id);
        self.shared
            .send(&GatewayMessage::StreamClose {
                stream_id: self.stream_id,
            })
            .await
    }

    /// Split into independently usable write and read halves.
    pub fn split(self) -> (RemoteStreamWriter, RemoteStreamReader) {
        (
            RemoteStreamWriter {
                stream_id: self.stream_id,
                shared: self.shared,
            },
            RemoteStreamReader { rx: self.rx },
        )
    }
}

/// Read half of a logical stream.
pub struct RemoteStreamReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl RemoteStreamReader {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Write half of a logical stream.
pub struct RemoteStreamWriter {
    stream_id: StreamId,
    shared: Arc<Shared>,
}

impl RemoteStreamWriter {
    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        self.shared
            .send(&GatewayMessage::StreamData {
                stream_id: self.stream_id,
                data: data.to_vec(),
            })
            .await
    }

    /// Tell the gateway this stream is done.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.shared.streams.write().await.remove(&self.stream_id);
        self.shared
            .send(&GatewayMessage::StreamClose {
                stream_id: self.stream_id,
            })
            .await
    }
}

/// Dial with the bounded retry contract: `attempts` tries, `delay` apart.
///
/// Authentication rejections are surfaced immediately; waiting out the
/// retry budget cannot fix them.
pub async fn dial_with_retry(
    gateway_addr: &str,
    site_id: &str,
    credential: &Credential,
    attempts: usize,
    delay: Duration,
) -> Result<GatewaySession, SessionError> {
    let mut last_err = SessionError::Closed;

    for attempt in 1..=attempts {
        match GatewaySession::dial(gateway_addr, site_id, credential).await {
            Ok(session) => return Ok(session),
            Err(err @ SessionError::Denied(_)) => return Err(err),
            Err(err) => {
                info!(
                    "Connection to the gateway failed, retrying in {} seconds... (Attempt {}/{})",
                    delay.as_secs(),
                    attempt,
                    attempts
                );
                last_err = err;
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_err)
}

/// Read one complete message, buffering as needed.
async fn read_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<GatewayMessage, SessionError> {
    loop {
        if let Some(msg) = GatewayCodec::decode(buf)? {
            return Ok(msg);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(SessionError::Closed);
        }
    }
}

/// Reader task: decodes frames off the transport and routes them.
///
/// Ends on EOF or a corrupt frame; dropping `accept_tx` is what turns the
/// listener's `accept` into `SessionClosed`, and clearing the stream map is
/// what turns in-flight `recv` calls into end-of-stream.
async fn read_loop(
    mut read: ReadHalf<TlsStream<TcpStream>>,
    mut buf: BytesMut,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<Result<RemoteStream, String>>,
) {
    loop {
        let msg = match GatewayCodec::decode(&mut buf) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                match read.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!("Gateway transport reached EOF");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        debug!("Gateway transport read failed: {}", err);
                        break;
                    }
                }
            }
            Err(err) => {
                warn!("Corrupt frame from gateway: {}", err);
                break;
            }
        };

        match msg {
            GatewayMessage::StreamOpen { stream_id } => {
                let mut streams = shared.streams.write().await;
                if streams.contains_key(&stream_id) {
                    drop(streams);
                    let _ = accept_tx.send(Err(format!(
                        "gateway reopened active stream {}",
                        stream_id
                    )));
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                streams.insert(stream_id, tx);
                drop(streams);

                debug!("Accepted stream {} from gateway", stream_id);
                let handed_off = accept_tx.send(Ok(RemoteStream {
                    stream_id,
                    rx,
                    shared: shared.clone(),
                }));
                if handed_off.is_err() {
                    shared.streams.write().await.remove(&stream_id);
                }
            }
            GatewayMessage::StreamData { stream_id, data } => {
                let streams = shared.streams.read().await;
                match streams.get(&stream_id) {
                    Some(tx) => {
                        if tx.send(Bytes::from(data)).is_err() {
                            debug!("Stream {} receiver gone, dropping data", stream_id);
                        }
                    }
                    None => warn!("Data for unknown stream {}", stream_id),
                }
            }
            GatewayMessage::StreamClose { stream_id } => {
                shared.streams.write().await.remove(&stream_id);
                debug!("Stream {} closed by gateway", stream_id);
            }
            GatewayMessage::Ping { timestamp } => {
                if shared.send(&GatewayMessage::Pong { timestamp }).await.is_err() {
                    break;
                }
            }
            other => {
                warn!("Unexpected message from gateway: {:?}", other);
            }
        }
    }

    shared.streams.write().await.clear();
}
