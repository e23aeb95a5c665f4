//! Accept loop bridging gateway streams onto the local proxy.
//!
//! One task runs the loop; each accepted public connection gets its own task
//! that dials the proxied endpoint and relays bytes both ways until either
//! side closes.

use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use loophole_transport::{AcceptError, RemoteListener, RemoteStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Set once the first public connection lands. Read by the signal handler to
/// decide whether the farewell includes a thank-you.
pub static ANY_SUCCESSFUL_CONNECTION: AtomicBool = AtomicBool::new(false);

/// Run the accept loop until the gateway drops the session.
///
/// Per-stream setup failures are logged and do not tear the session down;
/// only `SessionClosed` returns, handing control back for a reconnect.
pub async fn accept_loop(listener: &mut RemoteListener, proxied_endpoint: SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                ANY_SUCCESSFUL_CONNECTION.store(true, Ordering::Relaxed);
                info!("Accepted connection over HTTPS");
                tokio::spawn(handle_stream(stream, proxied_endpoint));
            }
            Err(AcceptError::SessionClosed) => return,
            Err(AcceptError::Stream(reason)) => {
                info!("Failed to accept connection over HTTPS: {}", reason);
            }
        }
    }
}

async fn handle_stream(stream: RemoteStream, proxied_endpoint: SocketAddr) {
    let local = match TcpStream::connect(proxied_endpoint).await {
        Ok(local) => local,
        Err(err) => {
            // The local proxy is gone; there is nothing left to serve.
            eprintln!("Dialing into the local proxy failed: {}", err);
            process::exit(1);
        }
    };
    debug!("Dialing into the local proxy succeeded");

    relay(stream, local).await;
}

/// Bidirectional byte relay between a gateway stream and a local socket.
///
/// Returns as soon as either direction finishes, with both sides closed no
/// later than return. Mid-stream copy errors are debug-level noise, not
/// failures; a half-closed peer still gets its in-flight response.
pub async fn relay(stream: RemoteStream, local: TcpStream) {
    let stream_id = stream.stream_id();
    let (writer, mut reader) = stream.split();
    let (mut local_read, mut local_write) = local.into_split();

    let client_to_local = async {
        while let Some(chunk) = reader.recv().await {
            if let Err(err) = local_write.write_all(&chunk).await {
                debug!("Error copying client -> local: {}", err);
                break;
            }
        }
        let _ = local_write.shutdown().await;
    };

    let local_to_client = async {
        let mut buffer = vec![0u8; 16384];
        loop {
            match local_read.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = writer.send(Bytes::copy_from_slice(&buffer[..n])).await {
                        debug!("Error copying local -> client: {}", err);
                        break;
                    }
                }
                Err(err) => {
                    debug!("Error copying local -> client: {}", err);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = client_to_local => {}
        _ = local_to_client => {}
    }

    if let Err(err) = writer.close().await {
        debug!("Error closing stream {}: {}", stream_id, err);
    }
    debug!("Relay for stream {} finished", stream_id);
}
