//! Gemini listener: TLS, one request line per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use nophr_render::gemtext::{response, Status};

use crate::handlers::respond_gemini;
use crate::SharedState;

const LOG_TARGET: &str = "nophr::gemini";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: usize = 128;

/// Gemini caps request lines at 1024 bytes plus CRLF.
const MAX_REQUEST_LINE: u64 = 1_026;

pub async fn run(
    state: SharedState,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    mut cancel: watch::Receiver<bool>,
) {
    info!(
        target: LOG_TARGET,
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "Gemini listening"
    );
    let permits = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        continue;
                    };
                    let state = state.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if tokio::time::timeout(
                            CONNECTION_TIMEOUT,
                            handle(state, acceptor, stream, peer),
                        )
                        .await
                        .is_err()
                        {
                            debug!(target: LOG_TARGET, %peer, "Connection timed out");
                        }
                    });
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, %err, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
        }
    }
    info!(target: LOG_TARGET, "Gemini listener stopped");
}

async fn handle(
    state: SharedState,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(err) => {
            debug!(target: LOG_TARGET, %peer, %err, "TLS handshake failed");
            return;
        }
    };
    let (read_half, mut write_half) = tokio::io::split(tls_stream);

    let mut reader = BufReader::new(read_half).take(MAX_REQUEST_LINE);
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await.is_err() {
        return;
    }
    let raw = String::from_utf8_lossy(&line);
    let request = raw.trim_end_matches(['\r', '\n']);
    debug!(target: LOG_TARGET, %peer, request = %request, "Request");

    let bytes = if !state.limits.check("gemini", peer.ip()) {
        response(Status::SlowDown, "rate limit exceeded, slow down", None)
    } else {
        match url::Url::parse(request) {
            Ok(parsed) if parsed.scheme() == "gemini" => {
                respond_gemini(&state, parsed.path(), parsed.query()).await
            }
            _ => response(Status::BadRequest, "expected an absolute gemini URL", None),
        }
    };

    let _ = write_half.write_all(&bytes).await;
    let _ = write_half.shutdown().await;
}
