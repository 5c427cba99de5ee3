//! Gopher listener (RFC 1436).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::handlers::respond_gopher;
use crate::SharedState;

const LOG_TARGET: &str = "nophr::gopher";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: usize = 128;

pub async fn run(
    state: SharedState,
    listener: TcpListener,
    mut cancel: watch::Receiver<bool>,
) {
    info!(
        target: LOG_TARGET,
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "Gopher listening"
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
                    tokio::spawn(async move {
                        let _permit = permit;
                        if tokio::time::timeout(
                            CONNECTION_TIMEOUT,
                            handle(state, stream, peer),
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
    info!(target: LOG_TARGET, "Gopher listener stopped");
}

async fn handle(state: SharedState, mut stream: TcpStream, peer: SocketAddr) {
    let response = {
        let (read_half, _) = stream.split();
        let cap = state.config.security.validation.max_selector_length as u64 + 8;
        let mut reader = BufReader::new(read_half).take(cap);
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await.is_err() {
            return;
        }
        let raw = String::from_utf8_lossy(&line);
        let selector = raw.trim_end_matches(['\r', '\n']);
        // Gopher+ suffixes after a tab are ignored.
        let selector = selector.split('\t').next().unwrap_or("").to_owned();

        if !state.limits.check("gopher", peer.ip()) {
            let mut map = crate::handlers::slow_down_map(&state);
            map.finish().into_bytes()
        } else {
            debug!(target: LOG_TARGET, %peer, selector = %selector, "Request");
            respond_gopher(&state, &selector).await
        }
    };
    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}
