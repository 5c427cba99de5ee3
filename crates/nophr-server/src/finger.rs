//! Finger listener (RFC 742/1288).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::handlers::respond_finger;
use crate::SharedState;

const LOG_TARGET: &str = "nophr::finger";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn run(
    state: SharedState,
    listener: TcpListener,
    mut cancel: watch::Receiver<bool>,
) {
    info!(
        target: LOG_TARGET,
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "Finger listening"
    );
    let permits = Arc::new(Semaphore::new(
        state.config.protocols.finger.max_users.max(1),
    ));
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
    info!(target: LOG_TARGET, "Finger listener stopped");
}

async fn handle(state: SharedState, mut stream: TcpStream, peer: SocketAddr) {
    let response = {
        let (read_half, _) = stream.split();
        let cap = state.config.security.validation.max_query_length as u64 + 8;
        let mut reader = BufReader::new(read_half).take(cap);
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await.is_err() {
            return;
        }
        let raw = String::from_utf8_lossy(&line);
        let query = raw.trim_end_matches(['\r', '\n']).to_owned();

        if !state.limits.check("finger", peer.ip()) {
            b"Too many requests, slow down.\r\n".to_vec()
        } else {
            debug!(target: LOG_TARGET, %peer, query = %query, "Request");
            respond_finger(&state, &query).await
        }
    };
    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}
