//! Protocol servers: Gopher, Gemini and Finger over the same selector
//! algebra, response cache and storage queries.

mod content;
mod diagnostics;
mod finger;
mod gemini;
mod gopher;
pub mod handlers;
mod ratelimit;
pub mod router;
pub mod tls;

use std::sync::Arc;

use snafu::{ResultExt as _, Snafu};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use nophr_config::Config;
use nophr_node::Node;

pub use crate::content::EventView;
pub use crate::ratelimit::RateLimits;
pub use crate::tls::TlsError;

const LOG_TARGET: &str = "nophr::server";

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("Cannot bind {addr}: {source}"))]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[snafu(transparent)]
    Tls { source: TlsError },
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

pub struct AppState {
    pub node: Arc<Node>,
    pub config: Arc<Config>,
    pub limits: RateLimits,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(node: Arc<Node>, config: Arc<Config>) -> SharedState {
        let limits = RateLimits::from_config(&config.security.ratelimit);
        Arc::new(AppState {
            node,
            config,
            limits,
        })
    }
}

/// Bind every enabled protocol and spawn its accept loop.
///
/// Bind and TLS failures are fatal here, before any traffic is served.
pub async fn spawn_listeners(
    state: SharedState,
    cancel: watch::Receiver<bool>,
) -> ServerResult<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    if state.config.protocols.gopher.enabled {
        let gopher_cfg = &state.config.protocols.gopher;
        let addr = format!("{}:{}", gopher_cfg.bind, gopher_cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .context(BindSnafu { addr: addr.clone() })?;
        tasks.push(tokio::spawn(gopher::run(
            state.clone(),
            listener,
            cancel.clone(),
        )));
    }

    if state.config.protocols.gemini.enabled {
        let gemini_cfg = &state.config.protocols.gemini;
        let acceptor = tls::build_acceptor(&gemini_cfg.tls, &gemini_cfg.host)?;
        let addr = format!("{}:{}", gemini_cfg.bind, gemini_cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .context(BindSnafu { addr: addr.clone() })?;
        tasks.push(tokio::spawn(gemini::run(
            state.clone(),
            listener,
            acceptor,
            cancel.clone(),
        )));
    }

    if state.config.protocols.finger.enabled {
        let finger_cfg = &state.config.protocols.finger;
        let addr = format!("{}:{}", finger_cfg.bind, finger_cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .context(BindSnafu { addr: addr.clone() })?;
        tasks.push(tokio::spawn(finger::run(state.clone(), listener, cancel)));
    }

    info!(target: LOG_TARGET, listeners = tasks.len(), "Protocol listeners up");
    Ok(tasks)
}

#[cfg(test)]
mod tests;
