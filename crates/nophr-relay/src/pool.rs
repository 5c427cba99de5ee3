//! Relay connection pool.
//!
//! One task per relay owns the WebSocket and its reconnect loop. The
//! pool hands out per-subscription bounded queues; subscriptions
//! survive reconnects (the connection task re-issues REQ frames for
//! every registered subscription after each connect).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use nophr_core::EventFilter;

use crate::message::{close_message, parse_relay_message, req_message, RelayMessage};
use crate::queue::BoundedQueue;

const LOG_TARGET: &str = "nophr::pool";

/// Forced re-subscribe after this long without any relay traffic.
const QUIESCENCE_WINDOW: Duration = Duration::from_secs(180);

#[derive(Debug, Snafu)]
pub enum PoolError {
    #[snafu(display("Relay {relay} already at max_concurrent_subs ({max})"))]
    TooManySubscriptions { relay: String, max: usize },
    #[snafu(display("Subscription id {sub_id} already active on {relay}"))]
    DuplicateSubscription { relay: String, sub_id: String },
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub connect_timeout: Duration,
    /// Discrete reconnect delays; the last entry is the plateau.
    pub backoff: Vec<Duration>,
    pub max_concurrent_subs: usize,
    pub queue_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff: vec![
                Duration::from_millis(500),
                Duration::from_millis(1_500),
                Duration::from_millis(5_000),
            ],
            max_concurrent_subs: 20,
            queue_capacity: 1_024,
        }
    }
}

/// Connection lifecycle per spec: Subscribing and Idle are both
/// "connected", split by whether any subscription is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Idle,
    Subscribing,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::Disconnected => "disconnected",
            RelayState::Connecting => "connecting",
            RelayState::Idle => "idle",
            RelayState::Subscribing => "subscribing",
        }
    }
}

/// Something a subscription stream delivers.
#[derive(Debug)]
pub enum SubEvent {
    Event(Box<nostr::Event>),
    /// End of stored events marker.
    Eose,
    /// Terminal status from the relay; the subscription is gone.
    Closed(String),
}

/// Consumer handle for one subscription's event stream.
pub struct Subscription {
    pub relay: String,
    pub id: String,
    queue: Arc<BoundedQueue<SubEvent>>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<SubEvent> {
        self.queue.pop().await
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

struct SubEntry {
    filters: Vec<EventFilter>,
    queue: Arc<BoundedQueue<SubEvent>>,
}

enum RelayCmd {
    Sync,
    Unsubscribe(String),
    Close,
}

#[derive(Default)]
pub struct RelayStatusShared {
    state: Mutex<Option<RelayState>>,
    pub reconnects: AtomicU64,
    pub events_received: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RelayStatusShared {
    fn set_state(&self, state: RelayState) {
        *self.state.lock().expect("Locking failed") = Some(state);
    }

    fn set_error(&self, error: String) {
        *self.last_error.lock().expect("Locking failed") = Some(error);
    }

    pub fn state(&self) -> RelayState {
        self.state
            .lock()
            .expect("Locking failed")
            .unwrap_or(RelayState::Disconnected)
    }
}

/// Diagnostics snapshot for one relay.
#[derive(Debug, Clone)]
pub struct RelayStatusSnapshot {
    pub url: String,
    pub state: RelayState,
    pub subscriptions: usize,
    pub reconnects: u64,
    pub events_received: u64,
    pub dropped_events: u64,
    pub last_error: Option<String>,
}

struct RelayHandle {
    cmd_tx: mpsc::UnboundedSender<RelayCmd>,
    subs: Arc<Mutex<HashMap<String, SubEntry>>>,
    status: Arc<RelayStatusShared>,
}

pub struct RelayPool {
    opts: PoolOptions,
    relays: Mutex<HashMap<String, RelayHandle>>,
}

impl RelayPool {
    pub fn new(opts: PoolOptions) -> Self {
        Self {
            opts,
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Open a subscription on a relay, connecting to it if needed.
    pub fn subscribe(
        &self,
        relay_url: &str,
        sub_id: &str,
        filters: Vec<EventFilter>,
    ) -> PoolResult<Subscription> {
        let mut relays = self.relays.lock().expect("Locking failed");
        let handle = relays
            .entry(relay_url.to_owned())
            .or_insert_with(|| spawn_relay(relay_url.to_owned(), self.opts.clone()));

        let queue = {
            let mut subs = handle.subs.lock().expect("Locking failed");
            if self.opts.max_concurrent_subs <= subs.len() {
                return TooManySubscriptionsSnafu {
                    relay: relay_url.to_owned(),
                    max: self.opts.max_concurrent_subs,
                }
                .fail();
            }
            if subs.contains_key(sub_id) {
                return DuplicateSubscriptionSnafu {
                    relay: relay_url.to_owned(),
                    sub_id: sub_id.to_owned(),
                }
                .fail();
            }
            let queue = Arc::new(BoundedQueue::new(self.opts.queue_capacity));
            subs.insert(
                sub_id.to_owned(),
                SubEntry {
                    filters,
                    queue: queue.clone(),
                },
            );
            queue
        };

        let _ = handle.cmd_tx.send(RelayCmd::Sync);
        Ok(Subscription {
            relay: relay_url.to_owned(),
            id: sub_id.to_owned(),
            queue,
        })
    }

    pub fn unsubscribe(&self, relay_url: &str, sub_id: &str) {
        let relays = self.relays.lock().expect("Locking failed");
        if let Some(handle) = relays.get(relay_url) {
            let removed = handle.subs.lock().expect("Locking failed").remove(sub_id);
            if let Some(entry) = removed {
                entry.queue.close();
                let _ = handle.cmd_tx.send(RelayCmd::Unsubscribe(sub_id.to_owned()));
            }
        }
    }

    /// Relay urls with a live connection task.
    pub fn connected_relays(&self) -> Vec<String> {
        self.relays
            .lock()
            .expect("Locking failed")
            .iter()
            .filter(|(_, handle)| {
                matches!(
                    handle.status.state(),
                    RelayState::Idle | RelayState::Subscribing
                )
            })
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<RelayStatusSnapshot> {
        let relays = self.relays.lock().expect("Locking failed");
        let mut out: Vec<RelayStatusSnapshot> = relays
            .iter()
            .map(|(url, handle)| {
                let subs = handle.subs.lock().expect("Locking failed");
                RelayStatusSnapshot {
                    url: url.clone(),
                    state: handle.status.state(),
                    subscriptions: subs.len(),
                    reconnects: handle.status.reconnects.load(Ordering::Relaxed),
                    events_received: handle.status.events_received.load(Ordering::Relaxed),
                    dropped_events: subs.values().map(|entry| entry.queue.dropped()).sum(),
                    last_error: handle
                        .status
                        .last_error
                        .lock()
                        .expect("Locking failed")
                        .clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        out
    }

    /// Close every relay connection and drop all subscriptions.
    pub fn close(&self) {
        let mut relays = self.relays.lock().expect("Locking failed");
        for (url, handle) in relays.drain() {
            debug!(target: LOG_TARGET, relay = %url, "Closing relay");
            {
                let mut subs = handle.subs.lock().expect("Locking failed");
                for (_, entry) in subs.drain() {
                    entry.queue.close();
                }
            }
            let _ = handle.cmd_tx.send(RelayCmd::Close);
        }
    }
}

fn spawn_relay(url: String, opts: PoolOptions) -> RelayHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let subs: Arc<Mutex<HashMap<String, SubEntry>>> = Arc::new(Mutex::new(HashMap::new()));
    let status = Arc::new(RelayStatusShared::default());

    tokio::spawn(relay_task(
        url,
        opts,
        cmd_rx,
        subs.clone(),
        status.clone(),
    ));

    RelayHandle {
        cmd_tx,
        subs,
        status,
    }
}

async fn relay_task(
    url: String,
    opts: PoolOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCmd>,
    subs: Arc<Mutex<HashMap<String, SubEntry>>>,
    status: Arc<RelayStatusShared>,
) {
    let mut backoff_idx = 0usize;
    info!(target: LOG_TARGET, relay = %url, "Relay task starting");

    'reconnect: loop {
        status.set_state(RelayState::Connecting);
        let stream = match timeout(opts.connect_timeout, connect_async(&url)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                status.set_error(err.to_string());
                status.set_state(RelayState::Disconnected);
                trace!(target: LOG_TARGET, relay = %url, err = %err, "Connect failed");
                if wait_backoff(&mut cmd_rx, &opts, &mut backoff_idx).await {
                    break 'reconnect;
                }
                continue;
            }
            Err(_elapsed) => {
                status.set_error("connect timeout".to_owned());
                status.set_state(RelayState::Disconnected);
                if wait_backoff(&mut cmd_rx, &opts, &mut backoff_idx).await {
                    break 'reconnect;
                }
                continue;
            }
        };

        status.reconnects.fetch_add(1, Ordering::Relaxed);
        debug!(target: LOG_TARGET, relay = %url, "Connected");
        let (mut write, mut read) = stream.split();

        // Re-issue every registered subscription.
        let mut announced: Vec<String> = Vec::new();
        let reissue: Vec<(String, String)> = {
            let subs = subs.lock().expect("Locking failed");
            subs.iter()
                .map(|(sub_id, entry)| (sub_id.clone(), req_message(sub_id, &entry.filters)))
                .collect()
        };
        for (sub_id, frame) in reissue {
            announced.push(sub_id);
            if write.send(Message::Text(frame)).await.is_err() {
                status.set_state(RelayState::Disconnected);
                continue 'reconnect;
            }
        }
        update_sub_state(&status, &subs);

        let mut last_rx = Instant::now();
        let mut quiescence = tokio::time::interval(QUIESCENCE_WINDOW);
        quiescence.reset();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(RelayCmd::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        status.set_state(RelayState::Disconnected);
                        info!(target: LOG_TARGET, relay = %url, "Relay task stopping");
                        return;
                    }
                    Some(RelayCmd::Sync) => {
                        // Send REQ for any subscription not announced yet.
                        let pending: Vec<(String, String)> = {
                            let subs = subs.lock().expect("Locking failed");
                            subs.iter()
                                .filter(|(sub_id, _)| !announced.contains(sub_id))
                                .map(|(sub_id, entry)| {
                                    (sub_id.clone(), req_message(sub_id, &entry.filters))
                                })
                                .collect()
                        };
                        for (sub_id, frame) in pending {
                            announced.push(sub_id);
                            if write.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        update_sub_state(&status, &subs);
                    }
                    Some(RelayCmd::Unsubscribe(sub_id)) => {
                        announced.retain(|announced_id| *announced_id != sub_id);
                        let _ = write.send(Message::Text(close_message(&sub_id))).await;
                        update_sub_state(&status, &subs);
                    }
                },
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        // A full receive round resets the backoff ladder.
                        backoff_idx = 0;
                        handle_frame(&url, &text, &subs, &status);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_rx = Instant::now();
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(target: LOG_TARGET, relay = %url, "Connection closed by relay");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        status.set_error(err.to_string());
                        trace!(target: LOG_TARGET, relay = %url, err = %err, "Read error");
                        break;
                    }
                },
                _ = quiescence.tick() => {
                    if QUIESCENCE_WINDOW <= last_rx.elapsed() {
                        let has_subs = !subs.lock().expect("Locking failed").is_empty();
                        if has_subs {
                            warn!(
                                target: LOG_TARGET,
                                relay = %url,
                                "No traffic within quiescence window, re-subscribing"
                            );
                            break;
                        }
                    }
                }
            }
        }

        status.set_state(RelayState::Disconnected);
        if wait_backoff(&mut cmd_rx, &opts, &mut backoff_idx).await {
            break 'reconnect;
        }
    }

    info!(target: LOG_TARGET, relay = %url, "Relay task stopped");
}

/// Sleep out the current backoff step; true means Close arrived.
async fn wait_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<RelayCmd>,
    opts: &PoolOptions,
    backoff_idx: &mut usize,
) -> bool {
    let delay = opts
        .backoff
        .get(*backoff_idx)
        .or_else(|| opts.backoff.last())
        .copied()
        .unwrap_or(Duration::from_secs(5));
    *backoff_idx = (*backoff_idx + 1).min(opts.backoff.len().saturating_sub(1));

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(RelayCmd::Close) => return true,
                // Subscription changes are picked up on reconnect.
                Some(_) => {}
            },
        }
    }
}

fn update_sub_state(status: &RelayStatusShared, subs: &Mutex<HashMap<String, SubEntry>>) {
    let active = !subs.lock().expect("Locking failed").is_empty();
    status.set_state(if active {
        RelayState::Subscribing
    } else {
        RelayState::Idle
    });
}

fn handle_frame(
    url: &str,
    text: &str,
    subs: &Mutex<HashMap<String, SubEntry>>,
    status: &RelayStatusShared,
) {
    match parse_relay_message(text) {
        Some(RelayMessage::Event { sub_id, event }) => {
            status.events_received.fetch_add(1, Ordering::Relaxed);
            let subs = subs.lock().expect("Locking failed");
            if let Some(entry) = subs.get(&sub_id) {
                entry.queue.push(SubEvent::Event(event));
            }
        }
        Some(RelayMessage::Eose { sub_id }) => {
            let subs = subs.lock().expect("Locking failed");
            if let Some(entry) = subs.get(&sub_id) {
                entry.queue.push(SubEvent::Eose);
            }
        }
        Some(RelayMessage::Closed { sub_id, message }) => {
            // Terminal for this subscription; the consumer decides
            // whether to retry with a narrower filter.
            let mut subs = subs.lock().expect("Locking failed");
            if let Some(entry) = subs.remove(&sub_id) {
                warn!(target: LOG_TARGET, relay = %url, sub = %sub_id, %message, "Subscription closed by relay");
                entry.queue.push(SubEvent::Closed(message));
                entry.queue.close();
            }
        }
        Some(RelayMessage::Notice { message }) => {
            debug!(target: LOG_TARGET, relay = %url, %message, "Relay notice");
        }
        Some(RelayMessage::Ok { .. }) | None => {}
    }
}
