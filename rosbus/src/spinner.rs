//! The spinner decouples socket I/O timing from user-callback timing. Each
//! registered client (a publication or subscription, identified by a stable
//! string id) has a bounded queue and an optional minimum interval between
//! dispatches. Producers "ping" the spinner with a payload; a periodic tick
//! hands each eligible client its entire queued batch in one call.
//!
//! All dispatching happens inside the single spinner task and every batch is
//! awaited to completion before the next one starts, so user callbacks are
//! never re-entered.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const DEFAULT_SPIN_RATE_HZ: u32 = 200;

/// The owning side of a spinner client: a publication fans the batch out to
///  its subscriber sockets, a subscription decodes and runs the user callback.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpinClient: Send + Sync + 'static {
    async fn dispatch_batch(&self, batch: Vec<Bytes>);
}

enum SpinnerCmd {
    Register {
        id: String,
        queue_size: usize,
        throttle: Duration,
        client: Arc<dyn SpinClient>,
    },
    Deregister { id: String },
    Ping { id: String, payload: Bytes },
    Shutdown,
}

/// Cheap cloneable handle; all state lives in the spinner task.
#[derive(Clone)]
pub struct Spinner {
    cmd: mpsc::UnboundedSender<SpinnerCmd>,
}

impl Spinner {
    pub fn start(spin_rate_hz: u32) -> Spinner {
        let (tx, rx) = mpsc::unbounded_channel();
        let tick = Duration::from_secs_f64(1.0 / spin_rate_hz.max(1) as f64);
        tokio::spawn(run_spinner(rx, tick));
        Spinner { cmd: tx }
    }

    /// `queue_size` is clamped to at least 1; `throttle` of zero means
    ///  "deliver at the next tick". Clients that want to bypass the spinner
    ///  entirely (negative throttle at the API level) simply never register.
    pub fn register(&self, id: &str, queue_size: usize, throttle: Duration, client: Arc<dyn SpinClient>) {
        self.send(SpinnerCmd::Register {
            id: id.to_string(),
            queue_size: queue_size.max(1),
            throttle,
            client,
        });
    }

    /// Discards anything still queued for the client.
    pub fn deregister(&self, id: &str) {
        self.send(SpinnerCmd::Deregister { id: id.to_string() });
    }

    pub fn ping(&self, id: &str, payload: Bytes) {
        self.send(SpinnerCmd::Ping { id: id.to_string(), payload });
    }

    pub fn shutdown(&self) {
        self.send(SpinnerCmd::Shutdown);
    }

    fn send(&self, cmd: SpinnerCmd) {
        // a send after shutdown is a benign race during teardown
        let _ = self.cmd.send(cmd);
    }
}

struct ClientQueue {
    client: Arc<dyn SpinClient>,
    queue: VecDeque<Bytes>,
    queue_size: usize,
    throttle: Duration,
    last_dispatch: Option<Instant>,
}

impl ClientQueue {
    fn push(&mut self, payload: Bytes) {
        self.queue.push_back(payload);
        // bounded and lossy: the OLDEST entry gives way, never the newest
        while self.queue.len() > self.queue_size {
            self.queue.pop_front();
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        match self.last_dispatch {
            None => true,
            Some(last) => now.duration_since(last) >= self.throttle,
        }
    }
}

async fn run_spinner(mut cmd: mpsc::UnboundedReceiver<SpinnerCmd>, tick: Duration) {
    let mut clients: FxHashMap<String, ClientQueue> = FxHashMap::default();
    // armed iff Some; the deadline survives command arrivals so that a steady
    //  stream of pings cannot push the tick out indefinitely
    let mut next_tick: Option<Instant> = None;

    loop {
        if clients.values().all(|c| c.queue.is_empty()) {
            next_tick = None;
        } else if next_tick.is_none() {
            next_tick = Some(Instant::now() + tick);
        }

        let received = match next_tick {
            Some(deadline) => select! {
                received = cmd.recv() => received,
                _ = tokio::time::sleep_until(deadline) => {
                    dispatch_due(&mut clients).await;
                    next_tick = None;
                    continue;
                }
            },
            // nothing queued anywhere: the timer is disarmed
            None => cmd.recv().await,
        };

        match received {
            Some(SpinnerCmd::Register { id, queue_size, throttle, client }) => {
                debug!("spinner: registering client {:?} (queue {}, throttle {:?})", id, queue_size, throttle);
                clients.insert(id, ClientQueue {
                    client,
                    queue: VecDeque::with_capacity(queue_size),
                    queue_size,
                    throttle,
                    last_dispatch: None,
                });
            }
            Some(SpinnerCmd::Deregister { id }) => {
                debug!("spinner: deregistering client {:?}", id);
                clients.remove(&id);
            }
            Some(SpinnerCmd::Ping { id, payload }) => {
                match clients.get_mut(&id) {
                    Some(client) => client.push(payload),
                    // disconnect races a late ping; nothing to deliver to
                    None => trace!("spinner: ping for unknown client {:?}, dropping", id),
                }
            }
            Some(SpinnerCmd::Shutdown) | None => break,
        }
    }
    debug!("spinner stopped");
}

async fn dispatch_due(clients: &mut FxHashMap<String, ClientQueue>) {
    let now = Instant::now();

    let mut due = Vec::new();
    for client in clients.values_mut() {
        if !client.queue.is_empty() && client.is_eligible(now) {
            client.last_dispatch = Some(now);
            let batch: Vec<Bytes> = std::mem::take(&mut client.queue).into();
            due.push((client.client.clone(), batch));
        }
    }

    // awaited sequentially: single-threaded callback semantics
    for (client, batch) in due {
        client.dispatch_batch(batch).await;
    }
}
