// Each integration test compiles as a separate binary that includes this
// module via `mod common;`. Not every binary uses every helper.
#![allow(dead_code)]
//! Shared test utilities for tracker integration tests.

use std::sync::Arc;

use rollcall_model::{Diff, DiffHandler, HandlerError, Meta};
use rollcall_net_sim::{SimNetwork, SimPubSub};
use rollcall_tracker::{Tracker, TrackerConfig};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Handler that forwards every diff to a channel. Its threaded state is a
/// diff counter, exercising the state-passing contract.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Diff>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Diff>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DiffHandler for ChannelHandler {
    type State = u64;

    fn init(&mut self) -> u64 {
        0
    }

    fn handle_diff(&mut self, diff: &Diff, state: u64) -> Result<u64, HandlerError> {
        let _ = self.tx.send(diff.clone());
        Ok(state + 1)
    }
}

/// Handler that violates its contract on the first diff.
pub struct FailingHandler;

impl DiffHandler for FailingHandler {
    type State = ();

    fn init(&mut self) {}

    fn handle_diff(&mut self, _diff: &Diff, _state: ()) -> Result<(), HandlerError> {
        Err(HandlerError("intentional test failure".into()))
    }
}

/// Millisecond-scale cadence for tests. `down_period` is pinned high so
/// liveness transitions only fire in tests that opt into them.
pub fn fast_config() -> TrackerConfig {
    TrackerConfig::new("test")
        .with_broadcast_period(Duration::from_millis(25))
        .with_max_silent_periods(2)
        .with_down_period(Duration::from_secs(60))
        .with_permdown_period(Duration::from_secs(600))
}

pub struct TestNode {
    pub tracker: Tracker,
    pub diffs: mpsc::UnboundedReceiver<Diff>,
    pub pubsub: Arc<SimPubSub>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub async fn spawn_node(net: &SimNetwork, name: &str, config: TrackerConfig) -> TestNode {
    init_tracing();
    let pubsub = Arc::new(SimPubSub::new(name, net));
    let (handler, diffs) = ChannelHandler::new();
    let tracker = Tracker::spawn(config, pubsub.clone(), handler)
        .await
        .expect("spawn tracker");
    TestNode {
        tracker,
        diffs,
        pubsub,
    }
}

pub fn meta(pairs: &[(&str, &str)]) -> Meta {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// Poll `list(topic)` until it contains `key`.
pub async fn wait_for_key(tracker: &Tracker, topic: &str, key: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Ok(list) = tracker.list(topic).await {
            if list.iter().any(|(k, _)| k == key) {
                return true;
            }
        }
        sleep(POLL).await;
    }
    false
}

/// Poll `list(topic)` until `key` is gone.
pub async fn wait_for_absent(tracker: &Tracker, topic: &str, key: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        match tracker.list(topic).await {
            Ok(list) if !list.iter().any(|(k, _)| k == key) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
        sleep(POLL).await;
    }
    false
}

/// Receive the next diff, if one arrives in time.
pub async fn next_diff(diffs: &mut mpsc::UnboundedReceiver<Diff>) -> Option<Diff> {
    timeout(WAIT, diffs.recv()).await.ok().flatten()
}

/// Receive diffs until one joins `key` on `topic`; returns the joined meta.
pub async fn wait_for_join(
    diffs: &mut mpsc::UnboundedReceiver<Diff>,
    topic: &str,
    key: &str,
) -> Option<Meta> {
    let deadline = Instant::now() + WAIT;
    while let Ok(Some(diff)) =
        timeout(deadline.saturating_duration_since(Instant::now()), diffs.recv()).await
    {
        if let Some(topic_diff) = diff.get(topic) {
            if let Some((_, meta)) = topic_diff.joins.iter().find(|(k, _)| k == key) {
                return Some(meta.clone());
            }
        }
    }
    None
}

/// Receive diffs until one removes `key` on `topic`; returns the left meta.
pub async fn wait_for_leave(
    diffs: &mut mpsc::UnboundedReceiver<Diff>,
    topic: &str,
    key: &str,
) -> Option<Meta> {
    let deadline = Instant::now() + WAIT;
    while let Ok(Some(diff)) =
        timeout(deadline.saturating_duration_since(Instant::now()), diffs.recv()).await
    {
        if let Some(topic_diff) = diff.get(topic) {
            if let Some((_, meta)) = topic_diff.leaves.iter().find(|(k, _)| k == key) {
                return Some(meta.clone());
            }
        }
    }
    None
}
