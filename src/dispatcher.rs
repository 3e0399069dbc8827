use crate::config::ClientConfig;
use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use wasession_core::binary::node::Node;

/// Where queued nodes end up.
#[async_trait]
pub trait NodeSink: Send + Sync {
    /// Whether a handler is registered for `tag`. Nodes without one never enter the queue.
    fn accepts(&self, tag: &str) -> bool;

    async fn process(&self, node: Node);
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_size: usize,
    pub spillover_workers: usize,
    pub stall_check_interval: Duration,
    pub stall_max_checks: u32,
    pub slow_handler_warning: Duration,
}

impl From<&ClientConfig> for DispatcherConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            queue_size: config.handler_queue_size.max(1),
            spillover_workers: config.spillover_workers,
            stall_check_interval: config.stall_check_interval,
            stall_max_checks: config.stall_max_checks,
            slow_handler_warning: config.slow_handler_warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; a spillover worker will push the node once there is room.
    Spilled,
    /// Queue and spillover pool were both full.
    Dropped,
    /// No handler for the tag.
    Unhandled,
    /// The dispatcher has shut down.
    Closed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub spilled: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    spilled: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded FIFO between the read loop and the stanza handlers.
///
/// One drain task runs handlers one at a time, in queue order. A handler that
/// is still running after `stall_max_checks` stall checks is left to finish in
/// the background while the drain moves on.
///
/// When the queue is full, the node is handed to a spillover worker that
/// waits for room; ordering relative to later frames is lost for that node.
/// At most `spillover_workers` nodes can wait like this. Beyond that the
/// newest node is dropped and counted.
#[derive(Clone)]
pub struct FrameDispatcher {
    tx: mpsc::Sender<Node>,
    sink: Arc<dyn NodeSink>,
    spillover: Arc<Semaphore>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl FrameDispatcher {
    /// Spawns the drain loop. It stops when `cancel` fires.
    pub fn start(
        config: DispatcherConfig,
        sink: Arc<dyn NodeSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let dispatcher = Self {
            tx,
            sink: sink.clone(),
            spillover: Arc::new(Semaphore::new(config.spillover_workers)),
            counters: Arc::default(),
            cancel: cancel.clone(),
        };
        tokio::spawn(drain_loop(rx, sink, config, cancel));
        dispatcher
    }

    /// Never waits: the read path must keep flowing.
    pub fn enqueue(&self, node: Node) -> EnqueueOutcome {
        if !self.sink.accepts(&node.tag) {
            if node.tag != "ack" {
                debug!(target: "Client/Dispatcher", "Didn't handle node <{}>", node.tag);
            }
            return EnqueueOutcome::Unhandled;
        }

        let node = match self.tx.try_send(node) {
            Ok(()) => return EnqueueOutcome::Queued,
            Err(TrySendError::Closed(node)) => {
                debug!(target: "Client/Dispatcher", "Dispatcher stopped, dropping <{}>", node.tag);
                return EnqueueOutcome::Closed;
            }
            Err(TrySendError::Full(node)) => node,
        };

        warn!(
            target: "Client/Dispatcher",
            "Handler queue is full, message ordering is no longer guaranteed"
        );
        let Ok(permit) = self.spillover.clone().try_acquire_owned() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                target: "Client/Dispatcher",
                "Spillover pool exhausted, dropping <{}> (id {:?})",
                node.tag,
                node.attrs.get("id")
            );
            return EnqueueOutcome::Dropped;
        };
        self.counters.spilled.fetch_add(1, Ordering::Relaxed);

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                res = tx.send(node) => {
                    if res.is_err() {
                        debug!(target: "Client/Dispatcher", "Dispatcher stopped before spilled node was queued");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
        EnqueueOutcome::Spilled
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            spilled: self.counters.spilled.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn drain_loop(
    mut rx: mpsc::Receiver<Node>,
    sink: Arc<dyn NodeSink>,
    config: DispatcherConfig,
    cancel: CancellationToken,
) {
    loop {
        let node = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            node = rx.recv() => match node {
                Some(node) => node,
                None => return,
            },
        };

        let tag = node.tag.clone();
        let started = Instant::now();
        let mut handle = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.process(node).await })
        };

        let mut stall_timer = interval_at(
            started + config.stall_check_interval,
            config.stall_check_interval,
        );
        stall_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checks = 0u32;

        loop {
            tokio::select! {
                res = &mut handle => {
                    if let Err(e) = res
                        && e.is_panic()
                    {
                        error!(target: "Client/Dispatcher", "Handler for <{tag}> panicked: {e}");
                    }
                    let elapsed = started.elapsed();
                    if elapsed > config.slow_handler_warning {
                        warn!(target: "Client/Dispatcher", "Node handling took {elapsed:?} for <{tag}>");
                    }
                    break;
                }
                _ = stall_timer.tick() => {
                    checks += 1;
                    warn!(
                        target: "Client/Dispatcher",
                        "Node handling is taking long for <{tag}> (started {:?} ago)",
                        started.elapsed()
                    );
                    if checks >= config.stall_max_checks {
                        warn!(target: "Client/Dispatcher", "Continuing handling of next node");
                        break;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use wasession_core::binary::builder::NodeBuilder;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        notify: Notify,
    }

    #[async_trait]
    impl NodeSink for RecordingSink {
        fn accepts(&self, tag: &str) -> bool {
            tag != "unknown" && tag != "ack"
        }

        async fn process(&self, node: Node) {
            if node.tag == "block"
                && let Some(gate) = &self.gate
            {
                gate.notified().await;
            }
            self.seen.lock().unwrap().push(node.attrs["n"].clone());
            self.notify.notify_waiters();
        }
    }

    impl RecordingSink {
        async fn wait_for(&self, count: usize) {
            loop {
                let notified = self.notify.notified();
                if self.seen.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        }
    }

    fn config(queue_size: usize, spillover_workers: usize) -> DispatcherConfig {
        DispatcherConfig {
            queue_size,
            spillover_workers,
            stall_check_interval: Duration::from_secs(30),
            stall_max_checks: 10,
            slow_handler_warning: Duration::from_secs(5),
        }
    }

    fn node(tag: &str, n: usize) -> Node {
        NodeBuilder::new(tag).attr("n", n.to_string()).build()
    }

    #[tokio::test]
    async fn test_dispatches_in_enqueue_order_below_capacity() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher =
            FrameDispatcher::start(config(64, 4), sink.clone(), CancellationToken::new());

        let tags = ["message", "receipt", "iq", "notification", "presence", "call"];
        for (i, tag) in tags.iter().cycle().take(40).enumerate() {
            assert_eq!(dispatcher.enqueue(node(tag, i)), EnqueueOutcome::Queued);
        }

        tokio::time::timeout(Duration::from_secs(5), sink.wait_for(40))
            .await
            .expect("all nodes should be dispatched");
        let seen = sink.seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..40).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected, "dispatch order must match enqueue order");
    }

    #[tokio::test]
    async fn test_overflow_spills_and_still_delivers() {
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let dispatcher =
            FrameDispatcher::start(config(2, 8), sink.clone(), CancellationToken::new());

        // The blocking handler holds the drain loop while the queue fills up.
        assert_eq!(dispatcher.enqueue(node("block", 0)), EnqueueOutcome::Queued);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut outcomes = Vec::new();
        for i in 1..=5 {
            outcomes.push(dispatcher.enqueue(node("message", i)));
        }
        assert_eq!(&outcomes[..2], &[EnqueueOutcome::Queued, EnqueueOutcome::Queued]);
        assert!(outcomes[2..].iter().all(|o| *o == EnqueueOutcome::Spilled));
        assert_eq!(dispatcher.stats().spilled, 3);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), sink.wait_for(6))
            .await
            .expect("overflowed nodes must still be delivered");
        let mut seen = sink.seen.lock().unwrap().clone();
        seen.sort_by_key(|n| n.parse::<usize>().unwrap());
        assert_eq!(seen, ["0", "1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_drops_newest_when_spillover_pool_is_exhausted() {
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let dispatcher =
            FrameDispatcher::start(config(1, 1), sink.clone(), CancellationToken::new());

        dispatcher.enqueue(node("block", 0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.enqueue(node("message", 1)), EnqueueOutcome::Queued);
        assert_eq!(dispatcher.enqueue(node("message", 2)), EnqueueOutcome::Spilled);
        assert_eq!(dispatcher.enqueue(node("message", 3)), EnqueueOutcome::Dropped);
        assert_eq!(
            dispatcher.stats(),
            DispatcherStats {
                spilled: 1,
                dropped: 1
            }
        );
        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), sink.wait_for(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_tags_never_reach_the_queue() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher =
            FrameDispatcher::start(config(4, 1), sink.clone(), CancellationToken::new());
        assert_eq!(dispatcher.enqueue(node("unknown", 0)), EnqueueOutcome::Unhandled);
        assert_eq!(dispatcher.enqueue(node("ack", 1)), EnqueueOutcome::Unhandled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handler_does_not_block_next_node() {
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let mut cfg = config(8, 1);
        cfg.stall_check_interval = Duration::from_secs(1);
        cfg.stall_max_checks = 3;
        let dispatcher = FrameDispatcher::start(cfg, sink.clone(), CancellationToken::new());

        dispatcher.enqueue(node("block", 0));
        dispatcher.enqueue(node("message", 1));

        // Never released: the drain loop gives up waiting after three checks.
        tokio::time::timeout(Duration::from_secs(10), sink.wait_for(1))
            .await
            .expect("next node should run while the first is stalled");
        assert_eq!(sink.seen.lock().unwrap().as_slice(), ["1"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_drain_loop() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let dispatcher = FrameDispatcher::start(config(4, 1), sink.clone(), cancel.clone());
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.enqueue(node("message", 0)), EnqueueOutcome::Closed);
    }
}
