//! ChemBus — headless, topic-based publish/subscribe signal bus.
//!
//! Built on [`tokio::sync::broadcast`]: `publish` is non-blocking from the
//! publisher's perspective, every subscriber that had already subscribed
//! receives the signal, and a slow subscriber never blocks the publisher or
//! any other subscriber. "Chemical" is branding only — the semantics are
//! standard pub/sub.

use std::future::Future;
use std::sync::Arc;

use synapse_types::{SynapseError, Signal};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default channel capacity (number of buffered signals before slow
/// subscribers start missing messages and see `Lagged`).
const DEFAULT_CAPACITY: usize = 256;

/// Shared signal bus. Clone it cheaply — all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct ChemBus {
    sender: broadcast::Sender<Signal>,
}

impl ChemBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a signal to every subscriber currently listening.
    ///
    /// Non-blocking: this only enqueues onto the broadcast channel. Returns
    /// the number of receivers the signal was delivered to, or
    /// [`SynapseError::Bus`] if the channel has no subscribers at all (the
    /// underlying channel is otherwise healthy — callers may treat "no
    /// subscribers" as a non-fatal condition).
    pub fn publish(&self, signal: Signal) -> Result<usize, SynapseError> {
        self.sender
            .send(signal)
            .map_err(|e| SynapseError::Bus(format!("no active subscribers: {e}")))
    }

    /// Subscribe to every signal on the bus, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }

    /// Subscribe to signals whose `topic` matches exactly.
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            topic: topic.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Register an async handler for a topic, running it on its own task so
    /// the bus dispatch path (`publish`) never awaits it.
    ///
    /// `zooid_name` and `niche` are subscriber-side labels used only for
    /// logging/grouping; they do not affect delivery semantics. Dropping the
    /// returned [`JoinHandle`] does not cancel the task — call `.abort()`
    /// explicitly during shutdown if the subscription should be torn down.
    pub fn subscribe_handler<F, Fut>(
        &self,
        topic: impl Into<String>,
        zooid_name: impl Into<String>,
        niche: impl Into<String>,
        handler: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut sub = self.subscribe_topic(topic);
        let zooid_name = zooid_name.into();
        let niche = niche.into();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            tracing::debug!(zooid_name = %zooid_name, niche = %niche, topic = %sub.topic, "chembus handler registered");
            while let Some(signal) = sub.recv().await {
                let handler = handler.clone();
                // Each invocation runs independently; a slow handler must not
                // stall delivery to other subscribers or future signals.
                tokio::spawn(async move {
                    handler(signal).await;
                });
            }
            tracing::debug!(zooid_name = %zooid_name, niche = %niche, "chembus handler subscription closed");
        })
    }
}

impl Default for ChemBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A pull-based subscriber filtered to a single topic.
pub struct TopicSubscriber {
    topic: String,
    receiver: broadcast::Receiver<Signal>,
}

impl TopicSubscriber {
    /// Wait for the next signal on this subscriber's topic.
    ///
    /// Returns `None` once the bus is closed and no further signals can
    /// arrive.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) if signal.topic == self.topic => return Some(signal),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(topic = %self.topic, skipped = n, "chembus subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_signal(topic: &str) -> Signal {
        Signal::new(topic).with_fact("test", true)
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = ChemBus::default();
        let mut rx = bus.subscribe();

        let signal = make_signal("Q_CURIOSITY_INVESTIGATE");
        bus.publish(signal.clone()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, signal.topic);
    }

    #[tokio::test]
    async fn topic_subscriber_filters_exact_match() {
        let bus = ChemBus::default();
        let mut sub = bus.subscribe_topic("AFFECT_MEMORY_PRESSURE");

        bus.publish(make_signal("METRICS_SUMMARY")).unwrap();
        let good = make_signal("AFFECT_MEMORY_PRESSURE");
        bus.publish(good.clone()).unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.topic, "AFFECT_MEMORY_PRESSURE");
        assert_eq!(received.issued_at, good.issued_at);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_signal() {
        let bus = ChemBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let signal = make_signal("METRICS_SUMMARY");
        bus.publish(signal.clone()).unwrap();

        assert_eq!(rx1.recv().await.unwrap().topic, signal.topic);
        assert_eq!(rx2.recv().await.unwrap().topic, signal.topic);
    }

    #[test]
    fn publish_no_subscribers_returns_error() {
        let bus = ChemBus::default();
        let result = bus.publish(make_signal("Q_CURIOSITY_INVESTIGATE"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subscribe_handler_invokes_for_matching_topic() {
        let bus = ChemBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let handle = bus.subscribe_handler("METRICS_SUMMARY", "worker_pool", "metrics", move |_signal| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Give the spawned task a chance to subscribe before publishing.
        tokio::task::yield_now().await;
        bus.publish(make_signal("METRICS_SUMMARY")).unwrap();
        bus.publish(make_signal("BOTTLENECK_DETECTED")).unwrap();

        // Allow the handler task(s) to run.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn fifo_per_publisher_topic() {
        let bus = ChemBus::default();
        let mut sub = bus.subscribe_topic("Q_CURIOSITY_INVESTIGATE");

        for i in 0..5 {
            bus.publish(make_signal("Q_CURIOSITY_INVESTIGATE").with_fact("seq", i))
                .unwrap();
        }

        for i in 0..5 {
            let signal = sub.recv().await.unwrap();
            assert_eq!(signal.facts.get("seq").and_then(|v| v.as_i64()), Some(i));
        }
    }
}
