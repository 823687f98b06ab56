//! Broadcast channel: one ordered publish/subscribe topic per collection.
//!
//! Publishing assigns a per-topic sequence number and sends under the same
//! lock, so every subscriber sees a topic's events in sequence order. There
//! is no ordering across topics.

use alive_sync_proto::{BroadcastEvent, Envelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of undelivered events a topic buffers per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Handle to a named broadcast topic. Cheap to clone.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    name: String,
    sender: broadcast::Sender<Envelope>,
    seq: Mutex<u64>,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.inner.name)
            .field("seq", &*self.inner.seq.lock())
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl Topic {
    /// Create a standalone topic buffering up to `capacity` events per
    /// subscriber.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(TopicInner {
                name: name.into(),
                sender,
                seq: Mutex::new(0),
            }),
        }
    }

    /// Topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publish `event` to every current subscriber.
    ///
    /// Returns the published envelope. Publishing with no subscribers is not
    /// an error; the event is simply dropped.
    pub fn publish(&self, event: BroadcastEvent) -> Envelope {
        let mut seq = self.inner.seq.lock();
        *seq += 1;
        let envelope = Envelope::new(self.inner.name.clone(), *seq, event);
        let delivered = self.inner.sender.send(envelope.clone()).unwrap_or(0);

        tracing::debug!(
            topic = %self.inner.name,
            seq = envelope.seq,
            action = %envelope.event.action(),
            delivered,
            "Published event"
        );
        envelope
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            topic: self.inner.name.clone(),
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Sequence number of the most recently published event (0 if none).
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        *self.inner.seq.lock()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

/// Receiving end of a topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Name of the subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Lagged`] if events were dropped because this
    /// subscriber fell behind, or [`ChannelError::Closed`] once the topic is
    /// gone.
    pub async fn recv(&mut self) -> Result<Envelope, ChannelError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(skipped) => {
                tracing::warn!(topic = %self.topic, skipped, "Subscriber lagged");
                ChannelError::Lagged(skipped)
            }
            broadcast::error::RecvError::Closed => ChannelError::Closed,
        })
    }

    /// Take the next event if one is already queued.
    ///
    /// # Errors
    ///
    /// Same as [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Result<Option<Envelope>, ChannelError> {
        match self.receiver.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(topic = %self.topic, skipped, "Subscriber lagged");
                Err(ChannelError::Lagged(skipped))
            }
            Err(broadcast::error::TryRecvError::Closed) => Err(ChannelError::Closed),
        }
    }
}

/// Registry of topics by name.
#[derive(Debug)]
pub struct Hub {
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Hub {
    /// Create a hub whose topics buffer `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Get the topic called `name`, creating it on first use.
    pub fn topic(&self, name: &str) -> Topic {
        self.topics
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(topic = name, capacity = self.capacity, "Created topic");
                Topic::new(name, self.capacity)
            })
            .clone()
    }

    /// Names of all topics created so far.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Errors raised while receiving from a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The subscriber fell behind and this many events were dropped
    #[error("subscriber lagged by {0} events")]
    Lagged(u64),
    /// The topic was dropped
    #[error("topic closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alive_sync_core::RecordId;

    fn order_event(ids: &[u64]) -> BroadcastEvent {
        BroadcastEvent::OrderChanged {
            order: ids.iter().copied().map(RecordId).collect(),
        }
    }

    #[tokio::test]
    async fn subscribers_see_publish_order() {
        let topic = Topic::new("alive:cards", 16);
        let mut first = topic.subscribe();
        let mut second = topic.subscribe();

        for i in 0..5 {
            topic.publish(order_event(&[i]));
        }

        for sub in [&mut first, &mut second] {
            let mut seqs = Vec::new();
            for _ in 0..5 {
                seqs.push(sub.recv().await.unwrap().seq);
            }
            assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn publish_without_subscribers_still_advances_seq() {
        let topic = Topic::new("alive:cards", 4);
        let envelope = topic.publish(order_event(&[1]));
        assert_eq!(envelope.seq, 1);
        assert_eq!(envelope.topic, "alive:cards");
        assert_eq!(topic.last_seq(), 1);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[test]
    fn late_subscriber_only_sees_new_events() {
        let topic = Topic::new("alive:cards", 4);
        topic.publish(order_event(&[1]));

        let mut sub = topic.subscribe();
        assert_eq!(sub.try_recv().unwrap(), None);

        topic.publish(order_event(&[2]));
        assert_eq!(sub.try_recv().unwrap().map(|e| e.seq), Some(2));
    }

    #[test]
    fn slow_subscriber_reports_lag() {
        let topic = Topic::new("alive:cards", 2);
        let mut sub = topic.subscribe();

        for i in 0..5 {
            topic.publish(order_event(&[i]));
        }

        assert_eq!(sub.try_recv(), Err(ChannelError::Lagged(3)));
        // Delivery resumes from the oldest retained event
        assert_eq!(sub.try_recv().unwrap().map(|e| e.seq), Some(4));
    }

    #[test]
    fn hub_reuses_topics_by_name() {
        let hub = Hub::new(8);
        let a = hub.topic("alive:cards");
        let _sub = a.subscribe();
        let b = hub.topic("alive:cards");
        hub.topic("alive:meals");

        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(hub.topic_names(), vec!["alive:cards", "alive:meals"]);
    }
}
