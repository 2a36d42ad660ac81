//! In-process topic fan-out shared by every store backend

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

/// Buffered messages per topic before slow subscribers start lagging
const TOPIC_CAPACITY: usize = 256;

/// Receiving end of a topic
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the topic is gone
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Map of topic name to broadcast channel
#[derive(Default)]
pub struct LocalHub {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        Subscription {
            topic: topic.to_string(),
            rx,
        }
    }

    /// Returns the number of local subscribers reached
    pub fn publish(&self, topic: &str, payload: String) -> usize {
        let sent = self.topics.get(topic).map(|tx| tx.send(payload));

        match sent {
            Some(Ok(receivers)) => receivers,
            Some(Err(_)) => {
                self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
                0
            }
            None => 0,
        }
    }

    /// Drop topics nobody listens to anymore
    pub fn prune(&self) {
        self.topics.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = LocalHub::new();
        let mut sub = hub.subscribe("game:a");

        assert_eq!(hub.publish("game:a", "hello".into()), 1);
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
        assert_eq!(sub.topic(), "game:a");
    }

    #[test]
    fn test_publish_without_subscriber() {
        let hub = LocalHub::new();
        assert_eq!(hub.publish("game:nobody", "lost".into()), 0);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let hub = LocalHub::new();
        let sub = hub.subscribe("game:a");
        let _keep = hub.subscribe("game:b");
        drop(sub);

        assert_eq!(hub.publish("game:a", "x".into()), 0);
        assert_eq!(hub.topic_count(), 1);

        drop(_keep);
        hub.prune();
        assert_eq!(hub.topic_count(), 0);
    }
}
