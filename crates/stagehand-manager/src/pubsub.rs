//! In-memory build event hub.

use async_trait::async_trait;
use stagehand_core::Result;
use stagehand_core::services::{Message, Pubsub};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Broadcasts build events to every live subscriber.
pub struct Hub {
    tx: broadcast::Sender<Message>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pubsub for Hub {
    async fn publish(&self, message: Message) -> Result<()> {
        // Publishing with nobody listening is not an error.
        let _ = self.tx.send(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let hub = Hub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscribers(), 2);

        let msg = Message {
            repository: "octocat/hello-world".into(),
            visibility: "public".into(),
            data: "{}".into(),
        };
        hub.publish(msg.clone()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), msg);
        assert_eq!(b.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = Hub::new();
        assert!(hub.publish(Message::default()).await.is_ok());
    }
}
