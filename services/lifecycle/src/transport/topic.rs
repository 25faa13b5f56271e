use super::{FilterPolicy, OutgoingMessage, Queue};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Names of the subscription queues a published message was delivered to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    pub delivered_to: Vec<String>,
}

impl PublishReceipt {
    pub fn is_unrouted(&self) -> bool {
        self.delivered_to.is_empty()
    }
}

#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, message: OutgoingMessage) -> Result<PublishReceipt>;
}

struct Subscription {
    queue: Arc<dyn Queue>,
    filter: FilterPolicy,
}

/// Topic that copies each message into every subscription queue whose
/// filter matches the message attributes
pub struct FanoutTopic {
    name: String,
    subscriptions: Vec<Subscription>,
}

impl FanoutTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Vec::new(),
        }
    }

    pub fn subscribe(mut self, queue: Arc<dyn Queue>, filter: FilterPolicy) -> Self {
        self.subscriptions.push(Subscription { queue, filter });
        self
    }

    /// Subscription queue names in subscription order
    pub fn subscription_names(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.queue.name()).collect()
    }
}

#[async_trait]
impl Topic for FanoutTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PublishReceipt> {
        let mut receipt = PublishReceipt::default();

        for subscription in &self.subscriptions {
            if !subscription.filter.matches(&message.attributes) {
                continue;
            }
            subscription.queue.enqueue(message.clone()).await?;
            receipt
                .delivered_to
                .push(subscription.queue.name().to_string());
        }

        debug!(
            topic = %self.name,
            delivered_to = ?receipt.delivered_to,
            "Published message"
        );
        metrics::counter!("photos.topic.published", "topic" => self.name.clone()).increment(1);

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_fans_out_by_filter() {
        let captions = Arc::new(InMemoryQueue::new("captions"));
        let everything_else = Arc::new(InMemoryQueue::new("everything-else"));
        let audit = Arc::new(InMemoryQueue::new("audit"));

        let topic = FanoutTopic::new("events")
            .subscribe(captions.clone(), FilterPolicy::any_of("type", ["Caption"]))
            .subscribe(
                everything_else.clone(),
                FilterPolicy::none_of("type", ["Caption"]),
            )
            .subscribe(audit.clone(), FilterPolicy::AcceptAll);

        let receipt = topic
            .publish(OutgoingMessage::new("{}").with_attribute("type", "Caption"))
            .await
            .unwrap();
        assert_eq!(receipt.delivered_to, vec!["captions", "audit"]);

        let receipt = topic.publish(OutgoingMessage::new("{}")).await.unwrap();
        assert_eq!(receipt.delivered_to, vec!["everything-else", "audit"]);

        let visibility = Duration::from_secs(30);
        assert_eq!(captions.receive_batch(10, visibility).await.unwrap().len(), 1);
        assert_eq!(everything_else.receive_batch(10, visibility).await.unwrap().len(), 1);
        assert_eq!(audit.receive_batch(10, visibility).await.unwrap().len(), 2);
        assert_eq!(
            topic.subscription_names(),
            vec!["captions", "everything-else", "audit"]
        );
    }

    #[tokio::test]
    async fn test_unmatched_message_is_unrouted() {
        let captions = Arc::new(InMemoryQueue::new("captions"));
        let topic = FanoutTopic::new("events")
            .subscribe(captions, FilterPolicy::any_of("type", ["Caption"]));

        let receipt = topic.publish(OutgoingMessage::new("{}")).await.unwrap();
        assert!(receipt.is_unrouted());
    }
}
