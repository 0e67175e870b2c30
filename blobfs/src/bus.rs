//! Cross-process notification capability.
//!
//! Peers publish invalidated paths on a topic; each process drains its own subscription and
//! applies the same invalidation locally. `LocalBus` is the in-process implementation used
//! when clustering is off and in tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("receive from {topic}/{subscription} failed: {message}")]
    Receive {
        topic: String,
        subscription: String,
        message: String,
    },
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, body: &str) -> Result<(), BusError>;

    /// Takes the next message of `subscription`, or `None` when it is drained.
    async fn receive(&self, topic: &str, subscription: &str) -> Result<Option<String>, BusError>;
}

/// topic -> subscription -> pending messages
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, HashMap<String, VecDeque<String>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscription` so it receives messages published from now on.
    pub fn subscribe(&self, topic: &str, subscription: &str) {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_default();
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, body: &str) -> Result<(), BusError> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        // 没有订阅者时消息直接丢弃
        if let Some(subs) = topics.get_mut(topic) {
            for queue in subs.values_mut() {
                queue.push_back(body.to_string());
            }
        }
        Ok(())
    }

    async fn receive(&self, topic: &str, subscription: &str) -> Result<Option<String>, BusError> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        Ok(topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_default()
            .pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_subscriptions() {
        let bus = LocalBus::new();
        bus.subscribe("t", "a");
        bus.subscribe("t", "b");
        bus.publish("t", "/c/x").await.unwrap();
        bus.publish("t", "/c/y").await.unwrap();
        assert_eq!(bus.receive("t", "a").await.unwrap().as_deref(), Some("/c/x"));
        assert_eq!(bus.receive("t", "a").await.unwrap().as_deref(), Some("/c/y"));
        assert_eq!(bus.receive("t", "a").await.unwrap(), None);
        assert_eq!(bus.receive("t", "b").await.unwrap().as_deref(), Some("/c/x"));
    }

    #[tokio::test]
    async fn test_receive_creates_subscription() {
        let bus = LocalBus::new();
        assert_eq!(bus.receive("t", "late").await.unwrap(), None);
        bus.publish("t", "/").await.unwrap();
        assert_eq!(bus.receive("t", "late").await.unwrap().as_deref(), Some("/"));
        bus.publish("other", "/dropped").await.unwrap();
        assert_eq!(bus.receive("other", "late").await.unwrap(), None);
    }
}
