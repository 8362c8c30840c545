//! Topic subscriptions and publish fan-out.
//!
//! The registry maps each publish target (a server connection) to the set of
//! topics it subscribed to. Publishing never writes to a socket: every
//! matching target receives the message through its own non-blocking
//! [`Publisher::publish`] path.

use crate::message::Message;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A target that accepts published messages for asynchronous delivery.
pub trait Publisher: Send + Sync {
    /// Stable identity of the target.
    fn id(&self) -> Uuid;

    /// Hand `msg` to the target's delivery queue without blocking.
    /// Returns `false` if the message was dropped.
    fn publish(&self, msg: Message) -> bool;
}

struct Subscriber {
    target: Arc<dyn Publisher>,
    topics: HashSet<String>,
}

/// Outcome of one publish fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub struct Subscriptions {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, topic: &str, target: Arc<dyn Publisher>) {
        self.subscribers
            .entry(target.id())
            .or_insert_with(|| Subscriber {
                target: target.clone(),
                topics: HashSet::new(),
            })
            .topics
            .insert(topic.to_string());
        debug!(target = %target.id(), topic, "Subscribed");
    }

    pub fn remove_subscription(&self, topic: &str, target_id: Uuid) {
        let now_empty = match self.subscribers.get_mut(&target_id) {
            Some(mut subscriber) => {
                subscriber.topics.remove(topic);
                subscriber.topics.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers.remove_if(&target_id, |_, s| s.topics.is_empty());
        }
    }

    /// Drop every subscription of a target.
    pub fn remove_subscriptions(&self, target_id: Uuid) {
        self.subscribers.remove(&target_id);
    }

    pub fn is_subscribed(&self, topic: &str, target_id: Uuid) -> bool {
        self.subscribers
            .get(&target_id)
            .is_some_and(|s| s.topics.contains(topic))
    }

    /// Number of targets subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.topics.contains(topic))
            .count()
    }

    pub fn target_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Fan `msg` out to every target subscribed to its topic. Each target
    /// receives the message at most once.
    pub fn publish(&self, msg: &Message) -> PublishReport {
        let topic = msg.topic();
        let targets: Vec<Arc<dyn Publisher>> = self
            .subscribers
            .iter()
            .filter(|entry| entry.topics.contains(topic))
            .map(|entry| entry.target.clone())
            .collect();

        let reply = msg.with_subscription_reply(true);
        let mut report = PublishReport::default();
        for target in targets {
            if target.publish(reply.clone()) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }
        report
    }
}
