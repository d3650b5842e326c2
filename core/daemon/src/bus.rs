//! Topic fan-out for live subscribers.
//!
//! Every accepted envelope is published on the broad `events.all` topic
//! and on its specific `events.<type>` topic. A subscriber attaches to
//! exactly one of the two, so no envelope is ever double-delivered to the
//! same connection. Publication never blocks: slow subscribers lag on
//! their own bounded channel and drop frames there.

use beacon_protocol::Envelope;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

pub const TOPIC_ALL: &str = "events.all";

pub fn topic_for(event_type: &str) -> String {
    format!("events.{}", event_type)
}

pub struct EventBus {
    all: broadcast::Sender<Envelope>,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            all,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish on `events.all` and `events.<type>`.
    pub fn publish(&self, envelope: &Envelope) {
        let _ = self.all.send(envelope.clone());

        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(_) => return,
        };
        let topic = topic_for(&envelope.event_type);
        if let Some(sender) = topics.get(&topic) {
            if sender.receiver_count() == 0 {
                topics.remove(&topic);
            } else {
                let _ = sender.send(envelope.clone());
            }
        }
    }

    /// Attach a subscriber to exactly one topic: `events.<type>` when a
    /// filter is given, `events.all` otherwise.
    pub fn subscribe(&self, event_type: Option<&str>) -> broadcast::Receiver<Envelope> {
        match event_type {
            None => self.all.subscribe(),
            Some(event_type) => {
                let topic = topic_for(event_type);
                let mut topics = match self.topics.lock() {
                    Ok(topics) => topics,
                    Err(poisoned) => poisoned.into_inner(),
                };
                topics
                    .entry(topic)
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                    .subscribe()
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let filtered: usize = self
            .topics
            .lock()
            .map(|topics| topics.values().map(|tx| tx.receiver_count()).sum())
            .unwrap_or(0);
        self.all.receiver_count() + filtered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
