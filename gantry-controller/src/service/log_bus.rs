//! Log Bus
//!
//! In-process pub/sub for stage log lines. Every run has one topic
//! (`stagelog__{project}__{pipeline}__{run}`) backed by a broadcast channel.
//! A topic is created by its first viewer and dropped when the run resolves;
//! lines published while nobody watches are not retained. Viewers that
//! attach late receive every line published after they subscribed, in
//! publish order.

use gantry_core::domain::log::{STAGE_LOG_OPERATION, topic_name};
use gantry_core::domain::record::StageName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

/// Number of messages buffered per topic before slow viewers start lagging
const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Line {
        stage: StageName,
        task: Option<String>,
        line: String,
    },
    /// The run is resolved; no more lines will follow
    End,
}

type Topics = Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

#[derive(Clone, Default)]
pub struct LogBus {
    topics: Topics,
}

/// Topic of a run's stage logs
pub fn run_topic(project_id: Uuid, pipeline_id: Uuid, record_id: Uuid) -> String {
    topic_name(
        STAGE_LOG_OPERATION,
        &project_id.to_string(),
        &pipeline_id.to_string(),
        &record_id.to_string(),
    )
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets or creates the channel of a topic
    async fn channel_or_create(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                return sender.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Another task may have created it in between
        if let Some(sender) = topics.get(topic) {
            return sender.clone();
        }

        let (sender, _) = broadcast::channel(TOPIC_CAPACITY);
        topics.insert(topic.to_string(), sender.clone());
        tracing::debug!("Created log bus topic {}", topic);

        sender
    }

    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.channel_or_create(topic).await.subscribe()
    }

    /// Publishes a message, returning how many subscribers received it
    pub async fn publish(&self, topic: &str, message: BusMessage) -> usize {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .and_then(|sender| sender.send(message).ok())
            .unwrap_or(0)
    }

    /// Signals the end of a topic's stream and drops the topic
    pub async fn end(&self, topic: &str) {
        let sender = self.topics.write().await.remove(topic);
        if let Some(sender) = sender {
            let _ = sender.send(BusMessage::End);
            tracing::debug!("Closed log bus topic {}", topic);
        }
    }
}

#[cfg(test)]
impl LogBus {
    pub async fn has_topic(&self, topic: &str) -> bool {
        self.topics.read().await.contains_key(topic)
    }
}
