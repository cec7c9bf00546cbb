//! Kafka-backed [`MessageSource`].

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use relay_settings::KafkaSettings;
use tracing::info;
use uuid::Uuid;

use crate::error::IngestError;
use crate::source::{MessageSource, QueueMessage};

/// Largest fetch, in bytes.
const MAX_FETCH_BYTES: &str = "10000000";

/// Consumer over one topic with manual offset commits.
///
/// With a configured group, offsets are committed per message and work is
/// shared across instances. With an empty group, the consumer joins a
/// throw-away group, reads the topic from the beginning, and never commits,
/// so every instance sees every message.
pub struct KafkaSource {
    consumer: StreamConsumer,
    commit_offsets: bool,
}

impl KafkaSource {
    /// Create the consumer and subscribe to `settings.topic`.
    pub fn new(settings: &KafkaSettings) -> Result<Self, IngestError> {
        let (config, shared_group) = client_config(settings);

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        consumer
            .subscribe(&[settings.topic.as_str()])
            .map_err(|e| IngestError::Config(e.to_string()))?;

        info!(
            topic = %settings.topic,
            group_id = config.get("group.id").unwrap_or_default(),
            commit_offsets = shared_group,
            "kafka consumer subscribed"
        );
        Ok(Self {
            consumer,
            commit_offsets: shared_group,
        })
    }
}

/// Consumer config, and whether the group is shared (offsets committed).
fn client_config(settings: &KafkaSettings) -> (ClientConfig, bool) {
    let shared_group = !settings.group_id.trim().is_empty();
    let group_id = if shared_group {
        settings.group_id.clone()
    } else {
        format!("saga-relay-{}", Uuid::now_v7())
    };

    let mut config = ClientConfig::new();
    let _ = config
        .set("bootstrap.servers", settings.brokers.join(","))
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("fetch.max.bytes", MAX_FETCH_BYTES)
        .set("enable.partition.eof", "false");
    (config, shared_group)
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn fetch(&mut self) -> Result<QueueMessage, IngestError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?;
        Ok(QueueMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    async fn commit(&mut self, message: &QueueMessage) -> Result<(), IngestError> {
        if !self.commit_offsets {
            return Ok(());
        }
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .map_err(|e| IngestError::Commit(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| IngestError::Commit(e.to_string()))
    }
}
