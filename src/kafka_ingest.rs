use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::{
    ClientConfig, Message, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use tracing::{debug, info, instrument};

use crate::{
    config::KafkaConfig,
    link_ingestor::{DeadLetterSink, LinkRequestConsumer, RawMessage},
};

const DEAD_LETTER_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaLinkRequestConsumer {
    consumer: StreamConsumer,
}

impl KafkaLinkRequestConsumer {
    /// # Errors
    /// Will return [`Err`] if the consumer cannot be created or subscribed.
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", "earliest")
            // NOTE: offsets are committed by hand once a link has been created
            .set("enable.auto.commit", "false");

        debug!(?client_config, "rdkafka consumer configuration");
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.input_topic.as_str()])?;

        info!(
            topic = config.input_topic,
            group = config.consumer_group,
            "Subscribed to link requests"
        );
        Ok(Self { consumer })
    }
}

#[async_trait]
impl LinkRequestConsumer for KafkaLinkRequestConsumer {
    async fn fetch_next(&mut self) -> anyhow::Result<RawMessage> {
        let message = self
            .consumer
            .recv()
            .await
            .context("Failed to receive link request from kafka")?;

        Ok(RawMessage {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    #[instrument(skip(self, message), fields(offset = message.offset))]
    async fn commit(&mut self, message: &RawMessage) -> anyhow::Result<()> {
        let mut offsets = TopicPartitionList::new();
        // NOTE: the committed offset is the next one to read
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;

        // NOTE: Sync so a failed commit surfaces here instead of in the commit callback
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .context("Failed to commit kafka offset")
    }

    #[instrument(skip(self, message), fields(offset = message.offset))]
    async fn rewind(&mut self, message: &RawMessage) -> anyhow::Result<()> {
        // NOTE: seeking also discards anything already prefetched for the partition
        self.consumer
            .seek(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset),
                Timeout::After(SEEK_TIMEOUT),
            )
            .context("Failed to seek back to link request")
    }
}

/// Forwards poison link requests, unchanged, to a separate topic.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    #[must_use]
    pub const fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    #[instrument(skip(self, message), fields(offset = message.offset))]
    async fn route(&self, message: &RawMessage, reason: &str) -> anyhow::Result<()> {
        let key = format!("{}:{}:{}", message.topic, message.partition, message.offset);
        let headers = OwnedHeaders::new().insert(Header {
            key: "dead_letter_reason",
            value: Some(reason),
        });
        let record = FutureRecord::to(&self.topic)
            .key(key.as_str())
            .payload(message.payload.as_slice())
            .headers(headers);

        self.producer
            .send(record, Timeout::After(DEAD_LETTER_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(err, _)| anyhow::Error::from(err).context("Failed to produce dead letter"))
    }
}
