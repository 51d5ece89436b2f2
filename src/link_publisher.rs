use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    ClientConfig,
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use rearch::CapsuleHandle;
use tracing::{debug, instrument};

use crate::{
    config::{KafkaConfig, kafka_config_capsule, kafka_producer_capsule},
    link::Link,
};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub fn link_publisher_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn LinkEventPublisher> {
    let producer = get.as_ref(kafka_producer_capsule).clone();
    let topic = get.as_ref(kafka_config_capsule).output_topic.clone();
    Arc::new(KafkaLinkEventPublisher { producer, topic })
}

/// # Errors
/// Will return [`Err`] if librdkafka rejects the configuration.
pub fn create_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string());

    debug!(?client_config, "rdkafka producer configuration");
    client_config.create()
}

/// Announces newly created links to downstream consumers.
#[async_trait]
pub trait LinkEventPublisher: Send + Sync {
    async fn publish_link(&self, link: &Link) -> anyhow::Result<()>;
}

struct KafkaLinkEventPublisher {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl LinkEventPublisher for KafkaLinkEventPublisher {
    #[instrument(skip(self))]
    async fn publish_link(&self, link: &Link) -> anyhow::Result<()> {
        let record = FutureRecord::to(&self.topic)
            .key(link.alias.as_str())
            .payload(link.url.as_str());

        self.producer
            .send(record, Timeout::After(PUBLISH_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(err, _)| anyhow::Error::from(err).context("Failed to publish link event"))
    }
}
