use std::{collections::HashMap, num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    api::CreateLinkPayload,
    create_link_service::{CreateLinkError, CreateLinkService, LinkCreationStatus},
    link::Link,
};

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A link request as read from the input stream, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MessagePosition {
    topic: String,
    partition: i32,
    offset: i64,
}

impl RawMessage {
    fn position(&self) -> MessagePosition {
        MessagePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// The input stream; owned exclusively by a single [`LinkIngestor`].
#[async_trait]
pub trait LinkRequestConsumer: Send {
    /// Suspends until the next message is available.
    async fn fetch_next(&mut self) -> anyhow::Result<RawMessage>;

    /// Marks `message` as durably applied so it is not delivered again.
    async fn commit(&mut self, message: &RawMessage) -> anyhow::Result<()>;

    /// Repositions the stream so `message` is delivered again by the next fetch.
    async fn rewind(&mut self, message: &RawMessage) -> anyhow::Result<()>;
}

/// Destination for messages that keep failing.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn route(&self, message: &RawMessage, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed link request: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to create link: {0}")]
    Create(#[from] CreateLinkError),
}

struct DeadLetterPolicy {
    sink: Arc<dyn DeadLetterSink>,
    max_delivery_attempts: NonZeroU32,
}

/// Applies link requests from a [`LinkRequestConsumer`] through the [`CreateLinkService`].
///
/// Delivery is at-least-once: a message is committed only after its link exists,
/// and every failure rewinds the stream to it for redelivery. Without a dead letter
/// sink a message that never succeeds is retried forever.
pub struct LinkIngestor<C> {
    consumer: C,
    create_service: Arc<dyn CreateLinkService>,
    dead_letter: Option<DeadLetterPolicy>,
    delivery_attempts: HashMap<MessagePosition, u32>,
}

impl<C: LinkRequestConsumer> LinkIngestor<C> {
    pub fn new(consumer: C, create_service: Arc<dyn CreateLinkService>) -> Self {
        Self {
            consumer,
            create_service,
            dead_letter: None,
            delivery_attempts: HashMap::new(),
        }
    }

    /// Routes a message to `sink` and commits it once it has failed
    /// `max_delivery_attempts` times.
    #[must_use]
    pub fn with_dead_letter(
        mut self,
        sink: Arc<dyn DeadLetterSink>,
        max_delivery_attempts: NonZeroU32,
    ) -> Self {
        self.dead_letter = Some(DeadLetterPolicy {
            sink,
            max_delivery_attempts,
        });
        self
    }

    /// Runs until `cancel` fires. Per-message failures never end the loop.
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Link ingestor started");

        while !cancel.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                fetched = self.consumer.fetch_next() => fetched,
            };

            match fetched {
                Ok(message) => self.handle(&cancel, &message).await,
                Err(err) => {
                    error!(?err, "Failed to fetch link request");
                    back_off(&cancel).await;
                }
            }
        }

        info!("Link ingestor stopped");
    }

    #[instrument(skip_all, fields(topic = message.topic, partition = message.partition, offset = message.offset))]
    async fn handle(&mut self, cancel: &CancellationToken, message: &RawMessage) {
        match apply(self.create_service.as_ref(), cancel, message).await {
            Ok((link, status)) => {
                info!(alias = link.alias, ?status, "Applied link request");
                self.commit(message).await;
            }
            Err(IngestError::Create(CreateLinkError::Cancelled(_))) => {
                debug!("Shutting down mid-request; leaving message uncommitted");
                self.rewind(message).await;
            }
            Err(err) => {
                error!(?err, "Failed to apply link request; leaving message uncommitted");
                if !self.dead_letter_if_exhausted(message, &err).await {
                    self.rewind(message).await;
                    back_off(cancel).await;
                }
            }
        }
    }

    /// Returns whether `message` was dead lettered and committed.
    async fn dead_letter_if_exhausted(&mut self, message: &RawMessage, err: &IngestError) -> bool {
        let Some(DeadLetterPolicy {
            sink,
            max_delivery_attempts,
        }) = &self.dead_letter
        else {
            return false;
        };
        let sink = Arc::clone(sink);
        let max_delivery_attempts = max_delivery_attempts.get();

        let attempts = self
            .delivery_attempts
            .entry(message.position())
            .or_insert(0);
        *attempts += 1;
        if *attempts < max_delivery_attempts {
            return false;
        }

        match sink.route(message, &err.to_string()).await {
            Ok(()) => {
                warn!(max_delivery_attempts, "Routed link request to dead letter sink");
                self.commit(message).await;
                true
            }
            Err(route_err) => {
                error!(?route_err, "Failed to route link request to dead letter sink");
                false
            }
        }
    }

    async fn commit(&mut self, message: &RawMessage) {
        // NOTE: committing an offset acknowledges everything before it on the partition
        self.delivery_attempts.retain(|position, _| {
            position.topic != message.topic
                || position.partition != message.partition
                || position.offset > message.offset
        });

        if let Err(err) = self.consumer.commit(message).await {
            error!(?err, "Failed to commit link request; it may be redelivered");
        }
    }

    async fn rewind(&mut self, message: &RawMessage) {
        if let Err(err) = self.consumer.rewind(message).await {
            error!(?err, "Failed to rewind to link request; it may be skipped until a rebalance");
        }
    }
}

async fn back_off(cancel: &CancellationToken) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(RETRY_DELAY) => {}
    }
}

async fn apply(
    create_service: &dyn CreateLinkService,
    cancel: &CancellationToken,
    message: &RawMessage,
) -> Result<(Link, LinkCreationStatus), IngestError> {
    let CreateLinkPayload { url } = serde_json::from_slice(&message.payload)?;
    // NOTE: AlreadyExists is a success here, so replaying a request is harmless
    Ok(create_service.create_link(cancel, &url).await?)
}
