use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    cancellation::{Cancelled, until_cancelled},
    link::{Link, LinkIdentity},
    link_cache::{LinkCache, link_cache_capsule},
    link_publisher::{LinkEventPublisher, link_publisher_capsule},
    link_repo::{InsertLinkError, LinkQuery, LinkRepository, link_repository_capsule},
};

pub fn create_link_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn CreateLinkService> {
    let link_repo = Arc::clone(get.as_ref(link_repository_capsule));
    let link_cache = Arc::clone(get.as_ref(link_cache_capsule));
    let link_publisher = Arc::clone(get.as_ref(link_publisher_capsule));
    Arc::new(CreateLinkServiceImpl::new(link_repo, link_cache, link_publisher))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkCreationStatus {
    NewlyCreated,
    AlreadyExists,
}

#[derive(Debug, Error)]
pub enum CreateLinkError {
    #[error("url must not be empty")]
    InputValidation,
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("failed to persist link: {0}")]
    Persist(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[async_trait]
pub trait CreateLinkService: Send + Sync {
    /// Returns the existing [`Link`] for `url` with [`LinkCreationStatus::AlreadyExists`],
    /// or persists a new one.
    ///
    /// Once the link is persisted, caching it and publishing its creation event are
    /// best-effort: failures there are logged and do not fail the call.
    async fn create_link(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<(Link, LinkCreationStatus), CreateLinkError>;
}

pub(crate) struct CreateLinkServiceImpl {
    link_repo: Arc<dyn LinkRepository>,
    link_cache: Arc<dyn LinkCache>,
    link_publisher: Arc<dyn LinkEventPublisher>,
}

impl CreateLinkServiceImpl {
    pub(crate) fn new(
        link_repo: Arc<dyn LinkRepository>,
        link_cache: Arc<dyn LinkCache>,
        link_publisher: Arc<dyn LinkEventPublisher>,
    ) -> Self {
        Self {
            link_repo,
            link_cache,
            link_publisher,
        }
    }

    async fn find_conflict_winner(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<(Link, LinkCreationStatus), CreateLinkError> {
        let winner = until_cancelled(cancel, self.link_repo.find_link(LinkQuery::Url(url.to_owned())))
            .await?
            .map_err(|err| {
                CreateLinkError::Persist(err.context("Failed to re-read link after insert conflict"))
            })?;

        match winner {
            Some(winner) => {
                info!(alias = winner.alias, "Concurrent create won the race; returning its link");
                Ok((winner, LinkCreationStatus::AlreadyExists))
            }
            None => Err(CreateLinkError::Persist(anyhow!(
                "Insert conflicted but no link exists for the url"
            ))),
        }
    }
}

#[async_trait]
impl CreateLinkService for CreateLinkServiceImpl {
    #[instrument(skip(self, cancel))]
    async fn create_link(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<(Link, LinkCreationStatus), CreateLinkError> {
        if url.is_empty() {
            return Err(CreateLinkError::InputValidation);
        }

        match until_cancelled(cancel, self.link_repo.find_link(LinkQuery::Url(url.to_owned())))
            .await?
        {
            Ok(Some(existing)) => return Ok((existing, LinkCreationStatus::AlreadyExists)),
            Ok(None) => {}
            // NOTE: the unique index on url still rejects a duplicate insert below
            Err(err) => warn!(?err, "Failed to look up existing link; attempting insert anyway"),
        }

        let link = Link::new(
            LinkIdentity::generate(&mut rand::rng()),
            url.to_owned(),
            OffsetDateTime::now_utc(),
        );

        match until_cancelled(cancel, self.link_repo.insert_link(link.clone())).await? {
            Ok(()) => {}
            Err(InsertLinkError::Conflict) => return self.find_conflict_winner(cancel, url).await,
            Err(InsertLinkError::Internal(err)) => return Err(CreateLinkError::Persist(err)),
        }

        // NOTE: the link is persisted from here on, so cancellation only skips the
        // remaining best-effort steps
        match until_cancelled(cancel, self.link_cache.put_link(&link)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(?err, alias = link.alias, "Failed to cache new link"),
            Err(Cancelled) => return Ok(skipped_after_cancel(link)),
        }

        match until_cancelled(cancel, self.link_publisher.publish_link(&link)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(?err, alias = link.alias, "Failed to publish link creation event"),
            Err(Cancelled) => return Ok(skipped_after_cancel(link)),
        }

        info!(alias = link.alias, "Created link");
        Ok((link, LinkCreationStatus::NewlyCreated))
    }
}

fn skipped_after_cancel(link: Link) -> (Link, LinkCreationStatus) {
    warn!(
        alias = link.alias,
        "Cancelled after persisting link; its cache entry or creation event may be missing"
    );
    (link, LinkCreationStatus::NewlyCreated)
}
