use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::{
    cancellation::{Cancelled, until_cancelled},
    link::Link,
    link_cache::{LinkCache, link_cache_capsule},
    link_repo::{LinkQuery, LinkRepository, link_repository_capsule},
};

pub fn fetch_link_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn FetchLinkService> {
    let link_repo = Arc::clone(get.as_ref(link_repository_capsule));
    let link_cache = Arc::clone(get.as_ref(link_cache_capsule));
    Arc::new(FetchLinkServiceImpl::new(link_repo, link_cache))
}

#[derive(Debug, Error)]
pub enum FetchLinkError {
    #[error("alias must not be empty")]
    InputValidation,
    #[error("link not found")]
    NotFound,
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("failed to read link: {0}")]
    Persist(anyhow::Error),
}

#[async_trait]
pub trait FetchLinkService: Send + Sync {
    /// Resolves `alias` through the cache, falling back to the store and
    /// backfilling the cache on a miss.
    ///
    /// Cache failures never fail the call; the store is always consulted instead.
    async fn fetch_link(&self, cancel: &CancellationToken, alias: &str)
    -> Result<Link, FetchLinkError>;
}

pub(crate) struct FetchLinkServiceImpl {
    link_repo: Arc<dyn LinkRepository>,
    link_cache: Arc<dyn LinkCache>,
}

impl FetchLinkServiceImpl {
    pub(crate) fn new(link_repo: Arc<dyn LinkRepository>, link_cache: Arc<dyn LinkCache>) -> Self {
        Self {
            link_repo,
            link_cache,
        }
    }
}

#[async_trait]
impl FetchLinkService for FetchLinkServiceImpl {
    #[instrument(skip(self, cancel))]
    async fn fetch_link(
        &self,
        cancel: &CancellationToken,
        alias: &str,
    ) -> Result<Link, FetchLinkError> {
        if alias.is_empty() {
            return Err(FetchLinkError::InputValidation);
        }

        match until_cancelled(cancel, self.link_cache.get_link(alias)).await? {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(err) => warn!(?err, "Link cache lookup failed; falling back to store"),
        }

        let link = until_cancelled(cancel, self.link_repo.find_link(LinkQuery::Alias(alias.to_owned())))
            .await?
            .map_err(FetchLinkError::Persist)?
            .ok_or(FetchLinkError::NotFound)?;

        if let Err(err) = until_cancelled(cancel, self.link_cache.put_link(&link)).await? {
            warn!(?err, "Failed to backfill link cache");
        }

        Ok(link)
    }
}
