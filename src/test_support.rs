//! Doubles shared by the unit tests.
#![allow(clippy::unwrap_used)]

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use mockall::mock;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    create_link_service::{CreateLinkError, CreateLinkService, LinkCreationStatus},
    link::{Link, LinkIdentity},
    link_cache::LinkCache,
    link_publisher::LinkEventPublisher,
    link_repo::{InsertLinkError, LinkQuery, LinkRepository},
};

mock! {
    pub LinkRepository {}

    #[async_trait]
    impl LinkRepository for LinkRepository {
        async fn find_link(&self, query: LinkQuery) -> anyhow::Result<Option<Link>>;
        async fn insert_link(&self, link: Link) -> Result<(), InsertLinkError>;
    }
}

mock! {
    pub LinkCache {}

    #[async_trait]
    impl LinkCache for LinkCache {
        async fn get_link(&self, alias: &str) -> anyhow::Result<Option<Link>>;
        async fn put_link(&self, link: &Link) -> anyhow::Result<()>;
    }
}

mock! {
    pub LinkEventPublisher {}

    #[async_trait]
    impl LinkEventPublisher for LinkEventPublisher {
        async fn publish_link(&self, link: &Link) -> anyhow::Result<()>;
    }
}

mock! {
    pub CreateLinkService {}

    #[async_trait]
    impl CreateLinkService for CreateLinkService {
        async fn create_link(
            &self,
            cancel: &CancellationToken,
            url: &str,
        ) -> Result<(Link, LinkCreationStatus), CreateLinkError>;
    }
}

pub fn new_link(url: &str) -> Link {
    Link::new(
        LinkIdentity::generate(&mut rand::rng()),
        url.to_owned(),
        OffsetDateTime::now_utc(),
    )
}

/// Enforces the same uniqueness rules as the `links` table.
#[derive(Default)]
pub struct InMemoryLinkRepository {
    links: Mutex<Vec<Link>>,
    lookups: AtomicUsize,
}

impl InMemoryLinkRepository {
    pub fn links(&self) -> Vec<Link> {
        self.links.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkRepository for InMemoryLinkRepository {
    async fn find_link(&self, query: LinkQuery) -> anyhow::Result<Option<Link>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let links = self.links.lock().unwrap();
        let found = links.iter().find(|link| match &query {
            LinkQuery::Alias(alias) => &link.alias == alias,
            LinkQuery::Url(url) => &link.url == url,
            LinkQuery::AliasAndUrl { alias, url } => &link.alias == alias && &link.url == url,
        });
        Ok(found.cloned())
    }

    async fn insert_link(&self, link: Link) -> Result<(), InsertLinkError> {
        let mut links = self.links.lock().unwrap();
        if links
            .iter()
            .any(|existing| existing.url == link.url || existing.alias == link.alias)
        {
            return Err(InsertLinkError::Conflict);
        }
        links.push(link);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLinkCache {
    links: Mutex<HashMap<String, Link>>,
    lookups: AtomicUsize,
}

impl InMemoryLinkCache {
    pub fn get(&self, alias: &str) -> Option<Link> {
        self.links.lock().unwrap().get(alias).cloned()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkCache for InMemoryLinkCache {
    async fn get_link(&self, alias: &str) -> anyhow::Result<Option<Link>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(alias))
    }

    async fn put_link(&self, link: &Link) -> anyhow::Result<()> {
        self.links
            .lock()
            .unwrap()
            .insert(link.alias.clone(), link.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLinkPublisher {
    published: Mutex<Vec<Link>>,
}

impl RecordingLinkPublisher {
    pub fn published(&self) -> Vec<Link> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkEventPublisher for RecordingLinkPublisher {
    async fn publish_link(&self, link: &Link) -> anyhow::Result<()> {
        self.published.lock().unwrap().push(link.clone());
        Ok(())
    }
}
