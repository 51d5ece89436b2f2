use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{instrument, trace};

use crate::{config::redis_conn_capsule, link::Link};

/// Cache entries live for an hour, independently of [`Link::expired_at`].
pub const LINK_CACHE_TTL_SECONDS: u64 = 60 * 60;

const KEY_PREFIX: &str = "link:";

pub fn link_cache_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn LinkCache> {
    let conn = get.as_ref(redis_conn_capsule).clone();
    Arc::new(RedisLinkCache { conn })
}

#[async_trait]
pub trait LinkCache: Send + Sync {
    /// Returns `Ok(None)` on a cache miss.
    async fn get_link(&self, alias: &str) -> anyhow::Result<Option<Link>>;

    async fn put_link(&self, link: &Link) -> anyhow::Result<()>;
}

struct RedisLinkCache {
    conn: ConnectionManager,
}

fn cache_key(alias: &str) -> String {
    format!("{KEY_PREFIX}{alias}")
}

#[async_trait]
impl LinkCache for RedisLinkCache {
    #[instrument(skip(self))]
    async fn get_link(&self, alias: &str) -> anyhow::Result<Option<Link>> {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn
            .get(cache_key(alias))
            .await
            .context("Failed to GET link from redis")?;

        trace!(hit = cached.is_some(), "Looked up link in redis");
        cached
            .map(|data| serde_json::from_str(&data).context("Failed to deserialize cached link"))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn put_link(&self, link: &Link) -> anyhow::Result<()> {
        let data = serde_json::to_string(link).context("Failed to serialize link for redis")?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(cache_key(&link.alias), data, LINK_CACHE_TTL_SECONDS)
            .await
            .context("Failed to SET link in redis")
    }
}
