use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DbConn, EntityTrait, QueryFilter, SqlErr,
};
use thiserror::Error;
use tracing::instrument;

use crate::{config::db_conn_capsule, link::Link, orm::link};

pub fn link_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn LinkRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(LinkRepositoryImpl { db })
}

/// Lookup key for [`LinkRepository::find_link`]; always names at least one column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkQuery {
    Alias(String),
    Url(String),
    /// Matches only when both keys belong to the same link. The workflows look up
    /// by a single key; this is kept for callers checking an alias against its url.
    AliasAndUrl { alias: String, url: String },
}

#[derive(Debug, Error)]
pub enum InsertLinkError {
    #[error("a link with the same alias or url already exists")]
    Conflict,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[async_trait]
pub trait LinkRepository: Send + Sync {
    async fn find_link(&self, query: LinkQuery) -> anyhow::Result<Option<Link>>;

    /// Inserts a new [`Link`], returning [`InsertLinkError::Conflict`] when the
    /// url or alias is already taken.
    async fn insert_link(&self, link: Link) -> Result<(), InsertLinkError>;
}

struct LinkRepositoryImpl {
    db: DbConn,
}

#[async_trait]
impl LinkRepository for LinkRepositoryImpl {
    #[instrument(skip(self))]
    async fn find_link(&self, query: LinkQuery) -> anyhow::Result<Option<Link>> {
        let select = match query {
            LinkQuery::Alias(alias) => link::Entity::find().filter(link::Column::Alias.eq(alias)),
            LinkQuery::Url(url) => link::Entity::find().filter(link::Column::Url.eq(url)),
            LinkQuery::AliasAndUrl { alias, url } => link::Entity::find()
                .filter(link::Column::Alias.eq(alias))
                .filter(link::Column::Url.eq(url)),
        };

        let found = select
            .one(&self.db)
            .await
            .context("Failed to query links table")?;
        Ok(found.map(Link::from))
    }

    #[instrument(skip(self))]
    async fn insert_link(&self, link: Link) -> Result<(), InsertLinkError> {
        let to_insert = link::ActiveModel {
            id: Set(link.id),
            url: Set(link.url),
            alias: Set(link.alias),
            expired_at: Set(link.expired_at),
        };

        match to_insert.insert(&self.db).await {
            Ok(_) => Ok(()),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(InsertLinkError::Conflict)
            }
            Err(err) => Err(InsertLinkError::Internal(
                anyhow::Error::from(err).context("Failed to insert link"),
            )),
        }
    }
}

impl From<link::Model> for Link {
    fn from(
        link::Model {
            id,
            url,
            alias,
            expired_at,
        }: link::Model,
    ) -> Self {
        Self {
            id,
            url,
            alias,
            expired_at,
        }
    }
}
