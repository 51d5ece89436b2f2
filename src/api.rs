use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::link::Link;

/// Body of a link creation request, over HTTP or from the input topic.
#[derive(Debug, Deserialize)]
pub struct CreateLinkPayload {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct LinkView {
    pub url: String,
    pub alias: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expired_at: OffsetDateTime,
}

impl From<Link> for LinkView {
    fn from(
        Link {
            url,
            alias,
            expired_at,
            ..
        }: Link,
    ) -> Self {
        Self {
            url,
            alias,
            expired_at,
        }
    }
}

#[derive(Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
}
