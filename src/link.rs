use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// How long a newly created [`Link`] is advertised as valid.
pub const LINK_TTL: Duration = Duration::hours(24);

/// Length of an alias: unpadded base64 of 16 bytes.
pub const ALIAS_LEN: usize = 22;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: Uuid,
    pub url: String,
    pub alias: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expired_at: OffsetDateTime,
}

impl Link {
    /// Builds a fresh [`Link`] for `url` that expires [`LINK_TTL`] after `now`.
    #[must_use]
    pub fn new(LinkIdentity { id, alias }: LinkIdentity, url: String, now: OffsetDateTime) -> Self {
        Self {
            id,
            url,
            alias,
            expired_at: truncate_to_micros(now + LINK_TTL),
        }
    }
}

// NOTE: Postgres keeps microseconds, so anything finer would not survive a round trip
fn truncate_to_micros(timestamp: OffsetDateTime) -> OffsetDateTime {
    timestamp - Duration::nanoseconds(i64::from(timestamp.nanosecond() % 1_000))
}

/// The `(id, alias)` pair of a [`Link`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkIdentity {
    pub id: Uuid,
    pub alias: String,
}

impl LinkIdentity {
    pub fn generate(rng: &mut impl Rng) -> Self {
        let mut bytes = [0; 16];
        rng.fill_bytes(&mut bytes);
        Self::from_random_bytes(bytes)
    }

    #[must_use]
    pub fn from_random_bytes(bytes: [u8; 16]) -> Self {
        let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
        let alias = URL_SAFE_NO_PAD.encode(id.as_bytes());
        Self { id, alias }
    }
}
