use std::{
    env::{self, VarError},
    num::NonZeroU32,
};

use rdkafka::producer::FutureProducer;
use rearch::{CData, CapsuleHandle, Container};
use redis::aio::ConnectionManager;
use sea_orm::{ConnectOptions, Database, DbConn};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::link_publisher::create_kafka_producer;

/// # Errors
/// Will return [`Err`] if connecting to the database, redis, or kafka fails.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));
    info!(?db_connection_options, "Connecting to database");
    set_db_conn(Database::connect(db_connection_options).await?);

    let (redis_url, set_redis_conn) = container.read((redis_url_capsule, redis_conn_init_action));
    info!("Connecting to redis");
    let redis_client = redis::Client::open(redis_url)?;
    set_redis_conn(redis_client.get_connection_manager().await?);

    let (kafka_config, set_kafka_producer) =
        container.read((kafka_config_capsule, kafka_producer_init_action));
    info!(brokers = kafka_config.brokers, "Creating kafka producer");
    set_kafka_producer(create_kafka_producer(&kafka_config)?);

    info!("Container initialized");
    Ok(container)
}

fn required_env_var(name: &str) -> String {
    env::var(name).unwrap_or_else(|err| match err {
        VarError::NotPresent => panic!("{name} is not set"),
        VarError::NotUnicode(actual) => {
            panic!("{name} is invalid unicode: {}", actual.display());
        }
    })
}

fn optional_env_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => Some(value),
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} is invalid unicode: {}", actual.display());
        }
    }
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    required_env_var("DB_URL").into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn redis_url_capsule(_: CapsuleHandle) -> String {
    required_env_var("REDIS_URL")
}

fn redis_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (
    Option<ConnectionManager>,
    impl use<> + CData + Fn(Option<ConnectionManager>),
) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn redis_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(ConnectionManager) {
    let set_redis_conn = get.as_ref(redis_conn_manager).1.clone();
    move |conn| set_redis_conn(Some(conn))
}

/// # Panics
/// Panics when the [`ConnectionManager`] was not set via [`redis_conn_init_action`].
pub fn redis_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> ConnectionManager {
    let redis_conn = get.as_ref(redis_conn_manager).0.clone();
    redis_conn.expect("ConnectionManager should've been set via redis_conn_init_action!")
}

#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub brokers: String,
    /// Topic carrying `{"url": ...}` link creation requests.
    pub input_topic: String,
    /// Topic that receives an event per newly created link.
    pub output_topic: String,
    pub consumer_group: String,
    pub dead_letter_topic: Option<String>,
    pub max_delivery_attempts: Option<NonZeroU32>,
}

/// # Panics
/// Panics when a required environment variable is not set or any is invalid.
#[must_use]
pub fn kafka_config_capsule(_: CapsuleHandle) -> KafkaConfig {
    const MAX_ATTEMPTS_VAR: &str = "KAFKA_MAX_DELIVERY_ATTEMPTS";

    let max_delivery_attempts = optional_env_var(MAX_ATTEMPTS_VAR).map(|raw| {
        raw.parse::<NonZeroU32>()
            .unwrap_or_else(|err| panic!("{MAX_ATTEMPTS_VAR} is invalid ({raw}): {err}"))
    });

    KafkaConfig {
        brokers: required_env_var("KAFKA_BROKERS"),
        input_topic: required_env_var("KAFKA_INPUT_TOPIC"),
        output_topic: required_env_var("KAFKA_OUTPUT_TOPIC"),
        consumer_group: required_env_var("KAFKA_GROUP"),
        dead_letter_topic: optional_env_var("KAFKA_DEAD_LETTER_TOPIC"),
        max_delivery_attempts,
    }
}

fn kafka_producer_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (
    Option<FutureProducer>,
    impl use<> + CData + Fn(Option<FutureProducer>),
) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn kafka_producer_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(FutureProducer) {
    let set_producer = get.as_ref(kafka_producer_manager).1.clone();
    move |producer| set_producer(Some(producer))
}

/// # Panics
/// Panics when the [`FutureProducer`] was not set via [`kafka_producer_init_action`].
pub fn kafka_producer_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> FutureProducer {
    let producer = get.as_ref(kafka_producer_manager).0.clone();
    producer.expect("FutureProducer should've been set via kafka_producer_init_action!")
}

/// Cancelled once the process starts shutting down.
pub fn shutdown_token_capsule(_: CapsuleHandle) -> CancellationToken {
    CancellationToken::new()
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    const ENV_VAR_NAME: &str = "ADDR";
    const DEFAULT_ADDR: &str = "127.0.0.1:0";

    match optional_env_var(ENV_VAR_NAME) {
        Some(addr) => {
            info!(addr, "{ENV_VAR_NAME} environment variable set");
            addr
        }
        None => {
            warn!(
                addr = DEFAULT_ADDR,
                "{ENV_VAR_NAME} environment variable not set; defaulting to {DEFAULT_ADDR}"
            );
            DEFAULT_ADDR.to_owned()
        }
    }
}
