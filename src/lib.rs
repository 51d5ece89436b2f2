pub mod api;
pub mod cancellation;
pub mod config;
pub mod create_link_service;
pub mod fetch_link_service;
pub mod kafka_ingest;
pub mod link;
pub mod link_cache;
pub mod link_ingestor;
pub mod link_publisher;
pub mod link_repo;
mod orm;

#[cfg(test)]
mod test_support;
