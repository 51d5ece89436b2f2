use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    routing,
};
use link_shortener::{
    api::{CreateLinkPayload, Error, LinkView},
    config,
    create_link_service::{CreateLinkError, LinkCreationStatus, create_link_service_capsule},
    fetch_link_service::{FetchLinkError, fetch_link_service_capsule},
    kafka_ingest::{KafkaDeadLetterSink, KafkaLinkRequestConsumer},
    link_ingestor::LinkIngestor,
};
use rearch::Container;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;
    let shutdown = container.read(config::shutdown_token_capsule);

    let link_ingestor = build_link_ingestor(&container)?;
    let ingestor_task = tokio::spawn(link_ingestor.run(shutdown.clone()));

    let app = Router::new()
        .route("/api/shortener/v1/link", routing::post(create_link))
        .route("/api/shortener/v1/link/{alias}", routing::get(fetch_link))
        .route(
            "/api/shortener/v1/link/{alias}/redirect",
            routing::get(redirect_link),
        )
        .with_state(container.clone());

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    ingestor_task.await?;
    info!("Shut down cleanly");
    Ok(())
}

fn build_link_ingestor(
    container: &Container,
) -> anyhow::Result<LinkIngestor<KafkaLinkRequestConsumer>> {
    let (kafka_config, create_link_service, producer) = container.read((
        config::kafka_config_capsule,
        create_link_service_capsule,
        config::kafka_producer_capsule,
    ));

    let link_ingestor = LinkIngestor::new(
        KafkaLinkRequestConsumer::new(&kafka_config)?,
        create_link_service,
    );

    Ok(
        match (
            kafka_config.dead_letter_topic,
            kafka_config.max_delivery_attempts,
        ) {
            (Some(topic), Some(max_delivery_attempts)) => {
                info!(topic, max_delivery_attempts, "Dead lettering enabled");
                link_ingestor.with_dead_letter(
                    Arc::new(KafkaDeadLetterSink::new(producer, topic)),
                    max_delivery_attempts,
                )
            }
            (None, None) => link_ingestor,
            _ => {
                warn!(
                    "Dead lettering needs both KAFKA_DEAD_LETTER_TOPIC and \
                     KAFKA_MAX_DELIVERY_ATTEMPTS; retrying failed requests forever"
                );
                link_ingestor
            }
        },
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl-C; shutting down"),
            Err(err) => {
                error!(?err, "Failed to listen for Ctrl-C");
                shutdown.cancelled().await;
            }
        },
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

fn request_token(container: &Container) -> CancellationToken {
    container.read(config::shutdown_token_capsule).child_token()
}

#[instrument(skip(container))]
async fn create_link(
    State(container): State<Container>,
    payload: Result<Json<CreateLinkPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<LinkView>), (StatusCode, Json<Error>)> {
    let Json(CreateLinkPayload { url }) = payload.map_err(rejection_response)?;
    container
        .read(create_link_service_capsule)
        .create_link(&request_token(&container), &url)
        .await
        .map(|(link, creation_status)| {
            (
                match creation_status {
                    LinkCreationStatus::NewlyCreated => StatusCode::CREATED,
                    LinkCreationStatus::AlreadyExists => StatusCode::FOUND,
                },
                Json(LinkView::from(link)),
            )
        })
        .map_err(|error: CreateLinkError| {
            let err_uuid = Uuid::new_v4();
            let status = match error {
                CreateLinkError::InputValidation => {
                    info!(?err_uuid, ?error, "User submitted a bad request");
                    StatusCode::BAD_REQUEST
                }
                CreateLinkError::Cancelled(_) => {
                    info!(?err_uuid, ?error, "Request cancelled by shutdown");
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CreateLinkError::Persist(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error_response(status, &error, err_uuid)
        })
}

#[instrument(skip(container))]
async fn fetch_link(
    State(container): State<Container>,
    Path(alias): Path<String>,
) -> impl IntoResponse {
    container
        .read(fetch_link_service_capsule)
        .fetch_link(&request_token(&container), &alias)
        .await
        .map(|link| Json(LinkView::from(link)))
        .map_err(fetch_error_response)
}

#[instrument(skip(container))]
async fn redirect_link(
    State(container): State<Container>,
    Path(alias): Path<String>,
) -> impl IntoResponse {
    container
        .read(fetch_link_service_capsule)
        .fetch_link(&request_token(&container), &alias)
        .await
        .map(|link| Redirect::temporary(&link.url))
        .map_err(fetch_error_response)
}

fn rejection_response(rejection: JsonRejection) -> (StatusCode, Json<Error>) {
    let err_uuid = Uuid::new_v4();
    info!(?err_uuid, ?rejection, "User submitted a malformed request body");
    error_response(rejection.status(), &rejection, err_uuid)
}

fn fetch_error_response(error: FetchLinkError) -> (StatusCode, Json<Error>) {
    let err_uuid = Uuid::new_v4();
    let status = match error {
        FetchLinkError::NotFound => StatusCode::NOT_FOUND,
        FetchLinkError::InputValidation => {
            info!(?err_uuid, ?error, "User submitted a bad request");
            StatusCode::BAD_REQUEST
        }
        FetchLinkError::Cancelled(_) => {
            info!(?err_uuid, ?error, "Request cancelled by shutdown");
            StatusCode::SERVICE_UNAVAILABLE
        }
        FetchLinkError::Persist(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, &error, err_uuid)
}

fn error_response(
    status: StatusCode,
    error: &impl std::error::Error,
    err_uuid: Uuid,
) -> (StatusCode, Json<Error>) {
    let message = if status.is_server_error() {
        "Internal server error".to_owned()
    } else {
        error.to_string()
    };
    (
        status,
        Json(Error {
            error: message,
            error_id: err_uuid.to_string(),
        }),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::{body::Body, extract::FromRequest, http::Request};

    use super::*;

    async fn rejection_for(body: &'static str) -> JsonRejection {
        let request = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        Json::<CreateLinkPayload>::from_request(request, &())
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_malformed_json_gets_error_body() {
        let (status, Json(body)) = rejection_response(rejection_for("{not json").await);

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.error.is_empty());
        assert!(Uuid::parse_str(&body.error_id).is_ok());
    }

    #[tokio::test]
    async fn test_missing_url_gets_error_body() {
        let (status, Json(body)) = rejection_response(rejection_for(r#"{"link": "x"}"#).await);

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.error.contains("url"));
        assert!(Uuid::parse_str(&body.error_id).is_ok());
    }
}
