use std::{collections::HashMap, future::IntoFuture, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    events::DispatchError,
    ingest::{self, Inbound, IngestError},
    pipeline::{Admitted, EventPipeline, PipelineError},
    signature::{SignatureVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};

pub const EVENTS_PATH: &str = "/slack/events";

#[derive(Clone)]
pub struct ListenerState {
    pipeline: Arc<EventPipeline>,
    verifier: Arc<SignatureVerifier>,
}

impl ListenerState {
    pub fn new(pipeline: Arc<EventPipeline>, verifier: SignatureVerifier) -> Self {
        Self { pipeline, verifier: Arc::new(verifier) }
    }
}

pub fn router(state: ListenerState) -> Router {
    Router::new().route(EVENTS_PATH, post(slack_events)).with_state(state)
}

/// Serves platform requests until `shutdown` fires, then gives in-flight
/// requests `grace` to finish before aborting them.
pub async fn serve(
    listener: TcpListener,
    state: ListenerState,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> std::io::Result<()> {
    let mut graceful = shutdown.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut graceful).await });
    let mut handle = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut handle => return joined.map_err(std::io::Error::other)?,
        () = wait_for_shutdown(&mut shutdown) => {}
    }

    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => joined.map_err(std::io::Error::other)?,
        Err(_) => {
            warn!(
                event_name = "listener.drain_timeout",
                grace_ms = grace.as_millis() as u64,
                "shutdown grace elapsed; aborting in-flight requests"
            );
            handle.abort();
            Ok(())
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub async fn slack_events(
    State(state): State<ListenerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Err(error) = state.verifier.verify(
        header_str(&headers, TIMESTAMP_HEADER),
        header_str(&headers, SIGNATURE_HEADER),
        &body,
        Utc::now().timestamp(),
    ) {
        warn!(
            event_name = "ingress.listener.signature_rejected",
            correlation_id = %correlation_id,
            error = %error,
            "rejected unsigned or mis-signed request"
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let inbound =
        if is_form(&headers) { ingest_form_body(&body) } else { ingest::ingest_bytes(&body) };
    let envelope = match state.pipeline.admit_inbound(inbound, &correlation_id) {
        Ok(Admitted::Challenge(challenge)) => {
            return (StatusCode::OK, Json(serde_json::json!({ "challenge": challenge })))
                .into_response();
        }
        Ok(Admitted::Envelope(envelope)) => envelope,
        Ok(Admitted::Unrecognized) => return StatusCode::OK.into_response(),
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.pipeline.process(envelope).await {
        Ok(outcome) => {
            info!(
                event_name = "ingress.listener.processed",
                correlation_id = %correlation_id,
                outcome = ?outcome,
                "listener event processed"
            );
            StatusCode::OK.into_response()
        }
        Err(error) => status_for(&error).into_response(),
    }
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Malformed(_) => StatusCode::BAD_REQUEST,
        PipelineError::Dispatch(
            DispatchError::HandlerTimeout { .. } | DispatchError::HandlerFailed { .. },
        ) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Ack(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn is_form(headers: &HeaderMap) -> bool {
    header_str(headers, CONTENT_TYPE.as_str())
        .map(|content_type| content_type.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

fn ingest_form_body(body: &[u8]) -> Result<Inbound, IngestError> {
    let fields = url::form_urlencoded::parse(body).into_owned().collect::<HashMap<_, _>>();
    ingest::ingest_form(&fields)
}
