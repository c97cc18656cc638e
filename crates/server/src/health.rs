use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use greeter_core::config::TransportMode;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    mode: TransportMode,
    handler_count: usize,
}

impl HealthState {
    pub fn new(mode: TransportMode, handler_count: usize) -> Self {
        Self { mode, handler_count }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub dispatcher: HealthCheck,
    pub transport_mode: &'static str,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let dispatcher = dispatcher_check(state.handler_count);
    let ready = dispatcher.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "greeter-server runtime initialized".to_string(),
        },
        dispatcher,
        transport_mode: state.mode.as_str(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn dispatcher_check(handler_count: usize) -> HealthCheck {
    if handler_count == 0 {
        HealthCheck { status: "degraded", detail: "no handlers registered".to_string() }
    } else {
        HealthCheck { status: "ready", detail: format!("{handler_count} handlers registered") }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        extract::State,
        http::{Request, StatusCode},
        Json,
    };
    use greeter_core::config::TransportMode;
    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};

    #[tokio::test]
    async fn health_returns_ready_with_registered_handlers() {
        let (status, Json(payload)) =
            health(State(HealthState::new(TransportMode::Session, 4))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.dispatcher.detail, "4 handlers registered");
        assert_eq!(payload.transport_mode, "session");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_with_empty_table() {
        let (status, Json(payload)) =
            health(State(HealthState::new(TransportMode::Listener, 0))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.dispatcher.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_route_is_mounted() {
        let response = router(HealthState::new(TransportMode::Listener, 4))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
