use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use perkbot_core::broadcast::{BroadcastCampaign, BroadcastState, DeliveryCache};
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    cache: Arc<DeliveryCache>,
    campaign: Arc<BroadcastCampaign>,
}

impl HealthState {
    pub fn new(cache: Arc<DeliveryCache>, campaign: Arc<BroadcastCampaign>) -> Self {
        Self { cache, campaign }
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
    pub delivery_cache: HealthCheck,
    pub broadcast_state: BroadcastState,
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
    let entries = state.cache.len();
    let payload = HealthResponse {
        status: "ready",
        service: HealthCheck {
            status: "ready",
            detail: "perkbot-server runtime initialized".to_string(),
        },
        delivery_cache: HealthCheck {
            status: "ready",
            detail: format!("{entries} delivery record(s) held"),
        },
        broadcast_state: state.campaign.state(),
        checked_at: Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(payload))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{body::Body, extract::State, http::Request, http::StatusCode, Json};
    use perkbot_core::broadcast::{
        memory::{InMemoryDirectory, RecordingTransport},
        BroadcastCampaign, BroadcastOrchestrator, BroadcastState, DeliveryCache,
        DirectMessageSender, EnumeratorConfig, OrchestratorConfig, RecipientEnumerator,
        RetryPolicy, SystemClock,
    };
    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};

    fn state() -> HealthState {
        let cache = Arc::new(DeliveryCache::new(Duration::from_secs(3600), Arc::new(SystemClock)));
        let enumerator = RecipientEnumerator::new(
            Arc::new(InMemoryDirectory::new()),
            RetryPolicy::default(),
            EnumeratorConfig::default(),
        );
        let sender = Arc::new(DirectMessageSender::new(
            Arc::new(RecordingTransport::new()),
            RetryPolicy::default(),
        ));
        let orchestrator = Arc::new(BroadcastOrchestrator::new(
            enumerator,
            sender,
            cache.clone(),
            OrchestratorConfig::default(),
        ));
        HealthState::new(cache, Arc::new(BroadcastCampaign::new(orchestrator)))
    }

    #[tokio::test]
    async fn health_reports_cache_size_and_campaign_state() {
        let state = state();
        state.cache.mark_sent("U1", "welcome");

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.delivery_cache.detail, "1 delivery record(s) held");
        assert_eq!(payload.broadcast_state, BroadcastState::Idle);
    }

    #[tokio::test]
    async fn health_route_serves_json() {
        let response = router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("application/json"));
    }
}
