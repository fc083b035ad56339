//! HTTP surface of the gateway.
//!
//! `/health` is public. Every other route requires a bearer session token
//! belonging to a registered agent and passes through the rate limiter.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::{AuthError, SandboxError};
use crate::gateway::{AiRequest, Gateway};
use crate::session_auth::{Capability, SessionClaims, extract_bearer_token};

const MAX_IN_FLIGHT: usize = 256;

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

/// Wire mapping of gateway errors.
pub struct GatewayError(pub SandboxError);

impl From<SandboxError> for GatewayError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::Auth(AuthError::Mismatch(_) | AuthError::Forbidden(_)) => {
            StatusCode::FORBIDDEN
        }
        SandboxError::Auth(_) => StatusCode::UNAUTHORIZED,
        SandboxError::Budget { .. } => StatusCode::PAYMENT_REQUIRED,
        SandboxError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::Validation(_) => StatusCode::BAD_REQUEST,
        SandboxError::Backend(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = api_error(status_for(&self.0), self.0.to_string());
        if let SandboxError::RateLimited { retry_after_secs } = self.0 {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

/// Caller identity attached by [`require_session`].
#[derive(Clone)]
pub struct AuthedAgent {
    pub claims: SessionClaims,
    pub token: String,
}

async fn require_session(
    State(gateway): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_string)
    else {
        return api_error(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    let claims = match gateway.authenticate(&token) {
        Ok(claims) => claims,
        Err(err) => return GatewayError(err).into_response(),
    };

    req.extensions_mut().insert(AuthedAgent { claims, token });
    next.run(req).await
}

/// Rate limit for authenticated routes that never reach the model. AI calls
/// take their slot during gateway admission instead.
async fn rate_limited(State(gateway): State<Arc<Gateway>>, req: Request, next: Next) -> Response {
    let Some(agent) = req.extensions().get::<AuthedAgent>() else {
        return api_error(StatusCode::UNAUTHORIZED, "missing bearer token");
    };
    if let Err(err) = gateway.check_rate(&agent.claims) {
        return GatewayError(err).into_response();
    }
    next.run(req).await
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.health())
}

async fn ai_request(
    State(gateway): State<Arc<Gateway>>,
    Extension(agent): Extension<AuthedAgent>,
    Json(body): Json<AiRequest>,
) -> Result<Response, GatewayError> {
    let response = gateway
        .make_ai_request(&agent.claims.agent_id, &agent.token, body)
        .await?;
    Ok(Json(response).into_response())
}

async fn ai_stream(
    State(gateway): State<Arc<Gateway>>,
    Extension(agent): Extension<AuthedAgent>,
    Json(body): Json<AiRequest>,
) -> Result<Response, GatewayError> {
    let chunks = gateway
        .make_streaming_ai_request(&agent.claims.agent_id, &agent.token, body)
        .await?;
    let lines = chunks.map(|chunk| {
        let mut line = serde_json::to_string(&chunk)
            .unwrap_or_else(|e| format!(r#"{{"type":"error","error":"encode failed: {e}"}}"#));
        line.push('\n');
        Ok::<_, Infallible>(line)
    });

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))
}

async fn agent_status(
    State(gateway): State<Arc<Gateway>>,
    Extension(agent): Extension<AuthedAgent>,
    Path(agent_id): Path<String>,
) -> Result<Response, GatewayError> {
    if agent.claims.agent_id != agent_id {
        return Err(SandboxError::from(AuthError::Forbidden(
            "cannot read another agent's status".into(),
        ))
        .into());
    }
    Ok(Json(gateway.agent_status(&agent_id)?).into_response())
}

async fn usage_stats(
    State(gateway): State<Arc<Gateway>>,
    Extension(agent): Extension<AuthedAgent>,
) -> Result<Response, GatewayError> {
    if !agent.claims.has_capability(Capability::StatusRead) {
        return Err(SandboxError::from(AuthError::Forbidden(
            "token lacks the status_read capability".into(),
        ))
        .into());
    }
    Ok(Json(gateway.usage_stats()).into_response())
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    let request_timeout = gateway.config().request_timeout;

    let reads = Router::new()
        .route("/api/agent/{agent_id}/status", get(agent_status))
        .route("/api/usage/stats", get(usage_stats))
        .route_layer(middleware::from_fn_with_state(gateway.clone(), rate_limited));

    let authed = Router::new()
        .route(
            "/api/ai/request",
            post(ai_request).layer(TimeoutLayer::new(request_timeout)),
        )
        .route("/api/ai/stream", post(ai_stream))
        .merge(reads)
        .route_layer(middleware::from_fn_with_state(
            gateway.clone(),
            require_session,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::backend::{BackendEvent, MockBackend, MockReply};
    use crate::events::EventBus;
    use crate::gateway::GatewayConfig;
    use crate::metrics::RuntimeMetrics;
    use crate::session_auth::{MintRequest, TokenManager, TokenManagerConfig};

    struct Harness {
        gateway: Arc<Gateway>,
        tokens: Arc<TokenManager>,
    }

    impl Harness {
        fn new(backend: MockBackend) -> Self {
            let tokens = Arc::new(
                TokenManager::new(TokenManagerConfig::default(), EventBus::new()).unwrap(),
            );
            let gateway = Arc::new(Gateway::new(
                GatewayConfig::default(),
                tokens.clone(),
                Arc::new(backend),
                Arc::new(RuntimeMetrics::new()),
                EventBus::new(),
            ));
            Self { gateway, tokens }
        }

        fn register(&self, agent_id: &str, capabilities: Vec<Capability>, rpm: u32) -> String {
            let minted = self
                .tokens
                .mint(MintRequest {
                    agent_id: agent_id.into(),
                    budget: 10_000,
                    capabilities,
                    ttl: Duration::from_secs(600),
                    max_requests_per_minute: rpm,
                    allowed_models: vec![],
                    max_tokens_per_request: 2000,
                })
                .unwrap();
            self.gateway.register_agent(agent_id, &minted.token).unwrap();
            minted.token
        }

        fn app(&self) -> Router {
            router(self.gateway.clone())
        }
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_authed(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = Harness::new(MockBackend::new());
        let response = h
            .app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["activeAgents"], 0);
    }

    #[tokio::test]
    async fn ai_request_requires_token() {
        let h = Harness::new(MockBackend::new());
        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/ai/request")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response.into_body()).await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn ai_request_returns_result() {
        let h = Harness::new(MockBackend::text("hello there", 42));
        let token = h.register("agent-a", vec![Capability::AiRequest], 10);

        let response = h
            .app()
            .oneshot(post_json(
                "/api/ai/request",
                &token,
                serde_json::json!({ "prompt": "say hi", "maxTokens": 100 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["result"], "hello there");
        assert_eq!(json["tokenUsage"], 42);
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn missing_capability_is_forbidden() {
        let h = Harness::new(MockBackend::new());
        let token = h.register("agent-a", vec![Capability::AiStream], 10);

        let response = h
            .app()
            .oneshot(post_json(
                "/api/ai/request",
                &token,
                serde_json::json!({ "prompt": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unregistered_token_is_forbidden() {
        let h = Harness::new(MockBackend::new());
        let minted = h
            .tokens
            .mint(MintRequest {
                agent_id: "ghost".into(),
                budget: 10,
                capabilities: Capability::ALL.to_vec(),
                ttl: Duration::from_secs(60),
                max_requests_per_minute: 10,
                allowed_models: vec![],
                max_tokens_per_request: 10,
            })
            .unwrap();

        let response = h
            .app()
            .oneshot(get_authed("/api/agent/ghost/status", &minted.token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after() {
        let h = Harness::new(MockBackend::text("x", 1));
        let token = h.register("agent-a", vec![Capability::AiRequest], 1);
        let ask = || serde_json::json!({ "prompt": "hi", "maxTokens": 10 });

        let first = h
            .app()
            .oneshot(post_json("/api/ai/request", &token, ask()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = h
            .app()
            .oneshot(post_json("/api/ai/request", &token, ask()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));

        // Reads share the agent's window.
        let status = h
            .app()
            .oneshot(get_authed("/api/agent/agent-a/status", &token))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn status_reads_are_rate_limited() {
        let h = Harness::new(MockBackend::text("x", 1));
        let token = h.register("agent-a", vec![Capability::AiRequest], 1);

        let first = h
            .app()
            .oneshot(get_authed("/api/agent/agent-a/status", &token))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = h
            .app()
            .oneshot(get_authed("/api/agent/agent-a/status", &token))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
        // The refused read never reached the model.
        assert_eq!(h.gateway.session("agent-a").unwrap().request_count, 0);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_payment_required() {
        let h = Harness::new(MockBackend::text("x", 1));
        let token = h.register("agent-a", vec![Capability::AiRequest], 10);

        let response = h
            .app()
            .oneshot(post_json(
                "/api/ai/request",
                &token,
                serde_json::json!({ "prompt": "hi", "maxTokens": 1_000_000 }),
            ))
            .await
            .unwrap();
        // maxTokens is capped at the per-request limit, which fits the budget.
        assert_eq!(response.status(), StatusCode::OK);

        let minted = h
            .tokens
            .mint(MintRequest {
                agent_id: "agent-b".into(),
                budget: 5,
                capabilities: vec![Capability::AiRequest],
                ttl: Duration::from_secs(60),
                max_requests_per_minute: 10,
                allowed_models: vec![],
                max_tokens_per_request: 0,
            })
            .unwrap();
        h.gateway.register_agent("agent-b", &minted.token).unwrap();
        let response = h
            .app()
            .oneshot(post_json(
                "/api/ai/request",
                &minted.token,
                serde_json::json!({ "prompt": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn status_of_other_agent_is_forbidden() {
        let h = Harness::new(MockBackend::new());
        let token = h.register("agent-a", vec![Capability::StatusRead], 10);
        h.register("agent-b", vec![Capability::StatusRead], 10);

        let response = h
            .app()
            .oneshot(get_authed("/api/agent/agent-b/status", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn usage_stats_needs_status_read() {
        let h = Harness::new(MockBackend::new());
        let reader = h.register("agent-a", vec![Capability::StatusRead], 10);
        let writer = h.register("agent-b", vec![Capability::AiRequest], 10);

        let ok = h
            .app()
            .oneshot(get_authed("/api/usage/stats", &reader))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let json = body_json(ok.into_body()).await;
        assert_eq!(json["totalAgents"], 2);

        let denied = h
            .app()
            .oneshot(get_authed("/api/usage/stats", &writer))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn stream_is_ndjson() {
        let h = Harness::new(MockBackend::new().with_reply(MockReply::Stream(vec![
            BackendEvent::Content { text: "a".into() },
            BackendEvent::Content { text: "b".into() },
            BackendEvent::Usage { units: 7 },
        ])));
        let token = h.register("agent-a", vec![Capability::AiStream], 10);

        let response = h
            .app()
            .oneshot(post_json(
                "/api/ai/stream",
                &token,
                serde_json::json!({ "prompt": "stream please" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let kinds: Vec<&str> = lines.iter().map(|l| l["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["content", "content", "usage", "complete"]);
        assert_eq!(lines[1]["accumulated"], "ab");
        assert_eq!(lines[3]["tokenUsage"], 7);
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&AuthError::Expired.into()),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&AuthError::Mismatch("x".into()).into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&SandboxError::Backend("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&SandboxError::Docker("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
