//! API-key proxy between sandboxed agents and the model backend.
//!
//! Sandboxes never see the model credential. They present a session token,
//! the gateway checks it against the [`TokenManager`], the registered
//! session, the model allow-list and the remaining budget, and only then
//! forwards the prompt.
//!
//! Budget is reserved before the backend call and settled afterwards, so
//! concurrent requests for one agent cannot jointly overspend.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::audit::{AuditLog, AuditRecord};
use crate::backend::{BackendEvent, ModelBackend, ModelRequest};
use crate::error::{AuthError, Result, SandboxError};
use crate::events::{EventBus, LifecycleEvent};
use crate::metrics::RuntimeMetrics;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::session_auth::{Capability, SessionClaims, TokenManager};
use crate::util::{env_or, now_ts};

/// Units charged when a request does not say how many it needs.
pub const DEFAULT_MAX_TOKENS: u64 = 1000;
const STREAM_BUFFER: usize = 32;
const RECENT_REQUESTS: usize = 10;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: IpAddr,
    /// 0 picks an ephemeral port.
    pub port: u16,
    /// Host name sandboxes use to reach the gateway.
    pub sandbox_host: String,
    pub model_api_url: String,
    pub model_api_key: Option<String>,
    pub default_model: String,
    pub request_timeout: Duration,
    pub audit_capacity: usize,
    pub rate_window_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8787,
            sandbox_host: "host.docker.internal".to_string(),
            model_api_url: "https://api.anthropic.com".to_string(),
            model_api_key: None,
            default_model: "claude-sonnet-4-20250514".to_string(),
            request_timeout: Duration::from_secs(120),
            audit_capacity: 1000,
            rate_window_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env_or("GATEWAY_BIND", defaults.bind),
            port: env_or("GATEWAY_PORT", defaults.port),
            sandbox_host: env::var("GATEWAY_SANDBOX_HOST").unwrap_or(defaults.sandbox_host),
            model_api_url: env::var("MODEL_API_URL").unwrap_or(defaults.model_api_url),
            model_api_key: env::var("MODEL_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            default_model: env::var("MODEL_DEFAULT").unwrap_or(defaults.default_model),
            request_timeout: Duration::from_secs(env_or("MODEL_REQUEST_TIMEOUT_SECS", 120)),
            audit_capacity: env_or("AUDIT_CAPACITY", defaults.audit_capacity),
            rate_window_secs: defaults.rate_window_secs,
        }
    }
}

/// IPv4-mapped loopback addresses count as loopback.
fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

/// Runtime record of one registered agent.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySession {
    pub agent_id: String,
    pub token_id: String,
    pub session_id: String,
    pub budget: u64,
    pub consumed: u64,
    /// Units held by in-flight requests.
    pub reserved: u64,
    pub request_count: u64,
    pub capabilities: Vec<Capability>,
    pub registered_at: u64,
    pub last_activity: u64,
}

impl GatewaySession {
    pub fn remaining(&self) -> u64 {
        self.budget
            .saturating_sub(self.consumed)
            .saturating_sub(self.reserved)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u64>,
    pub context: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponse {
    pub result: String,
    pub token_usage: u64,
    pub model: String,
    pub success: bool,
}

/// One line of a streaming response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamChunk {
    Content { content: String, accumulated: String },
    ToolUse { name: String, input: serde_json::Value },
    ToolResult { content: String },
    Usage { token_usage: u64 },
    Complete { accumulated: String, token_usage: u64 },
    Error { error: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub used: u64,
    pub budget: u64,
    pub remaining: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub agent_id: String,
    pub token_usage: TokenUsage,
    pub request_count: u64,
    pub last_activity: u64,
    pub capabilities: Vec<Capability>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_agents: usize,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub average_tokens_per_request: u64,
    pub recent_requests: Vec<AuditRecord>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub active_agents: usize,
    pub uptime: u64,
}

/// Units charged for a stream whose backend reported no usage.
///
/// A size heuristic, not real accounting: one unit per four bytes of output
/// with a floor of 100.
pub fn estimate_stream_units(content_len: usize) -> u64 {
    ((content_len / 4) as u64).max(100)
}

/// Units charged for a single completion whose backend reported no usage:
/// one unit per started four bytes of output, at least one.
pub fn estimate_reply_units(content_len: usize) -> u64 {
    (content_len.div_ceil(4) as u64).max(1)
}

struct Listener {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

pub struct Gateway {
    config: GatewayConfig,
    tokens: Arc<TokenManager>,
    backend: Arc<dyn ModelBackend>,
    sessions: DashMap<String, GatewaySession>,
    limiter: RateLimiter,
    audit: AuditLog,
    metrics: Arc<RuntimeMetrics>,
    events: EventBus,
    started: Instant,
    total_requests: AtomicU64,
    total_tokens: AtomicU64,
    listener: Mutex<Option<Listener>>,
}

/// What a pre-checked request is allowed to spend.
struct Admission {
    claims: SessionClaims,
    model: String,
    reserved: u64,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        tokens: Arc<TokenManager>,
        backend: Arc<dyn ModelBackend>,
        metrics: Arc<RuntimeMetrics>,
        events: EventBus,
    ) -> Self {
        let limiter = RateLimiter::new(RateLimitConfig::new(60, config.rate_window_secs));
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            config,
            tokens,
            backend,
            sessions: DashMap::new(),
            limiter,
            audit,
            metrics,
            events,
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Create the session for `agent_id`. Re-registration replaces it.
    pub fn register_agent(&self, agent_id: &str, token: &str) -> Result<()> {
        let claims = self.tokens.verify(token)?;
        if claims.agent_id != agent_id {
            return Err(AuthError::Mismatch(format!(
                "token belongs to {}, not {agent_id}",
                claims.agent_id
            ))
            .into());
        }
        let consumed = self
            .tokens
            .usage(&claims.token_id)
            .map(|u| u.consumed)
            .unwrap_or(0);
        let now = now_ts();
        let session = GatewaySession {
            agent_id: agent_id.to_string(),
            token_id: claims.token_id.clone(),
            session_id: claims.session_id.clone(),
            budget: claims.token_budget,
            consumed,
            reserved: 0,
            request_count: 0,
            capabilities: claims.capabilities.clone(),
            registered_at: now,
            last_activity: now,
        };
        if self.sessions.insert(agent_id.to_string(), session).is_some() {
            tracing::info!(agent_id, "replaced existing gateway session");
        }
        tracing::info!(agent_id, token_id = %claims.token_id, "agent registered");
        self.events.publish(LifecycleEvent::SessionRegistered {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Delete the session for `agent_id`. A missing session is a no-op.
    ///
    /// Ownership is checked against the authenticated token id, so a token
    /// that was already revoked or has expired can still unregister its own
    /// session.
    pub fn unregister_agent(&self, agent_id: &str, token: &str) -> Result<()> {
        let token_id = self.tokens.token_id(token)?;
        let removed = self
            .sessions
            .remove_if(agent_id, |_, session| session.token_id == token_id);
        match removed {
            Some(_) => {
                self.limiter.forget(agent_id);
                tracing::info!(agent_id, "agent unregistered");
                self.events.publish(LifecycleEvent::SessionUnregistered {
                    agent_id: agent_id.to_string(),
                });
                Ok(())
            }
            None if self.sessions.contains_key(agent_id) => Err(AuthError::Mismatch(
                "token does not own this session".into(),
            )
            .into()),
            None => Ok(()),
        }
    }

    pub fn session(&self, agent_id: &str) -> Option<GatewaySession> {
        self.sessions.get(agent_id).map(|s| s.clone())
    }

    /// Verify a bearer token and match it to its registered session.
    pub fn authenticate(&self, token: &str) -> Result<SessionClaims> {
        let claims = self.tokens.verify(token)?;
        match self.sessions.get(&claims.agent_id) {
            Some(session) if session.token_id == claims.token_id => Ok(claims),
            Some(_) => Err(AuthError::Mismatch("token superseded by a newer session".into()).into()),
            None => Err(AuthError::Forbidden(format!(
                "agent {} is not registered",
                claims.agent_id
            ))
            .into()),
        }
    }

    /// Take one sliding-window slot for the caller's agent id.
    pub fn check_rate(&self, claims: &SessionClaims) -> Result<()> {
        self.limiter
            .check(&claims.agent_id, claims.max_requests_per_minute)
            .map_err(|retry_after_secs| SandboxError::RateLimited { retry_after_secs })
    }

    /// All checks that must pass before any backend call, ending with a
    /// budget reservation.
    fn admit(
        &self,
        agent_id: &str,
        token: &str,
        request: &AiRequest,
        capability: Capability,
    ) -> Result<Admission> {
        let claims = self.authenticate(token)?;
        if claims.agent_id != agent_id {
            return Err(AuthError::Mismatch(format!(
                "token belongs to {}, not {agent_id}",
                claims.agent_id
            ))
            .into());
        }
        self.check_rate(&claims)?;
        if !claims.has_capability(capability) {
            return Err(AuthError::Forbidden(format!(
                "token lacks the {} capability",
                capability.as_str()
            ))
            .into());
        }
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        if !claims.allows_model(&model) {
            return Err(AuthError::Forbidden(format!("model {model} is not allowed")).into());
        }
        if request.prompt.trim().is_empty() {
            return Err(SandboxError::Validation("prompt is empty".into()));
        }

        let mut projected = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if claims.max_tokens_per_request > 0 {
            projected = projected.min(claims.max_tokens_per_request);
        }
        let mut session = self
            .sessions
            .get_mut(agent_id)
            .ok_or_else(|| AuthError::Forbidden(format!("agent {agent_id} is not registered")))?;
        let remaining = session.remaining();
        if projected > remaining {
            return Err(SandboxError::Budget {
                requested: projected,
                remaining,
            });
        }
        session.reserved += projected;
        session.last_activity = now_ts();
        Ok(Admission {
            claims,
            model,
            reserved: projected,
        })
    }

    /// Release the reservation and charge `units`, clamped to the budget.
    fn settle(&self, admission: &Admission, units: u64, counted: bool) -> u64 {
        let agent_id = &admission.claims.agent_id;
        let charged = match self.sessions.get_mut(agent_id) {
            Some(mut session) => {
                session.reserved = session.reserved.saturating_sub(admission.reserved);
                let charged = units.min(session.remaining());
                session.consumed += charged;
                if counted {
                    session.request_count += 1;
                }
                session.last_activity = now_ts();
                charged
            }
            // Unregistered mid-request: nothing left to charge against.
            None => 0,
        };
        if let Err(err) = self.tokens.record_usage(
            &admission.claims.token_id,
            u64::from(counted),
            charged,
        ) {
            tracing::warn!(agent_id = %agent_id, %err, "usage ledger update failed");
        }
        if counted {
            self.total_requests.fetch_add(1, Ordering::Relaxed);
            self.total_tokens.fetch_add(charged, Ordering::Relaxed);
        }
        charged
    }

    fn model_request(admission: &Admission, request: &AiRequest) -> ModelRequest {
        ModelRequest {
            model: admission.model.clone(),
            prompt: request.prompt.clone(),
            max_tokens: admission.reserved,
            temperature: request.temperature,
            context: request.context.as_ref().map(|c| match c {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }

    fn record_rejection(&self, agent_id: &str, request: &AiRequest, err: &SandboxError) {
        if err.is_budget() {
            let model = request
                .model
                .as_deref()
                .unwrap_or(&self.config.default_model);
            self.audit.append(AuditRecord::new(
                agent_id,
                &request.prompt,
                model,
                0,
                Some(err.to_string()),
            ));
        }
        tracing::warn!(agent_id, %err, "AI request rejected");
    }

    pub async fn make_ai_request(
        &self,
        agent_id: &str,
        token: &str,
        request: AiRequest,
    ) -> Result<AiResponse> {
        let admission = match self.admit(agent_id, token, &request, Capability::AiRequest) {
            Ok(admission) => admission,
            Err(err) => {
                self.record_rejection(agent_id, &request, &err);
                return Err(err);
            }
        };

        match self.backend.complete(&Self::model_request(&admission, &request)).await {
            Ok(response) => {
                let units = response
                    .units_used
                    .unwrap_or_else(|| estimate_reply_units(response.text.len()));
                let charged = self.settle(&admission, units, true);
                self.audit.append(AuditRecord::new(
                    agent_id,
                    &request.prompt,
                    &admission.model,
                    charged,
                    None,
                ));
                self.metrics.record_ai_request(true, charged);
                Ok(AiResponse {
                    result: response.text,
                    token_usage: charged,
                    model: response.model,
                    success: true,
                })
            }
            Err(err) => {
                self.settle(&admission, 0, true);
                self.audit.append(AuditRecord::new(
                    agent_id,
                    &request.prompt,
                    &admission.model,
                    0,
                    Some(err.to_string()),
                ));
                self.metrics.record_ai_request(false, 0);
                tracing::error!(agent_id, %err, "model backend request failed");
                Err(err)
            }
        }
    }

    /// Stream a completion as content/tool/usage/complete chunks.
    ///
    /// Pre-checks run before the stream opens and fail the call directly. A
    /// backend failure mid-stream is forwarded as a final `error` chunk.
    pub async fn make_streaming_ai_request(
        self: &Arc<Self>,
        agent_id: &str,
        token: &str,
        request: AiRequest,
    ) -> Result<ReceiverStream<StreamChunk>> {
        let admission = match self.admit(agent_id, token, &request, Capability::AiStream) {
            Ok(admission) => admission,
            Err(err) => {
                self.record_rejection(agent_id, &request, &err);
                return Err(err);
            }
        };

        let mut upstream = match self
            .backend
            .stream(&Self::model_request(&admission, &request))
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.settle(&admission, 0, true);
                self.audit.append(AuditRecord::new(
                    agent_id,
                    &request.prompt,
                    &admission.model,
                    0,
                    Some(err.to_string()),
                ));
                self.metrics.record_ai_request(false, 0);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = Arc::clone(self);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let mut accumulated = String::new();
            let mut reported_units = None;
            let mut failure = None;
            let mut receiver_gone = false;

            while let Some(item) = upstream.next().await {
                let chunk = match item {
                    Ok(BackendEvent::Content { text }) => {
                        accumulated.push_str(&text);
                        StreamChunk::Content {
                            content: text,
                            accumulated: accumulated.clone(),
                        }
                    }
                    Ok(BackendEvent::ToolUse { name, input }) => StreamChunk::ToolUse { name, input },
                    Ok(BackendEvent::ToolResult { content }) => StreamChunk::ToolResult { content },
                    Ok(BackendEvent::Usage { units }) => {
                        reported_units = Some(units);
                        continue;
                    }
                    Ok(BackendEvent::Error { message }) => {
                        failure = Some(message);
                        break;
                    }
                    Err(err) => {
                        failure = Some(err.to_string());
                        break;
                    }
                };
                if tx.send(chunk).await.is_err() {
                    receiver_gone = true;
                    break;
                }
            }

            let model = admission.model.clone();
            match failure {
                Some(error) => {
                    gateway.settle(&admission, reported_units.unwrap_or(0), true);
                    gateway.audit.append(AuditRecord::new(
                        &agent_id,
                        &request.prompt,
                        &model,
                        0,
                        Some(error.clone()),
                    ));
                    gateway.metrics.record_ai_request(false, 0);
                    tracing::error!(agent_id = %agent_id, %error, "model stream failed");
                    let _ = tx.send(StreamChunk::Error { error }).await;
                }
                None => {
                    let units = reported_units
                        .unwrap_or_else(|| estimate_stream_units(accumulated.len()));
                    let charged = gateway.settle(&admission, units, true);
                    gateway.audit.append(AuditRecord::new(
                        &agent_id,
                        &request.prompt,
                        &model,
                        charged,
                        None,
                    ));
                    gateway.metrics.record_ai_request(true, charged);
                    if receiver_gone {
                        tracing::debug!(agent_id = %agent_id, "stream consumer went away");
                        return;
                    }
                    let _ = tx.send(StreamChunk::Usage { token_usage: charged }).await;
                    let _ = tx
                        .send(StreamChunk::Complete {
                            accumulated,
                            token_usage: charged,
                        })
                        .await;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    pub fn agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        let session = self
            .session(agent_id)
            .ok_or_else(|| SandboxError::NotFound(format!("agent {agent_id}")))?;
        Ok(AgentStatus {
            agent_id: session.agent_id.clone(),
            token_usage: TokenUsage {
                used: session.consumed,
                budget: session.budget,
                remaining: session.budget.saturating_sub(session.consumed),
            },
            request_count: session.request_count,
            last_activity: session.last_activity,
            capabilities: session.capabilities,
        })
    }

    pub fn usage_stats(&self) -> UsageStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_tokens = self.total_tokens.load(Ordering::Relaxed);
        UsageStats {
            total_agents: self.sessions.len(),
            total_requests,
            total_tokens,
            average_tokens_per_request: total_tokens.checked_div(total_requests).unwrap_or(0),
            recent_requests: self.audit.recent(RECENT_REQUESTS),
        }
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            active_agents: self.sessions.len(),
            uptime: self.started.elapsed().as_secs(),
        }
    }

    /// Bind and serve the HTTP surface once. Later calls return the bound address.
    pub async fn ensure_listening(self: &Arc<Self>) -> Result<SocketAddr> {
        let mut listener = self.listener.lock().await;
        if let Some(existing) = listener.as_ref() {
            if !existing.task.is_finished() {
                return Ok(existing.addr);
            }
        }
        if !is_loopback(self.config.bind) {
            return Err(SandboxError::Validation(format!(
                "gateway must bind a loopback address, not {}",
                self.config.bind
            )));
        }

        let socket = tokio::net::TcpListener::bind((self.config.bind, self.config.port))
            .await
            .map_err(|e| {
                SandboxError::Validation(format!(
                    "failed to bind gateway on {}:{}: {e}",
                    self.config.bind, self.config.port
                ))
            })?;
        let addr = socket
            .local_addr()
            .map_err(|e| SandboxError::Validation(format!("gateway address unavailable: {e}")))?;
        let app = crate::gateway_api::router(Arc::clone(self));
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(socket, app).await {
                tracing::error!(%err, "gateway listener stopped");
            }
        });
        tracing::info!(%addr, "gateway listening");
        *listener = Some(Listener { addr, task });
        Ok(addr)
    }

    /// URL a sandbox uses to reach this gateway, once listening.
    pub async fn sandbox_url(&self) -> Option<String> {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|l| format!("http://{}:{}", self.config.sandbox_host, l.addr.port()))
    }

    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.task.abort();
            tracing::info!(addr = %listener.addr, "gateway stopped");
        }
    }
}
