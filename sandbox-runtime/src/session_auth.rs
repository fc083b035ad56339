//! PASETO v4.local session tokens for sandboxed agents.
//!
//! A token binds an agent id to a spend budget, capability set, rate limit and
//! model allow-list. The token id and expiry also travel in the authenticated
//! footer, so the revocation set can be consulted before the payload is
//! decrypted.
//!
//! The [`TokenManager`] owns the signing key, the permanent revocation set and
//! the usage ledger. It is constructed explicitly and shared by `Arc`.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::footer::Footer;
use pasetors::keys::SymmetricKey;
use pasetors::token::UntrustedToken;
use pasetors::version4::{LocalToken, V4};
use pasetors::{Local, local};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{AuthError, Result, SandboxError};
use crate::events::{EventBus, LifecycleEvent};
use crate::util::{env_or, now_ts};

const HKDF_SALT: &[u8] = b"agent-sandbox-gateway-paseto-v4";
const HKDF_INFO: &[u8] = b"session-token-symmetric-key-v1";

pub const TOKEN_ISSUER: &str = "agent-sandbox";
pub const TOKEN_AUDIENCE: &str = "agent-sandbox-gateway";

/// What a session token allows its holder to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AiRequest,
    AiStream,
    StatusRead,
    SandboxExec,
    PullRequest,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::AiRequest,
        Capability::AiStream,
        Capability::StatusRead,
        Capability::SandboxExec,
        Capability::PullRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::AiRequest => "ai_request",
            Capability::AiStream => "ai_stream",
            Capability::StatusRead => "status_read",
            Capability::SandboxExec => "sandbox_exec",
            Capability::PullRequest => "pull_request",
        }
    }
}

impl FromStr for Capability {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| SandboxError::Validation(format!("unknown capability: {s}")))
    }
}

#[derive(Clone, Debug)]
pub struct TokenManagerConfig {
    /// Input keying material; a random key is generated when absent.
    pub secret: Option<String>,
    pub max_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_ttl: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl TokenManagerConfig {
    pub fn from_env() -> Self {
        Self {
            secret: std::env::var("SESSION_AUTH_SECRET")
                .ok()
                .filter(|v| !v.is_empty()),
            max_ttl: Duration::from_secs(env_or("TOKEN_MAX_TTL_SECS", 86_400)),
            sweep_interval: Duration::from_secs(env_or("TOKEN_SWEEP_INTERVAL_SECS", 300)),
        }
    }
}

/// Everything bound into a freshly minted token.
#[derive(Clone, Debug)]
pub struct MintRequest {
    pub agent_id: String,
    pub budget: u64,
    pub capabilities: Vec<Capability>,
    pub ttl: Duration,
    pub max_requests_per_minute: u32,
    pub allowed_models: Vec<String>,
    pub max_tokens_per_request: u64,
}

#[derive(Clone, Debug)]
pub struct MintedToken {
    pub token: String,
    pub token_id: String,
    pub session_id: String,
    pub expires_at: u64,
}

/// Verified token payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    #[serde(rename = "sub")]
    pub agent_id: String,
    #[serde(rename = "jti")]
    pub token_id: String,
    pub session_id: String,
    pub token_budget: u64,
    pub capabilities: Vec<Capability>,
    pub max_requests_per_minute: u32,
    pub allowed_models: Vec<String>,
    pub max_tokens_per_request: u64,
    #[serde(skip)]
    pub issued_at: u64,
    #[serde(skip)]
    pub expires_at: u64,
}

impl SessionClaims {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// An empty allow-list permits every model.
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

/// Per-token spend accounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub agent_id: String,
    pub budget: u64,
    pub consumed: u64,
    pub requests: u64,
    pub issued_at: u64,
    pub expires_at: u64,
    pub last_used: Option<u64>,
}

#[derive(Deserialize)]
struct TokenFooter {
    tid: String,
    exp: String,
}

#[derive(Default)]
struct TokenState {
    revoked: HashSet<String>,
    usage: HashMap<String, UsageRecord>,
}

pub struct TokenManager {
    key: SymmetricKey<V4>,
    max_ttl: Duration,
    sweep_interval: Duration,
    state: Mutex<TokenState>,
    events: EventBus,
}

/// Derive a 32-byte symmetric key from input keying material using HKDF-SHA256.
fn derive_symmetric_key(ikm: &[u8]) -> Result<[u8; 32]> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| SandboxError::Validation(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

fn rfc3339(ts: u64) -> Result<String> {
    OffsetDateTime::from_unix_timestamp(ts as i64)
        .map_err(|e| SandboxError::Validation(format!("invalid timestamp {ts}: {e}")))?
        .format(&Rfc3339)
        .map_err(|e| SandboxError::Validation(format!("failed to format timestamp: {e}")))
}

fn parse_rfc3339(value: &str) -> Option<u64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|dt| dt.unix_timestamp().max(0) as u64)
}

fn malformed(msg: impl std::fmt::Display) -> SandboxError {
    SandboxError::Auth(AuthError::Malformed(msg.to_string()))
}

impl TokenManager {
    pub fn new(config: TokenManagerConfig, events: EventBus) -> Result<Self> {
        let key_bytes = match &config.secret {
            Some(secret) => derive_symmetric_key(secret.as_bytes())?,
            None => {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                bytes
            }
        };
        let key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| SandboxError::Validation(format!("invalid PASETO key: {e}")))?;
        Ok(Self {
            key,
            max_ttl: config.max_ttl,
            sweep_interval: config.sweep_interval,
            state: Mutex::new(TokenState::default()),
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mint(&self, request: MintRequest) -> Result<MintedToken> {
        self.issue(&request, now_ts(), None)
    }

    fn issue(
        &self,
        request: &MintRequest,
        issued_at: u64,
        session_id: Option<String>,
    ) -> Result<MintedToken> {
        if request.agent_id.trim().is_empty() {
            return Err(SandboxError::Validation("agent_id is required".into()));
        }
        let ttl = request.ttl.min(self.max_ttl).as_secs().max(1);
        let expires_at = issued_at + ttl;
        let token_id = uuid::Uuid::new_v4().to_string();
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let iat = rfc3339(issued_at)?;
        let exp = rfc3339(expires_at)?;

        let mut claims = Claims::new().map_err(|e| malformed(format!("claims: {e}")))?;
        let claim_err = |e: pasetors::errors::Error| malformed(format!("claim rejected: {e}"));
        claims.subject(&request.agent_id).map_err(claim_err)?;
        claims.issuer(TOKEN_ISSUER).map_err(claim_err)?;
        claims.audience(TOKEN_AUDIENCE).map_err(claim_err)?;
        claims.token_identifier(&token_id).map_err(claim_err)?;
        claims.issued_at(&iat).map_err(claim_err)?;
        claims.not_before(&iat).map_err(claim_err)?;
        claims.expiration(&exp).map_err(claim_err)?;
        claims
            .add_additional("sessionId", session_id.clone())
            .map_err(claim_err)?;
        claims
            .add_additional("tokenBudget", request.budget)
            .map_err(claim_err)?;
        claims
            .add_additional("capabilities", serde_json::json!(request.capabilities))
            .map_err(claim_err)?;
        claims
            .add_additional("maxRequestsPerMinute", request.max_requests_per_minute)
            .map_err(claim_err)?;
        claims
            .add_additional("allowedModels", serde_json::json!(request.allowed_models))
            .map_err(claim_err)?;
        claims
            .add_additional("maxTokensPerRequest", request.max_tokens_per_request)
            .map_err(claim_err)?;

        let mut footer = Footer::new();
        footer.add_additional("tid", &token_id).map_err(claim_err)?;
        footer.add_additional("exp", &exp).map_err(claim_err)?;

        let token = local::encrypt(&self.key, &claims, Some(&footer), None)
            .map_err(|e| malformed(format!("encryption failed: {e}")))?;

        self.state().usage.insert(
            token_id.clone(),
            UsageRecord {
                agent_id: request.agent_id.clone(),
                budget: request.budget,
                consumed: 0,
                requests: 0,
                issued_at,
                expires_at,
                last_used: None,
            },
        );
        tracing::info!(token_id, agent_id = %request.agent_id, ttl_secs = ttl, "session token minted");
        self.events.publish(LifecycleEvent::TokenMinted {
            token_id: token_id.clone(),
            agent_id: request.agent_id.clone(),
        });

        Ok(MintedToken {
            token,
            token_id,
            session_id,
            expires_at,
        })
    }

    /// Token id of a token sealed under this manager's key, whether or not
    /// it has expired or been revoked. The footer is covered by the token's
    /// tag, so it is only read once decryption succeeds.
    pub fn token_id(&self, token: &str) -> Result<String> {
        let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(malformed)?;
        LocalToken::decrypt(&self.key, &untrusted, None, None)
            .map_err(|_| malformed("token was not issued by this manager"))?;
        Ok(Self::footer(&untrusted)?.tid)
    }

    fn footer(untrusted: &UntrustedToken<Local, V4>) -> Result<TokenFooter> {
        serde_json::from_slice(untrusted.untrusted_footer())
            .map_err(|e| malformed(format!("footer: {e}")))
    }

    /// Check revocation, signature and expiry; stamps last-used on success.
    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(malformed)?;
        let footer = Self::footer(&untrusted)?;
        if self.state().revoked.contains(&footer.tid) {
            return Err(AuthError::Revoked.into());
        }

        let mut rules = ClaimsValidationRules::new();
        rules.validate_issuer_with(TOKEN_ISSUER);
        rules.validate_audience_with(TOKEN_AUDIENCE);
        let now = now_ts();
        let trusted = match local::decrypt(&self.key, &untrusted, &rules, None, None) {
            Ok(trusted) => trusted,
            Err(err) => {
                if parse_rfc3339(&footer.exp).is_some_and(|exp| exp <= now) {
                    return Err(AuthError::Expired.into());
                }
                return Err(malformed(err));
            }
        };

        let payload: serde_json::Value =
            serde_json::from_str(trusted.payload()).map_err(|e| malformed(format!("payload: {e}")))?;
        let mut claims: SessionClaims = serde_json::from_value(payload.clone())
            .map_err(|e| malformed(format!("claims: {e}")))?;
        claims.issued_at = payload
            .get("iat")
            .and_then(|v| v.as_str())
            .and_then(parse_rfc3339)
            .unwrap_or(0);
        claims.expires_at = payload
            .get("exp")
            .and_then(|v| v.as_str())
            .and_then(parse_rfc3339)
            .ok_or_else(|| malformed("missing expiration"))?;
        if claims.expires_at <= now {
            return Err(AuthError::Expired.into());
        }
        if claims.token_id != footer.tid {
            return Err(malformed("footer does not match payload"));
        }

        if let Some(usage) = self.state().usage.get_mut(&claims.token_id) {
            usage.last_used = Some(now);
        }
        Ok(claims)
    }

    /// Permanently reject `token`. Revoking twice is a no-op.
    pub fn revoke(&self, token: &str) -> Result<()> {
        let token_id = self.token_id(token)?;
        self.revoke_id(&token_id);
        Ok(())
    }

    pub fn revoke_id(&self, token_id: &str) {
        let inserted = self.state().revoked.insert(token_id.to_string());
        if inserted {
            tracing::info!(token_id, "session token revoked");
            self.events.publish(LifecycleEvent::TokenRevoked {
                token_id: token_id.to_string(),
            });
        }
    }

    pub fn is_revoked(&self, token_id: &str) -> bool {
        self.state().revoked.contains(token_id)
    }

    /// Replace `token` with a fresh one carrying the same grants. Spend
    /// already recorded against the old token carries over.
    pub fn refresh(&self, token: &str, new_ttl: Duration) -> Result<MintedToken> {
        let claims = self.verify(token)?;
        self.revoke_id(&claims.token_id);
        let request = MintRequest {
            agent_id: claims.agent_id.clone(),
            budget: claims.token_budget,
            capabilities: claims.capabilities.clone(),
            ttl: new_ttl,
            max_requests_per_minute: claims.max_requests_per_minute,
            allowed_models: claims.allowed_models.clone(),
            max_tokens_per_request: claims.max_tokens_per_request,
        };
        let minted = self.issue(&request, now_ts(), Some(claims.session_id.clone()))?;
        let mut state = self.state();
        let carried = state
            .usage
            .get(&claims.token_id)
            .map(|u| (u.consumed, u.requests));
        if let (Some((consumed, requests)), Some(usage)) =
            (carried, state.usage.get_mut(&minted.token_id))
        {
            usage.consumed = consumed;
            usage.requests = requests;
        }
        Ok(minted)
    }

    /// Accumulate spend into the usage ledger.
    pub fn record_usage(&self, token_id: &str, request_delta: u64, spend_delta: u64) -> Result<UsageRecord> {
        let mut state = self.state();
        let usage = state
            .usage
            .get_mut(token_id)
            .ok_or_else(|| SandboxError::NotFound(format!("usage record for token {token_id}")))?;
        usage.requests += request_delta;
        usage.consumed = usage.consumed.saturating_add(spend_delta);
        usage.last_used = Some(now_ts());
        Ok(usage.clone())
    }

    pub fn usage(&self, token_id: &str) -> Option<UsageRecord> {
        self.state().usage.get(token_id).cloned()
    }

    /// Purge usage records of expired or revoked tokens. The revocation set
    /// itself is never purged.
    pub fn sweep(&self) -> usize {
        let now = now_ts();
        let mut state = self.state();
        let TokenState { revoked, usage } = &mut *state;
        let before = usage.len();
        usage.retain(|token_id, record| record.expires_at > now && !revoked.contains(token_id));
        let purged = before - usage.len();
        if purged > 0 {
            tracing::debug!(purged, "swept usage records");
        }
        purged
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.sweep();
            }
        })
    }
}

/// Extract a Bearer token from an Authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
}
