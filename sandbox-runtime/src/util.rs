use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;

use crate::error::{Result, SandboxError};

static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Shared HTTP client for hosting-service calls.
pub fn http_client() -> Result<&'static Client> {
    if let Some(client) = HTTP_CLIENT.get() {
        return Ok(client);
    }
    let client = Client::builder()
        .timeout(Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS))
        .user_agent(concat!("sandbox-runtime/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| SandboxError::Http(format!("Failed to build HTTP client: {err}")))?;
    Ok(HTTP_CLIENT.get_or_init(|| client))
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

pub fn shell_escape(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_string(),
    }
}

/// Read an env var and parse it, falling back to `default` when unset or invalid.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
