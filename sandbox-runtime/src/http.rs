use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;

use crate::error::{Result, SandboxError};
use crate::util::http_client;

pub fn build_url(base: &str, path: &str) -> Result<Url> {
    let base_url =
        Url::parse(base).map_err(|err| SandboxError::Http(format!("Invalid base URL: {err}")))?;
    base_url
        .join(path)
        .map_err(|err| SandboxError::Http(format!("Invalid path '{path}': {err}")))
}

/// Headers for the hosting service's REST API.
pub fn github_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert(USER_AGENT, HeaderValue::from_static("secure-agent"));
    headers.insert(
        "x-github-api-version",
        HeaderValue::from_static("2022-11-28"),
    );

    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| SandboxError::Validation("hosting token is not a valid header value".into()))?;
    headers.insert(AUTHORIZATION, value);

    Ok(headers)
}

/// Send a request and return status plus body. Non-2xx is not an error here;
/// callers decide which statuses they can recover from.
pub async fn send_json(
    method: Method,
    url: Url,
    body: Option<Value>,
    headers: HeaderMap,
) -> Result<(StatusCode, String)> {
    let client = http_client()?;
    let mut request = client.request(method, url).headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|err| SandboxError::Http(format!("HTTP request failed: {err}")))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| SandboxError::Http(format!("Failed to read response body: {err}")))?;

    Ok((status, text))
}

pub fn parse_json(body: &str) -> Result<Value> {
    serde_json::from_str(body)
        .map_err(|err| SandboxError::Http(format!("Invalid response JSON: {err}")))
}
