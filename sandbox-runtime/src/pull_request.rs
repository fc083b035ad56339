//! Pull-request creation from a sandbox working tree.
//!
//! The sandbox commits and pushes a branch; the hosting API call runs in this
//! process. The hosting token reaches the sandbox only as an environment
//! variable of the push exec. If the token is missing, the push is refused or
//! the API is unreachable, the caller still gets a compare URL it can hand to
//! a human.

use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::error::{ExecError, Result, SandboxError};
use crate::http::{build_url, github_headers, parse_json, send_json};
use crate::runtime::{ExecOptions, SandboxOrchestrator};
use crate::util::shell_escape;

pub const GITHUB_API: &str = "https://api.github.com";
const DEFAULT_BASE_BRANCH: &str = "main";
/// Exec-scoped variable carrying the push credential header.
pub const PUSH_AUTH_ENV: &str = "GIT_PUSH_AUTH_HEADER";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    /// Accepts `https://github.com/o/r(.git)`, `git@github.com:o/r.git` and `o/r`.
    pub fn parse(repo_url: &str) -> Option<Self> {
        let trimmed = repo_url.trim().trim_end_matches('/');
        let path = if let Some(rest) = trimmed.strip_prefix("git@") {
            rest.split_once(':')?.1
        } else if let Some((_, rest)) = trimmed.split_once("://") {
            rest.split_once('/')?.1
        } else {
            trimmed
        };
        let path = path.trim_end_matches(".git");
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let owner = parts.next()?;
        let name = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn compare_url(&self, base: &str, branch: &str) -> String {
        format!(
            "https://github.com/{}/{}/compare/{base}...{branch}?expand=1",
            self.owner, self.name
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PullRequestOutcome {
    Created { url: String, number: u64 },
    /// An open pull request for the branch already existed.
    Existing { url: String },
    /// No API call was possible; a human has to open it.
    CompareUrl { url: String },
}

impl PullRequestOutcome {
    pub fn url(&self) -> &str {
        match self {
            Self::Created { url, .. } | Self::Existing { url } | Self::CompareUrl { url } => url,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PullRequestRequest {
    pub sandbox_id: String,
    pub repo_url: String,
    pub branch: String,
    /// Base branch; detected from the clone when `None`.
    pub base: Option<String>,
    pub title: String,
    pub body: String,
}

/// Hosting-service REST client.
#[derive(Clone, Debug)]
pub struct PullRequestClient {
    api_base: String,
    token: Option<String>,
}

impl PullRequestClient {
    pub fn new(token: Option<String>) -> Self {
        Self {
            api_base: GITHUB_API.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// `http.extraHeader` value authenticating an HTTPS push with the token.
    pub fn push_auth_header(&self) -> Option<String> {
        let token = self.token.as_deref()?;
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("x-access-token:{token}").as_bytes());
        Some(format!("Authorization: Basic {basic}"))
    }

    /// Open a pull request for an already-pushed branch.
    pub async fn open(
        &self,
        slug: &RepoSlug,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestOutcome> {
        let Some(token) = self.token.as_deref() else {
            tracing::warn!(repo = %slug.name, "no hosting token; falling back to compare URL");
            return Ok(PullRequestOutcome::CompareUrl {
                url: slug.compare_url(base, branch),
            });
        };

        let url = build_url(
            &self.api_base,
            &format!("/repos/{}/{}/pulls", slug.owner, slug.name),
        )?;
        let payload = json!({ "title": title, "head": branch, "base": base, "body": body });
        let (status, text) = send_json(Method::POST, url, Some(payload), github_headers(token)?).await?;

        match status {
            s if s.is_success() => {
                let created = parse_json(&text)?;
                let url = created["html_url"]
                    .as_str()
                    .ok_or_else(|| SandboxError::Http("pull request response lacks html_url".into()))?
                    .to_string();
                let number = created["number"].as_u64().unwrap_or_default();
                tracing::info!(%url, number, "pull request created");
                Ok(PullRequestOutcome::Created { url, number })
            }
            StatusCode::UNPROCESSABLE_ENTITY => match self.find_open(slug, branch, token).await? {
                Some(url) => {
                    tracing::info!(%url, "pull request already open for branch");
                    Ok(PullRequestOutcome::Existing { url })
                }
                None => Err(SandboxError::Http(format!("HTTP {status}: {text}"))),
            },
            _ => Err(SandboxError::Http(format!("HTTP {status}: {text}"))),
        }
    }

    async fn find_open(&self, slug: &RepoSlug, branch: &str, token: &str) -> Result<Option<String>> {
        let mut url = build_url(
            &self.api_base,
            &format!("/repos/{}/{}/pulls", slug.owner, slug.name),
        )?;
        url.query_pairs_mut()
            .append_pair("head", &format!("{}:{branch}", slug.owner))
            .append_pair("state", "open");
        let (status, text) = send_json(Method::GET, url, None, github_headers(token)?).await?;
        if !status.is_success() {
            return Err(SandboxError::Http(format!("HTTP {status}: {text}")));
        }
        Ok(parse_json(&text)?
            .as_array()
            .and_then(|prs| prs.first())
            .and_then(|pr| pr["html_url"].as_str())
            .map(str::to_string))
    }
}

fn valid_branch(branch: &str) -> bool {
    !branch.is_empty()
        && !branch.starts_with('-')
        && !branch.contains("..")
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
}

/// Commit the sandbox working tree, push `request.branch`, and open a pull
/// request for it.
///
/// A failed commit is an error. A refused push or a hosting-API transport
/// failure degrades to a compare URL.
pub async fn create_pull_request(
    orchestrator: &SandboxOrchestrator,
    client: &PullRequestClient,
    request: &PullRequestRequest,
) -> Result<PullRequestOutcome> {
    let slug = RepoSlug::parse(&request.repo_url).ok_or_else(|| {
        SandboxError::Validation(format!("unsupported repository URL: {}", request.repo_url))
    })?;
    if !valid_branch(&request.branch) {
        return Err(SandboxError::Validation(format!(
            "invalid branch name: {}",
            request.branch
        )));
    }

    let base = match &request.base {
        Some(base) => base.clone(),
        None => detect_base_branch(orchestrator, &request.sandbox_id).await,
    };

    let branch = shell_escape(&request.branch);
    let commit = format!(
        "git checkout -B {branch} && git add -A && (git diff --cached --quiet || git commit -m {})",
        shell_escape(&request.title)
    );
    orchestrator
        .exec(&request.sandbox_id, &commit, ExecOptions::in_repo())
        .await?;

    let compare = || PullRequestOutcome::CompareUrl {
        url: slug.compare_url(&base, &request.branch),
    };
    let mut push = ExecOptions::in_repo();
    let push_command = match client.push_auth_header() {
        Some(header) => {
            push.env.push((PUSH_AUTH_ENV.to_string(), header));
            format!(
                "git -c \"http.extraHeader=${PUSH_AUTH_ENV}\" push --force-with-lease -u origin {branch}"
            )
        }
        None => format!("git push --force-with-lease -u origin {branch}"),
    };
    match orchestrator
        .exec(&request.sandbox_id, &push_command, push)
        .await
    {
        Ok(_) => {
            tracing::info!(sandbox_id = %request.sandbox_id, branch = %request.branch, "branch pushed")
        }
        Err(SandboxError::Exec(ExecError::NonZeroExit { exit_code, stderr, .. })) => {
            tracing::warn!(
                sandbox_id = %request.sandbox_id,
                exit_code,
                stderr = %stderr.trim(),
                "push refused; falling back to compare URL"
            );
            return Ok(compare());
        }
        Err(err) => return Err(err),
    }

    match client
        .open(&slug, &request.branch, &base, &request.title, &request.body)
        .await
    {
        Err(SandboxError::Http(err)) => {
            tracing::warn!(%err, "hosting API unavailable; falling back to compare URL");
            Ok(compare())
        }
        other => other,
    }
}

async fn detect_base_branch(orchestrator: &SandboxOrchestrator, sandbox_id: &str) -> String {
    let head = orchestrator
        .exec(
            sandbox_id,
            "git symbolic-ref --short refs/remotes/origin/HEAD",
            ExecOptions::in_repo(),
        )
        .await;
    match head {
        Ok(result) => result
            .stdout
            .trim()
            .strip_prefix("origin/")
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
        Err(_) => DEFAULT_BASE_BRANCH.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repo_urls() {
        let expected = RepoSlug {
            owner: "acme".into(),
            name: "widgets".into(),
        };
        assert_eq!(RepoSlug::parse("https://github.com/acme/widgets"), Some(expected.clone()));
        assert_eq!(RepoSlug::parse("https://github.com/acme/widgets.git/"), Some(expected.clone()));
        assert_eq!(RepoSlug::parse("git@github.com:acme/widgets.git"), Some(expected.clone()));
        assert_eq!(RepoSlug::parse("acme/widgets"), Some(expected));
        assert_eq!(RepoSlug::parse("https://github.com/acme"), None);
        assert_eq!(RepoSlug::parse("https://github.com/a/b/c"), None);
    }

    #[test]
    fn compare_url_shape() {
        let slug = RepoSlug::parse("acme/widgets").unwrap();
        assert_eq!(
            slug.compare_url("main", "agent/fix"),
            "https://github.com/acme/widgets/compare/main...agent/fix?expand=1"
        );
    }

    #[test]
    fn branch_validation() {
        assert!(valid_branch("agent/fix-build"));
        assert!(!valid_branch("--upload-pack=x"));
        assert!(!valid_branch("a..b"));
        assert!(!valid_branch("a b"));
    }

    #[tokio::test]
    async fn missing_token_yields_compare_url() {
        let client = PullRequestClient::new(Some("  ".into()));
        let slug = RepoSlug::parse("acme/widgets").unwrap();
        let outcome = client.open(&slug, "fix", "main", "t", "b").await.unwrap();
        assert!(matches!(outcome, PullRequestOutcome::CompareUrl { .. }));
        assert!(outcome.url().contains("compare/main...fix"));
    }
}
