use std::fmt;

/// Why a session token was rejected.
///
/// Security failures are never retried by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// Token is past its expiry timestamp.
    Expired,
    /// Token could not be parsed, decrypted, or carries invalid claims.
    Malformed(String),
    /// Token id is in the revocation set.
    Revoked,
    /// Token is valid but belongs to a different agent.
    Mismatch(String),
    /// Token lacks the capability or model permission for this call.
    Forbidden(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Expired => write!(f, "session token expired"),
            AuthError::Malformed(msg) => write!(f, "malformed session token: {msg}"),
            AuthError::Revoked => write!(f, "session token revoked"),
            AuthError::Mismatch(msg) => write!(f, "token/agent mismatch: {msg}"),
            AuthError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
        }
    }
}

/// Failure of a command executed inside a sandbox.
///
/// Carries whatever stdout/stderr was captured before the failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecError {
    NonZeroExit {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    Timeout {
        timeout_secs: u64,
        stdout: String,
        stderr: String,
    },
    OutputOverflow {
        limit_bytes: usize,
        stdout: String,
        stderr: String,
    },
    /// The sandbox is not in the `running` state.
    NotRunning(String),
    /// The container engine failed to run the command at all.
    Engine(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::NonZeroExit {
                exit_code, stderr, ..
            } => write!(f, "command exited with code {exit_code}: {}", stderr.trim()),
            ExecError::Timeout { timeout_secs, .. } => {
                write!(f, "command timed out after {timeout_secs}s")
            }
            ExecError::OutputOverflow { limit_bytes, .. } => {
                write!(f, "command output exceeded {limit_bytes} bytes")
            }
            ExecError::NotRunning(state) => write!(f, "sandbox is not running (state: {state})"),
            ExecError::Engine(msg) => write!(f, "engine failure: {msg}"),
        }
    }
}

/// Errors returned by sandbox runtime and gateway operations.
#[derive(Debug)]
pub enum SandboxError {
    /// Session token rejected.
    Auth(AuthError),
    /// Projected spend exceeds the remaining budget.
    Budget { requested: u64, remaining: u64 },
    /// Too many requests inside the sliding window.
    RateLimited { retry_after_secs: u64 },
    /// Docker/container engine failure.
    Docker(String),
    /// In-sandbox command failure.
    Exec(ExecError),
    /// Sandbox lifecycle transition not permitted by the state machine.
    InvalidTransition { from: String, to: String },
    /// HTTP request to an external service failed.
    Http(String),
    /// Model backend failure.
    Backend(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Requested resource not found.
    NotFound(String),
}

impl SandboxError {
    /// Security failures must never be retried.
    pub fn is_security(&self) -> bool {
        matches!(self, SandboxError::Auth(_))
    }

    pub fn is_budget(&self) -> bool {
        matches!(self, SandboxError::Budget { .. })
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Auth(err) => write!(f, "auth error: {err}"),
            SandboxError::Budget {
                requested,
                remaining,
            } => write!(
                f,
                "budget exceeded: request needs {requested} units, {remaining} remaining"
            ),
            SandboxError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited: retry after {retry_after_secs}s")
            }
            SandboxError::Docker(msg) => write!(f, "docker error: {msg}"),
            SandboxError::Exec(err) => write!(f, "exec error: {err}"),
            SandboxError::InvalidTransition { from, to } => {
                write!(f, "invalid sandbox transition: {from} -> {to}")
            }
            SandboxError::Http(msg) => write!(f, "http error: {msg}"),
            SandboxError::Backend(msg) => write!(f, "backend error: {msg}"),
            SandboxError::Validation(msg) => write!(f, "validation error: {msg}"),
            SandboxError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<AuthError> for SandboxError {
    fn from(err: AuthError) -> Self {
        SandboxError::Auth(err)
    }
}

impl From<ExecError> for SandboxError {
    fn from(err: ExecError) -> Self {
        SandboxError::Exec(err)
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_errors_are_flagged() {
        assert!(SandboxError::Auth(AuthError::Revoked).is_security());
        assert!(!SandboxError::Docker("boom".into()).is_security());
        assert!(
            SandboxError::Budget {
                requested: 60,
                remaining: 40
            }
            .is_budget()
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = SandboxError::Exec(ExecError::NonZeroExit {
            exit_code: 2,
            stdout: String::new(),
            stderr: "no such file\n".into(),
        });
        assert_eq!(
            err.to_string(),
            "exec error: command exited with code 2: no such file"
        );
    }
}
