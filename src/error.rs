use std::time::Duration;

use crate::api;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classified failure modes of the engine.
///
/// Callers (the admin API layer, the renewal scheduler) branch on these
/// variants; nothing here aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory document could not be fetched or parsed.
    #[error("ACME directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// Connection-level failure talking to the CA.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A terminal problem document reported by the CA.
    #[error("ACME error: {0}")]
    Problem(api::Problem),

    /// The CA asked us to slow down. Not retried automatically; the
    /// suggested wait is surfaced to the caller.
    #[error("rate limited by CA: {problem}")]
    RateLimited {
        problem: api::Problem,
        retry_after: Option<Duration>,
    },

    /// A challenge was attempted and the CA judged it invalid.
    #[error("challenge validation failed for {domain}: {reason}")]
    ChallengeFailed { domain: String, reason: String },

    /// No configured provider covers the identifier.
    #[error("no challenge provider configured for domain {0}")]
    NoProviderForDomain(String),

    /// A wildcard identifier can only be proven over dns-01.
    #[error("wildcard identifier *.{0} requires a dns-01 capable provider")]
    WildcardRequiresDns(String),

    /// The requested names do not match the order's identifier set. Caught
    /// locally, never sent to the CA.
    #[error("order identifiers {order:?} do not match requested names {requested:?}")]
    IdentifierMismatch {
        requested: Vec<String>,
        order: Vec<String>,
    },

    /// Key material the signer cannot handle.
    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),

    /// Provisioning or API failure inside a challenge provider.
    #[error("challenge provider error for {domain}: {reason}")]
    Provider { domain: String, reason: String },

    /// A poll loop exceeded its configured bound.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The engine-wide shutdown signal fired mid-operation.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Deliberately unsupported operation.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// A 2xx response that is missing required structure (headers, body).
    #[error("malformed CA response: {0}")]
    MalformedResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key error: {0}")]
    Key(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    /// Storage collaborator failure during a renewal pass.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<api::Problem> for Error {
    fn from(problem: api::Problem) -> Self {
        if problem.is_rate_limited() {
            Error::RateLimited {
                problem,
                retry_after: None,
            }
        } else {
            Error::Problem(problem)
        }
    }
}

impl Error {
    /// True for failures worth retrying on a later pass (network blips,
    /// slow CAs). Terminal protocol and local validation errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::RateLimited { .. }
                | Error::Timeout(_)
                | Error::DirectoryUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_problems_classify_as_rate_limited() {
        let problem = api::Problem {
            _type: "urn:ietf:params:acme:error:rateLimited".to_owned(),
            detail: Some("too many certificates".to_owned()),
            status: Some(429),
            subproblems: None,
        };

        let err = Error::from(problem);
        assert!(matches!(err, Error::RateLimited { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn terminal_problems_stay_terminal() {
        let problem = api::Problem {
            _type: "urn:ietf:params:acme:error:unauthorized".to_owned(),
            detail: None,
            status: Some(403),
            subproblems: None,
        };

        let err = Error::from(problem);
        assert!(matches!(err, Error::Problem(_)));
        assert!(!err.is_transient());
    }
}
