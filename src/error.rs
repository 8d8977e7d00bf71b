//! Error categories shared by the worker, the queue dispatcher and the
//! HTTP collaborators.
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Timeouts, throttling and upstream 5xx. Safe to retry later.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    /// Output was produced but failed a quality gate.
    #[error("output rejected: {0}")]
    OutputQuality(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

/// Walk the error chain and decide whether the failure should be retried.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return e.is_transient();
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
            if let Some(status) = e.status() {
                return classify_status(status, "").is_transient();
            }
        }
        if let Some(e) = cause.downcast_ref::<sqlx::Error>() {
            return matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_));
        }
    }
    false
}

/// True when any error in the chain is a `PipelineError::NotFound`.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|c| matches!(c.downcast_ref::<PipelineError>(), Some(PipelineError::NotFound(_))))
}

/// Map an HTTP status from an upstream model service to an error category.
pub fn classify_status(status: StatusCode, body: &str) -> PipelineError {
    let detail = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            PipelineError::Transient(detail)
        }
        s if s.is_server_error() => PipelineError::Transient(detail),
        StatusCode::NOT_FOUND => PipelineError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PipelineError::AccessDenied(detail),
        _ => PipelineError::Invalid(detail),
    }
}
