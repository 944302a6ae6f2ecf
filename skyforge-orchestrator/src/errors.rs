use skyforge_common::TemplateError;
use skyforge_providers::ProviderError;
use thiserror::Error;

use crate::retry::RetryError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The process asked us to stop. Never retried, never rewrapped.
    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} gave up after {attempts} attempt(s): {last_error}")]
    DeadlineExceeded {
        operation: String,
        attempts: u32,
        last_error: Box<OrchestratorError>,
    },

    /// Quota or capacity error; `code` is the provider's error code.
    #[error("resource limit exceeded ({code}): {message}")]
    ResourceLimitExceeded { code: String, message: String },

    /// A lookup that requires an ownership tag found an instance without one.
    #[error("instance {provider_id} is missing its '{tag_key}' ownership tag")]
    OwnershipViolation { provider_id: String, tag_key: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("only {acquired} of {requested} instance(s) usable, at least {min_count} required")]
    InsufficientCapacity {
        requested: usize,
        min_count: usize,
        acquired: usize,
    },

    /// A polling condition has not converged yet.
    #[error("not ready: {0}")]
    Transient(String),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("{} error(s): {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<OrchestratorError>),
}

fn join_errors(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ProviderError> for OrchestratorError {
    fn from(e: ProviderError) -> Self {
        if e.is_limit_exceeded() {
            if let ProviderError::Api { code, message } = e {
                return OrchestratorError::ResourceLimitExceeded { code, message };
            }
        }
        OrchestratorError::Provider(e)
    }
}

impl<E: Into<OrchestratorError>> From<RetryError<E>> for OrchestratorError {
    fn from(e: RetryError<E>) -> Self {
        match e {
            RetryError::Cancelled => OrchestratorError::Cancelled,
            RetryError::DeadlineExceeded {
                operation,
                attempts,
                last_error,
            } => {
                let last_error = last_error.into();
                // A cancellation surfacing as the last error stays a cancellation.
                if matches!(last_error, OrchestratorError::Cancelled) {
                    return OrchestratorError::Cancelled;
                }
                OrchestratorError::DeadlineExceeded {
                    operation,
                    attempts,
                    last_error: Box::new(last_error),
                }
            }
            RetryError::Fatal(e) => e.into(),
        }
    }
}

impl OrchestratorError {
    /// Eventual-consistency misses and unconverged polls.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Transient(_) => true,
            OrchestratorError::Provider(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            OrchestratorError::Cancelled => true,
            OrchestratorError::Aggregate(errors) => errors.iter().any(|e| e.is_cancelled()),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::Provider(e) if e.is_not_found())
    }

    /// Provider error code carried by this error, if any.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            OrchestratorError::ResourceLimitExceeded { code, .. } => Some(code.as_str()),
            OrchestratorError::Provider(e) => e.code(),
            OrchestratorError::DeadlineExceeded { last_error, .. } => last_error.error_code(),
            OrchestratorError::Aggregate(errors) => errors.iter().find_map(|e| e.error_code()),
            _ => None,
        }
    }

    /// Collapse sibling errors: nothing is `Ok`, one error is itself, and a
    /// cancellation anywhere wins over everything else.
    pub fn aggregate(mut errors: Vec<OrchestratorError>) -> Result<()> {
        if errors.iter().any(|e| e.is_cancelled()) {
            return Err(OrchestratorError::Cancelled);
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(OrchestratorError::Aggregate(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyforge_providers::codes;

    #[test]
    fn limit_errors_keep_their_code() {
        let e: OrchestratorError =
            ProviderError::api(codes::VOLUME_LIMIT_EXCEEDED, "too many volumes").into();
        assert!(matches!(e, OrchestratorError::ResourceLimitExceeded { .. }));
        assert_eq!(e.error_code(), Some(codes::VOLUME_LIMIT_EXCEEDED));
    }

    #[test]
    fn not_found_is_retryable() {
        let e: OrchestratorError = ProviderError::api(codes::INSTANCE_NOT_FOUND, "x").into();
        assert!(e.is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
        assert!(OrchestratorError::Transient("pending".to_string()).is_retryable());
    }

    #[test]
    fn retry_cancellation_stays_cancellation() {
        let e: OrchestratorError = RetryError::<OrchestratorError>::Cancelled.into();
        assert!(matches!(e, OrchestratorError::Cancelled));

        let e: OrchestratorError = RetryError::DeadlineExceeded {
            operation: "wait".to_string(),
            attempts: 3,
            last_error: ProviderError::api(codes::INSTANCE_NOT_FOUND, "x"),
        }
        .into();
        assert!(matches!(e, OrchestratorError::DeadlineExceeded { attempts: 3, .. }));
        assert_eq!(e.error_code(), Some(codes::INSTANCE_NOT_FOUND));
    }

    #[test]
    fn aggregate_collapses() {
        assert!(OrchestratorError::aggregate(vec![]).is_ok());

        let one = OrchestratorError::aggregate(vec![OrchestratorError::InvalidRequest(
            "x".to_string(),
        )]);
        assert!(matches!(one, Err(OrchestratorError::InvalidRequest(_))));

        let many = OrchestratorError::aggregate(vec![
            OrchestratorError::InvalidRequest("a".to_string()),
            OrchestratorError::InvalidRequest("b".to_string()),
        ]);
        assert!(matches!(many, Err(OrchestratorError::Aggregate(ref v)) if v.len() == 2));

        let cancelled = OrchestratorError::aggregate(vec![
            OrchestratorError::InvalidRequest("a".to_string()),
            OrchestratorError::Cancelled,
        ]);
        assert!(matches!(cancelled, Err(OrchestratorError::Cancelled)));
    }
}
