use thiserror::Error;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Error codes returned by the control plane that the orchestrator reacts to.
pub mod codes {
    pub const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
    pub const VOLUME_NOT_FOUND: &str = "InvalidVolume.NotFound";
    pub const SPOT_REQUEST_NOT_FOUND: &str = "InvalidSpotInstanceRequestID.NotFound";
    pub const SCALING_GROUP_NOT_FOUND: &str = "AutoScalingGroup.NotFound";
    pub const INSTANCE_LIMIT_EXCEEDED: &str = "InstanceLimitExceeded";
    pub const VOLUME_LIMIT_EXCEEDED: &str = "VolumeLimitExceeded";
    pub const INSUFFICIENT_CAPACITY: &str = "InsufficientInstanceCapacity";
    pub const VOLUME_IN_USE: &str = "VolumeInUse";
    pub const INCORRECT_STATE: &str = "IncorrectState";
    pub const UNAUTHORIZED: &str = "UnauthorizedOperation";
    pub const VALIDATION_ERROR: &str = "ValidationError";
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Error returned by the control plane, with its machine-readable code.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// A memoized client was requested again with a different configuration.
    #[error("client already initialized with a different configuration")]
    ConfigurationChanged,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn api(code: &str, message: impl Into<String>) -> Self {
        ProviderError::Api {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Read-after-write misses: the resource exists but is not visible yet,
    /// or it is gone.
    pub fn is_not_found(&self) -> bool {
        self.code()
            .map(|c| c.ends_with(".NotFound") || c == "NotFound")
            .unwrap_or(false)
    }

    /// Quota and capacity errors. Retrying the same request will not help.
    pub fn is_limit_exceeded(&self) -> bool {
        self.code()
            .map(|c| c.ends_with("LimitExceeded") || c == codes::INSUFFICIENT_CAPACITY)
            .unwrap_or(false)
    }

    pub fn is_volume_in_use(&self) -> bool {
        self.code() == Some(codes::VOLUME_IN_USE)
    }

    pub fn is_incorrect_state(&self) -> bool {
        self.code() == Some(codes::INCORRECT_STATE)
    }
}
