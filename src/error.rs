//! Shared error types for the fleetbot platform.

/// Common error type for all fleetbot components.
#[derive(Debug)]
pub enum Error {
    /// Database-related errors.
    Database(sqlx::Error),

    /// I/O errors.
    Io(std::io::Error),

    /// JSON (de)serialization errors.
    Json(serde_json::Error),

    /// HTTP client errors.
    Http(reqwest::Error),

    /// Configuration errors.
    Config(String),

    /// Validation errors for user or candidate input.
    Validation(String),

    /// No schedulable candidate exists for a (codebase, campaign) pair.
    CandidateUnavailable { codebase: String, campaign: String },

    /// No such codebase is known to the store.
    NoSuchCodebase(String),

    /// No such campaign is known to the store.
    NoSuchCampaign(String),

    /// The publish subprocess returned something that didn't match the wire contract.
    PublisherInvalidResponse(String),

    /// The operation was refused by the rate limiter.
    RateLimited(String),

    /// A forge call failed transiently (timeout, 5xx, 429).
    ExternalService { service: String, message: String },

    /// Internal invariant violation.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Json(e) => write!(f, "JSON error: {}", e),
            Self::Http(e) => write!(f, "HTTP client error: {}", e),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Validation(msg) => write!(f, "validation error: {}", msg),
            Self::CandidateUnavailable { codebase, campaign } => {
                write!(f, "no candidate available for {} in {}", campaign, codebase)
            }
            Self::NoSuchCodebase(name) => write!(f, "no such codebase: {}", name),
            Self::NoSuchCampaign(name) => write!(f, "no such campaign: {}", name),
            Self::PublisherInvalidResponse(msg) => {
                write!(f, "publisher-invalid-response: {}", msg)
            }
            Self::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            Self::ExternalService { service, message } => {
                write!(f, "external service error: {}: {}", service, message)
            }
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl Error {
    /// The stable result-code string this error corresponds to, where one is defined.
    ///
    /// Used when an internal error needs to be recorded as a run/publish result code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CandidateUnavailable { .. } => "candidate-unavailable",
            Self::NoSuchCodebase(_) => "no-such-codebase",
            Self::NoSuchCampaign(_) => "no-such-campaign",
            Self::PublisherInvalidResponse(_) => "publisher-invalid-response",
            Self::RateLimited(_) => "rate-limited",
            _ => "internal-error",
        }
    }

    /// Whether retrying the operation later is worthwhile: transient forge/network
    /// failures are, configuration mistakes and validation failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Io(_)) => true,
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::ExternalService { .. } => true,
            Self::RateLimited(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
