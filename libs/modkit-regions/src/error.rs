use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Sub-status code reported by the service next to the HTTP status.
///
/// The same numeric value can mean different things under different HTTP
/// statuses, so always match on the `(status, sub_status)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubStatusCode(pub u32);

impl SubStatusCode {
    /// No sub-status was reported
    pub const UNKNOWN: Self = Self(0);
    /// `403`: the routed region does not accept writes (failover happened)
    pub const WRITE_FORBIDDEN: Self = Self(3);
    /// `410`: the cached collection name to id mapping is stale
    pub const NAME_CACHE_IS_STALE: Self = Self(1000);
    /// `410`: the partition key range moved (split or merge)
    pub const PARTITION_KEY_RANGE_GONE: Self = Self(1002);
    /// `403`: the account is not (or no longer) served from the routed region
    pub const DATABASE_ACCOUNT_NOT_FOUND: Self = Self(1008);
}

impl fmt::Display for SubStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The connection pool could not hand out a connection.
///
/// Transports usually wrap this in their own error types; use
/// [`RequestError::is_pool_exhausted`] to find it anywhere in a source chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connection pool exhausted: {reason}")]
pub struct ConnectionPoolExhausted {
    pub reason: String,
}

impl ConnectionPoolExhausted {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Error produced by one attempt of a service request.
///
/// This is what flows through the retry policy chain.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    /// The service answered with a failure status
    #[error("service returned {status} (sub-status {sub_status}): {message}")]
    Service {
        status: http::StatusCode,
        sub_status: SubStatusCode,
        message: String,
    },

    /// No pooled connection was available
    #[error(transparent)]
    PoolExhausted(#[from] ConnectionPoolExhausted),

    /// Transport error (network, connection reset, DNS, etc)
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
}

impl RequestError {
    /// Build a service error from status, sub-status and message.
    #[must_use]
    pub fn service(
        status: http::StatusCode,
        sub_status: SubStatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Service {
            status,
            sub_status,
            message: message.into(),
        }
    }

    /// Wrap any transport-level failure.
    #[must_use]
    pub fn transport(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Transport(err.into())
    }

    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn sub_status(&self) -> Option<SubStatusCode> {
        match self {
            Self::Service { sub_status, .. } => Some(*sub_status),
            _ => None,
        }
    }

    /// `true` for a service error with exactly this status and sub-status.
    #[must_use]
    pub fn is_status_with(&self, status: http::StatusCode, sub_status: SubStatusCode) -> bool {
        self.status() == Some(status) && self.sub_status() == Some(sub_status)
    }

    /// `true` for `410 Gone` with the given sub-status.
    #[must_use]
    pub fn is_gone_with(&self, sub_status: SubStatusCode) -> bool {
        self.is_status_with(http::StatusCode::GONE, sub_status)
    }

    /// `true` if a [`ConnectionPoolExhausted`] appears anywhere in the chain.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        if matches!(self, Self::PoolExhausted(_)) {
            return true;
        }
        let mut current: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = current {
            if err.is::<ConnectionPoolExhausted>() {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// `true` for transport errors that are not pool exhaustion.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_)) && !self.is_pool_exhausted()
    }
}

/// Failure fetching the account topology document.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// An endpoint URL could not be parsed or joined
    #[error("invalid topology URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// URL scheme rejected by the transport security settings
    #[error("URL scheme '{0}' not allowed: HTTPS is required")]
    InsecureScheme(String),

    /// Request building failed
    #[error("failed to build topology request: {0}")]
    RequestBuild(#[from] http::Error),

    /// HTTP non-2xx status
    #[error("topology HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
    },

    /// Transport error (network, connection, etc)
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn StdError + Send + Sync>),

    /// The request did not complete in time
    #[error("topology request timed out after {0:?}")]
    Timeout(Duration),

    /// The document could not be decoded
    #[error("invalid topology document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}

impl From<hyper_util::client::legacy::Error> for FetchError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        FetchError::Transport(Box::new(err))
    }
}

impl From<hyper::Error> for FetchError {
    fn from(err: hyper::Error) -> Self {
        FetchError::Transport(Box::new(err))
    }
}

/// Errors surfaced by the endpoint manager and configuration layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegionsError {
    /// Every candidate endpoint failed; carries the last failure
    #[error("failed to fetch account topology from {endpoint}: {source}")]
    Fetch {
        endpoint: Url,
        #[source]
        source: FetchError,
    },

    /// Configuration is invalid
    #[error("invalid regions configuration: {0}")]
    Config(String),

    /// Configuration could not be loaded or extracted
    #[error("failed to load regions configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// The manager was closed
    #[error("global endpoint manager is closed")]
    Closed,
}
