use thiserror::Error;

/// Errors that can occur when talking to a single endpoint.
///
/// Every variant counts as a transient provider failure for routing purposes: the
/// dispatcher lowers the endpoint's rating and retries elsewhere. The one exception is
/// [`UpstreamError::UnsupportedOperation`], which broadcast property writes skip.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded the configured timeout duration.
    #[error("Request timeout")]
    Timeout,

    /// Failed to establish a connection to the endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// HTTP-level error occurred (non-2xx status code).
    ///
    /// First field is the HTTP status code, second is the response body (truncated).
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error returned by the endpoint.
    ///
    /// First field is the RPC error code, second is the error message.
    #[error("RPC error {0}: {1}")]
    RpcError(i32, String),

    /// Network-level error from the underlying HTTP client.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response could not be parsed or was malformed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request could not be encoded for the wire.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The client does not support the requested property or operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The client's transport was closed, either explicitly or by the remote side.
    #[error("Client closed")]
    Closed,

    /// No endpoint could be selected.
    #[error("No endpoints available")]
    NoEndpoints,
}

impl UpstreamError {
    /// Returns `true` if the client reported that it cannot perform the operation.
    #[must_use]
    pub fn is_unsupported_operation(&self) -> bool {
        matches!(self, Self::UnsupportedOperation(_))
    }

    /// Returns `true` for HTTP 429 responses.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::HttpError(429, _))
    }
}

/// Errors caused by how the router was set up rather than by any endpoint.
///
/// These are fatal to the call and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The requested network is not configured.
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    /// No network has been configured at all.
    #[error("No networks configured")]
    NotInitialized,

    /// The network has no endpoint with the given url.
    #[error("Unknown endpoint {url} on network {network}")]
    UnknownEndpoint { network: String, url: String },
}

/// Errors surfaced to callers of a network client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Every attempt failed. `source` is the error from the last attempt.
    #[error("Call failed after {attempts} attempts (endpoints: {})", .endpoints.join(", "))]
    ExhaustedRetries {
        attempts: u32,
        endpoints: Vec<String>,
        #[source]
        source: UpstreamError,
    },

    /// A non-retried endpoint error, e.g. a broadcast property write that failed for a
    /// reason other than the property being unsupported.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl DispatchError {
    /// Returns the last endpoint error behind this failure, if any.
    #[must_use]
    pub fn upstream_error(&self) -> Option<&UpstreamError> {
        match self {
            Self::ExhaustedRetries { source, .. } => Some(source),
            Self::Upstream(error) => Some(error),
            Self::Configuration(_) => None,
        }
    }
}
