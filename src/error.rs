//! Error types for the load test engine.
//!
//! Defines [`LoadTestError`] for fatal configuration and setup errors,
//! [`PoolError`] for VU pool exhaustion, [`SampleError`] for metric values
//! that cannot be aggregated, [`HttpError`] for failures of the
//! HTTP collaborator, and [`IterationError`] for errors returned by user
//! iteration code.

/// Errors that abort a run before it starts: config parsing, validation,
/// file I/O, and setup failures.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax,
    /// an unrecognized option, or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// JSON parse failure for k6-style option objects.
    #[error("Failed to parse config JSON: {source}")]
    ConfigJson {
        #[from]
        source: serde_json::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., a zero-length stage, `maxVUs` below
    /// `preAllocatedVUs`).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// A threshold expression that could not be parsed or does not apply
    /// to the metric it is attached to.
    #[error("Invalid threshold '{expression}' on metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The setup function failed; no scenario was started.
    #[error("Setup failed: {message}")]
    Setup { message: String },
}

impl LoadTestError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// VU pool errors.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No idle VU and the scenario is already at `maxVUs`.
    #[error("No free VU for scenario '{scenario}' (maxVUs = {max_vus})")]
    Exhausted { scenario: String, max_vus: u64 },

    /// Reserving VUs for a scenario would exceed the pool's capacity.
    #[error("Cannot reserve {requested} VUs: pool capacity is {capacity}, {reserved} already reserved")]
    CapacityExceeded {
        requested: u64,
        reserved: u64,
        capacity: u64,
    },
}

/// A sample value that a metric summary cannot absorb.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Sample value {value} is not finite")]
    NotFinite { value: f64 },

    /// The trend histogram refused the scaled value.
    #[error("Histogram rejected sample value {value}: {reason:?}")]
    Histogram {
        value: f64,
        reason: hdrhistogram::errors::RecordError,
    },
}

/// HTTP collaborator errors encountered during iterations.
///
/// Status codes >= 400 are not errors at this level: they come back as a
/// response and are counted in `http_req_failed`.
#[derive(Debug, thiserror::Error, Clone)]
pub enum HttpError {
    /// The request exceeded the configured per-request timeout.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake).
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The request could not be built or sent (bad URL, bad header).
    #[error("Request error: {message}")]
    Request { message: String },

    /// The response body could not be read.
    #[error("Failed to read response body: {message}")]
    Body { message: String },
}

impl HttpError {
    /// Returns the error category as a static string for sample tagging.
    ///
    /// Categories: `"timeout"`, `"connection"`, `"request"`, `"body"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection { .. } => "connection",
            Self::Request { .. } => "request",
            Self::Body { .. } => "body",
        }
    }

    /// Classify a [`reqwest::Error`] into the appropriate variant.
    #[cfg(feature = "http-client")]
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection {
                message: err.to_string(),
            }
        } else if err.is_body() || err.is_decode() {
            Self::Body {
                message: err.to_string(),
            }
        } else {
            Self::Request {
                message: err.to_string(),
            }
        }
    }
}

/// Error returned by an iteration function.
///
/// Counted in `iteration_errors` and logged; the VU keeps running.
#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    /// An HTTP call the iteration chose to propagate.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Any other failure raised by user code.
    #[error("{0}")]
    Failed(String),
}

impl IterationError {
    /// Build an [`IterationError::Failed`] from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for IterationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for IterationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}
