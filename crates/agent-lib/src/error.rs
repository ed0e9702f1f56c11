//! Error types for the agent library
//!
//! Cluster-read and owner-resolution failures are recoverable per item;
//! `ExportError` covers the structural failures that abort an export cycle.

use crate::models::CloudProvider;
use thiserror::Error;

/// Failure to parse a Kubernetes quantity string
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity '{0}'")]
    Invalid(String),
    #[error("unknown quantity suffix '{suffix}' in '{quantity}'")]
    UnknownSuffix { quantity: String, suffix: String },
    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// Failure reading from the cluster API
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("cannot read workload of kind {0}")]
    UnsupportedKind(String),
    #[error("object is missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid quantity: {0}")]
    Quantity(#[from] QuantityError),
}

/// Failure walking an ownership chain
#[derive(Debug, Error)]
pub enum OwnerError {
    #[error("{name} reached maximum owner depth {depth} without finding the root owner")]
    MaxDepthExceeded { name: String, depth: usize },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Failure enriching a workload with its replica count
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("unsupported workload kind: {0}")]
    UnsupportedKind(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Structural failure that aborts an export cycle
///
/// Delta buffers are left untouched when any of these is returned.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to list nodes: {0}")]
    NodeList(#[source] ClusterError),
    #[error("failed to list pods: {0}")]
    PodList(#[source] ClusterError),
    #[error("failed to look up namespace {namespace}: {source}")]
    NamespaceLookup {
        namespace: String,
        #[source]
        source: ClusterError,
    },
    #[error("failed to encode cluster snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure talking to the control plane
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("control plane returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("control plane rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("invalid response envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("gzip failure: {0}")]
    Compression(#[from] std::io::Error),
    #[error("request payload is empty")]
    EmptyPayload,
    #[error("control plane assigned an empty cluster id")]
    EmptyClusterId,
    #[error("{resource} upload does not match cloud provider {provider:?}")]
    ProviderMismatch {
        resource: &'static str,
        provider: CloudProvider,
    },
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            TransportError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
