//! Error types for minifleet

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Registry Errors ===
    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Invalid node {node}: {reason}")]
    InvalidNode { node: String, reason: String },

    // === Placement Errors ===
    #[error("Insufficient capacity for volume {volume}: need {needed} nodes, have {available}")]
    InsufficientCapacity {
        volume: String,
        needed: usize,
        available: usize,
    },

    #[error("No eligible workload nodes for service {0}")]
    NoEligibleNodes(String),

    // === Safety Errors ===
    #[error("Quorum lost: {reachable} of {voting} voters reachable")]
    QuorumLost { reachable: usize, voting: usize },

    #[error("Placement stuck for {entity} on {node} after {attempts} attempts")]
    PlacementStuck {
        entity: String,
        node: String,
        attempts: u32,
    },

    // === Boundary Errors ===
    #[error("Runtime error on {node}: {reason}")]
    Runtime { node: String, reason: String },

    /// The node agent refused the request; repeating it will not help
    #[error("Runtime rejected request on {node}: {reason}")]
    Rejected { node: String, reason: String },

    #[error("Ingress error: {0}")]
    Ingress(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient failure worth retrying with backoff?
    ///
    /// Capacity and quorum conditions are never retryable: they only clear
    /// when the cluster itself changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Runtime { .. }
            | Error::Timeout(_)
            | Error::ConnectionFailed(_)
            | Error::Ingress(_) => true,
            // A body that does not decode will not decode next time either
            Error::Http(e) => !e.is_decode() && !e.is_builder(),
            _ => false,
        }
    }

    /// Short condition name used in logs and the condition log
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DuplicateNode(_) => "DuplicateNode",
            Error::UnknownNode(_) => "UnknownNode",
            Error::InsufficientCapacity { .. } => "InsufficientCapacity",
            Error::NoEligibleNodes(_) => "NoEligibleNodes",
            Error::QuorumLost { .. } => "QuorumLost",
            Error::PlacementStuck { .. } => "PlacementStuck",
            Error::Rejected { .. } => "Rejected",
            Error::Timeout(_) => "Timeout",
            _ => "Error",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::UnknownNode(_) => StatusCode::NOT_FOUND,
            Error::DuplicateNode(_) => StatusCode::CONFLICT,
            Error::InvalidNode { .. }
            | Error::InvalidConfig(_)
            | Error::InvalidManifest(_)
            | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::QuorumLost { .. }
            | Error::InsufficientCapacity { .. }
            | Error::NoEligibleNodes(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("create".into()).is_retryable());
        assert!(Error::Runtime {
            node: "a".into(),
            reason: "boom".into()
        }
        .is_retryable());
        assert!(!Error::Rejected {
            node: "a".into(),
            reason: "agent returned 400 Bad Request".into()
        }
        .is_retryable());
        assert!(!Error::Json(serde_json::from_str::<u32>("nope").unwrap_err()).is_retryable());
        assert!(!Error::QuorumLost {
            reachable: 1,
            voting: 3
        }
        .is_retryable());
        assert!(!Error::InsufficientCapacity {
            volume: "db".into(),
            needed: 2,
            available: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::UnknownNode("x".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::DuplicateNode("x".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::QuorumLost {
                reachable: 1,
                voting: 3
            }
            .to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
