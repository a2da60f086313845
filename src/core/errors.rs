use thiserror::Error;

/// Unified error type for the adsorption workflow library
#[derive(Debug, Error)]
pub enum FlowError {
    /// A write-once namespace key was written twice
    #[error("Key conflict: '{key}' already published by '{owner}' (attempted by '{producer}')")]
    KeyConflict {
        key: String,
        owner: String,
        producer: String,
    },

    /// A namespace key that a node requires has not been published
    #[error("Missing key '{key}' required by '{node_id}'")]
    MissingKey { key: String, node_id: String },

    /// The mutator ran without a published selection result
    #[error("No optimal distance published for idx '{idx}' (site {site_idx}); upstream selection did not run or failed")]
    UpstreamMissing { idx: String, site_idx: usize },

    /// No trial for this site produced a usable sample
    #[error("Insufficient samples for idx '{idx}': no distance trial succeeded")]
    InsufficientSamples { idx: String },

    /// Regenerated structures do not contain the requested site
    #[error("Site index {site_idx} out of range for idx '{idx}' ({available} sites regenerated)")]
    SiteIndexOutOfRange {
        idx: String,
        site_idx: usize,
        available: usize,
    },

    /// Least-squares fit could not be computed
    #[error("Curve fit failed: {message}")]
    Fit { message: String },

    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("Dependency not found: {dependency} (required by {node_id})")]
    DependencyNotFound { node_id: String, dependency: String },

    #[error("DAG not found: {0}")]
    DagNotFound(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Action not registered: {0}")]
    ActionNotRegistered(String),

    /// Configuration errors
    #[error("Configuration error in '{field}': {message}")]
    Configuration { field: String, message: String },

    /// The simulation engine reported a terminal failure
    #[error("Simulation failed for {task}: {message}")]
    Engine { task: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl FlowError {
    /// Create a configuration error for a field
    pub fn configuration<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a simulation failure
    pub fn engine<T: Into<String>, M: Into<String>>(task: T, message: M) -> Self {
        Self::Engine {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Create a fit failure
    pub fn fit<M: Into<String>>(message: M) -> Self {
        Self::Fit {
            message: message.into(),
        }
    }

    /// Create an IO error with the failing operation attached
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// The site identity this error is attributable to, if any
    pub fn idx(&self) -> Option<&str> {
        match self {
            Self::UpstreamMissing { idx, .. }
            | Self::InsufficientSamples { idx }
            | Self::SiteIndexOutOfRange { idx, .. } => Some(idx),
            _ => None,
        }
    }

    /// Check if retrying the failed operation could succeed. Errors that
    /// depend only on inputs and published data fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Engine { .. } | Self::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_attribution() {
        let err = FlowError::UpstreamMissing {
            idx: "0_1_2".to_string(),
            site_idx: 2,
        };
        assert_eq!(err.idx(), Some("0_1_2"));
        assert!(err.to_string().contains("0_1_2"));
        assert!(!err.is_retryable());

        let err = FlowError::configuration("distances", "must not be empty");
        assert_eq!(err.idx(), None);
        assert_eq!(
            err.to_string(),
            "Configuration error in 'distances': must not be empty"
        );
    }

    #[test]
    fn test_engine_errors_are_retryable() {
        let err = FlowError::engine("trial_0_0_0_1", "SCF did not converge");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("SCF did not converge"));
    }

    #[test]
    fn test_data_errors_are_not_retryable() {
        let conflict = FlowError::KeyConflict {
            key: "k".to_string(),
            owner: "a".to_string(),
            producer: "b".to_string(),
        };
        assert!(!conflict.is_retryable());
        assert!(!FlowError::InsufficientSamples { idx: "0_0_0".to_string() }.is_retryable());
        assert!(!FlowError::fit("singular matrix").is_retryable());
    }
}
