//! Custom error types for gup.

use thiserror::Error;

/// Errors surfaced by the upgrade planner and the execution engine.
#[derive(Error, Debug)]
pub enum GupError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("[{0}] agent unreachable: {1}")]
    Unreachable(String, String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GupError {
    /// Classify an agent RPC failure for the given server address.
    /// Connection-level failures map to `Unreachable`, anything else to `Transient`.
    pub fn rpc<E: std::fmt::Display>(server: &str, err: E) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();

        if lower.contains("connection refused")
            || lower.contains("no route to host")
            || lower.contains("timed out")
            || lower.contains("deadline exceeded")
            || lower.contains("unreachable")
        {
            return Self::Unreachable(server.to_string(), message);
        }

        Self::Transient(message)
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::KubernetesApi(_))
    }

    /// Returns true for `NotFound`. Several planner decisions key off this,
    /// e.g. a missing `version-etcd` label means the etcd version is unknown
    /// and must be upgraded.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Returns true when the error chain bottoms out in `GupError::NotFound`.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GupError>()
        .is_some_and(GupError::is_not_found)
}

/// Returns true when the error chain bottoms out in a transient error.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GupError>()
        .is_some_and(GupError::is_transient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = GupError::NotFound("package gravitational/planet:2.0.0".to_string());
        assert_eq!(
            err.to_string(),
            "not found: package gravitational/planet:2.0.0"
        );
    }

    #[test]
    fn test_error_display_already_exists() {
        let err = GupError::AlreadyExists("operation plan".to_string());
        assert_eq!(err.to_string(), "already exists: operation plan");
    }

    #[test]
    fn test_error_rpc_unreachable() {
        let err = GupError::rpc("172.28.128.1", "dial tcp: connection refused");
        assert!(matches!(err, GupError::Unreachable(_, _)));
        assert!(err.to_string().contains("[172.28.128.1]"));
    }

    #[test]
    fn test_error_rpc_timeout_is_unreachable() {
        let err = GupError::rpc("172.28.128.2", "request timed out after 5s");
        assert!(matches!(err, GupError::Unreachable(_, _)));
    }

    #[test]
    fn test_error_rpc_other_is_transient() {
        let err = GupError::rpc("172.28.128.3", "stream reset by peer");
        assert!(matches!(err, GupError::Transient(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_is_transient() {
        assert!(GupError::Transient("x".into()).is_transient());
        assert!(GupError::KubernetesApi("y".into()).is_transient());
        assert!(!GupError::NotFound("z".into()).is_transient());
        assert!(!GupError::BadParameter("w".into()).is_transient());
    }

    #[test]
    fn test_is_not_found_through_anyhow() {
        let err: anyhow::Error = GupError::NotFound("label version-etcd".into()).into();
        assert!(is_not_found(&err));
        assert!(!is_transient(&err));

        let plain = anyhow::anyhow!("some other failure");
        assert!(!is_not_found(&plain));
    }
}
