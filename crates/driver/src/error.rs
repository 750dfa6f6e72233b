//! Driver error types.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by runtime drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// An entity with this name is already running.
    #[error("Entity name already in use: {0}")]
    NameCollision(String),

    /// The entity, image or remote path does not exist (yet).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The runtime rejected a command.
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// The runtime did not answer in time.
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    /// The runtime answered with something we could not interpret.
    #[error("Invalid runtime response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Whether the operation may succeed if attempted again later.
    ///
    /// A missing remote path usually means the entity has not populated its
    /// filesystem yet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::NotFound(_) | DriverError::Timeout(..))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

/// Map a failed runtime CLI invocation to an error class.
pub(crate) fn classify(subject: &str, command: String, status: String, stderr: &str) -> DriverError {
    let lower = stderr.to_lowercase();
    if lower.contains("already in use") || lower.contains("already exists") {
        DriverError::NameCollision(subject.to_string())
    } else if lower.contains("no such")
        || lower.contains("not found")
        || lower.contains("could not find")
        || lower.contains("does not exist")
    {
        DriverError::NotFound(format!("{subject}: {}", stderr.trim()))
    } else {
        DriverError::Command {
            command,
            status,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Treat "already gone" as success, making stops idempotent.
pub(crate) fn ok_if_missing(result: Result<(), DriverError>) -> Result<(), DriverError> {
    match result {
        Err(DriverError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_stderr(stderr: &str) -> DriverError {
        classify("wasabi-client-000", "docker x".into(), "exit 1".into(), stderr)
    }

    #[test]
    fn test_classify_name_collision() {
        let err = classify_stderr(
            "docker: Error response from daemon: Conflict. The container name \"/wasabi-client-000\" is already in use",
        );
        assert!(matches!(err, DriverError::NameCollision(name) if name == "wasabi-client-000"));

        let err = classify_stderr("Error from server (AlreadyExists): pods \"x\" already exists");
        assert!(matches!(err, DriverError::NameCollision(_)));
    }

    #[test]
    fn test_classify_not_found_is_retryable() {
        let err = classify_stderr("Error response from daemon: No such container: wasabi-client-000");
        assert!(err.is_not_found());
        assert!(err.is_retryable());

        let err = classify_stderr("Error: Could not find the file /home/wasabi/x in container");
        assert!(err.is_not_found());

        let err = classify_stderr("cat: /x: No such file or directory");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_other_failures() {
        let err = classify_stderr("permission denied while trying to connect");
        assert!(matches!(err, DriverError::Command { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stop_of_missing_entity_is_ok() {
        let missing = Err(DriverError::NotFound("wasabi-client-000".into()));
        assert!(ok_if_missing(missing).is_ok());

        let failed = Err(DriverError::InvalidResponse("bad".into()));
        assert!(ok_if_missing(failed).is_err());
    }
}
