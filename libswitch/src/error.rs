//! Switch error types.
//!
//! Every failure in `libswitch` is a [`SwitchError`]. Precondition failures
//! (`NotFound`, `AlreadyExists`, `InUse`, ...) are raised before anything is
//! mutated; `InconsistentMount`, `MalformedPath` and `CycleDetected` mean the
//! observed state violates a structural invariant and are never recovered.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwitchError>;

#[derive(Debug, Error)]
pub enum SwitchError {
    /// A product, version or parent is missing.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("version {0} already exists")]
    AlreadyExists(String),

    /// The version contributes a layer to a live mount.
    #[error("version {0} is in use, unselect first")]
    InUse(String),

    /// Another version records this one as its parent.
    #[error("version {0} is parent, detach first")]
    Dependency(String),

    #[error("version {0} does not have parent")]
    NoParent(String),

    #[error("no version of product {0} is selected")]
    NotSelected(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("unexpected mount at {mount_point}: {reason}")]
    InconsistentMount { mount_point: String, reason: String },

    #[error("unexpected path {0}")]
    MalformedPath(String),

    #[error("parent chain of version {version} in product {product} contains a cycle")]
    CycleDetected { product: String, version: String },

    /// A mount helper or the tree synchronizer exited unsuccessfully.
    #[error("{command} failed: {status}")]
    ExternalTool { command: String, status: String },

    /// The io error is rendered in the message and not exposed as `source()`.
    #[error("{}: {error}", path.display())]
    Io { path: PathBuf, error: std::io::Error },

    #[error("failed to lock {}: {reason}", path.display())]
    Lock { path: PathBuf, reason: String },
}

impl SwitchError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn inconsistent(mount_point: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InconsistentMount {
            mount_point: mount_point.into(),
            reason: reason.into(),
        }
    }

    /// Build a closure that wraps an [`std::io::Error`] with the path it
    /// happened on, for use with `map_err`.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |error| Self::Io { path, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SwitchError::not_found("version", "v1");
        assert_eq!(err.to_string(), "version v1 not found");

        let err = SwitchError::Dependency("base".into());
        assert_eq!(err.to_string(), "version base is parent, detach first");
    }

    #[test]
    fn io_error_carries_path() {
        let err = SwitchError::io("/tmp/missing")(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        ));
        assert!(err.to_string().starts_with("/tmp/missing: "));
    }
}
