//! Validation errors for the declarative model.

use thiserror::Error;

use crate::path::PathId;

/// Result type alias for model validation.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Structural or semantic violations in a declared model.
///
/// Validation failures are surfaced to the caller and never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// A path contains illegal characters or structure.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Two entities share an immediate id within one group.
    #[error("duplicate id in group {0}: {1}")]
    DuplicateId(PathId, String),

    /// The dependency graph over the group tree contains a cycle.
    #[error("cyclic dependencies")]
    CyclicDependency,

    /// A capacity fraction lies outside [0, 1].
    #[error("capacity {1} for {0} must be within [0, 1]")]
    InvalidCapacity(&'static str, f64),

    /// A declared port is duplicated.
    #[error("duplicate port {0}")]
    DuplicatePort(u16),

    /// `require_ports` was set but a dynamic port (0) was declared.
    #[error("requirePorts is incompatible with dynamic port declarations")]
    RequirePortsWithDynamicPort,

    /// A run spec is structurally incomplete.
    #[error("invalid run spec {0}: {1}")]
    InvalidRunSpec(PathId, String),

    /// An entity was declared at a path that is not under its parent group.
    #[error("{0} is not a child of {1}")]
    NotAChild(PathId, PathId),
}
