//! Placement constraints for run specs.

use serde::{Deserialize, Serialize};

/// A single placement constraint over an agent attribute or hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// The attribute name the constraint applies to. The special field
    /// `hostname` refers to the agent host rather than an attribute.
    pub field: String,
    /// The constraint operator.
    pub operator: ConstraintOperator,
}

/// Constraint operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOperator {
    /// Every instance must see a distinct value.
    Unique,
    /// All instances must share the given value; an empty value means they
    /// must merely agree with each other.
    Cluster {
        /// Required value, or empty for "all equal".
        #[serde(default)]
        value: String,
    },
    /// Balance instances across `value` distinct values (best effort when
    /// zero, meaning "as many values as the cluster offers").
    GroupBy {
        /// Number of buckets to balance across; 0 = unbounded.
        #[serde(default)]
        value: u32,
    },
    /// The attribute must match the given regular expression.
    Like {
        /// Full-match regular expression.
        value: String,
    },
    /// The attribute must not match the given regular expression.
    Unlike {
        /// Full-match regular expression.
        value: String,
    },
    /// At most `value` instances may share one attribute value.
    MaxPer {
        /// Per-value instance ceiling.
        value: u32,
    },
}

impl Constraint {
    /// Convenience constructor for a hostname-unique constraint.
    pub fn unique_host() -> Self {
        Constraint { field: "hostname".to_string(), operator: ConstraintOperator::Unique }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_serialization() {
        let c = Constraint {
            field: "rack".to_string(),
            operator: ConstraintOperator::MaxPer { value: 2 },
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("MAX_PER"));
        let back: Constraint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_cluster_default_value() {
        let json = r#"{"field":"zone","operator":{"op":"CLUSTER"}}"#;
        let c: Constraint = serde_json::from_str(json).unwrap();
        assert_eq!(c.operator, ConstraintOperator::Cluster { value: String::new() });
    }
}
