//! PRD and PRD-set record types.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a PRD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrdStatus {
    Planning,
    Ready,
    Active,
    Blocked,
    Complete,
    Split,
    Deprecated,
}

impl std::fmt::Display for PrdStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Complete => "complete",
            Self::Split => "split",
            Self::Deprecated => "deprecated",
        };
        write!(f, "{s}")
    }
}

/// Status of a phase within a PRD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Complete,
    MostlyComplete,
    Deferred,
    Optional,
    LowPriority,
}

/// A declared dependency on another PRD. PRD markdown may encode this either
/// as a bare id string or as `{prd: id}`; both are accepted at the
/// deserialization boundary via `#[serde(untagged)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrdDependency {
    Id(String),
    Object { prd: String },
}

impl PrdDependency {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object { prd } => prd,
        }
    }
}

/// One ordered phase of work within a PRD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// A single PRD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    pub id: String,
    pub version: String,
    pub status: PrdStatus,
    #[serde(default, rename = "parentPrd", skip_serializing_if = "Option::is_none")]
    pub parent_prd: Option<String>,
    #[serde(default, rename = "prdSequence", skip_serializing_if = "Option::is_none")]
    pub prd_sequence: Option<u32>,
    #[serde(default)]
    pub dependencies: Vec<PrdDependency>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(rename = "idPattern")]
    pub id_pattern: String,
    #[serde(rename = "testingDir")]
    pub testing_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl Prd {
    pub fn is_set_parent(&self) -> bool {
        self.status == PrdStatus::Split
    }
}

/// A parent PRD (status=split) plus its children, validated as a set.
#[derive(Debug, Clone)]
pub struct PrdSet {
    pub parent: Prd,
    pub children: Vec<Prd>,
}

#[derive(Debug, thiserror::Error)]
pub enum PrdSetError {
    #[error("parent PRD {0} does not have status=split")]
    ParentNotSplit(String),
    #[error("child PRD {child} has parentPrd={actual:?}, expected {expected}")]
    ParentMismatch {
        child: String,
        actual: Option<String>,
        expected: String,
    },
    #[error("duplicate prdSequence {sequence} among children {first} and {second}")]
    DuplicateSequence { sequence: u32, first: String, second: String },
}

impl PrdSet {
    /// Validate the invariants in §3: exactly one parent, every child's
    /// `parentPrd` matches, and `prdSequence` is unique per set.
    pub fn new(parent: Prd, children: Vec<Prd>) -> Result<Self, PrdSetError> {
        if !parent.is_set_parent() {
            return Err(PrdSetError::ParentNotSplit(parent.id.clone()));
        }
        let mut seen: Vec<(u32, String)> = Vec::new();
        for child in &children {
            if child.parent_prd.as_deref() != Some(parent.id.as_str()) {
                return Err(PrdSetError::ParentMismatch {
                    child: child.id.clone(),
                    actual: child.parent_prd.clone(),
                    expected: parent.id.clone(),
                });
            }
            if let Some(seq) = child.prd_sequence {
                if let Some((_, first)) = seen.iter().find(|(s, _)| *s == seq) {
                    return Err(PrdSetError::DuplicateSequence {
                        sequence: seq,
                        first: first.clone(),
                        second: child.id.clone(),
                    });
                }
                seen.push((seq, child.id.clone()));
            }
        }
        Ok(Self { parent, children })
    }
}

/// A topological layer of the PRD DAG: all members are mutually independent.
pub type ExecutionLevel = Vec<String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn prd(id: &str, status: PrdStatus, parent: Option<&str>, seq: Option<u32>) -> Prd {
        Prd {
            id: id.to_string(),
            version: "1.0".to_string(),
            status,
            parent_prd: parent.map(str::to_string),
            prd_sequence: seq,
            dependencies: Vec::new(),
            phases: Vec::new(),
            id_pattern: "TASK-{id}".to_string(),
            testing_dir: "tests".to_string(),
            config: None,
        }
    }

    #[test]
    fn rejects_non_split_parent() {
        let parent = prd("P0", PrdStatus::Active, None, None);
        let err = PrdSet::new(parent, vec![]).unwrap_err();
        assert!(matches!(err, PrdSetError::ParentNotSplit(_)));
    }

    #[test]
    fn rejects_mismatched_parent_ref() {
        let parent = prd("P0", PrdStatus::Split, None, None);
        let child = prd("P1", PrdStatus::Ready, Some("WRONG"), Some(1));
        let err = PrdSet::new(parent, vec![child]).unwrap_err();
        assert!(matches!(err, PrdSetError::ParentMismatch { .. }));
    }

    #[test]
    fn rejects_duplicate_sequence() {
        let parent = prd("P0", PrdStatus::Split, None, None);
        let c1 = prd("P1", PrdStatus::Ready, Some("P0"), Some(1));
        let c2 = prd("P2", PrdStatus::Ready, Some("P0"), Some(1));
        let err = PrdSet::new(parent, vec![c1, c2]).unwrap_err();
        assert!(matches!(err, PrdSetError::DuplicateSequence { .. }));
    }

    #[test]
    fn accepts_valid_set() {
        let parent = prd("P0", PrdStatus::Split, None, None);
        let c1 = prd("P1", PrdStatus::Ready, Some("P0"), Some(1));
        let c2 = prd("P2", PrdStatus::Ready, Some("P0"), Some(2));
        assert!(PrdSet::new(parent, vec![c1, c2]).is_ok());
    }

    #[test]
    fn dependency_untagged_forms() {
        let by_id: PrdDependency = serde_json::from_str(r#""P1""#).unwrap();
        let by_obj: PrdDependency = serde_json::from_str(r#"{"prd": "P1"}"#).unwrap();
        assert_eq!(by_id.id(), "P1");
        assert_eq!(by_obj.id(), "P1");
    }
}
