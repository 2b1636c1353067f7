//! `ApplyPrimitive`: the external file-materialisation boundary (§1, §4.E).
//!
//! Applying a `FileChange` to disk is explicitly out of scope for the core;
//! the core only decides *whether* a change is allowed to reach the
//! primitive (target-module boundary, patch well-formedness) and *what* to
//! do with the result.

use async_trait::async_trait;

use crate::domain::{ApplyOutcome, ApplyResult, FileChange, FileOperation};

#[async_trait]
pub trait ApplyPrimitive: Send + Sync {
    async fn apply(&self, change: &FileChange) -> ApplyResult;
}

/// Predictive boundary check: a file write outside `target_module` is
/// rejected before the primitive is ever invoked (§4.E "applying-changes").
pub fn check_boundary(change: &FileChange, target_module: Option<&str>) -> Option<ApplyResult> {
    let Some(prefix) = target_module else { return None };
    if change.path.starts_with(prefix) {
        return None;
    }
    Some(ApplyResult {
        path: change.path.clone(),
        outcome: ApplyOutcome::BoundaryViolation,
        message: Some(format!("write to {} is outside target module {prefix}", change.path)),
    })
}

/// A `patch` file whose `search` text does not appear exactly once in
/// `current_content` fails with `PATCH_FAILED` — zero matches and multiple
/// matches are both rejected (§8 boundary behaviour: uniqueness required).
pub fn validate_patch_uniqueness(change: &FileChange, current_content: &str) -> Option<ApplyResult> {
    if change.operation != FileOperation::Patch {
        return None;
    }
    let patches = change.patches.as_deref().unwrap_or(&[]);
    if patches.is_empty() {
        return Some(ApplyResult {
            path: change.path.clone(),
            outcome: ApplyOutcome::PatchFailed,
            message: Some("patch operation requires a non-empty patches array".into()),
        });
    }
    for patch in patches {
        let occurrences = current_content.matches(patch.search.as_str()).count();
        if occurrences != 1 {
            return Some(ApplyResult {
                path: change.path.clone(),
                outcome: ApplyOutcome::PatchFailed,
                message: Some(format!(
                    "search text matched {occurrences} times in {}; exactly one match is required",
                    change.path
                )),
            });
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Patch;

    fn change(path: &str, op: FileOperation) -> FileChange {
        FileChange {
            path: path.to_string(),
            operation: op,
            content: None,
            patches: None,
        }
    }

    #[test]
    fn write_inside_target_module_is_allowed() {
        let c = change("src/api/handler.rs", FileOperation::Create);
        assert!(check_boundary(&c, Some("src/api")).is_none());
    }

    #[test]
    fn write_outside_target_module_is_blocked() {
        let c = change("src/other/handler.rs", FileOperation::Create);
        let result = check_boundary(&c, Some("src/api")).unwrap();
        assert_eq!(result.outcome, ApplyOutcome::BoundaryViolation);
    }

    #[test]
    fn no_target_module_means_no_boundary() {
        let c = change("anywhere.rs", FileOperation::Create);
        assert!(check_boundary(&c, None).is_none());
    }

    #[test]
    fn patch_with_unique_match_passes() {
        let mut c = change("f.rs", FileOperation::Patch);
        c.patches = Some(vec![Patch {
            search: "needle".into(),
            replace: "found".into(),
        }]);
        assert!(validate_patch_uniqueness(&c, "hay needle stack").is_none());
    }

    #[test]
    fn patch_with_duplicate_match_fails() {
        let mut c = change("f.rs", FileOperation::Patch);
        c.patches = Some(vec![Patch {
            search: "needle".into(),
            replace: "found".into(),
        }]);
        let result = validate_patch_uniqueness(&c, "needle needle").unwrap();
        assert_eq!(result.outcome, ApplyOutcome::PatchFailed);
    }

    #[test]
    fn patch_with_zero_matches_fails() {
        let mut c = change("f.rs", FileOperation::Patch);
        c.patches = Some(vec![Patch {
            search: "absent".into(),
            replace: "x".into(),
        }]);
        let result = validate_patch_uniqueness(&c, "nothing here").unwrap();
        assert_eq!(result.outcome, ApplyOutcome::PatchFailed);
    }

    #[test]
    fn patch_without_patches_array_fails() {
        let c = change("f.rs", FileOperation::Patch);
        let result = validate_patch_uniqueness(&c, "anything").unwrap();
        assert_eq!(result.outcome, ApplyOutcome::PatchFailed);
    }

    #[test]
    fn patch_with_empty_patches_array_fails() {
        let mut c = change("f.rs", FileOperation::Patch);
        c.patches = Some(vec![]);
        let result = validate_patch_uniqueness(&c, "anything").unwrap();
        assert_eq!(result.outcome, ApplyOutcome::PatchFailed);
    }
}
