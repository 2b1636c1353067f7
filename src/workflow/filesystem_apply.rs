//! Concrete [`ApplyPrimitive`] that materialises a [`FileChange`] on disk
//! under a working directory. Boundary and patch-uniqueness checks already
//! ran before a change reaches here (§4.E); this primitive only performs
//! the write and reports what happened.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::{ApplyOutcome, ApplyResult, FileChange, FileOperation};

use super::apply::ApplyPrimitive;

pub struct FilesystemApplyPrimitive {
    working_dir: PathBuf,
}

impl FilesystemApplyPrimitive {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self { working_dir: working_dir.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.working_dir.join(path)
    }
}

#[async_trait]
impl ApplyPrimitive for FilesystemApplyPrimitive {
    async fn apply(&self, change: &FileChange) -> ApplyResult {
        let target = self.resolve(&change.path);
        let result = match change.operation {
            FileOperation::Create | FileOperation::Update => {
                let content = change.content.clone().unwrap_or_default();
                write_with_parents(&target, &content)
            }
            FileOperation::Delete => std::fs::remove_file(&target),
            FileOperation::Patch => apply_patches(&target, change),
        };

        match result {
            Ok(()) => ApplyResult { path: change.path.clone(), outcome: ApplyOutcome::Applied, message: None },
            Err(e) => ApplyResult {
                path: change.path.clone(),
                outcome: ApplyOutcome::IoError,
                message: Some(e.to_string()),
            },
        }
    }
}

fn write_with_parents(target: &std::path::Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, content)
}

fn apply_patches(target: &std::path::Path, change: &FileChange) -> std::io::Result<()> {
    let mut content = std::fs::read_to_string(target)?;
    for patch in change.patches.as_deref().unwrap_or_default() {
        content = content.replacen(&patch.search, &patch.replace, 1);
    }
    std::fs::write(target, content)
}
