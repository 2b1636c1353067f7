//! PRD document loader (§1 "out of scope": full markdown section parsing is
//! an external concern; §4.G, §6). This module extracts only the
//! structured metadata the core actually consumes — the YAML frontmatter's
//! `prd`/`execution`/`requirements`/`testing` shape, or one of the two
//! documented legacy encodings — and treats section prose as opaque.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Prd, PrdDependency, PrdPhase, PrdStatus};

const FRONTMATTER_FENCE: &str = "---";
const LEGACY_METADATA_MARKER: &str = "<!-- DEV-LOOP METADATA -->";
const EMBEDDED_CONFIG_HEADING: &str = "## Dev-Loop Configuration";
const REQUIRED_SECTIONS: &[&str] = &["prd", "execution", "requirements", "testing"];

#[derive(Debug, Error)]
pub enum PrdLoadError {
    #[error("no recognised PRD metadata found (frontmatter, legacy comment, or embedded config block)")]
    NoMetadataFound,
    #[error("frontmatter is missing required section(s): {0}")]
    MissingSections(String),
    #[error("failed to parse PRD metadata: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse embedded config block as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A loaded PRD plus whatever `config:` overlay subtree accompanied it, for
/// use with [`crate::orchestrator::apply_overlay_cascade`].
#[derive(Debug)]
pub struct LoadedPrd {
    pub prd: Prd,
    pub overlay: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FrontmatterDoc {
    prd: PrdSection,
    #[serde(default)]
    execution: ExecutionSection,
    #[serde(default)]
    testing: TestingSection,
    #[serde(default)]
    config: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PrdSection {
    id: String,
    version: String,
    status: PrdStatus,
    #[serde(default, rename = "parentPrd")]
    parent_prd: Option<String>,
    #[serde(default, rename = "prdSequence")]
    prd_sequence: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionSection {
    #[serde(default, rename = "dependsOn")]
    depends_on: Vec<PrdDependency>,
    #[serde(default, rename = "idPattern")]
    id_pattern: Option<String>,
    #[serde(default)]
    phases: Vec<PrdPhase>,
}

#[derive(Debug, Default, Deserialize)]
struct TestingSection {
    #[serde(default, rename = "testingDir")]
    testing_dir: Option<String>,
}

/// Parse a PRD document's metadata, trying YAML frontmatter first, then the
/// legacy HTML-comment encoding, then an embedded JS config block.
pub fn parse_prd_document(markdown: &str) -> Result<LoadedPrd, PrdLoadError> {
    if let Some(frontmatter) = extract_frontmatter(markdown) {
        return parse_frontmatter(&frontmatter);
    }
    if let Some(legacy) = extract_legacy_metadata(markdown) {
        return Ok(legacy);
    }
    if let Some(embedded) = extract_embedded_config(markdown)? {
        return Ok(embedded);
    }
    Err(PrdLoadError::NoMetadataFound)
}

fn extract_frontmatter(markdown: &str) -> Option<String> {
    let trimmed = markdown.trim_start();
    let rest = trimmed.strip_prefix(FRONTMATTER_FENCE)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---")?;
    Some(rest[..end].to_string())
}

fn parse_frontmatter(raw: &str) -> Result<LoadedPrd, PrdLoadError> {
    let value: Value = serde_yaml::from_str(raw)?;
    let missing: Vec<&str> = REQUIRED_SECTIONS.iter().copied().filter(|s| value.get(s).is_none()).collect();
    if !missing.is_empty() {
        return Err(PrdLoadError::MissingSections(missing.join(", ")));
    }
    let doc: FrontmatterDoc = serde_json::from_value(value)?;
    let prd = Prd {
        id: doc.prd.id,
        version: doc.prd.version,
        status: doc.prd.status,
        parent_prd: doc.prd.parent_prd,
        prd_sequence: doc.prd.prd_sequence,
        dependencies: doc.execution.depends_on,
        phases: doc.execution.phases,
        id_pattern: doc.execution.id_pattern.unwrap_or_else(default_id_pattern),
        testing_dir: doc.testing.testing_dir.unwrap_or_else(default_testing_dir),
        config: doc.config.clone(),
    };
    Ok(LoadedPrd { prd, overlay: doc.config })
}

/// Legacy encoding: `<!-- DEV-LOOP METADATA -->` followed by `key: value`
/// lines until a blank line, a heading, or the comment's close.
fn extract_legacy_metadata(markdown: &str) -> Option<LoadedPrd> {
    let start = markdown.find(LEGACY_METADATA_MARKER)?;
    let after = &markdown[start + LEGACY_METADATA_MARKER.len()..];

    let mut fields = std::collections::HashMap::new();
    for line in after.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("-->") || trimmed.starts_with('#') {
            break;
        }
        match trimmed.split_once(':') {
            Some((key, value)) => {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => break,
        }
    }

    let id = fields.get("id")?.clone();
    let version = fields.get("version").cloned().unwrap_or_else(|| "1.0".to_string());
    let status = fields.get("status").and_then(|s| parse_status(s)).unwrap_or(PrdStatus::Ready);
    let dependencies = fields
        .get("dependsOn")
        .map(|s| s.split(',').map(str::trim).filter(|d| !d.is_empty()).map(|d| PrdDependency::Id(d.to_string())).collect())
        .unwrap_or_default();

    Some(LoadedPrd {
        prd: Prd {
            id,
            version,
            status,
            parent_prd: fields.get("parentPrd").cloned(),
            prd_sequence: fields.get("prdSequence").and_then(|s| s.parse().ok()),
            dependencies,
            phases: Vec::new(),
            id_pattern: fields.get("idPattern").cloned().unwrap_or_else(default_id_pattern),
            testing_dir: fields.get("testingDir").cloned().unwrap_or_else(default_testing_dir),
            config: None,
        },
        overlay: None,
    })
}

/// Legacy encoding: a `## Dev-Loop Configuration` heading followed by a
/// fenced `javascript` block containing an object literal. Only a JSON
/// subset of JS object-literal syntax is supported; anything the plain
/// `{...}` brace scan plus `serde_json` can't parse is treated as absent
/// rather than guessed at.
fn extract_embedded_config(markdown: &str) -> Result<Option<LoadedPrd>, PrdLoadError> {
    let Some(heading_at) = markdown.find(EMBEDDED_CONFIG_HEADING) else { return Ok(None) };
    let after = &markdown[heading_at..];
    let Some(fence_start) = after.find("```javascript") else { return Ok(None) };
    let body = &after[fence_start + "```javascript".len()..];
    let Some(fence_end) = body.find("```") else { return Ok(None) };
    let code = &body[..fence_end];
    let Some(brace_start) = code.find('{') else { return Ok(None) };
    let Some(object_text) = extract_balanced_braces(&code[brace_start..]) else { return Ok(None) };

    let value: Value = serde_json::from_str(&object_text)?;
    let Some(id) = value.get("id").and_then(Value::as_str) else { return Ok(None) };

    let dependencies = value
        .get("dependsOn")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(|d| PrdDependency::Id(d.to_string())).collect())
        .unwrap_or_default();

    Ok(Some(LoadedPrd {
        prd: Prd {
            id: id.to_string(),
            version: value.get("version").and_then(Value::as_str).unwrap_or("1.0").to_string(),
            status: value
                .get("status")
                .and_then(Value::as_str)
                .and_then(parse_status)
                .unwrap_or(PrdStatus::Ready),
            parent_prd: value.get("parentPrd").and_then(Value::as_str).map(str::to_string),
            prd_sequence: value.get("prdSequence").and_then(Value::as_u64).map(|n| n as u32),
            dependencies,
            phases: Vec::new(),
            id_pattern: value.get("idPattern").and_then(Value::as_str).map(str::to_string).unwrap_or_else(default_id_pattern),
            testing_dir: value.get("testingDir").and_then(Value::as_str).map(str::to_string).unwrap_or_else(default_testing_dir),
            config: value.get("config").cloned(),
        },
        overlay: value.get("config").cloned(),
    }))
}

fn extract_balanced_braces(text: &str) -> Option<String> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[..i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_status(s: &str) -> Option<PrdStatus> {
    serde_json::from_value(Value::String(s.to_lowercase())).ok()
}

fn default_id_pattern() -> String {
    "TASK-{id}".to_string()
}

fn default_testing_dir() -> String {
    "tests".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_frontmatter() {
        let markdown = r#"---
prd:
  id: P1
  version: "1.0"
  status: ready
execution:
  dependsOn: ["P0"]
  idPattern: "TASK-{id}"
requirements:
  summary: does a thing
testing:
  testingDir: tests
---

# Body
"#;
        let loaded = parse_prd_document(markdown).unwrap();
        assert_eq!(loaded.prd.id, "P1");
        assert_eq!(loaded.prd.dependencies[0].id(), "P0");
        assert_eq!(loaded.prd.id_pattern, "TASK-{id}");
    }

    #[test]
    fn missing_required_section_is_rejected() {
        let markdown = r#"---
prd:
  id: P1
  version: "1.0"
  status: ready
execution: {}
testing: {}
---
"#;
        let err = parse_prd_document(markdown).unwrap_err();
        assert!(matches!(err, PrdLoadError::MissingSections(_)));
    }

    #[test]
    fn parses_legacy_html_comment_metadata() {
        let markdown = r#"# My PRD

<!-- DEV-LOOP METADATA -->
id: P2
version: 1.0
status: active
dependsOn: P0, P1
-->

Body text.
"#;
        let loaded = parse_prd_document(markdown).unwrap();
        assert_eq!(loaded.prd.id, "P2");
        assert_eq!(loaded.prd.status, PrdStatus::Active);
        assert_eq!(loaded.prd.dependencies.len(), 2);
    }

    #[test]
    fn parses_embedded_javascript_config_block() {
        let markdown = r#"# My PRD

## Dev-Loop Configuration

```javascript
{
  "id": "P3",
  "version": "1.0",
  "status": "ready",
  "dependsOn": ["P1"]
}
```
"#;
        let loaded = parse_prd_document(markdown).unwrap();
        assert_eq!(loaded.prd.id, "P3");
        assert_eq!(loaded.prd.dependencies[0].id(), "P1");
    }

    #[test]
    fn no_recognised_metadata_is_an_error() {
        let err = parse_prd_document("# Just prose, no metadata at all.").unwrap_err();
        assert!(matches!(err, PrdLoadError::NoMetadataFound));
    }
}
