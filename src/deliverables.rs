//! Deliverables validation.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GateError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverablesResult {
    pub satisfied: bool,
    pub missing: Vec<String>,
    pub reasons: Vec<String>,
}

impl DeliverablesResult {
    pub fn satisfied() -> Self {
        Self {
            satisfied: true,
            ..Self::default()
        }
    }
}

/// Checks a phase's declared deliverables. An `Err` means the validator
/// itself broke, not that deliverables are missing.
pub trait DeliverablesValidator: Send + Sync {
    fn validate(&self, deliverables: &[String]) -> Result<DeliverablesResult, GateError>;
}

/// Each deliverable must be an existing, non-empty file (or a non-empty
/// directory) under the workspace.
pub struct FileDeliverablesValidator {
    workspace: PathBuf,
}

impl FileDeliverablesValidator {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

impl DeliverablesValidator for FileDeliverablesValidator {
    fn validate(&self, deliverables: &[String]) -> Result<DeliverablesResult, GateError> {
        let mut result = DeliverablesResult::satisfied();
        for item in deliverables {
            let rel = Path::new(item);
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                result.missing.push(item.clone());
                result
                    .reasons
                    .push(format!("deliverable {item} is outside the workspace"));
                continue;
            }
            let path = self.workspace.join(rel);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() == 0 => {
                    result.missing.push(item.clone());
                    result.reasons.push(format!("deliverable {item} is empty"));
                }
                Ok(meta) if meta.is_dir() => {
                    let empty = std::fs::read_dir(&path)
                        .map_err(|e| GateError::Validator(format!("{}: {e}", path.display())))?
                        .next()
                        .is_none();
                    if empty {
                        result.missing.push(item.clone());
                        result.reasons.push(format!("deliverable {item} is an empty directory"));
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    result.missing.push(item.clone());
                    result.reasons.push(format!("missing deliverable {item}"));
                }
                Err(e) => {
                    return Err(GateError::Validator(format!("{}: {e}", path.display())));
                }
            }
        }
        result.satisfied = result.missing.is_empty();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_missing_and_empty_items() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/parser.rs"), "fn parse() {}").unwrap();
        std::fs::write(dir.path().join("src/empty.rs"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();

        let v = FileDeliverablesValidator::new(dir.path());
        let r = v
            .validate(&[
                "src/parser.rs".into(),
                "src/empty.rs".into(),
                "src/lexer.rs".into(),
                "docs".into(),
            ])
            .unwrap();
        assert!(!r.satisfied);
        assert_eq!(r.missing, vec!["src/empty.rs", "src/lexer.rs", "docs"]);
        assert!(r.reasons.contains(&"missing deliverable src/lexer.rs".to_string()));
    }

    #[test]
    fn all_present_is_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();
        let r = FileDeliverablesValidator::new(dir.path())
            .validate(&["README.md".into()])
            .unwrap();
        assert!(r.satisfied);
        assert!(FileDeliverablesValidator::new(dir.path()).validate(&[]).unwrap().satisfied);
    }

    #[test]
    fn escaping_paths_are_never_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let r = FileDeliverablesValidator::new(dir.path())
            .validate(&["../outside.rs".into(), "/etc/passwd".into()])
            .unwrap();
        assert_eq!(r.missing.len(), 2);
    }
}
