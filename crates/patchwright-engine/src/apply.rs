//! Applying a `write_to_files` batch to the workspace, then checking the whole project.

use patchwright_adapters::artifacts::write_diff_artifact;
use patchwright_adapters::util::debug_stderr_enabled;
use patchwright_adapters::workspace::Workspace;
use patchwright_core::diff::apply_diff_to_content;
use patchwright_core::util::normalize_rel_path;
use patchwright_core::{
    ApplyReport, ApplyStatus, ChangeKind, ChangeOutcome, ChangeRequest, ChangeStatus,
    FailureScope, ProjectValidator,
};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const NO_CHANGES: &str = "No changes were provided.";
pub const DEMOTED_DETAIL: &str = "Change was applied but the file contains compilation errors. For fixing assume the previous changes were applied and treat the file contents as new.";
const DELETE_MISSING_DETAIL: &str = "File did not exist, no action taken.";

/// Outcome of a single change before it is folded into the batch report.
enum ChangeResult {
    Applied(Option<String>),
    Failed(String),
    Invalid(String),
}

#[derive(Clone)]
pub struct ChangeApplier {
    workspace: Workspace,
    validator: Arc<dyn ProjectValidator>,
    write_diff_artifacts: bool,
}

impl ChangeApplier {
    pub fn new(workspace: Workspace, validator: Arc<dyn ProjectValidator>) -> Self {
        Self {
            workspace,
            validator,
            write_diff_artifacts: true,
        }
    }

    pub fn with_diff_artifacts(mut self, enabled: bool) -> Self {
        self.write_diff_artifacts = enabled;
        self
    }

    /// Apply every change independently, then validate the project if all of them landed.
    pub fn apply_changes(&self, changes: &[ChangeRequest]) -> ApplyReport {
        if changes.is_empty() {
            return ApplyReport {
                status: ApplyStatus::Failure,
                scope: None,
                errors: NO_CHANGES.to_string(),
                error_files: Vec::new(),
                results: Vec::new(),
            };
        }

        let mut results = Vec::with_capacity(changes.len());
        let mut errors: Vec<String> = Vec::new();
        let mut error_files = BTreeSet::new();

        for (index, change) in changes.iter().enumerate() {
            let path = change.path.as_deref().map(normalize_rel_path);
            let (status, details) = match self.apply_one(index, change) {
                ChangeResult::Applied(detail) => (ChangeStatus::Success, detail),
                ChangeResult::Failed(error) => {
                    errors.push(error.clone());
                    (ChangeStatus::Failure, Some(error))
                }
                ChangeResult::Invalid(error) => {
                    errors.push(error.clone());
                    (ChangeStatus::Error, Some(error))
                }
            };
            if status != ChangeStatus::Success {
                if let Some(p) = path.as_ref().filter(|p| !p.is_empty()) {
                    error_files.insert(p.clone());
                }
                eprintln!(
                    "  ! {} {}: {}",
                    change.change_type.as_deref().unwrap_or("change"),
                    path.as_deref().unwrap_or("?"),
                    details.as_deref().unwrap_or_default()
                );
            }
            results.push(ChangeOutcome {
                index,
                path,
                change_type: change.change_type.clone(),
                status,
                details,
            });
        }

        if !errors.is_empty() {
            return ApplyReport {
                status: ApplyStatus::Failure,
                scope: Some(FailureScope::File),
                errors: errors.join("\n"),
                error_files: error_files.into_iter().collect(),
                results,
            };
        }

        let validation = self.validator.validate();
        if validation.success {
            return ApplyReport::success(results);
        }

        eprintln!("  ! Project check failed");
        let flagged: BTreeSet<String> = validation
            .error_files
            .iter()
            .map(|p| normalize_rel_path(p))
            .collect();
        for result in results.iter_mut() {
            let hit = result
                .path
                .as_ref()
                .is_some_and(|p| flagged.contains(p.as_str()));
            if result.status == ChangeStatus::Success && hit {
                result.status = ChangeStatus::Failure;
                result.details = Some(DEMOTED_DETAIL.to_string());
            }
        }

        ApplyReport {
            status: ApplyStatus::Failure,
            scope: Some(FailureScope::Project),
            errors: validation.errors,
            error_files: flagged.into_iter().collect(),
            results,
        }
    }

    fn apply_one(&self, index: usize, change: &ChangeRequest) -> ChangeResult {
        let (Some(kind), Some(path)) = (
            change.change_type.as_deref().filter(|t| !t.trim().is_empty()),
            change.path.as_deref().filter(|p| !p.trim().is_empty()),
        ) else {
            return ChangeResult::Invalid(format!(
                "Change #{} is invalid: missing 'type' or 'path'.",
                index
            ));
        };
        let Some(kind) = ChangeKind::parse(kind) else {
            return ChangeResult::Failed(format!("Unknown change type: {}", kind));
        };
        let resolved = match self.workspace.resolve(path) {
            Ok(resolved) => resolved,
            Err(e) => return ChangeResult::Invalid(e),
        };

        match kind {
            ChangeKind::Create => {
                let Some(content) = change.content.as_deref() else {
                    return ChangeResult::Failed(
                        "Create operation missing 'content' field.".to_string(),
                    );
                };
                match self.workspace.write_file(path, content) {
                    Ok(()) => ChangeResult::Applied(None),
                    Err(e) => ChangeResult::Failed(e),
                }
            }
            ChangeKind::Modify => {
                let docs = change.differences.as_deref().unwrap_or_default();
                if docs.iter().all(|d| d.trim().is_empty()) {
                    // Verification turns sometimes "modify" without any edits.
                    return ChangeResult::Applied(None);
                }
                if !resolved.absolute.is_file() {
                    return ChangeResult::Failed("File to modify does not exist.".to_string());
                }
                let original = match self.workspace.read_file(path) {
                    Ok(original) => original,
                    Err(e) => return ChangeResult::Failed(e),
                };
                let updated = match apply_diff_to_content(&docs.join("\n"), &original, true) {
                    Ok(updated) => updated,
                    Err(e) => return ChangeResult::Failed(e.to_string()),
                };
                if let Err(e) = self.workspace.write_file(path, &updated) {
                    return ChangeResult::Failed(e);
                }
                if self.write_diff_artifacts {
                    let label = normalize_rel_path(path);
                    if let Err(e) =
                        write_diff_artifact(&resolved.absolute, &label, &original, &updated)
                    {
                        if debug_stderr_enabled() {
                            eprintln!("  Warning: {}", e);
                        }
                    }
                }
                ChangeResult::Applied(None)
            }
            ChangeKind::Delete => match self.workspace.delete_file(path) {
                Ok(true) => ChangeResult::Applied(None),
                Ok(false) => ChangeResult::Applied(Some(DELETE_MISSING_DETAIL.to_string())),
                Err(e) => ChangeResult::Failed(e),
            },
        }
    }
}
