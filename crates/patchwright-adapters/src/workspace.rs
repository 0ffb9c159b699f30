//! File access rooted at a project directory.
//!
//! Every path handed in by a model is resolved through [`resolve_project_path`], so reads and
//! writes can never leave the project root.

use crate::util::{resolve_project_path, ProjectPath};
use chrono::{DateTime, Local};
use patchwright_core::util::normalize_rel_path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const IGNORED_DIRS: [&str; 8] = [
    ".git",
    "node_modules",
    "dist",
    "build",
    ".vscode",
    ".idea",
    "__pycache__",
    ".patchwright",
];
const IGNORED_FILES: [&str; 5] = [
    ".DS_Store",
    "package-lock.json",
    "yarn.lock",
    "eslint.config.js",
    "vite-env.d.ts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_size: u64,
    pub encoding: String,
    pub last_modified: String,
}

/// One entry of a `fetch_files` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedFile {
    pub file_path: String,
    pub status: FetchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Current content of a file plus its SHA-256, handed to the model during repairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlob {
    pub path: String,
    pub sha256: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(anyhow::anyhow!(
                "Project root is not a directory: {}",
                root.display()
            ));
        }
        let root = root
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("Failed to resolve project root: {}", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: &str) -> Result<ProjectPath, String> {
        resolve_project_path(&self.root, Path::new(&normalize_rel_path(rel)))
    }

    pub fn is_file(&self, rel: &str) -> bool {
        self.resolve(rel)
            .map(|p| p.absolute.is_file())
            .unwrap_or(false)
    }

    pub fn read_file(&self, rel: &str) -> Result<String, String> {
        let resolved = self.resolve(rel)?;
        fs::read_to_string(&resolved.absolute)
            .map_err(|e| format!("Failed to read {}: {}", rel, e))
    }

    /// Write `content`, creating parent directories as needed. Existing files are overwritten.
    pub fn write_file(&self, rel: &str, content: &str) -> Result<(), String> {
        let resolved = self.resolve(rel)?;
        if let Some(parent) = resolved.absolute.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory for {}: {}", rel, e))?;
        }
        fs::write(&resolved.absolute, content)
            .map_err(|e| format!("Failed to write {}: {}", rel, e))
    }

    /// Delete a file. Returns false when there was nothing to delete.
    pub fn delete_file(&self, rel: &str) -> Result<bool, String> {
        let resolved = self.resolve(rel)?;
        if !resolved.absolute.exists() {
            return Ok(false);
        }
        fs::remove_file(&resolved.absolute)
            .map_err(|e| format!("Failed to delete {}: {}", rel, e))?;
        Ok(true)
    }

    pub fn fetch_file(&self, rel: &str) -> FetchedFile {
        let error = |message: String| FetchedFile {
            file_path: rel.to_string(),
            status: FetchStatus::Error,
            content: None,
            metadata: None,
            error: Some(message),
        };

        let resolved = match self.resolve(rel) {
            Ok(resolved) => resolved,
            Err(e) => return error(e),
        };
        if !resolved.absolute.is_file() {
            return error("File not found".to_string());
        }
        let content = match fs::read_to_string(&resolved.absolute) {
            Ok(content) => content,
            Err(e) => return error(e.to_string()),
        };
        let metadata = fs::metadata(&resolved.absolute).ok().map(|meta| {
            let last_modified = meta
                .modified()
                .ok()
                .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%dT%H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            FileMetadata {
                file_size: meta.len(),
                encoding: "utf-8".to_string(),
                last_modified,
            }
        });

        FetchedFile {
            file_path: rel.to_string(),
            status: FetchStatus::Success,
            content: Some(content),
            metadata,
            error: None,
        }
    }

    /// Fresh blobs for the given paths. Paths that can't be read are skipped.
    pub fn file_blobs(&self, paths: &[String]) -> Vec<FileBlob> {
        paths
            .iter()
            .filter_map(|path| {
                let content = self.read_file(path).ok()?;
                Some(FileBlob {
                    path: path.clone(),
                    sha256: sha256_hex(&content),
                    content,
                })
            })
            .collect()
    }

    /// Indented listing of the project, directories first, each level sorted by name.
    pub fn project_tree(&self) -> String {
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by(|a, b| {
                match (a.file_type().is_dir(), b.file_type().is_dir()) {
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    _ => a.file_name().cmp(b.file_name()),
                }
            })
            .into_iter()
            .filter_entry(|entry| !is_ignored(entry));

        let mut lines = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            let indent = "  ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                lines.push(format!("{}{}/", indent, name));
            } else {
                lines.push(format!("{}{}", indent, name));
            }
        }
        lines.join("\n")
    }

    /// `dependencies` and `devDependencies` from package.json as `name@version` lines.
    pub fn dependency_summary(&self) -> Result<String, String> {
        let path = self.root.join("package.json");
        if !path.is_file() {
            return Err("package.json not found.".to_string());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| format!("Error reading package.json: {}", e))?;
        let data: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| format!("Error reading package.json: {}", e))?;

        let mut out = String::new();
        for (label, key) in [("Dependencies", "dependencies"), ("Dev dependencies", "devDependencies")] {
            out.push_str(label);
            out.push_str(":\n");
            match data.get(key).and_then(|v| v.as_object()) {
                Some(deps) if !deps.is_empty() => {
                    for (name, version) in deps {
                        out.push_str(&format!(
                            "- {}@{}\n",
                            name,
                            version.as_str().unwrap_or("*")
                        ));
                    }
                }
                _ => out.push_str("- (none)\n"),
            }
        }
        Ok(out.trim_end().to_string())
    }
}

fn is_ignored(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    if entry.file_type().is_dir() {
        IGNORED_DIRS.contains(&name.as_ref())
    } else {
        IGNORED_FILES.contains(&name.as_ref())
    }
}

pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_write_read_delete() {
        let (_dir, ws) = workspace();
        ws.write_file("src/components/Button.tsx", "export {};\n").unwrap();
        assert_eq!(ws.read_file("./src/components/Button.tsx").unwrap(), "export {};\n");
        assert!(ws.delete_file("src/components/Button.tsx").unwrap());
        assert!(!ws.delete_file("src/components/Button.tsx").unwrap());
    }

    #[test]
    fn test_write_outside_root_is_rejected() {
        let (_dir, ws) = workspace();
        assert!(ws.write_file("../escape.ts", "x").is_err());
    }

    #[test]
    fn test_fetch_file_reports_missing() {
        let (_dir, ws) = workspace();
        let fetched = ws.fetch_file("nope.ts");
        assert_eq!(fetched.status, FetchStatus::Error);
        assert_eq!(fetched.error.as_deref(), Some("File not found"));

        ws.write_file("a.ts", "abc").unwrap();
        let fetched = ws.fetch_file("a.ts");
        assert_eq!(fetched.status, FetchStatus::Success);
        assert_eq!(fetched.content.as_deref(), Some("abc"));
        assert_eq!(fetched.metadata.map(|m| m.file_size), Some(3));
    }

    #[test]
    fn test_fetch_file_serializes_camel_case() {
        let (_dir, ws) = workspace();
        ws.write_file("a.ts", "abc").unwrap();
        let json = serde_json::to_value(ws.fetch_file("a.ts")).unwrap();
        assert_eq!(json["filePath"], "a.ts");
        assert_eq!(json["status"], "success");
        assert_eq!(json["metadata"]["encoding"], "utf-8");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_file_blobs_hash_content() {
        let (_dir, ws) = workspace();
        ws.write_file("a.ts", "hello").unwrap();
        let blobs = ws.file_blobs(&["a.ts".to_string(), "missing.ts".to_string()]);
        assert_eq!(blobs.len(), 1);
        assert_eq!(
            blobs[0].sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_project_tree_orders_dirs_first_and_skips_ignored() {
        let (_dir, ws) = workspace();
        ws.write_file("package.json", "{}").unwrap();
        ws.write_file("src/main.tsx", "").unwrap();
        ws.write_file("src/components/Button.tsx", "").unwrap();
        ws.write_file("node_modules/react/index.js", "").unwrap();
        ws.write_file(".patchwright/runs/x/events.jsonl", "").unwrap();
        ws.write_file("package-lock.json", "{}").unwrap();

        let tree = ws.project_tree();
        assert_eq!(
            tree,
            "src/\n  components/\n    Button.tsx\n  main.tsx\npackage.json"
        );
    }

    #[test]
    fn test_dependency_summary() {
        let (_dir, ws) = workspace();
        assert!(ws.dependency_summary().is_err());
        ws.write_file(
            "package.json",
            r#"{"dependencies":{"react":"^18.2.0"},"devDependencies":{}}"#,
        )
        .unwrap();
        let summary = ws.dependency_summary().unwrap();
        assert_eq!(
            summary,
            "Dependencies:\n- react@^18.2.0\nDev dependencies:\n- (none)"
        );
    }
}
