//! Unified-diff audit files written next to every modified source file.

use diffy::{DiffOptions, Line};
use std::fs;
use std::path::{Path, PathBuf};

const CONTEXT_LINES: usize = 3;

/// Render a unified diff between two versions of `label`. Identical inputs yield "".
pub fn unified_diff(label: &str, original: &str, modified: &str) -> String {
    if original == modified {
        return String::new();
    }

    let mut options = DiffOptions::new();
    options.set_context_len(CONTEXT_LINES);
    let patch = options.create_patch(original, modified);

    let mut out = String::new();
    out.push_str(&format!("--- {} (original)\n", label));
    out.push_str(&format!("+++ {} (modified)\n", label));
    for hunk in patch.hunks() {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.old_range().start(),
            hunk.old_range().len(),
            hunk.new_range().start(),
            hunk.new_range().len()
        ));
        for line in hunk.lines() {
            let (prefix, text) = match line {
                Line::Context(text) => (' ', *text),
                Line::Delete(text) => ('-', *text),
                Line::Insert(text) => ('+', *text),
            };
            out.push(prefix);
            out.push_str(text);
            if !text.ends_with('\n') {
                out.push_str("\n\\ No newline at end of file\n");
            }
        }
    }
    out
}

/// Write `<file>.diff` beside `file` and return its path.
pub fn write_diff_artifact(
    file: &Path,
    label: &str,
    original: &str,
    modified: &str,
) -> Result<PathBuf, String> {
    let mut name = file.as_os_str().to_owned();
    name.push(".diff");
    let diff_path = PathBuf::from(name);
    fs::write(&diff_path, unified_diff(label, original, modified))
        .map_err(|e| format!("Failed to write diff artifact {}: {}", diff_path.display(), e))?;
    Ok(diff_path)
}
