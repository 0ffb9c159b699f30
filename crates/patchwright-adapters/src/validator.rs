//! Whole-project type checking after edits land.

use crate::util::{debug_stderr_enabled, run_command_with_timeout, which};
use patchwright_core::util::{normalize_rel_path, strip_ansi};
use patchwright_core::{ProjectValidator, ValidationReport};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const NPX_MISSING: &str = "Could not find 'npx' in PATH. Please ensure Node.js is installed.";

#[derive(Debug, Clone)]
enum CheckCommand {
    Shell(String),
    Program { program: PathBuf, args: Vec<String> },
}

/// Runs `npx tsc -b --noEmit --pretty false` (or a configured shell command) in the project
/// root and reports the files the compiler complained about.
#[derive(Debug, Clone)]
pub struct TypeScriptValidator {
    root: PathBuf,
    timeout: Duration,
    check_command: Option<String>,
}

impl TypeScriptValidator {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
            check_command: None,
        }
    }

    pub fn with_check_command(mut self, command: Option<String>) -> Self {
        self.check_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    fn command(&self) -> Result<CheckCommand, String> {
        if let Some(shell) = &self.check_command {
            return Ok(CheckCommand::Shell(shell.clone()));
        }
        let npx = which("npx").ok_or_else(|| NPX_MISSING.to_string())?;
        Ok(CheckCommand::Program {
            program: npx,
            args: ["tsc", "-b", "--noEmit", "--pretty", "false"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    fn run(&self) -> ValidationReport {
        let command = match self.command() {
            Ok(command) => command,
            Err(message) => return ValidationReport::failed(message, Vec::new()),
        };

        let mut cmd = match &command {
            CheckCommand::Shell(shell) => {
                let mut cmd = if cfg!(windows) {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C").arg(shell);
                    cmd
                } else {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c").arg(shell);
                    cmd
                };
                cmd.current_dir(&self.root);
                cmd
            }
            CheckCommand::Program { program, args } => {
                let mut cmd = Command::new(program);
                cmd.current_dir(&self.root).args(args);
                cmd
            }
        };

        if debug_stderr_enabled() {
            eprintln!("  Running project check: {:?}", cmd);
        }

        let output = match run_command_with_timeout(&mut cmd, self.timeout) {
            Ok(output) => output,
            Err(err) => return ValidationReport::failed(err, Vec::new()),
        };

        if output.timed_out {
            return ValidationReport::failed(
                format!(
                    "Project check timed out after {}s.",
                    self.timeout.as_secs()
                ),
                Vec::new(),
            );
        }
        if output.success() {
            return ValidationReport::passed();
        }

        // stderr first: that's where npx reports its own failures.
        let errors = strip_ansi(&format!("{}{}", output.stderr, output.stdout));
        let error_files = extract_error_files(&self.root, &errors);
        ValidationReport::failed(errors, error_files)
    }
}

impl ProjectValidator for TypeScriptValidator {
    fn validate(&self) -> ValidationReport {
        self.run()
    }
}

/// Project-relative paths named by `file(line,col): error TSxxxx:` lines, sorted.
pub fn extract_error_files(root: &Path, output: &str) -> Vec<String> {
    let Some(re) = Regex::new(r"^(.*\.(?:ts|tsx|js|jsx))\((\d+),(\d+)\):\s+error TS\d+:").ok()
    else {
        return Vec::new();
    };

    let mut files = BTreeSet::new();
    for line in output.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            files.insert(relative_to_root(root, &caps[1]));
        }
    }
    files.into_iter().collect()
}

fn relative_to_root(root: &Path, reported: &str) -> String {
    let reported_path = Path::new(reported);
    if reported_path.is_absolute() {
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        for base in [root, canonical_root.as_path()] {
            if let Ok(rel) = reported_path.strip_prefix(base) {
                return normalize_rel_path(&rel.to_string_lossy());
            }
        }
    }
    normalize_rel_path(reported)
}
