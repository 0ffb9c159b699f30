//! Configuration management for patchwright
//!
//! Global settings live in ~/.config/patchwright/config.json. A project can override them
//! with a `patchwright.toml` at its root, and `PATCHWRIGHT_*` environment variables win over
//! both.

use crate::keyring;
use crate::util::debug_stderr_enabled;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_FILE: &str = "patchwright.toml";
pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "openai/gpt-4.1";

const MIN_STALL_TIMEOUT_SECS: u64 = 5;
const MAX_TEMPERATURE: f32 = 2.0;

/// How a user request is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workflow {
    /// One coding task, no planner.
    #[default]
    Direct,
    /// Planner splits the request into steps that are coded in order.
    Planned,
    /// Like `Planned`, with a reviewer approving each step.
    Reviewed,
}

impl Workflow {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Workflow::Direct),
            "planned" => Some(Workflow::Planned),
            "reviewed" => Some(Workflow::Reviewed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Direct => "direct",
            Workflow::Planned => "planned",
            Workflow::Reviewed => "reviewed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub coder_model: String,
    pub planner_model: String,
    pub reviewer_model: String,
    pub temperature: f32,
    pub api_url: String,
    pub workflow: Workflow,
    /// Repair attempts after the first apply; a step applies at most `max_retries + 1` times.
    pub max_retries: u32,
    pub review_retry_limit: u32,
    pub max_format_retries: u32,
    pub max_tool_turns: u32,
    pub stall_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub validator_timeout_secs: u64,
    /// USD per million prompt tokens, used when the provider doesn't report a cost.
    pub input_cost: f64,
    /// USD per million completion tokens.
    pub output_cost: f64,
    /// Replaces the TypeScript check when set (run through the shell in the project root).
    pub check_command: Option<String>,
    pub write_diff_artifacts: bool,
    pub log_runs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coder_model: DEFAULT_MODEL.to_string(),
            planner_model: DEFAULT_MODEL.to_string(),
            reviewer_model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            api_url: DEFAULT_API_URL.to_string(),
            workflow: Workflow::Direct,
            max_retries: 3,
            review_retry_limit: 3,
            max_format_retries: 3,
            max_tool_turns: 25,
            stall_timeout_secs: 120,
            request_timeout_secs: 600,
            validator_timeout_secs: 300,
            input_cost: 0.0,
            output_cost: 0.0,
            check_command: None,
            write_diff_artifacts: true,
            log_runs: true,
        }
    }
}

/// `patchwright.toml`: any subset of the global settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectOverrides {
    pub coder_model: Option<String>,
    pub planner_model: Option<String>,
    pub reviewer_model: Option<String>,
    pub temperature: Option<f32>,
    pub api_url: Option<String>,
    pub workflow: Option<Workflow>,
    pub max_retries: Option<u32>,
    pub review_retry_limit: Option<u32>,
    pub max_format_retries: Option<u32>,
    pub max_tool_turns: Option<u32>,
    pub stall_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub validator_timeout_secs: Option<u64>,
    pub input_cost: Option<f64>,
    pub output_cost: Option<f64>,
    pub check_command: Option<String>,
    pub write_diff_artifacts: Option<bool>,
    pub log_runs: Option<bool>,
}

impl Config {
    fn sanitize(&mut self) {
        if self.coder_model.trim().is_empty() {
            self.coder_model = DEFAULT_MODEL.to_string();
        }
        if self.planner_model.trim().is_empty() {
            self.planner_model = self.coder_model.clone();
        }
        if self.reviewer_model.trim().is_empty() {
            self.reviewer_model = self.planner_model.clone();
        }
        if self.api_url.trim().is_empty() {
            self.api_url = DEFAULT_API_URL.to_string();
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            self.temperature = 0.0;
        }
        self.temperature = self.temperature.min(MAX_TEMPERATURE);
        self.stall_timeout_secs = self.stall_timeout_secs.max(MIN_STALL_TIMEOUT_SECS);
        self.max_tool_turns = self.max_tool_turns.max(1);
        if !self.input_cost.is_finite() || self.input_cost < 0.0 {
            self.input_cost = 0.0;
        }
        if !self.output_cost.is_finite() || self.output_cost < 0.0 {
            self.output_cost = 0.0;
        }
        if let Some(cmd) = &self.check_command {
            if cmd.trim().is_empty() {
                self.check_command = None;
            }
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchwright"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load the global config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str::<Config>(&content) {
                Ok(mut config) => {
                    config.sanitize();
                    return config;
                }
                Err(err) => {
                    preserve_corrupt_config(path, &content);
                    if debug_stderr_enabled() {
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Global config, then `patchwright.toml` in `project_root`, then environment.
    pub fn resolve(project_root: &Path) -> anyhow::Result<Self> {
        let mut config = Self::load();
        config.apply_project_file(project_root)?;
        config.apply_env();
        config.sanitize();
        Ok(config)
    }

    /// Layer `<project_root>/patchwright.toml` over this config, if present.
    pub fn apply_project_file(&mut self, project_root: &Path) -> anyhow::Result<()> {
        let path = project_root.join(PROJECT_CONFIG_FILE);
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let overrides: ProjectOverrides = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", path.display(), e))?;
        self.apply_overrides(overrides);
        Ok(())
    }

    fn apply_overrides(&mut self, o: ProjectOverrides) {
        if let Some(v) = o.coder_model {
            self.coder_model = v;
        }
        if let Some(v) = o.planner_model {
            self.planner_model = v;
        }
        if let Some(v) = o.reviewer_model {
            self.reviewer_model = v;
        }
        if let Some(v) = o.temperature {
            self.temperature = v;
        }
        if let Some(v) = o.api_url {
            self.api_url = v;
        }
        if let Some(v) = o.workflow {
            self.workflow = v;
        }
        if let Some(v) = o.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = o.review_retry_limit {
            self.review_retry_limit = v;
        }
        if let Some(v) = o.max_format_retries {
            self.max_format_retries = v;
        }
        if let Some(v) = o.max_tool_turns {
            self.max_tool_turns = v;
        }
        if let Some(v) = o.stall_timeout_secs {
            self.stall_timeout_secs = v;
        }
        if let Some(v) = o.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = o.validator_timeout_secs {
            self.validator_timeout_secs = v;
        }
        if let Some(v) = o.input_cost {
            self.input_cost = v;
        }
        if let Some(v) = o.output_cost {
            self.output_cost = v;
        }
        if o.check_command.is_some() {
            self.check_command = o.check_command;
        }
        if let Some(v) = o.write_diff_artifacts {
            self.write_diff_artifacts = v;
        }
        if let Some(v) = o.log_runs {
            self.log_runs = v;
        }
    }

    /// Apply `PATCHWRIGHT_*` environment overrides. Unparseable numbers are ignored.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("PATCHWRIGHT_CODER_MODEL") {
            self.coder_model = v;
        }
        if let Some(v) = get("PATCHWRIGHT_PLANNER_MODEL") {
            self.planner_model = v;
        }
        if let Some(v) = get("PATCHWRIGHT_REVIEWER_MODEL") {
            self.reviewer_model = v;
        }
        if let Some(v) = get("PATCHWRIGHT_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = get("PATCHWRIGHT_CHECK_CMD") {
            self.check_command = Some(v);
        }
        if let Some(v) = get("PATCHWRIGHT_WORKFLOW").and_then(|v| Workflow::parse(&v)) {
            self.workflow = v;
        }
        if let Some(v) = get("PATCHWRIGHT_INPUT_COST").and_then(|v| v.parse().ok()) {
            self.input_cost = v;
        }
        if let Some(v) = get("PATCHWRIGHT_OUTPUT_COST").and_then(|v| v.parse().ok()) {
            self.output_cost = v;
        }
        if let Some(v) = get("PATCHWRIGHT_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.max_retries = v;
        }
        if let Some(v) = get("PATCHWRIGHT_STALL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.stall_timeout_secs = v;
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let mut sanitized = self.clone();
        sanitized.sanitize();
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                if debug_stderr_enabled() {
                    eprintln!(
                        "  Warning: Failed to set config directory permissions: {}",
                        e
                    );
                }
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(&sanitized)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// Get the OpenRouter API key (credential store first, environment fallback).
    pub fn get_api_key(&self) -> Option<String> {
        match keyring::get_api_key() {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => {
                keyring::warn_keychain_error_once("API key", &err);
            }
        }
        std::env::var("OPENROUTER_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Store the API key and verify it reads back.
    pub fn set_api_key(&mut self, key: &str) -> Result<(), String> {
        keyring::set_api_key(key).map_err(|e| {
            format!(
                "Failed to store API key in {}: {}. \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                keyring::credentials_store_label(),
                e
            )
        })?;

        match keyring::get_api_key() {
            Ok(Some(stored_key)) if stored_key == key => self.save(),
            Ok(Some(_)) => Err(format!(
                "API key verification failed: stored key doesn't match in {}. \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                keyring::credentials_store_label()
            )),
            Ok(None) => Err(format!(
                "API key verification failed: key was not persisted to {}. \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                keyring::credentials_store_label()
            )),
            Err(read_err) => Err(format!(
                "API key verification failed: couldn't read back from {} ({}). \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                keyring::credentials_store_label(),
                read_err
            )),
        }
    }

    pub fn validate_api_key_format(key: &str) -> bool {
        let key = key.trim();
        !key.is_empty() && key.starts_with("sk-")
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/patchwright/config.json".to_string())
    }
}

/// Interactive prompt to set up the API key
pub fn setup_api_key_interactive() -> Result<String, String> {
    use std::io;

    println!();
    println!("  ┌─────────────────────────────────────────────────────────┐");
    println!("  │  PATCHWRIGHT SETUP                                      │");
    println!("  └─────────────────────────────────────────────────────────┘");
    println!();
    println!("  patchwright talks to models through OpenRouter.");
    println!();
    println!("  Steps:");
    println!("    1) Create a key at https://openrouter.ai/keys");
    println!("    2) Paste the key below and press Enter");
    println!();
    println!("  Data use notice: patchwright sends your request, file contents and");
    println!("  type-checker output to the configured model provider.");
    println!();
    println!(
        "  We'll store it in your {}.",
        keyring::credentials_store_label()
    );
    println!("  You can update it later with `patchwright --setup`.");
    println!("  Prefer env vars? Set OPENROUTER_API_KEY and rerun.");
    println!();
    print!("  API Key: ");
    io::stdout().flush().map_err(|e| e.to_string())?;

    let mut key = String::new();
    io::stdin().read_line(&mut key).map_err(|e| e.to_string())?;
    let key = key.trim().to_string();

    if key.is_empty() {
        return Err("No API key provided".to_string());
    }

    if !Config::validate_api_key_format(&key) {
        println!();
        println!("  Warning: Key doesn't look like an OpenRouter key (usually starts with sk-or-)");
        println!("     Saving anyway...");
    }

    let mut config = Config::load();
    config.set_api_key(&key)?;

    println!();
    println!("  + API key saved to {}", keyring::credentials_store_label());
    println!();

    Ok(key)
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        if debug_stderr_enabled() {
            eprintln!(
                "  Warning: Failed to set temp config file permissions: {}",
                e
            );
        }
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_format_retries, 3);
        assert_eq!(config.max_tool_turns, 25);
        assert_eq!(config.stall_timeout_secs, 120);
        assert_eq!(config.workflow, Workflow::Direct);
        assert!((config.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_deserializes_partial_shape_with_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"max_retries":5}"#).unwrap();
        assert_eq!(parsed.max_retries, 5);
        assert_eq!(parsed.review_retry_limit, 3);
        assert_eq!(parsed.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_corrupt_config_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config, Config::default());
        assert!(!path.exists());
        let backup = fs::read_to_string(dir.path().join("config.json.corrupt")).unwrap();
        assert_eq!(backup, "{ not json");
    }

    #[test]
    fn test_project_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "workflow = \"reviewed\"\nmax_retries = 1\ncheck_command = \"npm run lint\"\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_project_file(dir.path()).unwrap();
        assert_eq!(config.workflow, Workflow::Reviewed);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.check_command.as_deref(), Some("npm run lint"));
        assert_eq!(config.max_tool_turns, 25);
    }

    #[test]
    fn test_project_file_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_CONFIG_FILE), "max_retires = 1\n").unwrap();
        let mut config = Config::default();
        assert!(config.apply_project_file(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides_ignore_bad_numbers() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PATCHWRIGHT_CODER_MODEL", "vendor/coder"),
            ("PATCHWRIGHT_MAX_RETRIES", "seven"),
            ("PATCHWRIGHT_INPUT_COST", "3.5"),
            ("PATCHWRIGHT_CHECK_CMD", "  "),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.coder_model, "vendor/coder");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.input_cost, 3.5);
        assert!(config.check_command.is_none());
    }

    #[test]
    fn test_sanitize_clamps_values() {
        let mut config = Config {
            temperature: 9.0,
            stall_timeout_secs: 0,
            max_tool_turns: 0,
            reviewer_model: String::new(),
            ..Config::default()
        };
        config.sanitize();
        assert_eq!(config.temperature, MAX_TEMPERATURE);
        assert_eq!(config.stall_timeout_secs, MIN_STALL_TIMEOUT_SECS);
        assert_eq!(config.max_tool_turns, 1);
        assert_eq!(config.reviewer_model, config.planner_model);
    }

    #[test]
    fn test_workflow_parse() {
        assert_eq!(Workflow::parse("Planned"), Some(Workflow::Planned));
        assert_eq!(Workflow::parse("nope"), None);
    }
}
