//! Storage for the OpenRouter API key.
//!
//! One secret, two homes: the system keychain, or a plain key file under the config dir.
//! The file is used when `PATCHWRIGHT_DISABLE_KEYRING` is set, when
//! `PATCHWRIGHT_CREDENTIALS_FILE` points somewhere, or when the file already holds a key.

use keyring::Entry;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::util::{debug_stderr_enabled, env_flag};

const KEYRING_SERVICE: &str = "patchwright";
const KEYRING_USERNAME: &str = "openrouter-api-key";

type KeyringResult<T> = Result<T, String>;

static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

enum Store {
    Keychain,
    File(PathBuf),
}

fn key_file_path() -> KeyringResult<PathBuf> {
    if let Ok(path) = std::env::var("PATCHWRIGHT_CREDENTIALS_FILE") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    if cfg!(test) {
        return Ok(std::env::temp_dir().join("patchwright-test-api-key"));
    }
    dirs::config_dir()
        .map(|p| p.join("patchwright").join("api_key"))
        .ok_or_else(|| "Could not determine credentials file path".to_string())
}

fn store() -> KeyringResult<Store> {
    let path = key_file_path()?;
    let file_forced = cfg!(test)
        || env_flag("PATCHWRIGHT_DISABLE_KEYRING")
        || std::env::var_os("PATCHWRIGHT_CREDENTIALS_FILE").is_some();
    if file_forced || matches!(read_key_file(&path), Ok(Some(_))) {
        Ok(Store::File(path))
    } else {
        Ok(Store::Keychain)
    }
}

/// Where the key lives, for CLI messages.
pub fn credentials_store_label() -> &'static str {
    match store() {
        Ok(Store::Keychain) => "system keychain",
        _ => "local credentials file",
    }
}

fn read_key_file(path: &Path) -> KeyringResult<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read credentials file '{}': {}", path.display(), e))?;
    let key = content.trim();
    Ok((!key.is_empty()).then(|| key.to_string()))
}

fn write_key_file(path: &Path, key: &str) -> KeyringResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            format!(
                "Failed to create credentials directory '{}': {}",
                parent.display(),
                e
            )
        })?;
    }
    fs::write(path, format!("{}\n", key.trim()))
        .map_err(|e| format!("Failed to write credentials file '{}': {}", path.display(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

/// Log a keychain failure once per session, when debug output is enabled.
pub fn warn_keychain_error_once(context: &str, err: &str) {
    if debug_stderr_enabled() && !KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        eprintln!("  ! Keychain unavailable for {}: {}", context, err);
    }
}

/// Get the stored OpenRouter API key.
pub fn get_api_key() -> KeyringResult<Option<String>> {
    match store()? {
        Store::File(path) => read_key_file(&path),
        Store::Keychain => {
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USERNAME).map_err(|e| e.to_string())?;
            match entry.get_password() {
                Ok(key) => Ok(Some(key.trim().to_string()).filter(|k| !k.is_empty())),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(err) => Err(err.to_string()),
            }
        }
    }
}

/// Store the OpenRouter API key.
pub fn set_api_key(key: &str) -> Result<(), String> {
    match store()? {
        Store::File(path) => write_key_file(&path, key),
        Store::Keychain => Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
            .and_then(|entry| entry.set_password(key.trim()))
            .map_err(|e| e.to_string()),
    }
}
