//! Runtime adapters for patchwright (config/auth, workspace files, validation, run logs).

pub mod artifacts;
pub mod config;
pub mod keyring;
pub mod run_log;
pub mod util;
pub mod validator;
pub mod workspace;
