//! Core domain model, collaborator contracts and the SEARCH/REPLACE diff engine.

pub mod diff;
pub mod protocol;
pub mod util;

pub use protocol::*;
