//! clnrm Common Library
//!
//! Test definition model, shared runtime types, the error taxonomy and the
//! append-only run history used by the engine and the CLI.

pub mod db;
pub mod definition;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use definition::{
    AttributePredicate, Cardinality, ExitClass, ExitExpectation, PredicateOp, ServiceSpec, Step,
    TestDefinition, TraceAssertion,
};
pub use error::{Error, ErrorClass, Result};
pub use types::*;

/// clnrm version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_state_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".clnrm")
}

/// Default run history database path
pub fn default_history_path() -> std::path::PathBuf {
    default_state_path().join("history.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
