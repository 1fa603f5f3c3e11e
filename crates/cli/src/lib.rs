//! clnrm CLI
//!
//! Command implementations and output formatting behind the `clnrm` binary.

pub mod commands;
pub mod output;

pub use commands::{Context, Outcome};
