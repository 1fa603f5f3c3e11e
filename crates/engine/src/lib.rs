//! clnrm engine
//!
//! Runs hermetic integration tests: services come up through plugins, steps
//! run against them, spans are checked against the definition, and every
//! run ends in a [`clnrm_common::RunRecord`].

pub mod config;
pub mod coordinator;
pub mod executor;
pub mod lifecycle;
pub mod plugin;
pub mod reuse;
pub mod runner;
pub mod runtime;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trace;
pub mod workers;

pub use config::EngineConfig;
pub use coordinator::{RunCoordinator, RunState};
pub use executor::StepExecutor;
pub use lifecycle::{LifecycleManager, ServiceGroup};
pub use plugin::{PluginRegistry, ServicePlugin};
pub use reuse::{ReusePool, ReuseStats};
pub use runner::{ComponentHealth, TestRunner};
pub use scheduler::Scheduler;
pub use trace::{TraceSink, TraceValidator};
pub use workers::{write_results, SuiteResult, WorkerPool};
