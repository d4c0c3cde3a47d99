//! Duplicate and rotation-artifact cleanup for category-organized image
//! datasets.
//!
//! [`ScannerService::plan`] walks a dataset root and decides what to remove;
//! [`Executor::execute`] commits (or previews) that plan.

pub mod config;
pub mod core;

pub use crate::config::{ConfigError, EngineConfig, Stages};
pub use crate::core::{
    CategoryLabel, CleanupPlan, CleanupReport, Executor, History, RemovalMode, ScanError,
    ScannerService,
};
