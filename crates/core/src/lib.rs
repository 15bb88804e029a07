//! mergeflow core library.
//!
//! This crate provides the building blocks for merging change requests:
//! configuration, database persistence, diff snapshots, conflict detection
//! and resolution, mergeability evaluation, the lifecycle controller and
//! the merge orchestrator with its worker pool.

pub mod authz;
pub mod ci;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod lifecycle;
pub mod mergeability;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod service;
pub mod snapshots;
pub mod vcs;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use orchestrator::{MergeOrchestrator, MergeQueue, MergeReport, MergeWorkerPool};
pub use service::ChangeRequestService;
pub use vcs::GitRepository;
