//! Backup pipeline engine.
//!
//! Policy-driven, verifiable backups of a source tree to local directories,
//! SFTP hosts and object-storage buckets, with per-run JSON manifests,
//! optional encryption at rest, hardlink deduplication, retention and
//! scheduled single-instance operation.

pub mod config;
pub mod dest;
pub mod error;
pub mod events;
pub mod fs;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod restore;
pub mod schedule;
pub mod selector;
pub mod stages;
pub mod verify;

// Re-export commonly used types
pub use config::RunConfig;
pub use error::EngineError;
pub use error::Result;
