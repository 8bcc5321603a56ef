//! ubuntu-app-launch - Application launcher core
//!
//! A Rust implementation that:
//! - Resolves application identifiers against pluggable app stores
//! - Expands freedesktop Exec= templates into command lines
//! - Runs applications as tracked transient units on the systemd user bus
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               ubuntu-app-launch                  │
//! ├─────────────────────────────────────────────────┤
//! │   App Stores   │   Exec Parser   │    AppID     │
//! ├─────────────────────────────────────────────────┤
//! │       Registry (worker thread, signals)          │
//! ├─────────────────────────────────────────────────┤
//! │     Job Manager (systemd1 user-bus client)       │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod appid;
pub mod exec;
pub mod jobs;
pub mod keyfile;
pub mod registry;
pub mod stores;

// Re-exports for the common launch path
pub use appid::AppID;
pub use jobs::{FailureKind, InstanceHandle, LaunchMode, UnitInfo};
pub use registry::{Registry, RegistryError};
pub use stores::{AppRecord, AppStore, StoreId};
