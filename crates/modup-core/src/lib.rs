//! Module update pipeline for modup.
//!
//! A host executable loads independently versioned modules from disk. This
//! crate keeps them current:
//! - Comparing the installed manifest against the remote version catalog.
//! - Streaming outdated archives into a staging directory.
//! - Extracting them with an external archive tool.
//! - Committing the reconciled manifest after every install.
//! - Reporting every phase through a typed event stream.
//!
//! Host executable updates are delegated to a [`HostUpdater`].

pub mod catalog;
pub mod config;
pub mod download;
mod error;
pub mod events;
pub mod host;
mod http;
pub mod install;
mod locator;
pub mod manifest;
mod pipeline;
pub mod progress;

/// Remote catalog client and its query parameters.
pub use catalog::{CatalogQuery, RemoteCatalog, RemoteVersions, is_valid_module_name};
/// Settings store seam and the typed updater configuration.
pub use config::{JsonSettings, SettingsError, SettingsStore, UpdaterConfig};
/// Archive download into the staging directory.
pub use download::{DownloadError, DownloadManager, DownloadProgress, StagedArchive};
/// Unified error carried by `update-error` events.
pub use error::UpdaterError;
/// Event stream types.
pub use events::{EventBus, EventRecord, SubscriptionId, UpdateEvent};
/// Host executable updater seam and the feed-polling implementation.
pub use host::{
    FeedHostUpdater, HostUpdateError, HostUpdateStatus, HostUpdater, ManualUpdate,
    is_newer_version,
};
/// Shared HTTP client construction and bounded redirect following.
pub use http::{DEFAULT_MAX_REDIRECTS, NetworkError, build_client, get_following_redirects};
/// Archive extraction through an external tool.
pub use install::{ArchiveTool, InstallError, InstallProgress, Installer};
pub use locator::ModuleLocator;
/// Durable installed-version record.
pub use manifest::{Manifest, ManifestEntry, ManifestError, ManifestStore};
/// Orchestrator and its construction.
pub use pipeline::{
    ExitOnFatal, FatalErrorHandler, ModuleState, PipelineBuilder, UpdatePipeline,
};
pub use progress::{ProgressTracker, TrackedOperation};
