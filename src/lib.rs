//! Offline downloads for self-hosted audiobook servers
//!
//! Downloads whole books (every chapter's audio plus the cover) into a
//! directory per book, tracks progress per book, validates what is on disk
//! and heals or purges damaged downloads in the background.
//!
//! [`DownloadManager`] is the entry point; everything else is exposed for
//! hosts that need finer control.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod maintenance;
pub mod models;

pub use api::{ServerClient, ServerCredentials};
pub use config::OfflineConfig;
pub use download::{
    DownloadHandle, DownloadManager, DownloadOutcome, DownloadRecord, DownloadRequest,
    DownloadStage, DownloadStatus, OfflineStatus, ProgressEvent,
};
pub use error::{OfflineError, Result};
pub use maintenance::{HealingReport, HealingService, ValidationService};
pub use models::{Book, Chapter, CollapsedSeries};
