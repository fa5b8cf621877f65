// Audiobook Offline - Offline downloads for self-hosted audiobook servers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Download management and streaming
//!
//! This module moves audiobooks from the server onto local storage.
//!
//! - [`manager`]: per-book state, concurrency and the public download API
//! - [`orchestrator`]: one book's ordered transfer sequence with retries
//! - [`stream`]: HTTP body streaming into temporary files
//! - [`progress`]: stages, weighting and throttled progress events
//! - [`leases`]: exclusive per-book access shared with healing and deletion

pub mod leases;
pub mod manager;
pub mod orchestrator;
pub mod progress;
pub mod stream;

// Re-export commonly used types
pub use leases::{BookLease, BookLeases, LeaseHolder};
pub use manager::{
    DownloadHandle, DownloadManager, DownloadOutcome, DownloadRecord, DownloadRequest,
    DownloadStatus, MemoryCatalog, OfflineStatus,
};
pub use orchestrator::{DownloadOrchestrator, RetryPolicy};
pub use progress::{DownloadStage, ProgressEvent};
