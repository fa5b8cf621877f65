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


//! Background healing of on-disk download state
//!
//! # Sweep
//! For every book directory under the downloads root:
//! 1. Skip it if another party (an active download, a deletion) holds its
//!    lease
//! 2. Remove abandoned `.part` files
//! 3. Validate it
//! 4. Valid: remove audio files beyond the manifest's chapter count
//! 5. Manifest lost or unreadable, catalog still knows the book and every
//!    chapter's audio is present: rewrite the manifest (repair)
//! 6. Anything else: delete the directory (purge)
//!
//! Repair never guesses. Without a catalog copy whose chapters all have
//! audio on disk, the directory is purged.
//!
//! Failures are logged per book and never stop the sweep.

use crate::download::leases::{BookLeases, LeaseHolder};
use crate::error::Result;
use crate::file::paths::{is_part_file, parse_audio_file_name};
use crate::file::{BookDirectory, StorageService};
use crate::maintenance::validation::{IntegrityFailure, ValidationService};
use crate::models::Book;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of known book metadata for manifest repair
pub trait BookCatalog: Send + Sync {
    /// Last known full record of a book, if any
    fn cached_book(&self, book_id: &str) -> Option<Book>;
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealingReport {
    pub scanned: usize,
    pub healthy: usize,
    pub repaired: usize,
    pub purged: usize,
    /// Leased to someone else at sweep time
    pub skipped: usize,
    pub failed: usize,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Healthy,
    Repaired,
    Purged,
    Skipped,
}

struct HealingInner {
    storage: Arc<StorageService>,
    validation: ValidationService,
    leases: BookLeases,
    catalog: Arc<dyn BookCatalog>,
    interval: Duration,
    wake: Notify,
    reports: watch::Sender<HealingReport>,
    /// Serializes sweeps from the loop and from `sweep_now`
    sweep_lock: Mutex<()>,
}

/// Recurring sweep over the downloads root
pub struct HealingService {
    inner: Arc<HealingInner>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for HealingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealingService")
            .field("root", &self.inner.storage.root())
            .field("interval", &self.inner.interval)
            .finish()
    }
}

impl HealingService {
    pub fn new(
        storage: Arc<StorageService>,
        leases: BookLeases,
        catalog: Arc<dyn BookCatalog>,
        interval: Duration,
    ) -> Self {
        let (reports, _) = watch::channel(HealingReport::default());
        Self {
            inner: Arc::new(HealingInner {
                validation: ValidationService::new(Arc::clone(&storage)),
                storage,
                leases,
                catalog,
                interval,
                wake: Notify::new(),
                reports,
                sweep_lock: Mutex::new(()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the sweep loop; the first sweep runs immediately
    ///
    /// Calling `start` while running does nothing.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            info!(interval_secs = inner.interval.as_secs(), "Healing service started");
            loop {
                inner.sweep(&token).await;

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = inner.wake.notified() => debug!("Healing sweep triggered"),
                    _ = tokio::time::sleep(inner.interval) => {}
                }
            }
            info!("Healing service stopped");
        });

        *running = Some((cancel, handle));
    }

    /// Stop the sweep loop and wait for it to exit
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Healing task ended abnormally");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Request a sweep as soon as possible (app-foreground hook)
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Run one sweep inline and return its report
    pub async fn sweep_now(&self) -> HealingReport {
        self.inner.sweep(&CancellationToken::new()).await
    }

    /// Reports of finished sweeps
    pub fn subscribe(&self) -> watch::Receiver<HealingReport> {
        self.inner.reports.subscribe()
    }

    /// Report of the most recent sweep
    pub fn last_report(&self) -> HealingReport {
        self.inner.reports.borrow().clone()
    }
}

impl HealingInner {
    async fn sweep(&self, cancel: &CancellationToken) -> HealingReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = HealingReport::default();

        let directories = match self.storage.list_book_directories().await {
            Ok(directories) => directories,
            Err(e) => {
                warn!(error = %e, "Healing sweep could not list downloads");
                report.failed += 1;
                Vec::new()
            }
        };

        for directory in directories {
            if cancel.is_cancelled() {
                break;
            }
            report.scanned += 1;

            match self.heal(&directory).await {
                Ok(Outcome::Healthy) => report.healthy += 1,
                Ok(Outcome::Repaired) => report.repaired += 1,
                Ok(Outcome::Purged) => report.purged += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(book_id = %directory.book_id, error = %e, "Healing failed for book");
                    report.failed += 1;
                }
            }
        }

        report.finished_at = Some(Utc::now());
        if report.repaired > 0 || report.purged > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                repaired = report.repaired,
                purged = report.purged,
                skipped = report.skipped,
                failed = report.failed,
                "Healing sweep finished"
            );
        } else {
            debug!(scanned = report.scanned, skipped = report.skipped, "Healing sweep finished");
        }

        self.reports.send_replace(report.clone());
        report
    }

    async fn heal(&self, directory: &BookDirectory) -> Result<Outcome> {
        let book_id = directory.book_id.as_str();
        let Some(_lease) = self.leases.try_acquire(book_id, LeaseHolder::Healing) else {
            debug!(book_id = %book_id, "Book busy, skipping");
            return Ok(Outcome::Skipped);
        };

        remove_part_files(&directory.path).await?;

        let report = self.validation.validate_book_integrity(book_id).await;
        if report.is_valid {
            if let Some(book) = &report.book {
                remove_extra_audio(&directory.path, book.chapters.len()).await?;
            }
            return Ok(Outcome::Healthy);
        }

        let reason = report.reason.unwrap_or(IntegrityFailure::ManifestMissing);
        if reason == IntegrityFailure::DirectoryMissing {
            return Ok(Outcome::Skipped);
        }

        if reason.is_manifest_failure() {
            if let Some(book) = self.repairable(book_id).await {
                self.storage.write_manifest(&book).await?;
                if self.validation.validate_book_integrity(book_id).await.is_valid {
                    remove_extra_audio(&directory.path, book.chapters.len()).await?;
                    info!(book_id = %book_id, reason = %reason, "Rewrote manifest");
                    return Ok(Outcome::Repaired);
                }
            }
        }

        info!(book_id = %book_id, reason = %reason, "Purging invalid download");
        self.storage.delete_book_directory(&directory.path).await?;
        Ok(Outcome::Purged)
    }

    /// Catalog copy of a book whose audio is fully present on disk
    async fn repairable(&self, book_id: &str) -> Option<Book> {
        let book = self.catalog.cached_book(book_id)?;
        if book.id != book_id || book.validate_chapters().is_err() {
            return None;
        }
        match self.validation.check_audio_files(&book).await {
            None => Some(book),
            Some(missing) => {
                debug!(book_id = %book_id, reason = %missing, "Catalog copy does not match files");
                None
            }
        }
    }
}

async fn remove_part_files(dir: &Path) -> Result<()> {
    for name in file_names(dir).await? {
        if is_part_file(&name) {
            debug!(file = %name, "Removing abandoned partial file");
            StorageService::remove_file(&dir.join(&name)).await?;
        }
    }
    Ok(())
}

async fn remove_extra_audio(dir: &Path, chapter_count: usize) -> Result<()> {
    for name in file_names(dir).await? {
        if parse_audio_file_name(&name).is_some_and(|index| index >= chapter_count) {
            debug!(file = %name, "Removing audio file not in manifest");
            StorageService::remove_file(&dir.join(&name)).await?;
        }
    }
    Ok(())
}

async fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
