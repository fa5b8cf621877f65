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


//! Download manager: the single source of truth for offline state
//!
//! # Per-book State Machine
//! ```text
//! notDownloaded -> downloading -> complete  -> available
//!                              -> failed    -> notDownloaded
//!                              -> cancelled -> notDownloaded
//! ```
//!
//! # Responsibilities
//! - At most one download task per book id; repeat requests are no-ops
//! - Concurrency limit across books (default: 3)
//! - In-memory [`DownloadRecord`] per active book, written only from the
//!   download's own progress channel
//! - Broadcast of every accepted progress event to subscribers
//! - The downloaded-books list, loaded from manifests and kept in step with
//!   the healing sweep
//!
//! Terminal records (complete/failed) stay visible for a short grace period
//! and are then removed. Cancelled records disappear immediately and no
//! further events are published for them.

use crate::api::client::{ClientConfig, ServerClient, ServerCredentials};
use crate::config::OfflineConfig;
use crate::download::leases::{BookLease, BookLeases, LeaseHolder};
use crate::download::orchestrator::DownloadOrchestrator;
use crate::download::progress::{DownloadStage, ProgressEvent};
use crate::error::{OfflineError, Result};
use crate::file::{SpaceProbe, StorageService, SystemSpaceProbe};
use crate::maintenance::healing::{BookCatalog, HealingReport, HealingService};
use crate::maintenance::validation::ValidationService;
use crate::models::Book;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Capacity of each download's progress channel
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the subscriber broadcast channel
const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Where a book should be played from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfflineStatus {
    Downloading,
    Available,
    NotDownloaded,
}

/// Observable state of one download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    /// Overall progress in `[0, 1]`, non-decreasing within one attempt
    pub progress: f64,
    pub stage: DownloadStage,
    pub status_message: String,
    pub is_downloading: bool,
}

impl DownloadRecord {
    fn started() -> Self {
        Self {
            progress: 0.0,
            stage: DownloadStage::Preparing,
            status_message: "Preparing download".to_string(),
            is_downloading: true,
        }
    }

    fn failed(progress: f64, message: String) -> Self {
        Self {
            progress,
            stage: DownloadStage::Failed,
            status_message: message,
            is_downloading: false,
        }
    }
}

/// Combined answer for UI status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub is_downloaded: bool,
    pub is_downloading: bool,
    pub progress: f64,
    pub stage: Option<DownloadStage>,
    pub message: Option<String>,
}

/// How a download attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Answer to a download request
#[derive(Debug)]
pub enum DownloadRequest {
    Started(DownloadHandle),
    AlreadyDownloading,
    AlreadyDownloaded,
}

impl DownloadRequest {
    pub fn handle(self) -> Option<DownloadHandle> {
        match self {
            DownloadRequest::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Handle to a started download
#[derive(Debug)]
pub struct DownloadHandle {
    book_id: String,
    outcome: watch::Receiver<Option<DownloadOutcome>>,
    manager: Weak<ManagerInner>,
}

impl DownloadHandle {
    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    /// Current record, while one exists
    pub async fn record(&self) -> Option<DownloadRecord> {
        let manager = self.manager.upgrade()?;
        manager.record(&self.book_id).await
    }

    /// Wait for the attempt to end
    pub async fn wait(&mut self) -> DownloadOutcome {
        match self.outcome.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| DownloadOutcome::Failed("no outcome".to_string())),
            Err(_) => DownloadOutcome::Failed("download task ended unexpectedly".to_string()),
        }
    }
}

/// Books the manager has seen, for manifest repair
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    books: std::sync::RwLock<HashMap<String, Book>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, book: Book) {
        let mut books = self.books.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        books.insert(book.id.clone(), book);
    }

    pub fn len(&self) -> usize {
        self.books.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BookCatalog for MemoryCatalog {
    fn cached_book(&self, book_id: &str) -> Option<Book> {
        self.books
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(book_id)
            .cloned()
    }
}

/// In-flight (or recently finished) download
#[derive(Debug)]
struct ActiveDownload {
    record: DownloadRecord,
    cancel: CancellationToken,
    attempt: u64,
}

struct ManagerInner {
    config: OfflineConfig,
    storage: Arc<StorageService>,
    validation: ValidationService,
    orchestrator: DownloadOrchestrator,
    leases: BookLeases,
    catalog: Arc<MemoryCatalog>,
    healing: HealingService,
    client: RwLock<Option<Arc<ServerClient>>>,
    active: RwLock<HashMap<String, ActiveDownload>>,
    downloaded: RwLock<HashMap<String, Book>>,
    events: broadcast::Sender<ProgressEvent>,
    semaphore: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    next_attempt: AtomicU64,
    initialized: AtomicBool,
}

impl std::fmt::Debug for ManagerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerInner")
            .field("root", &self.storage.root())
            .finish_non_exhaustive()
    }
}

/// Coordination layer for offline downloads
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// Create a manager using the system's free-space figures
    pub fn new(config: OfflineConfig) -> Result<Self> {
        Self::with_space_probe(config, Arc::new(SystemSpaceProbe))
    }

    pub fn with_space_probe(config: OfflineConfig, space: Arc<dyn SpaceProbe>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(StorageService::with_space_probe(
            config.downloads_directory.clone(),
            space,
        ));
        let leases = BookLeases::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let healing = HealingService::new(
            Arc::clone(&storage),
            leases.clone(),
            Arc::clone(&catalog) as Arc<dyn BookCatalog>,
            config.healing_interval(),
        );
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                validation: ValidationService::new(Arc::clone(&storage)),
                orchestrator: DownloadOrchestrator::new(Arc::clone(&storage), &config),
                semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
                config,
                storage,
                leases,
                catalog,
                healing,
                client: RwLock::new(None),
                active: RwLock::new(HashMap::new()),
                downloaded: RwLock::new(HashMap::new()),
                events,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                next_attempt: AtomicU64::new(1),
                initialized: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<StorageService> {
        &self.inner.storage
    }

    pub fn healing(&self) -> &HealingService {
        &self.inner.healing
    }

    pub fn catalog(&self) -> &Arc<MemoryCatalog> {
        &self.inner.catalog
    }

    /// Load downloaded books from disk and start background healing
    ///
    /// Only books that pass validation are listed. Calling this again only
    /// reloads the list.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .storage
            .ensure_directory_exists(self.inner.storage.root())
            .await?;
        self.inner.reload_downloaded_books().await;

        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.spawn_reload_on_heal();
        self.inner.healing.start().await;
        info!(
            root = %self.inner.storage.root().display(),
            books = self.inner.downloaded.read().await.len(),
            "Download manager initialized"
        );
        Ok(())
    }

    /// Refresh the downloaded list after every healing sweep
    fn spawn_reload_on_heal(&self) {
        let mut reports = self.inner.healing.subscribe();
        let manager = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = reports.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let Some(manager) = manager.upgrade() else { break };
                manager.reload_downloaded_books().await;
            }
        });
    }

    /// Re-read every manifest and keep the books that validate
    pub async fn reload_downloaded_books(&self) {
        self.inner.reload_downloaded_books().await;
    }

    /// Configure the server used for downloads; `None` clears it
    pub async fn set_credentials(&self, credentials: Option<ServerCredentials>) -> Result<()> {
        let client = match credentials {
            Some(credentials) => {
                let config = ClientConfig::builder()
                    .timeout(self.inner.config.request_timeout())
                    .user_agent(self.inner.config.user_agent.clone())
                    .build();
                Some(Arc::new(ServerClient::with_config(credentials, config)?))
            }
            None => None,
        };
        *self.inner.client.write().await = client;
        Ok(())
    }

    /// Start downloading a book
    ///
    /// Returns `AlreadyDownloaded`/`AlreadyDownloading` without doing
    /// anything when the book is available or in flight. Missing
    /// credentials and insufficient free space fail here, before any
    /// network request; every later failure ends up in the book's record.
    pub async fn download_book(&self, book: Book) -> Result<DownloadRequest> {
        let inner = &self.inner;
        let book_id = book.id.clone();

        if inner.is_available(&book_id).await {
            return Ok(DownloadRequest::AlreadyDownloaded);
        }
        if inner.is_downloading(&book_id).await {
            return Ok(DownloadRequest::AlreadyDownloading);
        }

        book.validate_chapters()?;

        let client = match inner.client.read().await.clone() {
            Some(client) => client,
            None => {
                let err = OfflineError::NotConfigured("no server credentials set".to_string());
                inner.record_rejection(&book_id, &err).await;
                return Err(err);
            }
        };

        if let Err(err) = inner.orchestrator.ensure_free_space().await {
            inner.record_rejection(&book_id, &err).await;
            return Err(err);
        }

        let cancel = inner.shutdown.child_token();
        let attempt = inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = inner.active.write().await;
            if active.get(&book_id).is_some_and(|a| a.record.is_downloading) {
                return Ok(DownloadRequest::AlreadyDownloading);
            }
            active.insert(
                book_id.clone(),
                ActiveDownload {
                    record: DownloadRecord::started(),
                    cancel: cancel.clone(),
                    attempt,
                },
            );
        }

        // Queued books are owned by their download even before a slot frees up
        let lease = inner.leases.try_acquire(&book_id, LeaseHolder::Download);

        info!(book_id = %book_id, title = %book.title, chapters = book.chapters.len(), "Download requested");
        inner.catalog.insert(book.clone());

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let task_inner = Arc::clone(inner);
        inner.tasks.spawn(async move {
            let outcome = task_inner.run_download(book, client, lease, cancel, attempt).await;
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(DownloadRequest::Started(DownloadHandle {
            book_id,
            outcome: outcome_rx,
            manager: Arc::downgrade(inner),
        }))
    }

    /// Fetch a book's details from the server, then download it
    pub async fn download_book_by_id(&self, book_id: &str) -> Result<DownloadRequest> {
        if self.inner.is_available(book_id).await {
            return Ok(DownloadRequest::AlreadyDownloaded);
        }
        if self.inner.is_downloading(book_id).await {
            return Ok(DownloadRequest::AlreadyDownloading);
        }

        let client = self
            .inner
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| OfflineError::NotConfigured("no server credentials set".to_string()))?;
        let book = client.fetch_book_details(book_id).await?;
        self.download_book(book).await
    }

    /// Cancel a running download
    ///
    /// The record is gone as soon as this returns; files are cleaned up by
    /// the download task shortly after. Returns whether anything was
    /// cancelled.
    pub async fn cancel_download(&self, book_id: &str) -> bool {
        self.inner.cancel(book_id).await
    }

    /// Delete a downloaded book, cancelling any download of it first
    ///
    /// Deleting a book that is not downloaded is not an error.
    pub async fn delete_book(&self, book_id: &str) -> Result<()> {
        self.inner.delete(book_id).await
    }

    /// Delete every downloaded book
    ///
    /// Continues past individual failures and returns the first one.
    pub async fn delete_all_books(&self) -> Result<()> {
        let inner = &self.inner;

        let active: Vec<String> = inner.active.read().await.keys().cloned().collect();
        for book_id in &active {
            inner.cancel(book_id).await;
        }

        let mut ids: Vec<String> = inner.downloaded.read().await.keys().cloned().collect();
        match inner.storage.list_book_directories().await {
            Ok(directories) => ids.extend(directories.into_iter().map(|d| d.book_id)),
            Err(e) => warn!(error = %e, "Could not list book directories"),
        }
        ids.extend(active);
        ids.sort();
        ids.dedup();

        let mut first_error = None;
        for book_id in ids {
            if let Err(e) = inner.delete(&book_id).await {
                warn!(book_id = %book_id, error = %e, "Failed to delete book");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn is_book_downloaded(&self, book_id: &str) -> bool {
        self.inner.downloaded.read().await.contains_key(book_id)
    }

    pub async fn is_downloading_book(&self, book_id: &str) -> bool {
        self.inner.is_downloading(book_id).await
    }

    /// Progress in `[0, 1]`; 1.0 for downloaded books, 0.0 when unknown
    pub async fn get_download_progress(&self, book_id: &str) -> f64 {
        if let Some(record) = self.inner.record(book_id).await {
            return record.progress;
        }
        if self.is_book_downloaded(book_id).await {
            1.0
        } else {
            0.0
        }
    }

    pub async fn get_download_record(&self, book_id: &str) -> Option<DownloadRecord> {
        self.inner.record(book_id).await
    }

    pub async fn get_download_status(&self, book_id: &str) -> DownloadStatus {
        let record = self.inner.record(book_id).await;
        let is_downloaded = self.is_book_downloaded(book_id).await;

        match record {
            Some(record) => DownloadStatus {
                is_downloaded,
                is_downloading: record.is_downloading,
                progress: record.progress,
                stage: Some(record.stage),
                message: Some(record.status_message),
            },
            None => DownloadStatus {
                is_downloaded,
                is_downloading: false,
                progress: if is_downloaded { 1.0 } else { 0.0 },
                stage: None,
                message: None,
            },
        }
    }

    /// Whether to play a book from local files
    ///
    /// `Available` is only reported when the book validates right now.
    pub async fn get_offline_status(&self, book_id: &str) -> OfflineStatus {
        self.inner.offline_status(book_id).await
    }

    pub async fn get_local_audio_path(&self, book_id: &str, chapter_index: usize) -> Option<PathBuf> {
        self.inner.storage.get_local_audio_path(book_id, chapter_index).await
    }

    pub async fn get_local_cover_path(&self, book_id: &str) -> Option<PathBuf> {
        self.inner.storage.get_local_cover_path(book_id).await
    }

    pub async fn get_total_download_size(&self) -> u64 {
        self.inner.storage.get_total_download_size().await
    }

    pub async fn get_book_storage_size(&self, book_id: &str) -> u64 {
        self.inner.storage.get_book_storage_size(book_id).await
    }

    /// Downloaded books ordered by title
    pub async fn downloaded_books(&self) -> Vec<Book> {
        let mut books: Vec<Book> = self.inner.downloaded.read().await.values().cloned().collect();
        books.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        books
    }

    /// Every progress event accepted for any book
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    /// Request an immediate healing sweep (app-foreground hook)
    pub fn trigger_healing(&self) {
        self.inner.healing.trigger();
    }

    /// Run one healing sweep inline and refresh the downloaded list
    pub async fn heal_now(&self) -> HealingReport {
        let report = self.inner.healing.sweep_now().await;
        self.inner.reload_downloaded_books().await;
        report
    }

    /// Cancel every download, stop healing and wait for background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down download manager");
        self.inner.shutdown.cancel();
        self.inner.healing.stop().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.active.write().await.clear();
    }
}

impl ManagerInner {
    async fn record(&self, book_id: &str) -> Option<DownloadRecord> {
        self.active.read().await.get(book_id).map(|a| a.record.clone())
    }

    async fn is_downloading(&self, book_id: &str) -> bool {
        self.active
            .read()
            .await
            .get(book_id)
            .is_some_and(|a| a.record.is_downloading)
    }

    /// Validate on disk and keep the downloaded list in step
    async fn is_available(&self, book_id: &str) -> bool {
        if self.leases.holder(book_id) == Some(LeaseHolder::Deletion) {
            return false;
        }

        let report = self.validation.validate_book_integrity(book_id).await;
        let mut downloaded = self.downloaded.write().await;
        match (report.is_valid, report.book) {
            (true, Some(book)) => {
                if !downloaded.contains_key(book_id) && !self.leases.is_leased(book_id) {
                    self.catalog.insert(book.clone());
                    downloaded.insert(book_id.to_string(), book);
                }
                true
            }
            _ => {
                if downloaded.remove(book_id).is_some() {
                    debug!(book_id = %book_id, reason = ?report.reason, "Dropped invalid book from list");
                }
                false
            }
        }
    }

    async fn offline_status(&self, book_id: &str) -> OfflineStatus {
        if self.is_downloading(book_id).await {
            return OfflineStatus::Downloading;
        }
        if self.is_available(book_id).await {
            OfflineStatus::Available
        } else {
            OfflineStatus::NotDownloaded
        }
    }

    async fn reload_downloaded_books(&self) {
        // Held across the scan so a concurrent delete cannot be undone
        let mut downloaded = self.downloaded.write().await;

        let mut books = HashMap::new();
        for book in self.storage.load_downloaded_books().await {
            if self.leases.is_leased(&book.id) {
                if let Some(existing) = downloaded.get(&book.id) {
                    books.insert(book.id.clone(), existing.clone());
                }
                continue;
            }
            let report = self.validation.validate_book_integrity(&book.id).await;
            if report.is_valid {
                self.catalog.insert(book.clone());
                books.insert(book.id.clone(), book);
            } else {
                debug!(book_id = %book.id, reason = ?report.reason, "Not listing invalid download");
            }
        }

        *downloaded = books;
    }

    /// Mirror a synchronous rejection into a transient failed record
    async fn record_rejection(self: &Arc<Self>, book_id: &str, err: &OfflineError) {
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        let message = format!("Download failed: {}", err.user_message());
        {
            let mut active = self.active.write().await;
            if active.get(book_id).is_some_and(|a| a.record.is_downloading) {
                return;
            }
            active.insert(
                book_id.to_string(),
                ActiveDownload {
                    record: DownloadRecord::failed(0.0, message.clone()),
                    cancel: CancellationToken::new(),
                    attempt,
                },
            );
        }
        warn!(book_id = %book_id, error = %err, "Download rejected");
        self.publish(book_id, 0.0, message, DownloadStage::Failed);
        self.schedule_removal(book_id.to_string(), attempt);
    }

    async fn run_download(
        self: Arc<Self>,
        book: Book,
        client: Arc<ServerClient>,
        lease: Option<BookLease>,
        cancel: CancellationToken,
        attempt: u64,
    ) -> DownloadOutcome {
        let book_id = book.id.clone();

        // Still held by a previous attempt's cleanup or a healing pass
        let lease = match lease {
            Some(lease) => Some(lease),
            None => tokio::select! {
                _ = cancel.cancelled() => None,
                lease = self.leases.acquire(&book_id, LeaseHolder::Download) => Some(lease),
            },
        };
        let Some(_lease) = lease else {
            return self.finish(&book_id, attempt, DownloadOutcome::Cancelled).await;
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return self.finish(&book_id, attempt, DownloadOutcome::Cancelled).await;
        };

        debug!(book_id = %book_id, "Download started");
        let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let transfer = self.orchestrator.download_book(&client, &book, tx, &cancel);
        let forward = async {
            while let Some(event) = rx.recv().await {
                self.apply_event(attempt, event).await;
            }
        };
        let (result, ()) = tokio::join!(transfer, forward);

        let outcome = match result {
            Ok(_) => self.complete(&book_id, attempt, &cancel).await,
            Err(e) if e.is_cancelled() => DownloadOutcome::Cancelled,
            Err(e) => {
                if e.is_file_error() {
                    error!(book_id = %book_id, error = %e, "Download failed writing to storage");
                } else {
                    warn!(book_id = %book_id, error = %e, "Download failed");
                }
                DownloadOutcome::Failed(format!("Download failed: {}", e.user_message()))
            }
        };

        self.finish(&book_id, attempt, outcome).await
    }

    /// Load the written manifest as the downloaded record and publish `Complete`
    ///
    /// The list entry and the record change under the `active` lock, so a
    /// cancel either lands first and the files are removed, or it finds a
    /// finished download and does nothing.
    async fn complete(
        self: &Arc<Self>,
        book_id: &str,
        attempt: u64,
        cancel: &CancellationToken,
    ) -> DownloadOutcome {
        let book = match self.validation.validate_book_integrity(book_id).await.into_result() {
            Ok(book) => book,
            Err(e) => {
                warn!(book_id = %book_id, error = %e, "Downloaded book failed validation");
                if let Err(cleanup) = self.storage.delete_book(book_id).await {
                    warn!(book_id = %book_id, error = %cleanup, "Failed to remove invalid download");
                }
                return DownloadOutcome::Failed(format!("Download failed: {}", e.user_message()));
            }
        };

        let message = "Download complete".to_string();
        {
            let mut active = self.active.write().await;
            let current = !cancel.is_cancelled()
                && active
                    .get(book_id)
                    .is_some_and(|a| a.attempt == attempt && a.record.is_downloading);
            if !current {
                drop(active);
                info!(book_id = %book_id, "Cancelled while finalizing, removing files");
                if let Err(e) = self.storage.delete_book(book_id).await {
                    warn!(book_id = %book_id, error = %e, "Failed to remove cancelled download");
                }
                return DownloadOutcome::Cancelled;
            }

            self.catalog.insert(book.clone());
            self.downloaded.write().await.insert(book_id.to_string(), book);
            if let Some(entry) = active.get_mut(book_id) {
                entry.record = DownloadRecord {
                    progress: 1.0,
                    stage: DownloadStage::Complete,
                    status_message: message.clone(),
                    is_downloading: false,
                };
            }
            self.publish(book_id, 1.0, message, DownloadStage::Complete);
        }

        info!(book_id = %book_id, "Download complete");
        self.schedule_removal(book_id.to_string(), attempt);
        DownloadOutcome::Completed
    }

    /// Apply a progress event from the download's own channel
    async fn apply_event(&self, attempt: u64, mut event: ProgressEvent) {
        let mut active = self.active.write().await;
        let Some(entry) = active.get_mut(&event.book_id) else {
            return;
        };
        if entry.attempt != attempt || !entry.record.is_downloading {
            return;
        }
        let record = &mut entry.record;
        if event.stage != record.stage && !record.stage.can_transition_to(event.stage) {
            return;
        }
        record.stage = event.stage;
        record.progress = record.progress.max(event.progress);
        record.status_message = event.message.clone();
        event.progress = record.progress;

        // Sent under the lock so a concurrent cancel cannot slip in between
        let _ = self.events.send(event);
    }

    /// Record a cancelled or failed end; `complete` already recorded success
    async fn finish(self: &Arc<Self>, book_id: &str, attempt: u64, outcome: DownloadOutcome) -> DownloadOutcome {
        match &outcome {
            DownloadOutcome::Cancelled => {
                let mut active = self.active.write().await;
                if active.get(book_id).is_some_and(|a| a.attempt == attempt) {
                    active.remove(book_id);
                }
                info!(book_id = %book_id, "Download cancelled");
            }
            DownloadOutcome::Completed => {}
            DownloadOutcome::Failed(message) => {
                let progress = self.record(book_id).await.map(|r| r.progress).unwrap_or(0.0);
                self.set_terminal(book_id, attempt, progress, message.clone(), DownloadStage::Failed)
                    .await;
            }
        }
        outcome
    }

    async fn set_terminal(
        self: &Arc<Self>,
        book_id: &str,
        attempt: u64,
        progress: f64,
        message: String,
        stage: DownloadStage,
    ) {
        let progress = {
            let mut active = self.active.write().await;
            let Some(entry) = active.get_mut(book_id) else {
                return;
            };
            if entry.attempt != attempt {
                return;
            }
            entry.record = DownloadRecord {
                progress: entry.record.progress.max(progress),
                stage,
                status_message: message.clone(),
                is_downloading: false,
            };
            entry.record.progress
        };

        self.publish(book_id, progress, message, stage);
        self.schedule_removal(book_id.to_string(), attempt);
    }

    fn publish(&self, book_id: &str, progress: f64, message: String, stage: DownloadStage) {
        let _ = self.events.send(ProgressEvent {
            book_id: book_id.to_string(),
            progress,
            message,
            stage,
        });
    }

    /// Drop a terminal record once the grace period has passed
    fn schedule_removal(self: &Arc<Self>, book_id: String, attempt: u64) {
        let grace = self.config.terminal_state_grace();
        let inner = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let Some(inner) = inner.upgrade() else { return };
            let mut active = inner.active.write().await;
            if active
                .get(&book_id)
                .is_some_and(|a| a.attempt == attempt && !a.record.is_downloading)
            {
                active.remove(&book_id);
            }
        });
    }

    async fn cancel(&self, book_id: &str) -> bool {
        let removed = self.active.write().await.remove(book_id);
        match removed {
            Some(entry) if entry.record.is_downloading => {
                entry.cancel.cancel();
                info!(book_id = %book_id, "Cancelling download");
                true
            }
            _ => false,
        }
    }

    async fn delete(&self, book_id: &str) -> Result<()> {
        self.cancel(book_id).await;

        // Waits for a cancelled download to finish its own cleanup
        let _lease = self.leases.acquire(book_id, LeaseHolder::Deletion).await;
        self.storage.delete_book(book_id).await?;
        self.downloaded.write().await.remove(book_id);

        info!(book_id = %book_id, "Book deleted");
        Ok(())
    }
}
