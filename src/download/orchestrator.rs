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


//! Book download orchestration
//!
//! Drives the network transfer for one book, start to finish:
//!
//! 1. **Preparing**: validate the chapter list, check free space, reset the
//!    book directory
//! 2. **Downloading audio**: for each chapter in order, resolve its URL,
//!    stream it into a `.part` file and move it to `chapter_NNN.audio`.
//!    Transient failures are retried with exponential backoff
//! 3. **Downloading cover**: one best-effort attempt
//! 4. **Finalizing**: write `metadata.json` atomically
//!
//! Any failure aborts the whole book and removes its directory. The
//! cancellation token is honoured between chapters, between chunks and
//! during backoff sleeps.
//!
//! The caller owns the `Complete`/`Failed` stages: the book is only
//! complete once the coordination layer has re-read the manifest.

use crate::api::client::ServerClient;
use crate::api::models::{AudioTrack, PlaybackSession};
use crate::config::OfflineConfig;
use crate::download::progress::{
    DownloadStage, ProgressEvent, ProgressReporter, COVER_PROGRESS, FINALIZING_PROGRESS,
};
use crate::download::stream::fetch_to_file;
use crate::error::{OfflineError, Result};
use crate::file::paths::part_path;
use crate::file::StorageService;
use crate::models::Book;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Retry budget for one chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the first retry; doubles after each retry
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OfflineConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            initial_backoff: config.initial_backoff(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Transfers books from the server into the storage layout
#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    storage: Arc<StorageService>,
    retry: RetryPolicy,
    read_timeout: Duration,
    min_free_space_bytes: u64,
    progress_interval: Duration,
}

impl DownloadOrchestrator {
    pub fn new(storage: Arc<StorageService>, config: &OfflineConfig) -> Self {
        Self {
            storage,
            retry: RetryPolicy::from_config(config),
            read_timeout: config.request_timeout(),
            min_free_space_bytes: config.min_free_space_bytes,
            progress_interval: config.progress_interval(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fail with `InsufficientStorage` unless the free-space threshold is met
    pub async fn ensure_free_space(&self) -> Result<()> {
        let available = self.storage.available_space().await?;
        if available < self.min_free_space_bytes {
            return Err(OfflineError::InsufficientStorage {
                required: self.min_free_space_bytes,
                available,
            });
        }
        Ok(())
    }

    /// Download `book` completely
    ///
    /// Returns the book as written to the manifest. On error nothing of the
    /// book is left on disk.
    pub async fn download_book(
        &self,
        client: &ServerClient,
        book: &Book,
        events: mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<Book> {
        let mut reporter = ProgressReporter::new(book.id.clone(), events, self.progress_interval);
        reporter
            .enter_stage(DownloadStage::Preparing, 0.0, "Preparing download")
            .await;

        book.validate_chapters()?;
        self.ensure_free_space().await?;

        let dir = self.storage.book_directory(&book.id).await?;
        // Leftovers from an earlier interrupted attempt
        self.storage.delete_book_directory(&dir).await?;
        self.storage.ensure_directory_exists(&dir).await?;

        let mut resolver = ChapterUrlResolver::new(client);
        let result = self
            .transfer(client, book, &mut resolver, &mut reporter, cancel)
            .await;
        resolver.close_sessions().await;

        match result {
            Ok(()) => {
                info!(book_id = %book.id, chapters = book.chapters.len(), "Book downloaded");
                Ok(book.clone())
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(book_id = %book.id, "Download cancelled, removing partial files");
                } else {
                    warn!(book_id = %book.id, error = %e, "Download failed, removing partial files");
                }
                if let Err(cleanup) = self.storage.delete_book_directory(&dir).await {
                    warn!(book_id = %book.id, error = %cleanup, "Failed to remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        client: &ServerClient,
        book: &Book,
        resolver: &mut ChapterUrlResolver<'_>,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = book.chapters.len();
        let message = reporter.chapter_message(0, total);
        reporter
            .enter_stage(DownloadStage::DownloadingAudio, 0.0, message)
            .await;

        // Chapters sharing one remote file are fetched once
        let mut fetched: HashMap<Url, PathBuf> = HashMap::new();

        for index in 0..total {
            if cancel.is_cancelled() {
                return Err(OfflineError::Cancelled);
            }
            let bytes = self
                .download_chapter(client, book, index, resolver, &mut fetched, reporter, cancel)
                .await?;
            reporter.chapter_finished(index, total, bytes);
        }

        if cancel.is_cancelled() {
            return Err(OfflineError::Cancelled);
        }
        reporter
            .enter_stage(DownloadStage::DownloadingCover, COVER_PROGRESS, "Downloading cover")
            .await;
        self.download_cover(client, book, cancel).await?;

        if cancel.is_cancelled() {
            return Err(OfflineError::Cancelled);
        }
        reporter
            .enter_stage(DownloadStage::Finalizing, FINALIZING_PROGRESS, "Finalizing")
            .await;
        self.storage.write_manifest(book).await?;

        // A cancel that lands while the manifest is written still wins
        if cancel.is_cancelled() {
            return Err(OfflineError::Cancelled);
        }
        Ok(())
    }

    /// Download one chapter, retrying transient failures
    async fn download_chapter(
        &self,
        client: &ServerClient,
        book: &Book,
        index: usize,
        resolver: &mut ChapterUrlResolver<'_>,
        fetched: &mut HashMap<Url, PathBuf>,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut attempt = 1;

        loop {
            match self
                .try_chapter(client, book, index, resolver, fetched, reporter, cancel)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        book_id = %book.id,
                        chapter = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chapter transfer failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OfflineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_chapter(
        &self,
        client: &ServerClient,
        book: &Book,
        index: usize,
        resolver: &mut ChapterUrlResolver<'_>,
        fetched: &mut HashMap<Url, PathBuf>,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let url = resolver.resolve(book, index).await?;
        let final_path = self.storage.paths().audio_path(&book.id, index)?;
        let temp_path = part_path(&final_path);
        let total = book.chapters.len();

        if let Some(source) = fetched.get(&url) {
            debug!(book_id = %book.id, chapter = index, source = %source.display(), "Reusing fetched track");
            return self.storage.link_or_copy(source, &final_path).await;
        }

        debug!(book_id = %book.id, chapter = index, url = %url.path(), "Fetching chapter");
        let stats = fetch_to_file(
            client.download_request(url.clone()),
            &temp_path,
            self.read_timeout,
            cancel,
            |received, expected| {
                reporter.chapter_bytes(index, total, received, expected);
            },
        )
        .await?;

        self.storage.safe_move(&temp_path, &final_path).await?;
        fetched.insert(url, final_path);
        Ok(stats.bytes_written)
    }

    /// One attempt at the cover; only cancellation is an error
    async fn download_cover(
        &self,
        client: &ServerClient,
        book: &Book,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let location = match &book.cover_path {
            Some(path) => path.clone(),
            None => format!("/api/items/{}/cover", urlencoding::encode(&book.id)),
        };
        let url = match client.endpoint_url(&location) {
            Ok(url) => url,
            Err(e) => {
                debug!(book_id = %book.id, error = %e, "Unusable cover location");
                return Ok(());
            }
        };

        let final_path = self.storage.paths().cover_path(&book.id)?;
        let temp_path = part_path(&final_path);

        match fetch_to_file(
            client.download_request(url),
            &temp_path,
            self.read_timeout,
            cancel,
            |_, _| {},
        )
        .await
        {
            Ok(_) => {
                if let Err(e) = self.storage.safe_move(&temp_path, &final_path).await {
                    debug!(book_id = %book.id, error = %e, "Cover not stored");
                }
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!(book_id = %book.id, error = %e, "Cover not downloaded");
                Ok(())
            }
        }
    }
}

type SessionKey = (String, Option<String>);

/// Maps chapters to remote URLs, opening playback sessions on demand
///
/// One session is opened per (library item, episode) and reused for every
/// chapter of that item.
#[derive(Debug)]
pub struct ChapterUrlResolver<'a> {
    client: &'a ServerClient,
    sessions: HashMap<SessionKey, PlaybackSession>,
}

impl<'a> ChapterUrlResolver<'a> {
    pub fn new(client: &'a ServerClient) -> Self {
        Self {
            client,
            sessions: HashMap::new(),
        }
    }

    /// Remote URL of chapter `index`
    pub async fn resolve(&mut self, book: &Book, index: usize) -> Result<Url> {
        let chapter = book.chapters.get(index).ok_or_else(|| {
            OfflineError::InvalidBook(format!("book {} has no chapter {}", book.id, index))
        })?;

        if let Some(content_url) = &chapter.content_url {
            return self.client.endpoint_url(content_url);
        }

        let key = (chapter.library_item_id.clone(), chapter.episode_id.clone());
        if !self.sessions.contains_key(&key) {
            let session = self
                .client
                .start_playback_session(&chapter.library_item_id, chapter.episode_id.as_deref())
                .await?;
            self.sessions.insert(key.clone(), session);
        }
        let session = self
            .sessions
            .get(&key)
            .ok_or_else(|| OfflineError::internal("playback session missing after insert"))?;

        let track = select_track(book, index, &session.audio_tracks).ok_or_else(|| {
            OfflineError::invalid_response(
                format!(
                    "no audio track of session {} covers chapter {} of book {}",
                    session.id, index, book.id
                ),
                None,
            )
        })?;

        self.client.endpoint_url(&track.content_url)
    }

    /// Close every session opened so far; failures are only logged
    pub async fn close_sessions(&mut self) {
        for (_, session) in self.sessions.drain() {
            if let Err(e) = self.client.close_session(&session.id).await {
                debug!(session_id = %session.id, error = %e, "Failed to close playback session");
            }
        }
    }
}

/// Pick the track holding the audio for chapter `index`
///
/// When the item has exactly one track per chapter, tracks map by position.
/// Otherwise the track whose offset range contains the chapter start wins.
pub fn select_track<'t>(book: &Book, index: usize, tracks: &'t [AudioTrack]) -> Option<&'t AudioTrack> {
    let chapter = book.chapters.get(index)?;
    let siblings: Vec<usize> = book
        .chapters
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            c.library_item_id == chapter.library_item_id && c.episode_id == chapter.episode_id
        })
        .map(|(i, _)| i)
        .collect();

    let mut ordered: Vec<&AudioTrack> = tracks.iter().collect();
    ordered.sort_by_key(|t| t.index);

    if ordered.len() == siblings.len() {
        let position = siblings.iter().position(|&i| i == index)?;
        return ordered.get(position).copied();
    }

    ordered.into_iter().find(|t| t.contains(chapter.start))
}
