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


//! Download progress tracking and reporting
//!
//! # Progress Weighting
//! - Audio: `[0, 0.95]`, `(chapters completed + fraction of current) / total`
//! - Cover: 0.97
//! - Finalizing: 0.99
//! - Complete: 1.0
//!
//! # Delivery
//! Each download publishes [`ProgressEvent`]s on its own bounded channel.
//! Byte-count updates are throttled and sent with `try_send`, so a slow
//! consumer only loses intermediate values. Stage transitions are awaited
//! and never dropped. Within one reporter, progress never decreases and
//! stages never move backwards.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Share of the progress bar taken by chapter audio
pub const AUDIO_PROGRESS_WEIGHT: f64 = 0.95;

/// Progress once the cover stage starts
pub const COVER_PROGRESS: f64 = 0.97;

/// Progress once the manifest is being written
pub const FINALIZING_PROGRESS: f64 = 0.99;

/// Lifecycle stage of one download attempt
///
/// Stages only move forward. `Failed` is reachable from every non-terminal
/// stage and is terminal itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadStage {
    Preparing,
    DownloadingAudio,
    DownloadingCover,
    Finalizing,
    Complete,
    Failed,
}

impl DownloadStage {
    fn ordinal(self) -> u8 {
        match self {
            DownloadStage::Preparing => 0,
            DownloadStage::DownloadingAudio => 1,
            DownloadStage::DownloadingCover => 2,
            DownloadStage::Finalizing => 3,
            DownloadStage::Complete => 4,
            DownloadStage::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStage::Complete | DownloadStage::Failed)
    }

    /// Whether moving from `self` to `next` respects stage ordering
    ///
    /// Staying in the same non-terminal stage is allowed (progress updates).
    pub fn can_transition_to(self, next: DownloadStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == DownloadStage::Failed {
            return true;
        }
        next.ordinal() >= self.ordinal()
    }

    pub fn display_name(self) -> &'static str {
        match self {
            DownloadStage::Preparing => "Preparing",
            DownloadStage::DownloadingAudio => "Downloading audio",
            DownloadStage::DownloadingCover => "Downloading cover",
            DownloadStage::Finalizing => "Finalizing",
            DownloadStage::Complete => "Complete",
            DownloadStage::Failed => "Failed",
        }
    }
}

impl fmt::Display for DownloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One progress notification for a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub book_id: String,
    /// Overall progress in `[0, 1]`
    pub progress: f64,
    pub message: String,
    pub stage: DownloadStage,
}

/// Overall progress while chapter audio is transferring
///
/// `chapter_fraction` is how much of the current chapter has arrived, in
/// `[0, 1]`.
pub fn audio_progress(completed_chapters: usize, chapter_fraction: f64, total_chapters: usize) -> f64 {
    if total_chapters == 0 {
        return 0.0;
    }
    let fraction = chapter_fraction.clamp(0.0, 1.0);
    let done = (completed_chapters as f64 + fraction) / total_chapters as f64;
    (done * AUDIO_PROGRESS_WEIGHT).clamp(0.0, AUDIO_PROGRESS_WEIGHT)
}

/// Format a transfer rate for status messages (e.g. "2.5 MB/s")
pub fn speed_string(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000.0 {
        format!("{:.1} MB/s", bytes_per_sec / 1_000_000.0)
    } else {
        format!("{:.0} KB/s", bytes_per_sec / 1_000.0)
    }
}

/// Speed tracker with moving average
///
/// Keeps position samples inside a sliding window to smooth out network
/// fluctuations.
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    /// Total bytes at this point in time
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    /// Add a position sample (total bytes transferred so far)
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();

        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-download publisher of progress events
///
/// Owned by the orchestration task; the coordination layer holds the
/// receiving end.
#[derive(Debug)]
pub struct ProgressReporter {
    book_id: String,
    tx: mpsc::Sender<ProgressEvent>,
    stage: DownloadStage,
    progress: f64,
    last_update: Option<Instant>,
    update_interval: Duration,
    speed_tracker: SpeedTracker,
    /// Bytes from finished chapters, so speed spans chapter boundaries
    bytes_before_chapter: u64,
}

impl ProgressReporter {
    pub fn new(book_id: String, tx: mpsc::Sender<ProgressEvent>, update_interval: Duration) -> Self {
        Self {
            book_id,
            tx,
            stage: DownloadStage::Preparing,
            progress: 0.0,
            last_update: None,
            update_interval,
            speed_tracker: SpeedTracker::new(),
            bytes_before_chapter: 0,
        }
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn stage(&self) -> DownloadStage {
        self.stage
    }

    /// Last progress value published
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Publish a stage transition; always delivered unless the receiver is gone
    ///
    /// Out-of-order transitions are ignored. Progress is clamped so it never
    /// goes below what was already reported.
    pub async fn enter_stage(&mut self, stage: DownloadStage, progress: f64, message: impl Into<String>) {
        if stage != self.stage && !self.stage.can_transition_to(stage) {
            return;
        }
        self.stage = stage;
        self.progress = self.progress.max(progress.clamp(0.0, 1.0));
        self.last_update = Some(Instant::now());

        let event = self.event(message.into());
        // Receiver gone means nobody is observing any more
        let _ = self.tx.send(event).await;
    }

    /// Publish a throttled progress update within the current stage
    ///
    /// Returns whether an event was handed to the channel.
    pub fn update(&mut self, progress: f64, message: impl Into<String>) -> bool {
        if self.stage.is_terminal() {
            return false;
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress <= self.progress {
            return false;
        }

        let now = Instant::now();
        if let Some(last) = self.last_update {
            if now.duration_since(last) < self.update_interval {
                return false;
            }
        }

        self.progress = progress;
        self.last_update = Some(now);
        let event = self.event(message.into());
        self.tx.try_send(event).is_ok()
    }

    /// Report bytes received for the chapter currently transferring
    ///
    /// `chapter_index` is 0-based. Without a known content length the
    /// chapter contributes nothing until it completes.
    pub fn chapter_bytes(
        &mut self,
        chapter_index: usize,
        total_chapters: usize,
        received: u64,
        expected: Option<u64>,
    ) -> bool {
        self.speed_tracker.add_position(self.bytes_before_chapter + received);

        let fraction = match expected {
            Some(total) if total > 0 => received as f64 / total as f64,
            _ => 0.0,
        };
        let progress = audio_progress(chapter_index, fraction, total_chapters);
        let message = self.chapter_message(chapter_index, total_chapters);
        self.update(progress, message)
    }

    /// Mark a chapter as fully transferred
    pub fn chapter_finished(&mut self, chapter_index: usize, total_chapters: usize, bytes: u64) -> bool {
        self.bytes_before_chapter += bytes;
        let progress = audio_progress(chapter_index + 1, 0.0, total_chapters);
        let message = self.chapter_message((chapter_index + 1).min(total_chapters.saturating_sub(1)), total_chapters);
        self.update(progress, message)
    }

    /// Status message for the chapter currently transferring
    pub fn chapter_message(&self, chapter_index: usize, total_chapters: usize) -> String {
        let speed = self.speed_tracker.average_speed();
        if speed > 0.0 {
            format!(
                "Downloading chapter {} of {} ({})",
                chapter_index + 1,
                total_chapters,
                speed_string(speed)
            )
        } else {
            format!("Downloading chapter {} of {}", chapter_index + 1, total_chapters)
        }
    }

    fn event(&self, message: String) -> ProgressEvent {
        ProgressEvent {
            book_id: self.book_id.clone(),
            progress: self.progress,
            message,
            stage: self.stage,
        }
    }
}
