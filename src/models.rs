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


//! Book and chapter records
//!
//! The same `Book` type is produced by the API client and persisted as the
//! `metadata.json` manifest of a downloaded book. The manifest is the only
//! record that survives a relaunch, so the serialized field names below are
//! a file format and must not change.
//!
//! # Manifest layout
//! ```json
//! {
//!   "id": "li_8f2c",
//!   "title": "The Hobbit",
//!   "author": "J.R.R. Tolkien",
//!   "chapters": [
//!     { "id": 0, "title": "An Unexpected Party", "start": 0.0, "end": 1804.5,
//!       "libraryItemId": "li_8f2c", "episodeId": null, "contentUrl": null }
//!   ],
//!   "coverPath": "/api/items/li_8f2c/cover",
//!   "collapsedSeries": null
//! }
//! ```

use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};

/// A downloadable/playable audiobook item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    /// Server-assigned, stable identifier
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub author: Option<String>,

    /// Playback order, which is also download order
    #[serde(default)]
    pub chapters: Vec<Chapter>,

    /// Server-relative or absolute cover location
    #[serde(default)]
    pub cover_path: Option<String>,

    /// Set when this record stands in for a whole series
    #[serde(default)]
    pub collapsed_series: Option<CollapsedSeries>,
}

/// A contiguous, time-addressable segment of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: u32,

    pub title: String,

    /// Start offset in seconds
    pub start: f64,

    /// End offset in seconds
    pub end: f64,

    /// Library item that owns the audio for this chapter
    pub library_item_id: String,

    /// Podcast-style episode id
    #[serde(default)]
    pub episode_id: Option<String>,

    /// Direct content URL when the server already issued one
    #[serde(default)]
    pub content_url: Option<String>,
}

/// Descriptor of a series collapsed into a single book entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollapsedSeries {
    pub id: String,
    pub name: String,
    pub num_books: u32,
}

impl Chapter {
    /// Duration in seconds (`end - start`)
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Whether `offset` falls inside `[start, end)`
    pub fn contains(&self, offset: f64) -> bool {
        offset >= self.start && offset < self.end
    }
}

impl Book {
    /// Total playable duration in seconds
    pub fn total_duration(&self) -> f64 {
        self.chapters.iter().map(Chapter::duration).sum()
    }

    pub fn is_collapsed_series(&self) -> bool {
        self.collapsed_series.is_some()
    }

    /// Check the book can be downloaded as a set of chapter files
    ///
    /// Chapters must be non-empty, each `[start, end)` well formed, and the
    /// list ordered without overlap.
    pub fn validate_chapters(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OfflineError::InvalidBook("book id is empty".to_string()));
        }

        if self.chapters.is_empty() {
            return Err(OfflineError::InvalidBook(format!(
                "book {} has no chapters",
                self.id
            )));
        }

        let mut previous_end = f64::NEG_INFINITY;
        for (index, chapter) in self.chapters.iter().enumerate() {
            if !chapter.start.is_finite() || !chapter.end.is_finite() || chapter.end < chapter.start {
                return Err(OfflineError::InvalidBook(format!(
                    "chapter {} of book {} has invalid bounds [{}, {})",
                    index, self.id, chapter.start, chapter.end
                )));
            }

            // Podcast episodes each restart at zero within their own item
            let same_item = index > 0
                && self.chapters[index - 1].library_item_id == chapter.library_item_id
                && self.chapters[index - 1].episode_id == chapter.episode_id;

            if same_item && chapter.start < previous_end {
                return Err(OfflineError::InvalidBook(format!(
                    "chapter {} of book {} overlaps the previous chapter",
                    index, self.id
                )));
            }

            previous_end = chapter.end;
        }

        Ok(())
    }

    /// Serialize to manifest bytes
    pub fn to_manifest_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse manifest bytes
    pub fn from_manifest_json(bytes: &[u8]) -> Result<Self> {
        let book: Book = serde_json::from_slice(bytes)?;
        if book.id.trim().is_empty() {
            return Err(OfflineError::InvalidBook("manifest has an empty id".to_string()));
        }
        Ok(book)
    }
}
