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


//! Integrity checks for downloaded books
//!
//! A book directory is valid iff its manifest exists and deserializes, the
//! manifest lists at least one chapter, and every chapter index has a
//! non-empty audio file. Checks run in that order and stop at the first
//! failure. A missing cover never fails validation.
//!
//! Validation is read-only. Repair and purge decisions belong to the
//! healing service.

use crate::error::{OfflineError, Result};
use crate::file::StorageService;
use crate::models::Book;
use std::fmt;
use std::sync::Arc;
use tokio::fs;

/// Why a book directory failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// No directory for this id
    DirectoryMissing,
    /// Directory exists but holds no manifest
    ManifestMissing,
    /// Manifest exists but does not deserialize to a Book
    ManifestCorrupt(String),
    /// Manifest belongs to a different book id
    ManifestMismatch { found: String },
    /// Manifest lists no chapters
    NoChapters,
    /// Audio file for a chapter index is absent
    AudioMissing { chapter_index: usize },
    /// Audio file for a chapter index is zero bytes
    AudioEmpty { chapter_index: usize },
}

impl IntegrityFailure {
    /// Whether the audio content itself is intact and only the manifest is lost
    pub fn is_manifest_failure(&self) -> bool {
        matches!(
            self,
            IntegrityFailure::ManifestMissing
                | IntegrityFailure::ManifestCorrupt(_)
                | IntegrityFailure::ManifestMismatch { .. }
        )
    }
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFailure::DirectoryMissing => write!(f, "book directory missing"),
            IntegrityFailure::ManifestMissing => write!(f, "manifest missing"),
            IntegrityFailure::ManifestCorrupt(e) => write!(f, "manifest unreadable: {}", e),
            IntegrityFailure::ManifestMismatch { found } => {
                write!(f, "manifest belongs to book {}", found)
            }
            IntegrityFailure::NoChapters => write!(f, "manifest lists no chapters"),
            IntegrityFailure::AudioMissing { chapter_index } => {
                write!(f, "audio for chapter {} missing", chapter_index)
            }
            IntegrityFailure::AudioEmpty { chapter_index } => {
                write!(f, "audio for chapter {} is empty", chapter_index)
            }
        }
    }
}

/// Verdict of an integrity check
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub book_id: String,
    pub is_valid: bool,
    pub reason: Option<IntegrityFailure>,
    /// Manifest contents when they could be read
    pub book: Option<Book>,
}

impl IntegrityReport {
    fn valid(book: Book) -> Self {
        Self {
            book_id: book.id.clone(),
            is_valid: true,
            reason: None,
            book: Some(book),
        }
    }

    fn invalid(book_id: &str, reason: IntegrityFailure, book: Option<Book>) -> Self {
        Self {
            book_id: book_id.to_string(),
            is_valid: false,
            reason: Some(reason),
            book,
        }
    }

    /// The validated book, or an `IntegrityCheckFailed` error
    pub fn into_result(self) -> Result<Book> {
        match (self.is_valid, self.book) {
            (true, Some(book)) => Ok(book),
            _ => Err(OfflineError::integrity(
                self.book_id,
                self.reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            )),
        }
    }
}

/// Read-only integrity checks over the storage layout
#[derive(Debug, Clone)]
pub struct ValidationService {
    storage: Arc<StorageService>,
}

impl ValidationService {
    pub fn new(storage: Arc<StorageService>) -> Self {
        Self { storage }
    }

    /// Decide whether a downloaded book is complete and uncorrupted
    pub async fn validate_book_integrity(&self, book_id: &str) -> IntegrityReport {
        let paths = self.storage.paths();

        let dir = match paths.book_dir(book_id) {
            Ok(dir) => dir,
            Err(_) => return IntegrityReport::invalid(book_id, IntegrityFailure::DirectoryMissing, None),
        };
        if !StorageService::file_exists(&dir).await {
            return IntegrityReport::invalid(book_id, IntegrityFailure::DirectoryMissing, None);
        }

        let book = match self.storage.read_manifest(book_id).await {
            Ok(book) => book,
            Err(OfflineError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return IntegrityReport::invalid(book_id, IntegrityFailure::ManifestMissing, None);
            }
            Err(e) => {
                return IntegrityReport::invalid(
                    book_id,
                    IntegrityFailure::ManifestCorrupt(e.to_string()),
                    None,
                );
            }
        };

        if book.id != book_id {
            let found = book.id.clone();
            return IntegrityReport::invalid(
                book_id,
                IntegrityFailure::ManifestMismatch { found },
                Some(book),
            );
        }

        match self.check_audio_files(&book).await {
            Some(reason) => IntegrityReport::invalid(book_id, reason, Some(book)),
            None => IntegrityReport::valid(book),
        }
    }

    /// Check that `book`'s chapters all have non-empty audio on disk
    ///
    /// Healing uses this against a catalog copy of the book to decide whether
    /// a lost manifest can be rewritten.
    pub async fn check_audio_files(&self, book: &Book) -> Option<IntegrityFailure> {
        if book.chapters.is_empty() {
            return Some(IntegrityFailure::NoChapters);
        }

        for chapter_index in 0..book.chapters.len() {
            let path = match self.storage.paths().audio_path(&book.id, chapter_index) {
                Ok(path) => path,
                Err(_) => return Some(IntegrityFailure::AudioMissing { chapter_index }),
            };
            match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() && metadata.len() > 0 => {}
                Ok(metadata) if metadata.is_file() => {
                    return Some(IntegrityFailure::AudioEmpty { chapter_index });
                }
                _ => return Some(IntegrityFailure::AudioMissing { chapter_index }),
            }
        }

        None
    }
}
