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


//! Downloads directory scanner
//!
//! Enumerates book directories under the downloads root and loads their
//! manifests. Used at startup and by the healing sweep.

use crate::error::{OfflineError, Result};
use crate::file::paths::{decode_book_id, MANIFEST_FILE_NAME};
use crate::models::Book;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// A directory under the downloads root that maps back to a book id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookDirectory {
    pub book_id: String,
    pub path: PathBuf,
}

/// Scan results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResults {
    /// Number of book directories found
    pub directories_found: usize,
    /// Number of manifests that deserialized
    pub manifests_loaded: usize,
    /// Number of directories with a missing or unreadable manifest
    pub manifests_skipped: usize,
}

/// List book directories under `root`
///
/// A missing root means nothing has been downloaded yet. Entries that are
/// not directories, or whose names are not encoded book ids, are ignored.
pub async fn scan_book_directories(root: &Path) -> Result<Vec<BookDirectory>> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(OfflineError::FileIoError(format!(
                "Failed to read directory {}: {}",
                root.display(),
                e
            )))
        }
    };

    let mut directories = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(|e| {
        OfflineError::FileIoError(format!(
            "Failed to read directory entry in {}: {}",
            root.display(),
            e
        ))
    })? {
        let is_dir = match entry.file_type().await {
            Ok(file_type) => file_type.is_dir(),
            // Removed between listing and stat
            Err(_) => continue,
        };
        if !is_dir {
            continue;
        }

        let name = entry.file_name();
        let Some(book_id) = name.to_str().and_then(decode_book_id) else {
            debug!(name = ?name, "Ignoring foreign directory in downloads root");
            continue;
        };

        directories.push(BookDirectory {
            book_id,
            path: entry.path(),
        });
    }

    directories.sort_by(|a, b| a.book_id.cmp(&b.book_id));
    Ok(directories)
}

/// Load every manifest under `root`, skipping unreadable ones
pub async fn load_manifests(root: &Path) -> Result<(Vec<Book>, ScanResults)> {
    let directories = scan_book_directories(root).await?;
    let mut results = ScanResults {
        directories_found: directories.len(),
        ..ScanResults::default()
    };
    let mut books = Vec::with_capacity(directories.len());

    for directory in directories {
        match read_manifest_in(&directory.path).await {
            Some(book) if book.id == directory.book_id => {
                results.manifests_loaded += 1;
                books.push(book);
            }
            Some(book) => {
                debug!(
                    directory = %directory.book_id,
                    manifest = %book.id,
                    "Manifest id does not match its directory"
                );
                results.manifests_skipped += 1;
            }
            None => results.manifests_skipped += 1,
        }
    }

    Ok((books, results))
}

async fn read_manifest_in(dir: &Path) -> Option<Book> {
    let bytes = fs::read(dir.join(MANIFEST_FILE_NAME)).await.ok()?;
    Book::from_manifest_json(&bytes).ok()
}
