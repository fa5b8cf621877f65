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


//! Storage service for downloaded books
//!
//! Stateless path and I/O operations over the downloads root. Nothing here
//! touches the network or keeps state beyond the filesystem itself.
//!
//! # Key Operations
//! - Book directory mapping and recursive deletion (idempotent)
//! - Local audio/cover lookup for playback
//! - Size accounting that tolerates files vanishing mid-walk
//! - Manifest read/write (atomic)
//! - Free space checks before a download starts

use crate::error::{OfflineError, Result};
use crate::file::paths::BookPaths;
use crate::file::scanner::{self, BookDirectory, ScanResults};
use crate::models::Book;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Source of free-space figures for the downloads volume
pub trait SpaceProbe: Send + Sync + std::fmt::Debug {
    /// Bytes available to this process on the volume holding `path`
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Free space as reported by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        // The root may not exist yet; ask the closest existing ancestor
        let mut existing = path;
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        fs2::available_space(existing)
    }
}

/// Fixed free-space figure
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Filesystem operations over the downloads root
#[derive(Debug, Clone)]
pub struct StorageService {
    paths: BookPaths,
    space: Arc<dyn SpaceProbe>,
}

impl StorageService {
    /// Create a storage service backed by the operating system's free-space figures
    pub fn new(root: PathBuf) -> Self {
        Self::with_space_probe(root, Arc::new(SystemSpaceProbe))
    }

    pub fn with_space_probe(root: PathBuf, space: Arc<dyn SpaceProbe>) -> Self {
        Self {
            paths: BookPaths::new(root),
            space,
        }
    }

    pub fn paths(&self) -> &BookPaths {
        &self.paths
    }

    /// Downloads root
    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    /// Path of a book's directory
    ///
    /// Creates the downloads root if needed, but never the book directory
    /// itself: its existence is what marks a book as (partially) present.
    pub async fn book_directory(&self, book_id: &str) -> Result<PathBuf> {
        let dir = self.paths.book_dir(book_id)?;
        self.ensure_directory_exists(self.paths.root()).await?;
        Ok(dir)
    }

    /// Recursively delete a book directory
    ///
    /// Deleting a directory that does not exist is not an error.
    pub async fn delete_book_directory(&self, path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match fs::remove_dir_all(path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Deleted book directory");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(OfflineError::FileIoError(format!(
                        "Failed to delete directory after {} attempts: {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        path.display(),
                        e
                    )));
                }
                Err(_) => {
                    // A concurrent writer may still be creating files
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    /// Delete the directory of a book id
    pub async fn delete_book(&self, book_id: &str) -> Result<()> {
        let dir = self.paths.book_dir(book_id)?;
        self.delete_book_directory(&dir).await
    }

    /// Local audio file for a chapter, if present
    pub async fn get_local_audio_path(&self, book_id: &str, chapter_index: usize) -> Option<PathBuf> {
        let path = self.paths.audio_path(book_id, chapter_index).ok()?;
        Self::file_exists(&path).await.then_some(path)
    }

    /// Local cover image, if present
    pub async fn get_local_cover_path(&self, book_id: &str) -> Option<PathBuf> {
        let path = self.paths.cover_path(book_id).ok()?;
        Self::file_exists(&path).await.then_some(path)
    }

    /// Sum of all file sizes under the downloads root
    pub async fn get_total_download_size(&self) -> u64 {
        Self::directory_size(self.paths.root().to_path_buf()).await
    }

    /// Sum of file sizes in one book directory
    pub async fn get_book_storage_size(&self, book_id: &str) -> u64 {
        match self.paths.book_dir(book_id) {
            Ok(dir) => Self::directory_size(dir).await,
            Err(_) => 0,
        }
    }

    /// Walk a directory and sum file sizes
    ///
    /// Entries that disappear or cannot be read mid-walk are left out of the
    /// sum rather than failing it.
    async fn directory_size(dir: PathBuf) -> u64 {
        let walk = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.metadata().ok())
                .map(|metadata| metadata.len())
                .sum::<u64>()
        });

        match walk.await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Directory size walk aborted");
                0
            }
        }
    }

    /// Enumerate book directories under the root
    pub async fn list_book_directories(&self) -> Result<Vec<BookDirectory>> {
        scanner::scan_book_directories(self.paths.root()).await
    }

    /// Load every book whose manifest deserializes
    ///
    /// Directories with a missing or corrupt manifest are skipped silently;
    /// validation and healing deal with them.
    pub async fn load_downloaded_books(&self) -> Vec<Book> {
        match scanner::load_manifests(self.paths.root()).await {
            Ok((books, results)) => {
                log_scan(&results);
                books
            }
            Err(e) => {
                warn!(error = %e, "Failed to scan downloads directory");
                Vec::new()
            }
        }
    }

    /// Whether at least `required_bytes` are free on the downloads volume
    pub async fn check_available_storage(&self, required_bytes: u64) -> bool {
        match self.available_space().await {
            Ok(available) => available >= required_bytes,
            Err(e) => {
                warn!(error = %e, "Free space check failed");
                false
            }
        }
    }

    /// Free bytes on the downloads volume
    pub async fn available_space(&self) -> Result<u64> {
        let space = Arc::clone(&self.space);
        let root = self.paths.root().to_path_buf();
        tokio::task::spawn_blocking(move || space.available_space(&root))
            .await
            .map_err(|e| OfflineError::internal(format!("space probe panicked: {}", e)))?
            .map_err(|e| OfflineError::FileIoError(format!("Failed to query free space: {}", e)))
    }

    /// Read and parse a book's manifest
    pub async fn read_manifest(&self, book_id: &str) -> Result<Book> {
        let path = self.paths.manifest_path(book_id)?;
        let bytes = fs::read(&path).await?;
        Book::from_manifest_json(&bytes)
    }

    /// Write a book's manifest atomically
    pub async fn write_manifest(&self, book: &Book) -> Result<()> {
        let path = self.paths.manifest_path(&book.id)?;
        let json = book.to_manifest_json()?;
        self.atomic_write(&path, &json).await
    }

    /// Safe move operation with retry
    ///
    /// # Algorithm
    /// 1. Delete destination if it exists
    /// 2. Rename (atomic on same filesystem)
    /// 3. Retry up to 3 times on failure
    pub async fn safe_move(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::try_move(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(OfflineError::FileIoError(format!(
                        "Failed to move file after {} attempts: {} -> {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        source.display(),
                        destination.display(),
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    /// Try to move file once
    async fn try_move(source: &Path, destination: &Path) -> Result<()> {
        if !Self::file_exists(source).await {
            return Err(OfflineError::FileIoError(format!(
                "Move source missing: {}",
                source.display()
            )));
        }

        if Self::file_exists(destination).await {
            Self::remove_file(destination).await?;
        }

        fs::rename(source, destination).await.map_err(|e| {
            OfflineError::FileIoError(format!(
                "Move failed: {} -> {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Give `destination` the contents of `source`, sharing the data when possible
    ///
    /// Hard links first; filesystems without them get a full copy.
    pub async fn link_or_copy(&self, source: &Path, destination: &Path) -> Result<u64> {
        Self::remove_file(destination).await?;

        if let Err(e) = fs::hard_link(source, destination).await {
            debug!(
                source = %source.display(),
                error = %e,
                "Hard link failed, copying instead"
            );
            fs::copy(source, destination).await.map_err(|e| {
                OfflineError::FileIoError(format!(
                    "Copy failed: {} -> {}: {}",
                    source.display(),
                    destination.display(),
                    e
                ))
            })?;
        }

        Self::file_size(destination).await.ok_or_else(|| {
            OfflineError::FileIoError(format!("Missing after copy: {}", destination.display()))
        })
    }

    /// Delete a single file; a missing file is not an error
    pub async fn remove_file(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OfflineError::FileIoError(format!(
                "Delete failed: {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Ensure directory exists, creating parent directories as needed
    pub async fn ensure_directory_exists(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await.map_err(|e| {
            OfflineError::FileIoError(format!(
                "Failed to create directory {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Check if file exists
    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Size of a file, `None` if it cannot be read
    pub async fn file_size(path: &Path) -> Option<u64> {
        fs::metadata(path).await.ok().map(|m| m.len())
    }

    /// Atomic write: write to temp file, sync, then rename
    pub async fn atomic_write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = crate::file::paths::part_path(path);

        fs::write(&temp_path, contents).await.map_err(|e| {
            OfflineError::FileIoError(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| {
                OfflineError::FileIoError(format!(
                    "Failed to open temp file for sync {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

        file.sync_all().await.map_err(|e| {
            OfflineError::FileIoError(format!(
                "Failed to sync temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        drop(file);

        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = Self::remove_file(&temp_path).await;
            return Err(OfflineError::FileIoError(format!(
                "Failed to rename temp file {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            )));
        }

        Ok(())
    }
}

fn log_scan(results: &ScanResults) {
    if results.manifests_skipped > 0 {
        debug!(
            directories = results.directories_found,
            loaded = results.manifests_loaded,
            skipped = results.manifests_skipped,
            "Skipped book directories without a readable manifest"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use crate::file::paths::MANIFEST_FILE_NAME;
    use tempfile::TempDir;

    fn storage(temp_dir: &TempDir) -> StorageService {
        StorageService::with_space_probe(
            temp_dir.path().join("downloads"),
            Arc::new(FixedSpaceProbe(600 * 1024 * 1024)),
        )
    }

    #[tokio::test]
    async fn test_book_directory_creates_root_only() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let dir = storage.book_directory("li_1").await.unwrap();
        assert!(storage.root().exists());
        assert!(!dir.exists());
        assert_eq!(dir, storage.book_directory("li_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let dir = storage.book_directory("li_1").await.unwrap();
        fs::create_dir_all(dir.join("nested")).await.unwrap();
        fs::write(dir.join("nested/file"), b"x").await.unwrap();

        storage.delete_book_directory(&dir).await.unwrap();
        assert!(!dir.exists());
        storage.delete_book_directory(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_paths_only_when_present() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);
        let dir = storage.book_directory("li_1").await.unwrap();

        assert!(storage.get_local_audio_path("li_1", 0).await.is_none());
        assert!(storage.get_local_cover_path("li_1").await.is_none());

        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("chapter_000.audio"), b"abc").await.unwrap();
        fs::write(dir.join("cover.jpg"), b"img").await.unwrap();

        assert_eq!(
            storage.get_local_audio_path("li_1", 0).await,
            Some(dir.join("chapter_000.audio"))
        );
        assert!(storage.get_local_audio_path("li_1", 1).await.is_none());
        assert!(storage.get_local_cover_path("li_1").await.is_some());
        assert!(storage.get_local_audio_path("", 0).await.is_none());
    }

    #[tokio::test]
    async fn test_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        for (id, len) in [("a", 10usize), ("b", 32)] {
            let dir = storage.book_directory(id).await.unwrap();
            fs::create_dir_all(&dir).await.unwrap();
            fs::write(dir.join("chapter_000.audio"), vec![0u8; len]).await.unwrap();
        }

        assert_eq!(storage.get_book_storage_size("a").await, 10);
        assert_eq!(storage.get_book_storage_size("missing").await, 0);
        assert_eq!(storage.get_total_download_size().await, 42);
    }

    #[tokio::test]
    async fn test_load_skips_corrupt_manifests() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let good = fixtures::book("good", 2);
        let dir = storage.book_directory(&good.id).await.unwrap();
        storage.ensure_directory_exists(&dir).await.unwrap();
        storage.write_manifest(&good).await.unwrap();

        let bad_dir = storage.book_directory("bad").await.unwrap();
        fs::create_dir_all(&bad_dir).await.unwrap();
        fs::write(bad_dir.join(MANIFEST_FILE_NAME), b"{ not json").await.unwrap();

        let empty_dir = storage.book_directory("empty").await.unwrap();
        fs::create_dir_all(&empty_dir).await.unwrap();

        let books = storage.load_downloaded_books().await;
        assert_eq!(books, vec![good]);
    }

    #[tokio::test]
    async fn test_check_available_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);
        assert!(storage.check_available_storage(500 * 1024 * 1024).await);

        let tight = StorageService::with_space_probe(
            temp_dir.path().join("downloads"),
            Arc::new(FixedSpaceProbe(100 * 1024 * 1024)),
        );
        assert!(!tight.check_available_storage(500 * 1024 * 1024).await);
    }

    #[tokio::test]
    async fn test_system_probe_handles_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageService::new(temp_dir.path().join("not/yet/created"));
        assert!(storage.available_space().await.is_ok());
    }

    #[tokio::test]
    async fn test_safe_move_replaces_destination() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let source = temp_dir.path().join("source.part");
        let dest = temp_dir.path().join("dest.audio");
        fs::write(&source, b"new").await.unwrap();
        fs::write(&dest, b"old").await.unwrap();

        storage.safe_move(&source, &dest).await.unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_link_or_copy_shares_contents() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let source = temp_dir.path().join("0.audio");
        let dest = temp_dir.path().join("1.audio");
        fs::write(&source, b"track").await.unwrap();
        fs::write(&dest, b"stale").await.unwrap();

        let size = storage.link_or_copy(&source, &dest).await.unwrap();
        assert_eq!(size, 5);
        assert!(source.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"track");
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let file = temp_dir.path().join("metadata.json");
        storage.atomic_write(&file, b"{}").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("metadata.json")]);
    }
}
