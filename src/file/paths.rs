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


//! On-disk layout of downloaded books
//!
//! # Layout
//! ```text
//! <root>/
//!   <percent-encoded book id>/
//!     metadata.json          manifest (serialized Book)
//!     chapter_000.audio      one file per chapter, 0-based, playback order
//!     chapter_001.audio
//!     cover.jpg              optional
//!     .chapter_001.audio.<uuid>.part   in-flight transfer
//! ```
//!
//! Book ids are server-assigned and may contain characters that are not
//! valid in a path component, so the directory name is the percent-encoded
//! id. Decoding the directory name gives the id back.

use crate::error::{OfflineError, Result};
use std::path::{Path, PathBuf};

/// Manifest file name inside a book directory
pub const MANIFEST_FILE_NAME: &str = "metadata.json";

/// Cover image file name inside a book directory
pub const COVER_FILE_NAME: &str = "cover.jpg";

const CHAPTER_PREFIX: &str = "chapter_";
const AUDIO_EXTENSION: &str = "audio";
const PART_SUFFIX: &str = ".part";

/// Deterministic mapping from book ids to paths under a downloads root
#[derive(Debug, Clone)]
pub struct BookPaths {
    root: PathBuf,
}

impl BookPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Downloads root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a book
    pub fn book_dir(&self, book_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(encode_book_id(book_id)?))
    }

    pub fn manifest_path(&self, book_id: &str) -> Result<PathBuf> {
        Ok(self.book_dir(book_id)?.join(MANIFEST_FILE_NAME))
    }

    pub fn audio_path(&self, book_id: &str, chapter_index: usize) -> Result<PathBuf> {
        Ok(self.book_dir(book_id)?.join(audio_file_name(chapter_index)))
    }

    pub fn cover_path(&self, book_id: &str) -> Result<PathBuf> {
        Ok(self.book_dir(book_id)?.join(COVER_FILE_NAME))
    }
}

/// Encode a book id as a single path component
pub fn encode_book_id(book_id: &str) -> Result<String> {
    if book_id.trim().is_empty() {
        return Err(OfflineError::InvalidBook("book id is empty".to_string()));
    }

    let encoded = urlencoding::encode(book_id).into_owned();

    // "." and ".." survive percent-encoding untouched
    if encoded == "." || encoded == ".." {
        return Err(OfflineError::InvalidBook(format!(
            "book id {:?} is not a valid directory name",
            book_id
        )));
    }

    Ok(encoded)
}

/// Recover a book id from a directory name
pub fn decode_book_id(dir_name: &str) -> Option<String> {
    if dir_name.starts_with('.') {
        return None;
    }
    let decoded = urlencoding::decode(dir_name).ok()?.into_owned();
    // Only names this module produced are book directories
    match encode_book_id(&decoded) {
        Ok(encoded) if encoded == dir_name => Some(decoded),
        _ => None,
    }
}

/// File name of the audio file for a chapter index
pub fn audio_file_name(chapter_index: usize) -> String {
    format!("{}{:03}.{}", CHAPTER_PREFIX, chapter_index, AUDIO_EXTENSION)
}

/// Chapter index of an audio file name, if it is one
pub fn parse_audio_file_name(file_name: &str) -> Option<usize> {
    let stem = file_name
        .strip_prefix(CHAPTER_PREFIX)?
        .strip_suffix(AUDIO_EXTENSION)?
        .strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Temporary path for an in-flight write of `final_path`
///
/// Lives next to the final file so the closing rename stays on one
/// filesystem.
pub fn part_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let temp_name = format!(".{}.{}{}", name, uuid::Uuid::new_v4().simple(), PART_SUFFIX);
    match final_path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Whether a file name is an in-flight or abandoned partial write
pub fn is_part_file(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(PART_SUFFIX)
}

/// Get default downloads path for the platform
pub fn default_downloads_path() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let mut path = PathBuf::from(home);
            path.push("Library");
            path.push("Application Support");
            path.push("AudiobookOffline");
            path.push("Downloads");
            return path;
        }
        return PathBuf::from("./downloads");
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let mut path = PathBuf::from(home);
            path.push(".local");
            path.push("share");
            path.push("audiobook-offline");
            path.push("downloads");
            return path;
        }
        return PathBuf::from("./downloads");
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            let mut path = PathBuf::from(appdata);
            path.push("AudiobookOffline");
            path.push("Downloads");
            return path;
        }
        return PathBuf::from("./downloads");
    }

    #[cfg(target_os = "ios")]
    {
        // The host app normally overrides this with its sandbox directory
        if let Some(home) = std::env::var_os("HOME") {
            let mut path = PathBuf::from(home);
            path.push("Documents");
            path.push("Downloads");
            return path;
        }
        PathBuf::from("./downloads")
    }

    #[cfg(not(any(
        target_os = "macos",
        target_os = "linux",
        target_os = "windows",
        target_os = "ios"
    )))]
    {
        // Android passes the app files directory in through the config
        PathBuf::from("./downloads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_dir_is_single_component() {
        let paths = BookPaths::new(PathBuf::from("/data"));
        let dir = paths.book_dir("series/42 ?").unwrap();
        assert_eq!(dir.parent(), Some(Path::new("/data")));
        assert_eq!(
            decode_book_id(dir.file_name().unwrap().to_str().unwrap()).as_deref(),
            Some("series/42 ?")
        );
    }

    #[test]
    fn test_rejects_dot_ids() {
        assert!(encode_book_id("..").is_err());
        assert!(encode_book_id("").is_err());
        assert_eq!(decode_book_id(".hidden"), None);
    }

    #[test]
    fn test_audio_file_names() {
        assert_eq!(audio_file_name(2), "chapter_002.audio");
        assert_eq!(audio_file_name(1234), "chapter_1234.audio");
        assert_eq!(parse_audio_file_name("chapter_017.audio"), Some(17));
        assert_eq!(parse_audio_file_name("chapter_.audio"), None);
        assert_eq!(parse_audio_file_name("chapter_01x.audio"), None);
        assert_eq!(parse_audio_file_name("cover.jpg"), None);
    }

    #[test]
    fn test_part_path_is_hidden_sibling() {
        let final_path = PathBuf::from("/data/b/chapter_000.audio");
        let part = part_path(&final_path);
        assert_eq!(part.parent(), final_path.parent());
        let name = part.file_name().unwrap().to_str().unwrap();
        assert!(is_part_file(name));
        assert!(name.starts_with(".chapter_000.audio."));
        assert!(!is_part_file("chapter_000.audio"));
    }
}
