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


//! Audiobook server API
//!
//! The slice of the server's REST API the download core consumes: book
//! details, playback sessions for track URLs, and authenticated requests.

pub mod client;
pub mod models;

// Re-export commonly used types
pub use client::{ClientConfig, ServerClient, ServerCredentials};
pub use models::{AudioTrack, LibraryItem, PlaybackSession};
