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


//! Server response payloads
//!
//! Only the fields the offline subsystem reads are modelled; everything
//! else in the server's JSON is ignored. Library items convert into the
//! same [`Book`] the manifest stores.

use crate::models::{Book, Chapter, CollapsedSeries};
use serde::{Deserialize, Serialize};

/// `GET /api/items/{id}?expanded=1`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: String,
    #[serde(default)]
    pub media: ItemMedia,
    #[serde(default)]
    pub collapsed_series: Option<ApiCollapsedSeries>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMedia {
    #[serde(default)]
    pub metadata: ItemMetadata,
    /// Server-side filesystem path; only its presence matters here
    #[serde(default)]
    pub cover_path: Option<String>,
    #[serde(default)]
    pub chapters: Vec<ApiChapter>,
    #[serde(default)]
    pub tracks: Vec<AudioTrack>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiChapter {
    pub id: u32,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCollapsedSeries {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub num_books: u32,
}

/// One audio file of an item, as listed by the server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrack {
    pub index: u32,
    /// Offset of this track within the whole item, in seconds
    pub start_offset: f64,
    pub duration: f64,
    pub content_url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl AudioTrack {
    /// Whether `offset` falls inside `[start_offset, start_offset + duration)`
    pub fn contains(&self, offset: f64) -> bool {
        offset >= self.start_offset && offset < self.start_offset + self.duration
    }
}

/// `POST /api/items/{item}/play[/{episode}]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSession {
    pub id: String,
    #[serde(default)]
    pub audio_tracks: Vec<AudioTrack>,
}

/// Request body for opening a playback session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackRequest {
    pub device_info: DeviceInfo,
    pub force_direct_play: bool,
    pub force_transcode: bool,
    pub media_player: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub client_name: String,
    pub client_version: String,
}

impl PlaybackRequest {
    /// Direct-play request identifying this crate as the client
    pub fn direct_play() -> Self {
        Self {
            device_info: DeviceInfo {
                client_name: env!("CARGO_PKG_NAME").to_string(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            force_direct_play: true,
            force_transcode: false,
            media_player: "offline-download".to_string(),
        }
    }
}

impl LibraryItem {
    /// Convert into a downloadable book
    ///
    /// Items without chapter markers get one chapter per audio track. When
    /// chapters and tracks line up one to one, each chapter carries its
    /// track's content URL; otherwise URLs are left for session resolution.
    pub fn into_book(self) -> Book {
        let LibraryItem {
            id,
            media,
            collapsed_series,
        } = self;

        let chapters: Vec<Chapter> = if media.chapters.is_empty() {
            media
                .tracks
                .iter()
                .enumerate()
                .map(|(i, track)| Chapter {
                    id: i as u32,
                    title: format!("Track {}", track.index),
                    start: track.start_offset,
                    end: track.start_offset + track.duration,
                    library_item_id: id.clone(),
                    episode_id: None,
                    content_url: Some(track.content_url.clone()),
                })
                .collect()
        } else {
            let direct = media.tracks.len() == media.chapters.len();
            media
                .chapters
                .iter()
                .enumerate()
                .map(|(i, chapter)| Chapter {
                    id: chapter.id,
                    title: chapter.title.clone(),
                    start: chapter.start,
                    end: chapter.end,
                    library_item_id: id.clone(),
                    episode_id: None,
                    content_url: direct.then(|| media.tracks[i].content_url.clone()),
                })
                .collect()
        };

        let cover_path = media
            .cover_path
            .as_ref()
            .map(|_| format!("/api/items/{}/cover", urlencoding::encode(&id)));

        Book {
            title: media.metadata.title.unwrap_or_else(|| id.clone()),
            author: media.metadata.author_name,
            chapters,
            cover_path,
            collapsed_series: collapsed_series.map(|s| CollapsedSeries {
                id: s.id,
                name: s.name,
                num_books: s.num_books,
            }),
            id,
        }
    }
}
