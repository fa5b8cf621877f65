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


//! HTTP client for the audiobook server
//!
//! Thin wrapper over `reqwest::Client` covering what the download core
//! needs from the server:
//! - Authenticated request construction (`Authorization: Bearer`)
//! - Book details (`GET /api/items/{id}?expanded=1`)
//! - Playback sessions for items without direct file URLs
//!
//! # URL Handling
//! Servers are often hosted under a path prefix (`https://host/audiobooks`).
//! Server-relative paths are appended to that prefix rather than resolved
//! against the host root. Absolute URLs pass through unchanged, and only
//! receive the bearer token when they point at the configured server.

use crate::api::models::{LibraryItem, PlaybackRequest, PlaybackSession};
use crate::error::{OfflineError, Result};
use crate::models::Book;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default timeout for API requests
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Server location plus bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    server_url: Url,
    token: String,
}

impl ServerCredentials {
    pub fn new(server_url: &str, token: impl Into<String>) -> Result<Self> {
        let server_url = Url::parse(server_url)?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(OfflineError::NotConfigured(format!(
                "unsupported server URL scheme: {}",
                server_url.scheme()
            )));
        }

        let token = token.into();
        if token.trim().is_empty() {
            return Err(OfflineError::NoCredentials);
        }

        Ok(Self { server_url, token })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("server_url", &self.server_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Configuration for ServerClient
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for API calls and for connecting
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Authenticated client for one server
#[derive(Debug, Clone)]
pub struct ServerClient {
    client: Client,
    credentials: ServerCredentials,
    config: ClientConfig,
}

impl ServerClient {
    pub fn new(credentials: ServerCredentials) -> Result<Self> {
        Self::with_config(credentials, ClientConfig::default())
    }

    /// Create a client with custom configuration
    ///
    /// The underlying client only bounds connecting; API calls add the
    /// configured timeout per request, while streamed transfers bound each
    /// read instead so long files are not cut off.
    pub fn with_config(credentials: ServerCredentials, config: ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).map_err(|e| {
                OfflineError::InvalidConfiguration(format!("Invalid user agent: {}", e))
            })?,
        );

        let client = Client::builder()
            .connect_timeout(config.timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| OfflineError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            credentials,
            config,
        })
    }

    pub fn credentials(&self) -> &ServerCredentials {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve a server-relative path or absolute URL
    pub fn endpoint_url(&self, path_or_url: &str) -> Result<Url> {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            return Ok(Url::parse(path_or_url)?);
        }

        let (path, query) = match path_or_url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_or_url, None),
        };

        let mut url = self.credentials.server_url.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", prefix, path.trim_start_matches('/')));
        url.set_query(query);
        url.set_fragment(None);
        Ok(url)
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        let server = &self.credentials.server_url;
        url.scheme() == server.scheme()
            && url.host_str() == server.host_str()
            && url.port_or_known_default() == server.port_or_known_default()
    }

    /// Request with the bearer token attached when `url` is on this server
    pub fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        let same_origin = self.is_same_origin(&url);
        let request = self.client.request(method, url);
        if same_origin {
            request.bearer_auth(&self.credentials.token)
        } else {
            request
        }
    }

    /// Authorized JSON API request, bounded by the configured timeout
    fn api_request(&self, method: Method, url: Url) -> RequestBuilder {
        self.authorized(method, url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .timeout(self.config.timeout)
    }

    /// Authorized GET for a file transfer, without a total timeout
    pub fn download_request(&self, url: Url) -> RequestBuilder {
        self.authorized(Method::GET, url)
    }

    /// Fetch the authoritative chapter list for a book
    pub async fn fetch_book_details(&self, book_id: &str) -> Result<Book> {
        let mut url = self.endpoint_url(&format!("/api/items/{}", urlencoding::encode(book_id)))?;
        url.query_pairs_mut().append_pair("expanded", "1");

        debug!(book_id = %book_id, "Fetching book details");
        let item: LibraryItem = self.send_json(self.api_request(Method::GET, url)).await?;

        if item.id != book_id {
            return Err(OfflineError::invalid_response(
                format!("requested item {} but server returned {}", book_id, item.id),
                None,
            ));
        }
        Ok(item.into_book())
    }

    /// Open a playback session for an item (or one podcast episode)
    pub async fn start_playback_session(
        &self,
        library_item_id: &str,
        episode_id: Option<&str>,
    ) -> Result<PlaybackSession> {
        let path = match episode_id {
            Some(episode) => format!(
                "/api/items/{}/play/{}",
                urlencoding::encode(library_item_id),
                urlencoding::encode(episode)
            ),
            None => format!("/api/items/{}/play", urlencoding::encode(library_item_id)),
        };
        let url = self.endpoint_url(&path)?;

        debug!(library_item_id = %library_item_id, ?episode_id, "Opening playback session");
        let request = self
            .api_request(Method::POST, url)
            .json(&PlaybackRequest::direct_play());
        let session: PlaybackSession = self.send_json(request).await?;

        if session.audio_tracks.is_empty() {
            return Err(OfflineError::invalid_response(
                format!("session {} has no audio tracks", session.id),
                None,
            ));
        }
        Ok(session)
    }

    /// Close a playback session
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let url = self.endpoint_url(&format!(
            "/api/session/{}/close",
            urlencoding::encode(session_id)
        ))?;
        let response = self.api_request(Method::POST, url).send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check_status(request.send().await?).await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            OfflineError::invalid_response(
                format!("Failed to parse response: {}", e),
                Some(status.as_u16()),
            )
        })
    }
}

/// Turn a non-2xx response into `InvalidServerResponse`
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(OfflineError::invalid_response(
        format!("HTTP {} for {}: {}", status.as_u16(), url, snippet.trim()),
        Some(status.as_u16()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ServerClient {
        ServerClient::new(ServerCredentials::new(base, "secret").unwrap()).unwrap()
    }

    #[test]
    fn test_endpoint_url_keeps_path_prefix() {
        let client = client("https://example.org/abs/");
        assert_eq!(
            client.endpoint_url("/api/items/li_1").unwrap().as_str(),
            "https://example.org/abs/api/items/li_1"
        );
        assert_eq!(
            client.endpoint_url("s/item/x.mp3?token=t").unwrap().as_str(),
            "https://example.org/abs/s/item/x.mp3?token=t"
        );
        assert_eq!(
            client.endpoint_url("https://cdn.example.net/a.mp3").unwrap().as_str(),
            "https://cdn.example.net/a.mp3"
        );
    }

    #[test]
    fn test_bearer_only_for_same_origin() {
        let client = client("https://example.org");

        let own = client
            .authorized(Method::GET, client.endpoint_url("/api/me").unwrap())
            .build()
            .unwrap();
        assert_eq!(
            own.headers().get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer secret"
        );

        let foreign = client
            .authorized(Method::GET, Url::parse("https://cdn.example.net/a").unwrap())
            .build()
            .unwrap();
        assert!(foreign.headers().get(reqwest::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_credentials_validation_and_redaction() {
        assert!(matches!(
            ServerCredentials::new("https://example.org", " "),
            Err(OfflineError::NoCredentials)
        ));
        assert!(ServerCredentials::new("ftp://example.org", "t").is_err());
        assert!(ServerCredentials::new("not a url", "t").is_err());

        let creds = ServerCredentials::new("https://example.org", "secret").unwrap();
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
