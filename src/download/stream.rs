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


//! HTTP streaming to a local file
//!
//! # Transfer Loop
//! 1. Send the request; headers must arrive within the read timeout
//! 2. Reject non-2xx statuses (not retryable)
//! 3. Copy body chunks into a buffered writer, checking the cancellation
//!    token between chunks and bounding every read by the timeout
//! 4. Flush and fsync, then compare the byte count with Content-Length
//!
//! The destination is always a temporary file; callers move it into place.
//! On any failure the temporary file is removed before returning.

use crate::api::client::check_status;
use crate::error::{OfflineError, Result};
use futures_util::StreamExt;
use reqwest::RequestBuilder;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Write buffer size
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Result of one completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_written: u64,
    /// Content-Length announced by the server, if any
    pub expected_bytes: Option<u64>,
}

/// Stream a response body into `destination`
///
/// `on_progress` is called after every chunk with the bytes received so far
/// and the announced length.
pub async fn fetch_to_file<F>(
    request: RequestBuilder,
    destination: &Path,
    read_timeout: Duration,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<TransferStats>
where
    F: FnMut(u64, Option<u64>),
{
    let result = transfer(request, destination, read_timeout, cancel, on_progress).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(destination).await;
    }
    result
}

async fn transfer<F>(
    request: RequestBuilder,
    destination: &Path,
    read_timeout: Duration,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<TransferStats>
where
    F: FnMut(u64, Option<u64>),
{
    if cancel.is_cancelled() {
        return Err(OfflineError::Cancelled);
    }

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(OfflineError::Cancelled),
        sent = timeout(read_timeout, request.send()) => match sent {
            Ok(response) => response?,
            Err(_) => return Err(timed_out("waiting for response headers", read_timeout)),
        },
    };
    let response = check_status(response).await?;
    let expected_bytes = response.content_length();

    let file = create_file(destination).await?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    let mut stream = response.bytes_stream();
    let mut bytes_written = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OfflineError::Cancelled),
            next = timeout(read_timeout, stream.next()) => match next {
                Ok(next) => next,
                Err(_) => return Err(timed_out("reading response body", read_timeout)),
            },
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;

        writer.write_all(&chunk).await.map_err(|e| write_error(destination, e))?;
        bytes_written += chunk.len() as u64;
        on_progress(bytes_written, expected_bytes);
    }

    writer.flush().await.map_err(|e| write_error(destination, e))?;
    let file = writer.into_inner();
    file.sync_all().await.map_err(|e| write_error(destination, e))?;

    trace!(path = %destination.display(), bytes = bytes_written, "Transfer finished");

    if bytes_written == 0 {
        return Err(OfflineError::invalid_response("empty response body", None));
    }

    if let Some(expected) = expected_bytes {
        if bytes_written != expected {
            // Connection dropped mid-body
            return Err(OfflineError::network_error(
                format!("incomplete transfer: {} of {} bytes", bytes_written, expected),
                true,
            ));
        }
    }

    Ok(TransferStats {
        bytes_written,
        expected_bytes,
    })
}

async fn create_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| {
            OfflineError::FileIoError(format!("Failed to create {}: {}", path.display(), e))
        })
}

fn write_error(path: &Path, e: std::io::Error) -> OfflineError {
    OfflineError::FileIoError(format!("Failed to write {}: {}", path.display(), e))
}

fn timed_out(what: &str, after: Duration) -> OfflineError {
    OfflineError::network_error(format!("timed out after {:?} {}", after, what), true)
}
