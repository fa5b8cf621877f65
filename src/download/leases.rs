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


//! Exclusive ownership of book directories
//!
//! At most one party mutates a book directory at a time: the active
//! download, the healing sweep, or a deletion. A lease is released when its
//! guard drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

/// Who holds a book directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseHolder {
    Download,
    Healing,
    Deletion,
}

#[derive(Debug, Default)]
struct LeaseTable {
    held: Mutex<HashMap<String, LeaseHolder>>,
    released: Notify,
}

impl LeaseTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, LeaseHolder>> {
        // Critical sections never panic; a poisoned map is still consistent
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared lease table keyed by book id
#[derive(Debug, Clone, Default)]
pub struct BookLeases {
    inner: Arc<LeaseTable>,
}

impl BookLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `book_id` if nobody holds it
    pub fn try_acquire(&self, book_id: &str, holder: LeaseHolder) -> Option<BookLease> {
        let mut held = self.inner.lock();
        if held.contains_key(book_id) {
            return None;
        }
        held.insert(book_id.to_string(), holder);
        trace!(book_id = %book_id, ?holder, "Lease acquired");

        Some(BookLease {
            table: Arc::clone(&self.inner),
            book_id: book_id.to_string(),
            holder,
        })
    }

    /// Wait until the lease for `book_id` is free, then take it
    pub async fn acquire(&self, book_id: &str, holder: LeaseHolder) -> BookLease {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(book_id, holder) {
                return lease;
            }
            notified.await;
        }
    }

    /// Current holder of a book's lease
    pub fn holder(&self, book_id: &str) -> Option<LeaseHolder> {
        self.inner.lock().get(book_id).copied()
    }

    pub fn is_leased(&self, book_id: &str) -> bool {
        self.holder(book_id).is_some()
    }
}

/// Guard for an acquired lease
#[derive(Debug)]
pub struct BookLease {
    table: Arc<LeaseTable>,
    book_id: String,
    holder: LeaseHolder,
}

impl BookLease {
    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn holder(&self) -> LeaseHolder {
        self.holder
    }
}

impl Drop for BookLease {
    fn drop(&mut self) {
        self.table.lock().remove(&self.book_id);
        trace!(book_id = %self.book_id, holder = ?self.holder, "Lease released");
        self.table.released.notify_waiters();
    }
}
