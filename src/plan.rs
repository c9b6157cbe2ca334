//! ETag diff between the remote listing and the local mirror.

use std::collections::{HashMap, HashSet};
use std::slice::Chunks;

/// Maximum number of hrefs named in one addressbook-multiget.
pub const MULTIGET_BATCH_SIZE: usize = 90;

/// Work needed to bring the local mirror in line with the remote listing.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Locations whose ETag is not stored locally.
    pub to_fetch: Vec<String>,
    /// Local ETags the server no longer lists.
    pub to_delete: Vec<String>,
}

impl SyncPlan {
    /// Diff `remote` (ETag -> href) against the local ETag set.
    ///
    /// ETags present on both sides produce no work. Ordering follows map
    /// iteration and carries no meaning.
    pub fn new(remote: &HashMap<String, String>, local: &HashSet<String>) -> Self {
        let to_fetch = remote
            .iter()
            .filter(|(etag, _)| !local.contains(*etag))
            .map(|(_, href)| href.clone())
            .collect();

        let to_delete = local
            .iter()
            .filter(|etag| !remote.contains_key(*etag))
            .cloned()
            .collect();

        Self {
            to_fetch,
            to_delete,
        }
    }

    /// `to_fetch` in chunks of at most [`MULTIGET_BATCH_SIZE`].
    pub fn batches(&self) -> Chunks<'_, String> {
        self.to_fetch.chunks(MULTIGET_BATCH_SIZE)
    }

    pub fn batch_count(&self) -> usize {
        self.to_fetch.len().div_ceil(MULTIGET_BATCH_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.to_fetch.is_empty() && self.to_delete.is_empty()
    }
}
