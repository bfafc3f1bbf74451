//! QueueBackend trait abstraction for the operation queue's durable store.
//!
//! Implementations:
//! - `MemoryBackend` - Lower-capacity fallback and tests
//! - `FileBackend` - One file per entry plus a transaction journal (tokio::fs)
//!
//! Backends never look inside `StoredEntry::payload`; the index fields on the
//! entry are what they use for lookups by document and timestamp order.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Entry {0} not found")]
    NotFound(String),

    #[error("Corrupt entry {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Encoding error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A record as the backend stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: String,
    pub doc_id: String,
    pub space_id: String,
    /// Creation timestamp, the primary ordering key.
    pub timestamp: u64,
    /// Estimated size of the update this entry carries.
    pub size: u64,
    /// Encoded operation, opaque to the backend.
    pub payload: Vec<u8>,
}

impl StoredEntry {
    /// Ordering key: timestamp first, id as tiebreaker.
    pub fn order_key(&self) -> (u64, &str) {
        (self.timestamp, self.id.as_str())
    }
}

/// Result of a listing: readable entries in timestamp order plus the ids of
/// records that could not be decoded.
#[derive(Debug, Default)]
pub struct Listing {
    pub entries: Vec<StoredEntry>,
    pub corrupt: Vec<String>,
}

/// Cursor-style stream over every stored entry, one record at a time.
pub type EntryStream<'a> = BoxStream<'a, Result<StoredEntry>>;

/// Keyed durable store behind the operation queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short name for logs and status reports.
    fn name(&self) -> &str;

    /// Whether the backend can currently serve requests.
    async fn is_available(&self) -> bool;

    /// Insert or overwrite one entry atomically.
    async fn put(&self, entry: StoredEntry) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<StoredEntry>>;

    /// All entries ordered by timestamp ascending.
    async fn get_all(&self) -> Result<Listing>;

    /// Entries of one document ordered by timestamp ascending.
    async fn get_by_doc(&self, doc_id: &str) -> Result<Listing>;

    /// Delete one entry. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Delete several entries in a single transaction.
    async fn delete_many(&self, ids: &[String]) -> Result<usize>;

    /// Delete `remove` and insert `insert` in a single transaction.
    async fn replace(&self, remove: &[String], insert: Vec<StoredEntry>) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Stream every entry without materializing them all at once.
    async fn scan(&self) -> Result<EntryStream<'_>>;
}
