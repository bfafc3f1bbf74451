//! Durable queue backend on the native filesystem.
//!
//! Layout under the backend root:
//! - `entries/<hex(id)>.op` - one bincode-encoded `StoredEntry` per file
//! - `journal.bin` - pending multi-entry transaction, if any
//!
//! Single-entry writes go through a temp file and a rename. Multi-entry
//! mutations are first written to the journal, then applied, then the
//! journal is removed; a journal found on open is replayed. Applying a
//! journal is idempotent, so an interruption at any point leaves either the
//! old entries or the new ones, never neither.

use super::{EntryStream, Listing, QueueBackend, Result, StorageError, StoredEntry};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const ENTRY_EXT: &str = "op";
const JOURNAL_FILE: &str = "journal.bin";

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    DeleteMany { ids: Vec<String> },
    Replace { remove: Vec<String>, insert: Vec<StoredEntry> },
    Clear,
}

/// Index fields kept in memory so lookups do not touch payloads.
#[derive(Debug, Clone)]
struct IndexEntry {
    doc_id: String,
    timestamp: u64,
}

#[derive(Default)]
struct Index {
    entries: BTreeMap<String, IndexEntry>,
    /// Files that failed to decode, by id, until someone deletes them.
    corrupt: BTreeSet<String>,
}

impl Index {
    fn ordered_ids(&self, doc_id: Option<&str>) -> Vec<String> {
        let mut ids: Vec<(u64, &String)> = self
            .entries
            .iter()
            .filter(|(_, e)| doc_id.is_none_or(|d| e.doc_id == d))
            .map(|(id, e)| (e.timestamp, id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

/// Queue backend storing one file per entry.
pub struct FileBackend {
    name: String,
    root: PathBuf,
    entries_dir: PathBuf,
    index: RwLock<Index>,
    /// Serializes mutations so journal transactions never interleave.
    txn: Mutex<()>,
}

impl FileBackend {
    /// Open (or create) a backend rooted at `root`, replaying any leftover journal.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let entries_dir = root.join("entries");
        fs::create_dir_all(&entries_dir).await?;

        let backend = Self {
            name: "file".to_string(),
            root,
            entries_dir,
            index: RwLock::new(Index::default()),
            txn: Mutex::new(()),
        };

        backend.recover().await?;
        backend.rebuild_index().await?;
        Ok(backend)
    }

    /// Name used in logs and status reports.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.entries_dir.join(format!("{}.{ENTRY_EXT}", encode_id(id)))
    }

    fn index_read(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn index_write(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn recover(&self) -> Result<()> {
        let path = self.journal_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match bincode::deserialize::<JournalRecord>(&bytes) {
            Ok(record) => {
                info!("Replaying interrupted queue transaction");
                self.apply_files(&record).await?;
            }
            Err(e) => warn!("Discarding unreadable queue journal: {}", e),
        }
        remove_if_exists(&path).await
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut index = Index::default();
        let mut dir = fs::read_dir(&self.entries_dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                // Leftover temp files from an interrupted put.
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    remove_if_exists(&path).await?;
                }
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_id) else {
                warn!("Ignoring queue file with unexpected name: {}", path.display());
                continue;
            };
            match read_entry_file(&path, &id).await {
                Ok(entry) => {
                    index.entries.insert(
                        entry.id,
                        IndexEntry {
                            doc_id: entry.doc_id,
                            timestamp: entry.timestamp,
                        },
                    );
                }
                Err(e) => {
                    warn!("Queue entry {} is unreadable: {}", id, e);
                    index.corrupt.insert(id);
                }
            }
        }

        debug!(
            "Indexed {} queue entries ({} corrupt)",
            index.entries.len(),
            index.corrupt.len()
        );
        *self.index_write() = index;
        Ok(())
    }

    async fn write_entry_file(&self, entry: &StoredEntry) -> Result<()> {
        let bytes = bincode::serialize(entry).map_err(|e| StorageError::Codec(e.to_string()))?;
        write_atomic(&self.entry_path(&entry.id), &bytes).await
    }

    /// Apply a journal record to the files. Safe to run more than once.
    async fn apply_files(&self, record: &JournalRecord) -> Result<()> {
        match record {
            JournalRecord::DeleteMany { ids } => {
                for id in ids {
                    remove_if_exists(&self.entry_path(id)).await?;
                }
            }
            JournalRecord::Replace { remove, insert } => {
                for entry in insert {
                    self.write_entry_file(entry).await?;
                }
                for id in remove {
                    if !insert.iter().any(|e| &e.id == id) {
                        remove_if_exists(&self.entry_path(id)).await?;
                    }
                }
            }
            JournalRecord::Clear => {
                fs::remove_dir_all(&self.entries_dir).await?;
                fs::create_dir_all(&self.entries_dir).await?;
            }
        }
        Ok(())
    }

    fn apply_index(&self, record: &JournalRecord) {
        let mut index = self.index_write();
        match record {
            JournalRecord::DeleteMany { ids } => {
                for id in ids {
                    index.entries.remove(id);
                    index.corrupt.remove(id);
                }
            }
            JournalRecord::Replace { remove, insert } => {
                for id in remove {
                    index.entries.remove(id);
                    index.corrupt.remove(id);
                }
                for entry in insert {
                    index.entries.insert(
                        entry.id.clone(),
                        IndexEntry {
                            doc_id: entry.doc_id.clone(),
                            timestamp: entry.timestamp,
                        },
                    );
                }
            }
            JournalRecord::Clear => *index = Index::default(),
        }
    }

    /// Run a multi-entry transaction through the journal.
    async fn transact(&self, record: JournalRecord) -> Result<()> {
        let bytes = bincode::serialize(&record).map_err(|e| StorageError::Codec(e.to_string()))?;
        let journal = self.journal_path();
        write_atomic(&journal, &bytes).await?;
        self.apply_files(&record).await?;
        self.apply_index(&record);
        remove_if_exists(&journal).await
    }

    /// Read the listed ids, collecting unreadable files as corrupt.
    async fn read_listing(&self, ids: Vec<String>) -> Listing {
        let mut listing = Listing::default();
        listing
            .corrupt
            .extend(self.index_read().corrupt.iter().cloned());

        for id in ids {
            match read_entry_file(&self.entry_path(&id), &id).await {
                Ok(entry) => listing.entries.push(entry),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    warn!("Queue entry {} became unreadable: {}", id, e);
                    self.index_write().corrupt.insert(id.clone());
                    listing.corrupt.push(id);
                }
            }
        }
        listing
    }
}

#[async_trait]
impl QueueBackend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        fs::metadata(&self.entries_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn put(&self, entry: StoredEntry) -> Result<()> {
        let _txn = self.txn.lock().await;
        self.write_entry_file(&entry).await?;
        let mut index = self.index_write();
        index.corrupt.remove(&entry.id);
        index.entries.insert(
            entry.id,
            IndexEntry {
                doc_id: entry.doc_id,
                timestamp: entry.timestamp,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredEntry>> {
        if !self.index_read().entries.contains_key(id) {
            return Ok(None);
        }
        match read_entry_file(&self.entry_path(id), id).await {
            Ok(entry) => Ok(Some(entry)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_all(&self) -> Result<Listing> {
        let ids = self.index_read().ordered_ids(None);
        Ok(self.read_listing(ids).await)
    }

    async fn get_by_doc(&self, doc_id: &str) -> Result<Listing> {
        let ids = self.index_read().ordered_ids(Some(doc_id));
        let mut listing = self.read_listing(ids).await;
        // Corrupt files of other documents are reported by get_all.
        listing.corrupt.clear();
        Ok(listing)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _txn = self.txn.lock().await;
        remove_if_exists(&self.entry_path(id)).await?;
        let mut index = self.index_write();
        let existed = index.entries.remove(id).is_some();
        Ok(index.corrupt.remove(id) || existed)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize> {
        let _txn = self.txn.lock().await;
        let present = {
            let index = self.index_read();
            ids.iter()
                .filter(|id| index.entries.contains_key(*id) || index.corrupt.contains(*id))
                .count()
        };
        self.transact(JournalRecord::DeleteMany { ids: ids.to_vec() })
            .await?;
        Ok(present)
    }

    async fn replace(&self, remove: &[String], insert: Vec<StoredEntry>) -> Result<()> {
        let _txn = self.txn.lock().await;
        self.transact(JournalRecord::Replace {
            remove: remove.to_vec(),
            insert,
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        let _txn = self.txn.lock().await;
        self.transact(JournalRecord::Clear).await
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.index_read().entries.len())
    }

    async fn scan(&self) -> Result<EntryStream<'_>> {
        let ids = self.index_read().ordered_ids(None);
        let stream = futures::stream::iter(ids).filter_map(move |id| async move {
            match read_entry_file(&self.entry_path(&id), &id).await {
                Ok(entry) => Some(Ok(entry)),
                // Deleted since the scan started.
                Err(StorageError::NotFound(_)) => None,
                Err(e) => Some(Err(e)),
            }
        });
        Ok(stream.boxed())
    }
}

async fn read_entry_file(path: &Path, id: &str) -> Result<StoredEntry> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let entry: StoredEntry = bincode::deserialize(&bytes).map_err(|e| StorageError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    if entry.id != id {
        return Err(StorageError::Corrupt {
            id: id.to_string(),
            reason: format!("file holds entry {}", entry.id),
        });
    }
    Ok(entry)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Ids are arbitrary strings; file names use their hex encoding.
fn encode_id(id: &str) -> String {
    hex::encode(id)
}

fn decode_id(stem: &str) -> Option<String> {
    String::from_utf8(hex::decode(stem).ok()?).ok()
}
