//! In-memory queue backend.

use super::{EntryStream, Listing, QueueBackend, Result, StorageError, StoredEntry};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct State {
    entries: HashMap<String, StoredEntry>,
    /// Secondary index: (timestamp, id) in ascending order.
    by_time: BTreeSet<(u64, String)>,
}

impl State {
    fn insert(&mut self, entry: StoredEntry) {
        if let Some(old) = self.entries.remove(&entry.id) {
            self.by_time.remove(&(old.timestamp, old.id));
        }
        self.by_time.insert((entry.timestamp, entry.id.clone()));
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(old) => {
                self.by_time.remove(&(old.timestamp, old.id));
                true
            }
            None => false,
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &StoredEntry> {
        self.by_time.iter().filter_map(|(_, id)| self.entries.get(id))
    }
}

/// Volatile backend kept entirely in memory.
///
/// Used as the lower-capacity fallback when the durable backend is
/// unavailable, and as the store in tests. Availability can be toggled to
/// simulate an outage.
pub struct MemoryBackend {
    name: String,
    state: RwLock<State>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(self.name.clone()))
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn put(&self, entry: StoredEntry) -> Result<()> {
        self.check()?;
        self.write().insert(entry);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredEntry>> {
        self.check()?;
        Ok(self.read().entries.get(id).cloned())
    }

    async fn get_all(&self) -> Result<Listing> {
        self.check()?;
        Ok(Listing {
            entries: self.read().ordered().cloned().collect(),
            corrupt: Vec::new(),
        })
    }

    async fn get_by_doc(&self, doc_id: &str) -> Result<Listing> {
        self.check()?;
        Ok(Listing {
            entries: self
                .read()
                .ordered()
                .filter(|e| e.doc_id == doc_id)
                .cloned()
                .collect(),
            corrupt: Vec::new(),
        })
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.write().remove(id))
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize> {
        self.check()?;
        let mut state = self.write();
        Ok(ids.iter().filter(|id| state.remove(id)).count())
    }

    async fn replace(&self, remove: &[String], insert: Vec<StoredEntry>) -> Result<()> {
        self.check()?;
        let mut state = self.write();
        for id in remove {
            state.remove(id);
        }
        for entry in insert {
            state.insert(entry);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        *self.write() = State::default();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.check()?;
        Ok(self.read().entries.len())
    }

    async fn scan(&self) -> Result<EntryStream<'_>> {
        self.check()?;
        let ids: Vec<String> = self.read().by_time.iter().map(|(_, id)| id.clone()).collect();
        // Entries deleted mid-scan are skipped.
        let stream = futures::stream::iter(ids)
            .filter_map(move |id| async move { self.read().entries.get(&id).cloned().map(Ok) });
        Ok(stream.boxed())
    }
}
