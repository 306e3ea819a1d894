use crate::{
    record::ResourceRecord,
    store::{Result, StateError, StateStore, Write},
};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

/// A [`StateStore`] that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, ResourceRecord>,
    commits: usize,
    fail_next_commit: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = (String, ResourceRecord)>) -> Self {
        let store = Self::new();
        store.lock().records.extend(records);
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Make the next commit fail without writing anything, as if the process
    /// died before the state write reached the disk.
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }
}

impl StateStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.lock().records.get(name).cloned())
    }

    fn snapshot(&self) -> Result<BTreeMap<String, ResourceRecord>> {
        Ok(self.lock().records.clone())
    }

    fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.fail_next_commit) {
            return Err(StateError::Unavailable("simulated commit failure".to_owned()));
        }
        for write in writes {
            match write {
                Write::Put { name, record } => {
                    inner.records.insert(name, record);
                }
                Write::Remove { name } => {
                    inner.records.remove(&name);
                }
            }
        }
        inner.commits += 1;
        Ok(())
    }
}
