use crate::record::ResourceRecord;
use std::{collections::BTreeMap, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error on state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is invalid: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("could not apply state event: {0}")]
    Patch(#[from] json_patch::PatchError),

    #[error("could not encode state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refusing to commit resource `{resource}`: {message}")]
    Invariant { resource: String, message: String },

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T, E = StateError> = std::result::Result<T, E>;

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put {
        name: String,
        record: ResourceRecord,
    },
    Remove {
        name: String,
    },
}

impl Write {
    pub fn name(&self) -> &str {
        match self {
            Write::Put { name, .. } | Write::Remove { name } => name,
        }
    }
}

/// Durable, transactional storage of resource records, keyed by resource name.
///
/// Implementations apply all writes passed to [`StateStore::commit`] atomically:
/// after a crash, either all of them are visible or none are.
pub trait StateStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<ResourceRecord>>;

    /// All records, ordered by name.
    fn snapshot(&self) -> Result<BTreeMap<String, ResourceRecord>>;

    /// Apply a batch of writes atomically. Prefer [`StateStoreExt::begin`].
    fn commit(&self, writes: Vec<Write>) -> Result<()>;
}

pub trait StateStoreExt: StateStore {
    fn begin(&self) -> Transaction<'_, Self> {
        Transaction {
            store: self,
            writes: Vec::new(),
        }
    }
}
impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// A set of writes that is applied as a whole, or not at all.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it back.
#[must_use = "a transaction does nothing unless committed"]
pub struct Transaction<'a, S: StateStore + ?Sized> {
    store: &'a S,
    writes: Vec<Write>,
}

impl<S: StateStore + ?Sized> Transaction<'_, S> {
    pub fn put(&mut self, name: impl Into<String>, record: ResourceRecord) -> &mut Self {
        self.writes.push(Write::Put {
            name: name.into(),
            record,
        });
        self
    }

    pub fn remove(&mut self, name: impl Into<String>) -> &mut Self {
        self.writes.push(Write::Remove { name: name.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn commit(self) -> Result<()> {
        for write in &self.writes {
            if let Write::Put { name, record } = write {
                record
                    .check_invariant()
                    .map_err(|message| StateError::Invariant {
                        resource: name.clone(),
                        message,
                    })?;
            }
        }
        if self.writes.is_empty() {
            return Ok(());
        }
        self.store.commit(self.writes)
    }

    pub fn rollback(self) {
        tracing::trace!(writes = self.writes.len(), "rolling back state transaction");
    }
}
