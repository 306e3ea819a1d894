//! Persisted resource state.
//!
//! All writes go through a [`Transaction`], which a [`StateStore`] applies
//! atomically. [`EventLogStore`] keeps state durable across process restarts;
//! [`MemoryStore`] is the in-process variant used by tests.

mod event_log;
mod memory;
mod record;
mod store;

pub use event_log::{
    apply_state_event, apply_state_events, EventLogStore, StateEvent, StateEventMeta,
    StateEventStream, WaitMonitor,
};
pub use memory::MemoryStore;
pub use record::ResourceRecord;
pub use store::{Result, StateError, StateStore, StateStoreExt, Transaction, Write};
