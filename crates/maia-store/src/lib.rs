//! Embedded memory store backing MAIA.
//!
//! Memories and namespaces live in one ordered key/value table (see the key
//! layout in `keys`). Memory ids are UUID v7, so a namespace listing walks the
//! membership index in creation order.
//!
//! ```no_run
//! use maia_store::{CreateMemoryInput, ListOptions, Store};
//!
//! let store = Store::open_path("/var/lib/maia")?;
//! store.create_memory(CreateMemoryInput::new("tenant-a", "prefers dark mode"))?;
//! let page = store.list_memories("tenant-a", ListOptions::default())?;
//! # Ok::<(), maia_store::StoreError>(())
//! ```

mod error;
mod keys;
mod store;
mod types;

pub use error::{Result, StoreError};
pub use store::{Store, StoreOptions};
pub use types::{
    CreateMemoryInput, CreateNamespaceInput, DEFAULT_LIST_LIMIT, DEFAULT_SOURCE, ListOptions,
    Memory, MemoryType, Namespace, NamespaceConfig, Relation, SearchOptions, SearchResult,
    StoreStats, TimeRange, UpdateMemoryInput,
};
