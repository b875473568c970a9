use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use redb::{Database, Durability, ReadOnlyTable, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::types::{
    CreateMemoryInput, CreateNamespaceInput, DEFAULT_SOURCE, ListOptions, Memory, Namespace,
    NamespaceConfig, SearchOptions, SearchResult, StoreStats, UpdateMemoryInput,
};

const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const DB_FILE: &str = "maia.redb";

type KvTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type KvReadTable = ReadOnlyTable<&'static str, &'static [u8]>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    /// Fsync on every commit instead of letting the engine batch durability.
    pub sync_writes: bool,
}

impl StoreOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes: false,
        }
    }
}

/// Memory and namespace store over a single ordered redb table.
///
/// Every mutating call is one write transaction; redb serialises writers and
/// gives readers a consistent snapshot.
pub struct Store {
    db: Database,
    data_dir: PathBuf,
    durability: Durability,
}

impl Store {
    pub fn open(opts: StoreOptions) -> Result<Self> {
        if opts.data_dir.as_os_str().is_empty() {
            return Err(StoreError::invalid("data_dir", "is required"));
        }
        std::fs::create_dir_all(&opts.data_dir)?;
        let db = Database::create(opts.data_dir.join(DB_FILE))?;

        // Read transactions cannot open a table that was never written.
        let txn = db.begin_write()?;
        {
            txn.open_table(KV)?;
        }
        txn.commit()?;

        let durability = if opts.sync_writes {
            Durability::Immediate
        } else {
            Durability::Eventual
        };
        debug!(data_dir = %opts.data_dir.display(), sync_writes = opts.sync_writes, "store opened");
        Ok(Self {
            db,
            data_dir: opts.data_dir,
            durability,
        })
    }

    pub fn open_path(data_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open(StoreOptions::new(data_dir))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn close(self) {
        drop(self.db);
    }

    // ---- memories ----

    pub fn create_memory(&self, input: CreateMemoryInput) -> Result<Memory> {
        validate_create(&input)?;
        let mem = new_memory(input, OffsetDateTime::now_utc());
        self.write(|table| put_memory(table, &mem))?;
        Ok(mem)
    }

    pub fn get_memory(&self, id: &str) -> Result<Memory> {
        self.read(|table| {
            get_json(table, &keys::memory(id))?.ok_or_else(|| StoreError::not_found("memory", id))
        })
    }

    pub fn update_memory(&self, id: &str, input: UpdateMemoryInput) -> Result<Memory> {
        if input.content.as_deref() == Some("") {
            return Err(StoreError::invalid("content", "cannot be empty"));
        }
        if let Some(c) = input.confidence {
            validate_confidence(c)?;
        }
        self.write(|table| {
            let key = keys::memory(id);
            let mut mem: Memory =
                get_json(&*table, &key)?.ok_or_else(|| StoreError::not_found("memory", id))?;
            if let Some(content) = input.content {
                mem.content = content;
            }
            if let Some(embedding) = input.embedding {
                mem.embedding = Some(embedding);
            }
            if let Some(metadata) = input.metadata {
                mem.metadata = metadata;
            }
            if let Some(tags) = input.tags {
                mem.tags = tags;
            }
            if let Some(confidence) = input.confidence {
                mem.confidence = confidence;
            }
            if let Some(relations) = input.relations {
                mem.relations = relations;
            }
            mem.updated_at = OffsetDateTime::now_utc();
            put_json(table, &key, &mem)?;
            Ok(mem)
        })
    }

    pub fn delete_memory(&self, id: &str) -> Result<()> {
        self.write(|table| {
            let mem: Memory = get_json(&*table, &keys::memory(id))?
                .ok_or_else(|| StoreError::not_found("memory", id))?;
            remove_memory(table, &mem)
        })
    }

    /// Lists a namespace in insertion order.
    ///
    /// `offset` counts membership entries, `limit` counts returned records.
    /// Entries whose primary record is gone are skipped, not repaired.
    pub fn list_memories(&self, namespace: &str, opts: ListOptions) -> Result<Vec<Memory>> {
        let limit = opts.effective_limit();
        self.read(|table| {
            let mut out = Vec::new();
            let mut skipped = 0;
            let prefix = keys::membership_prefix(namespace);
            for_each_prefix(table, &prefix, |key, value| {
                if !keys::is_direct_member(key, &prefix) {
                    return Ok(ControlFlow::Continue(()));
                }
                if skipped < opts.offset {
                    skipped += 1;
                    return Ok(ControlFlow::Continue(()));
                }
                if out.len() >= limit {
                    return Ok(ControlFlow::Break(()));
                }
                let id = String::from_utf8_lossy(value);
                match get_json::<Memory, _>(table, &keys::memory(&id))? {
                    Some(mem) => out.push(mem),
                    None => trace!(%id, namespace, "skipping orphaned membership entry"),
                }
                Ok(ControlFlow::Continue(()))
            })?;
            Ok(out)
        })
    }

    /// Filtered listing. Every result scores `1.0`.
    pub fn search_memories(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let limit = if opts.limit == 0 {
            crate::types::DEFAULT_LIST_LIMIT
        } else {
            opts.limit
        };
        self.read(|table| {
            let mut out = Vec::new();
            let mut skipped = 0;
            let mut consider = |mem: Memory| {
                if !opts.matches(&mem) {
                    return ControlFlow::Continue(());
                }
                if skipped < opts.offset {
                    skipped += 1;
                    return ControlFlow::Continue(());
                }
                out.push(SearchResult {
                    memory: mem,
                    score: 1.0,
                });
                if out.len() >= limit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };

            match opts.namespace.as_deref() {
                Some(ns) => {
                    let prefix = keys::membership_prefix(ns);
                    for_each_prefix(table, &prefix, |key, value| {
                        if !keys::is_direct_member(key, &prefix) {
                            return Ok(ControlFlow::Continue(()));
                        }
                        let id = String::from_utf8_lossy(value);
                        let Some(bytes) = table.get(keys::memory(&id).as_str())? else {
                            return Ok(ControlFlow::Continue(()));
                        };
                        match serde_json::from_slice::<Memory>(bytes.value()) {
                            Ok(mem) => Ok(consider(mem)),
                            Err(e) => {
                                warn!(%id, error = %e, "skipping undecodable memory");
                                Ok(ControlFlow::Continue(()))
                            }
                        }
                    })?
                }
                None => for_each_prefix(table, keys::MEMORY, |key, value| {
                    match serde_json::from_slice::<Memory>(value) {
                        Ok(mem) => Ok(consider(mem)),
                        Err(e) => {
                            warn!(key, error = %e, "skipping undecodable memory");
                            Ok(ControlFlow::Continue(()))
                        }
                    }
                })?,
            }
            Ok(out)
        })
    }

    /// Bumps `accessed_at` and `access_count`; `updated_at` is left alone.
    pub fn touch_memory(&self, id: &str) -> Result<()> {
        self.write(|table| {
            let key = keys::memory(id);
            let mut mem: Memory =
                get_json(&*table, &key)?.ok_or_else(|| StoreError::not_found("memory", id))?;
            mem.accessed_at = OffsetDateTime::now_utc();
            mem.access_count += 1;
            put_json(table, &key, &mem)
        })
    }

    // ---- namespaces ----

    pub fn create_namespace(&self, input: CreateNamespaceInput) -> Result<Namespace> {
        if input.name.is_empty() {
            return Err(StoreError::invalid("name", "cannot be empty"));
        }
        let now = OffsetDateTime::now_utc();
        let ns = Namespace {
            id: Uuid::now_v7().to_string(),
            name: input.name,
            parent: input.parent,
            template: input.template,
            config: input.config,
            created_at: now,
            updated_at: now,
        };
        self.write(|table| {
            let name_key = keys::namespace_name(&ns.name);
            if table.get(name_key.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists {
                    kind: "namespace",
                    id: ns.name.clone(),
                });
            }
            put_json(table, &keys::namespace(&ns.id), &ns)?;
            table.insert(name_key.as_str(), ns.id.as_bytes())?;
            Ok(())
        })?;
        Ok(ns)
    }

    pub fn get_namespace(&self, id: &str) -> Result<Namespace> {
        self.read(|table| {
            get_json(table, &keys::namespace(id))?
                .ok_or_else(|| StoreError::not_found("namespace", id))
        })
    }

    pub fn get_namespace_by_name(&self, name: &str) -> Result<Namespace> {
        self.read(|table| {
            let id = match table.get(keys::namespace_name(name).as_str())? {
                Some(v) => String::from_utf8_lossy(v.value()).into_owned(),
                None => return Err(StoreError::not_found("namespace", name)),
            };
            get_json(table, &keys::namespace(&id))?
                .ok_or_else(|| StoreError::not_found("namespace", id))
        })
    }

    /// Replaces the whole config.
    pub fn update_namespace(&self, id: &str, config: NamespaceConfig) -> Result<Namespace> {
        self.write(|table| {
            let key = keys::namespace(id);
            let mut ns: Namespace =
                get_json(&*table, &key)?.ok_or_else(|| StoreError::not_found("namespace", id))?;
            ns.config = config;
            ns.updated_at = OffsetDateTime::now_utc();
            put_json(table, &key, &ns)?;
            Ok(ns)
        })
    }

    /// Removes the namespace and its name index. Member memories stay.
    pub fn delete_namespace(&self, id: &str) -> Result<()> {
        self.write(|table| {
            let key = keys::namespace(id);
            let ns: Namespace =
                get_json(&*table, &key)?.ok_or_else(|| StoreError::not_found("namespace", id))?;
            table.remove(key.as_str())?;
            table.remove(keys::namespace_name(&ns.name).as_str())?;
            Ok(())
        })
    }

    pub fn list_namespaces(&self, opts: ListOptions) -> Result<Vec<Namespace>> {
        let limit = opts.effective_limit();
        self.read(|table| {
            let mut out = Vec::new();
            let mut skipped = 0;
            for_each_prefix(table, keys::NAMESPACE, |key, value| {
                if skipped < opts.offset {
                    skipped += 1;
                    return Ok(ControlFlow::Continue(()));
                }
                if out.len() >= limit {
                    return Ok(ControlFlow::Break(()));
                }
                match serde_json::from_slice::<Namespace>(value) {
                    Ok(ns) => out.push(ns),
                    Err(e) => warn!(key, error = %e, "skipping undecodable namespace"),
                }
                Ok(ControlFlow::Continue(()))
            })?;
            Ok(out)
        })
    }

    // ---- bulk ----

    /// All-or-nothing: inputs are validated before anything is written.
    pub fn batch_create_memories(&self, inputs: Vec<CreateMemoryInput>) -> Result<Vec<Memory>> {
        for input in &inputs {
            validate_create(input)?;
        }
        let now = OffsetDateTime::now_utc();
        let memories: Vec<Memory> = inputs.into_iter().map(|i| new_memory(i, now)).collect();
        self.write(|table| {
            for mem in &memories {
                put_memory(table, mem)?;
            }
            Ok(())
        })?;
        Ok(memories)
    }

    /// Missing ids are skipped.
    pub fn batch_delete_memories(&self, ids: &[&str]) -> Result<()> {
        self.write(|table| {
            for id in ids {
                let Some(mem) = get_json::<Memory, _>(&*table, &keys::memory(id))? else {
                    continue;
                };
                remove_memory(table, &mem)?;
            }
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (total_memories, total_namespaces) = self.read(|table| {
            Ok((
                count_prefix(table, keys::MEMORY)?,
                count_prefix(table, keys::NAMESPACE)?,
            ))
        })?;
        let storage_size_bytes = std::fs::metadata(self.data_dir.join(DB_FILE))?.len();
        Ok(StoreStats {
            total_memories,
            total_namespaces,
            storage_size_bytes,
        })
    }

    // ---- transaction plumbing ----

    fn read<T>(&self, f: impl FnOnce(&KvReadTable) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV)?;
        f(&table)
    }

    /// Runs `f` in one write transaction; an error drops the transaction
    /// uncommitted.
    fn write<T>(&self, f: impl FnOnce(&mut KvTable<'_>) -> Result<T>) -> Result<T> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(self.durability);
        let out = {
            let mut table = txn.open_table(KV)?;
            f(&mut table)?
        };
        txn.commit()?;
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn raw_remove(&self, key: &str) -> Result<()> {
        self.write(|table| {
            table.remove(key)?;
            Ok(())
        })
    }
}

fn validate_create(input: &CreateMemoryInput) -> Result<()> {
    if input.content.is_empty() {
        return Err(StoreError::invalid("content", "cannot be empty"));
    }
    if input.namespace.is_empty() {
        return Err(StoreError::invalid("namespace", "cannot be empty"));
    }
    if let Some(c) = input.confidence {
        validate_confidence(c)?;
    }
    Ok(())
}

fn validate_confidence(c: f64) -> Result<()> {
    if (0.0..=1.0).contains(&c) {
        Ok(())
    } else {
        Err(StoreError::invalid("confidence", "must be within [0, 1]"))
    }
}

fn new_memory(input: CreateMemoryInput, now: OffsetDateTime) -> Memory {
    Memory {
        id: Uuid::now_v7().to_string(),
        namespace: input.namespace,
        content: input.content,
        memory_type: input.memory_type.unwrap_or_default(),
        embedding: input.embedding,
        metadata: input.metadata,
        tags: input.tags,
        created_at: now,
        updated_at: now,
        accessed_at: now,
        access_count: 0,
        confidence: input.confidence.unwrap_or(1.0),
        source: input.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
        relations: input.relations,
    }
}

fn put_memory(table: &mut KvTable<'_>, mem: &Memory) -> Result<()> {
    put_json(table, &keys::memory(&mem.id), mem)?;
    let index = keys::membership(&mem.namespace, &mem.id);
    table.insert(index.as_str(), mem.id.as_bytes())?;
    Ok(())
}

fn remove_memory(table: &mut KvTable<'_>, mem: &Memory) -> Result<()> {
    table.remove(keys::memory(&mem.id).as_str())?;
    table.remove(keys::membership(&mem.namespace, &mem.id).as_str())?;
    Ok(())
}

fn get_json<R, T>(table: &T, key: &str) -> Result<Option<R>>
where
    R: DeserializeOwned,
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn put_json<V: Serialize>(table: &mut KvTable<'_>, key: &str, value: &V) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    table.insert(key, data.as_slice())?;
    Ok(())
}

/// Visits keys starting with `prefix` in key order until `visit` breaks.
fn for_each_prefix<T, F>(table: &T, prefix: &str, mut visit: F) -> Result<()>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    F: FnMut(&str, &[u8]) -> Result<ControlFlow<()>>,
{
    for entry in table.range(prefix..)? {
        let (key, value) = entry?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        if visit(key, value.value())?.is_break() {
            break;
        }
    }
    Ok(())
}

fn count_prefix<T>(table: &T, prefix: &str) -> Result<u64>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut n = 0;
    for_each_prefix(table, prefix, |_, _| {
        n += 1;
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(n)
}
