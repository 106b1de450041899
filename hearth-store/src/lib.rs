//! In-memory JSON collection store with recipe lookup, JSONPath queries,
//! debounced file persistence, and an external-change watcher.
//!
//! A store is a named mapping from collection name to a JSON tree. Two
//! names are reserved: `_` (store metadata) and `recipes` (the recipe
//! records driving the data API).

pub mod merge;
pub mod query;
pub mod recipe;

mod persist;
mod watcher;

use hearth_core::config::DatabaseConfig;
use hearth_core::HttpError;
use merge::merged;
use recipe::{Recipe, UniqueMode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Metadata kept under the reserved `_` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    #[serde(default = "default_format")]
    pub format: String,

    /// Persist debounce window, milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Read-only stores reject `modify` and never persist.
    #[serde(default)]
    pub readonly: bool,
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self { format: default_format(), debounce_ms: default_debounce_ms(), readonly: false }
    }
}

fn default_format() -> String {
    "json".to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

/// One requested mutation: a reference key and a record (absent record
/// deletes the referenced entry).
#[derive(Debug, Clone, Deserialize)]
pub struct ModifyEntry {
    #[serde(rename = "ref", default)]
    pub reference: Option<Value>,

    #[serde(default)]
    pub record: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Change,
    Delete,
    Nop,
    Bad,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Change => "change",
            Op::Delete => "delete",
            Op::Nop => "nop",
            Op::Bad => "bad",
        }
    }
}

/// Result of one modify entry: `[op, ref, idx]`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult(pub Op, pub Option<Value>, pub Option<usize>);

impl OpResult {
    pub fn to_value(&self) -> Value {
        json!([
            self.0.as_str(),
            self.1.clone().unwrap_or(Value::Null),
            self.2.map(|i| json!(i)).unwrap_or(Value::Null),
        ])
    }
}

/// A file-backed JSON store. Mutations serialize through the write lock;
/// query results are deep copies, so callers may retain them freely.
pub struct Store {
    name: String,
    path: PathBuf,
    readonly_cfg: bool,
    tree: RwLock<Value>,
    meta: RwLock<StoreMeta>,
    version: AtomicU64,
    dirty: AtomicBool,
    inhibit: AtomicBool,
    last_write_ms: AtomicU64,
    persist_tx: mpsc::UnboundedSender<()>,
}

impl Store {
    /// Open a store from its backing file, spawn its persist task and
    /// external-change watcher. Load failure is fatal to the caller (the
    /// owning site).
    pub fn open(name: &str, cfg: &DatabaseConfig) -> anyhow::Result<Arc<Store>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(Store {
            name: name.to_string(),
            path: cfg.file.clone(),
            readonly_cfg: cfg.readonly,
            tree: RwLock::new(json!({})),
            meta: RwLock::new(StoreMeta::default()),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            inhibit: AtomicBool::new(false),
            last_write_ms: AtomicU64::new(0),
            persist_tx: tx,
        });
        store.load()?;
        persist::spawn(Arc::clone(&store), rx);
        if let Err(e) = watcher::spawn(Arc::clone(&store)) {
            tracing::warn!(store = %name, error = %e, "Store watcher unavailable");
        }
        tracing::info!(store = %name, path = %cfg.file.display(), "Store opened");
        Ok(store)
    }

    /// In-memory store with no persistence or watch tasks. Test and
    /// derived-data use only.
    pub fn in_memory(name: &str, tree: Value) -> Arc<Store> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let store = Store {
            name: name.to_string(),
            path: PathBuf::new(),
            readonly_cfg: false,
            tree: RwLock::new(json!({})),
            meta: RwLock::new(StoreMeta::default()),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            inhibit: AtomicBool::new(false),
            last_write_ms: AtomicU64::new(0),
            persist_tx: tx,
        };
        store.install(tree);
        Arc::new(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn readonly(&self) -> bool {
        self.readonly_cfg || self.meta.read().expect("meta lock").readonly
    }

    pub(crate) fn debounce_ms(&self) -> u64 {
        self.meta.read().expect("meta lock").debounce_ms
    }

    /// Read the backing file and atomically replace the in-memory tree.
    pub fn load(&self) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(&self.path)?;
        let tree: Value = serde_json::from_str(&text)?;
        if !tree.is_object() {
            anyhow::bail!("store {} is not a JSON object", self.path.display());
        }
        self.install(tree);
        tracing::debug!(store = %self.name, version = self.version(), "Store (re)loaded");
        Ok(())
    }

    fn install(&self, tree: Value) {
        let meta = tree
            .get("_")
            .cloned()
            .map(|m| serde_json::from_value(m).unwrap_or_default())
            .unwrap_or_default();
        *self.meta.write().expect("meta lock") = meta;
        *self.tree.write().expect("tree lock") = tree;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Deep copy of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.tree.read().expect("tree lock").clone()
    }

    /// Deep copy of one collection.
    pub fn collection(&self, name: &str) -> Option<Value> {
        self.tree.read().expect("tree lock").get(name).cloned()
    }

    /// Collection names, reserved ones included.
    pub fn collections(&self) -> Vec<String> {
        match &*self.tree.read().expect("tree lock") {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Scan a collection for the first record whose `field` equals
    /// `value`.
    pub fn find_by(&self, collection: &str, field: &str, value: &Value) -> Option<Value> {
        let tree = self.tree.read().expect("tree lock");
        tree.get(collection)?
            .as_array()?
            .iter()
            .find(|rec| rec.get(field) == Some(value))
            .cloned()
    }

    /// Find a recipe by name in the reserved `recipes` collection.
    pub fn lookup(&self, name: &str) -> Option<Recipe> {
        let tree = self.tree.read().expect("tree lock");
        let recipes = tree.get("recipes")?.as_array()?;
        let found = recipes.iter().find(|r| r.get("name").and_then(Value::as_str) == Some(name))?;
        match serde_json::from_value(found.clone()) {
            Ok(recipe) => Some(recipe),
            Err(e) => {
                tracing::warn!(store = %self.name, recipe = name, error = %e, "Malformed recipe");
                None
            }
        }
    }

    /// Run a query recipe. Evaluation errors collapse into the recipe's
    /// defaults (or `{}`) and are logged, never surfaced.
    pub fn query(&self, recipe: &Recipe, bindings: &Map<String, Value>) -> Value {
        let fallback = || recipe.defaults.clone().unwrap_or_else(|| json!({}));

        let Some(expression) = recipe.expression.as_deref() else {
            tracing::warn!(store = %self.name, recipe = %recipe.name, "Query recipe has no expression");
            return fallback();
        };

        let tree = self.tree.read().expect("tree lock");
        let nodes = match query::eval(&tree, expression, bindings) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(store = %self.name, recipe = %recipe.name, error = %e, "Query failed");
                return fallback();
            }
        };
        drop(tree);

        if nodes.is_empty() {
            return fallback();
        }
        // A single non-array node is a scalar/record answer; everything
        // else is shaped as an array with limit and header applied.
        if nodes.len() == 1 && !nodes[0].is_array() {
            return nodes.into_iter().next().expect("one node");
        }
        let mut list: Vec<Value> = if nodes.len() == 1 {
            nodes.into_iter().next().expect("one node").as_array().cloned().unwrap_or_default()
        } else {
            nodes
        };

        if let Some(limit) = recipe.limit {
            let n = limit.unsigned_abs() as usize;
            if limit >= 0 {
                list.truncate(n);
            } else if list.len() > n {
                list.drain(..list.len() - n);
            }
        }
        if let Some(header) = &recipe.header {
            match header {
                Value::Array(rows) => {
                    for row in rows.iter().rev() {
                        list.insert(0, row.clone());
                    }
                }
                one => list.insert(0, one.clone()),
            }
        }
        Value::Array(list)
    }

    /// Apply a list of mutations through a modify recipe. Per-entry
    /// results come back in input order as `[op, ref, idx]` triples.
    pub fn modify(&self, recipe: &Recipe, entries: &[ModifyEntry]) -> Result<Vec<OpResult>, HttpError> {
        if self.readonly() {
            return Err(HttpError::Forbidden(format!("Store {} is read-only", self.name)));
        }
        let Some(collection) = recipe.collection.clone() else {
            return Err(HttpError::BadRequest(format!(
                "Recipe {} does not modify a collection",
                recipe.name
            )));
        };

        let mut results = Vec::with_capacity(entries.len());
        let mut touched = false;
        let mut tree = self.tree.write().expect("tree lock");

        for entry in entries {
            let result = self.apply_entry(&mut tree, recipe, &collection, entry, &mut touched);
            results.push(result);
        }
        drop(tree);

        if touched {
            self.dirty.store(true, Ordering::Release);
            let _ = self.persist_tx.send(());
        }
        Ok(results)
    }

    fn apply_entry(
        &self,
        tree: &mut Value,
        recipe: &Recipe,
        collection: &str,
        entry: &ModifyEntry,
        touched: &mut bool,
    ) -> OpResult {
        let reference = entry.reference.clone();
        if reference.is_none() && entry.record.is_none() {
            return OpResult(Op::Bad, None, None);
        }

        let existing = self.resolve_existing(tree, recipe, collection, reference.as_ref());

        let root = tree.as_object_mut().expect("store tree is an object");
        let slot = root.entry(collection.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        let Some(records) = slot.as_array_mut() else {
            tracing::error!(store = %self.name, collection, "Modify target is not an array");
            return OpResult(Op::Bad, reference, None);
        };

        match &entry.record {
            Some(record) => {
                let defaults = recipe.defaults.clone().unwrap_or_else(|| json!({}));
                match existing {
                    Some((index, current)) => {
                        records[index] = merged(&defaults, &[&current, record]);
                        *touched = true;
                        OpResult(Op::Change, reference, Some(index))
                    }
                    None => {
                        let mut fresh = merged(&defaults, &[record]);
                        let mut key_value = None;
                        if let Some(unique) = &recipe.unique {
                            let value = match unique.mode {
                                UniqueMode::Ref => reference.clone(),
                                UniqueMode::Serial => Some(json!(next_serial(records, &unique.key))),
                                UniqueMode::Uuid => Some(json!(uuid::Uuid::new_v4().to_string())),
                            };
                            let Some(value) = value else {
                                tracing::error!(store = %self.name, recipe = %recipe.name,
                                    "Insert requires a ref for its unique key");
                                return OpResult(Op::Bad, reference, None);
                            };
                            if records.iter().any(|r| r.get(&unique.key) == Some(&value)) {
                                tracing::error!(store = %self.name, recipe = %recipe.name,
                                    key = %unique.key, "Unique key collision on insert");
                                return OpResult(Op::Bad, reference, None);
                            }
                            if let Some(obj) = fresh.as_object_mut() {
                                obj.insert(unique.key.clone(), value.clone());
                            }
                            key_value = Some(value);
                        }
                        records.push(fresh);
                        *touched = true;
                        OpResult(Op::Add, key_value, Some(records.len() - 1))
                    }
                }
            }
            None => match existing {
                Some((index, _)) => {
                    records.remove(index);
                    *touched = true;
                    OpResult(Op::Delete, reference, Some(index))
                }
                None => OpResult(Op::Nop, reference, None),
            },
        }
    }

    /// Locate the record the recipe's `reference` expression selects for
    /// the bound ref, along with its index in the collection.
    fn resolve_existing(
        &self,
        tree: &Value,
        recipe: &Recipe,
        collection: &str,
        reference: Option<&Value>,
    ) -> Option<(usize, Value)> {
        let expression = recipe.reference.as_deref()?;
        let reference = reference?;

        let mut bindings = Map::new();
        bindings.insert("ref".to_string(), reference.clone());

        let nodes = match query::eval(tree, expression, &bindings) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(store = %self.name, recipe = %recipe.name, error = %e, "Reference failed");
                return None;
            }
        };
        let found = nodes.into_iter().next()?;
        let records = tree.get(collection)?.as_array()?;
        let index = records.iter().position(|r| *r == found)?;
        Some((index, found))
    }

    // ── Persist/watch coordination ───────────────────────────────

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn inhibited(&self) -> bool {
        self.inhibit.load(Ordering::Acquire)
    }

    /// True within two seconds of our own file write; the watcher uses
    /// this to ignore self-inflicted change events.
    pub(crate) fn recently_written(&self) -> bool {
        let last = self.last_write_ms.load(Ordering::Acquire);
        last != 0 && now_ms().saturating_sub(last) < 2000
    }

    /// Write the tree to disk (temp file + rename). Failure leaves the
    /// store dirty so the next mutation retries.
    pub async fn write_now(&self) -> anyhow::Result<()> {
        if self.readonly() {
            return Ok(());
        }
        self.inhibit.store(true, Ordering::Release);
        let result = self.write_inner().await;
        self.last_write_ms.store(now_ms(), Ordering::Release);
        self.inhibit.store(false, Ordering::Release);
        if let Err(e) = &result {
            self.mark_dirty();
            tracing::error!(store = %self.name, error = %e, "Store persist failed");
        }
        result
    }

    async fn write_inner(&self) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.version.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(store = %self.name, bytes = text.len(), "Store persisted");
        Ok(())
    }

    /// Flush a pending write immediately (shutdown path).
    pub async fn flush(&self) {
        if self.take_dirty() {
            let _ = self.write_now().await;
        }
    }
}

fn next_serial(records: &[Value], key: &str) -> i64 {
    records.iter().filter_map(|r| r.get(key).and_then(Value::as_i64)).max().unwrap_or(0) + 1
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
