use crate::config::ID_FIELD;
use crate::error::IndexError;
use crate::index::{IndexService, Query};
use crate::models::{Document, LinkDocument, TargetField};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
enum Pending {
    Add(Document),
    Update(LinkDocument),
}

#[derive(Debug, Default)]
struct Store {
    committed: BTreeMap<String, Document>,
    pending: Vec<Pending>,
    add_calls: Vec<usize>,
    update_calls: Vec<usize>,
    commits: usize,
    optimizes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    store: Mutex<Store>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Committed document by id.
    pub fn get(&self, id: &str) -> Option<Document> {
        self.lock().committed.get(id).cloned()
    }

    /// Number of committed documents.
    pub fn len(&self) -> usize {
        self.lock().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of every `add` call, in call order.
    pub fn add_calls(&self) -> Vec<usize> {
        self.lock().add_calls.clone()
    }

    pub fn update_calls(&self) -> Vec<usize> {
        self.lock().update_calls.clone()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn optimizes(&self) -> usize {
        self.lock().optimizes
    }
}

impl IndexService for MemoryIndex {
    fn add(&self, docs: &[Document]) -> Result<(), IndexError> {
        if let Some(missing) = docs.iter().position(|d| d.id().is_none()) {
            return Err(IndexError::Rejected(format!("document {missing} in batch has no id")));
        }
        let mut store = self.lock();
        store.add_calls.push(docs.len());
        store.pending.extend(docs.iter().cloned().map(Pending::Add));
        Ok(())
    }

    fn update(&self, docs: &[LinkDocument]) -> Result<(), IndexError> {
        let mut store = self.lock();
        store.update_calls.push(docs.len());
        store.pending.extend(docs.iter().cloned().map(Pending::Update));
        Ok(())
    }

    fn commit(&self) -> Result<(), IndexError> {
        let mut store = self.lock();
        let pending = std::mem::take(&mut store.pending);
        let applied = pending.len();
        for change in pending {
            match change {
                Pending::Add(doc) => {
                    if let Some(id) = doc.id().map(str::to_string) {
                        store.committed.insert(id, doc);
                    }
                }
                Pending::Update(link) => {
                    let doc = store
                        .committed
                        .entry(link.id.clone())
                        .or_insert_with(|| Document::new().with(ID_FIELD, &[&link.id]));
                    link.apply(doc);
                }
            }
        }
        store.commits += 1;
        debug!(applied, docs = store.committed.len(), "Memory index committed");
        Ok(())
    }

    fn optimize(&self) -> Result<(), IndexError> {
        self.lock().optimizes += 1;
        Ok(())
    }

    fn query(&self, query: &Query) -> Result<Vec<Document>, IndexError> {
        let store = self.lock();
        let lower = query.after_id.as_deref();
        let docs = store
            .committed
            .iter()
            .filter(|(id, _)| lower.map_or(true, |after| id.as_str() > after))
            .map(|(_, doc)| doc)
            .filter(|doc| query.filters.iter().all(|f| f.matches(doc)))
            .take(query.rows)
            .map(|doc| project(doc, &query.fields))
            .collect();
        Ok(docs)
    }
}

fn project(doc: &Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return doc.clone();
    }
    Document {
        fields: doc
            .fields
            .iter()
            .filter(|f| fields.contains(&f.name))
            .map(|f| TargetField {
                name: f.name.clone(),
                values: f.values.clone(),
            })
            .collect(),
    }
}
