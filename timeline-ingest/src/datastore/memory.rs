use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Annotation, Datastore, IndexCreation};
use crate::{
    error::DatastoreError,
    event::{EventRecord, StoredEvent, DATA_TYPE},
};

#[derive(Debug, Default)]
struct MemoryIndex {
    event_type: String,
    // (id, document) in write order
    docs: Vec<(String, Value)>,
}

/// A process local datastore. Used for dry runs, and by tests to observe the
/// exact sequence of bulk writes.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    indices: Mutex<HashMap<String, MemoryIndex>>,
    flush_sizes: Mutex<Vec<usize>>,
    written: AtomicU64,
    next_id: AtomicU64,
    // Bulk writes allowed before the store starts reporting itself unavailable
    fail_after: Option<usize>,
    refuse_deletes: bool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that accepts `batches` bulk writes, then fails every later one
    /// as if the connection had dropped.
    pub fn failing_after(batches: usize) -> Self {
        Self {
            fail_after: Some(batches),
            ..Self::default()
        }
    }

    /// A store on which every index deletion fails as if the connection had
    /// dropped.
    pub fn refusing_deletes() -> Self {
        Self {
            refuse_deletes: true,
            ..Self::default()
        }
    }

    /// Batch sizes of every successful bulk write, in call order.
    pub fn flush_sizes(&self) -> Vec<usize> {
        lock(&self.flush_sizes).clone()
    }

    pub fn document_count(&self, index: &str) -> usize {
        lock(&self.indices)
            .get(index)
            .map(|i| i.docs.len())
            .unwrap_or_default()
    }

    pub fn event_type(&self, index: &str) -> Option<String> {
        lock(&self.indices).get(index).map(|i| i.event_type.clone())
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        lock(&self.indices).get(index).and_then(|i| {
            i.docs
                .iter()
                .find(|(doc_id, _)| doc_id == id)
                .map(|(_, doc)| doc.clone())
        })
    }
}

// A poisoned lock only means another test thread panicked mid-write, the data is still usable
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create_index(
        &self,
        index: &str,
        event_type: &str,
    ) -> Result<IndexCreation, DatastoreError> {
        let mut indices = lock(&self.indices);
        if indices.contains_key(index) {
            return Ok(IndexCreation::AlreadyExists);
        }
        indices.insert(
            index.to_string(),
            MemoryIndex {
                event_type: event_type.to_string(),
                docs: Vec::new(),
            },
        );
        Ok(IndexCreation::Created)
    }

    async fn index_exists(&self, index: &str) -> Result<bool, DatastoreError> {
        Ok(lock(&self.indices).contains_key(index))
    }

    async fn bulk_write(
        &self,
        index: &str,
        event_type: &str,
        batch: &[EventRecord],
    ) -> Result<usize, DatastoreError> {
        let mut flush_sizes = lock(&self.flush_sizes);
        if let Some(limit) = self.fail_after {
            if flush_sizes.len() >= limit {
                return Err(DatastoreError::Unavailable(format!(
                    "memory datastore configured to fail after {limit} writes"
                )));
            }
        }

        let mut indices = lock(&self.indices);
        let target = indices
            .get_mut(index)
            .ok_or_else(|| DatastoreError::IndexNotFound(index.to_string()))?;

        for record in batch {
            // Zero padded so that id order is write order
            let id = format!("{:012}", self.next_id.fetch_add(1, Ordering::Relaxed));
            target.docs.push((id, record.to_document(event_type)));
        }

        flush_sizes.push(batch.len());
        self.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!("Wrote {} documents to memory index {}", batch.len(), index);
        Ok(batch.len())
    }

    fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    async fn delete_index(&self, index: &str) -> Result<(), DatastoreError> {
        if self.refuse_deletes {
            return Err(DatastoreError::Unavailable(
                "memory datastore configured to refuse deletes".to_string(),
            ));
        }
        lock(&self.indices)
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| DatastoreError::IndexNotFound(index.to_string()))
    }

    async fn events_by_data_type(
        &self,
        index: &str,
        data_type: &str,
    ) -> Result<Vec<StoredEvent>, DatastoreError> {
        let indices = lock(&self.indices);
        let target = indices
            .get(index)
            .ok_or_else(|| DatastoreError::IndexNotFound(index.to_string()))?;

        let mut events = Vec::new();
        for (pos, (id, doc)) in target.docs.iter().enumerate() {
            if doc.get(DATA_TYPE).and_then(Value::as_str) != Some(data_type) {
                continue;
            }
            match EventRecord::from_document(pos + 1, doc.clone()) {
                Ok(record) => events.push(StoredEvent {
                    id: id.clone(),
                    record,
                }),
                Err(e) => warn!("Ignoring unreadable document {} in {}: {}", id, index, e),
            }
        }
        Ok(events)
    }

    async fn annotate(
        &self,
        index: &str,
        annotations: &[Annotation],
    ) -> Result<(), DatastoreError> {
        let mut indices = lock(&self.indices);
        let target = indices
            .get_mut(index)
            .ok_or_else(|| DatastoreError::IndexNotFound(index.to_string()))?;

        let mut failed = 0;
        for annotation in annotations {
            let doc = target
                .docs
                .iter_mut()
                .find(|(id, _)| *id == annotation.id)
                .and_then(|(_, doc)| doc.as_object_mut());
            match doc {
                Some(doc) => {
                    for (k, v) in &annotation.fields {
                        doc.insert(k.clone(), v.clone());
                    }
                }
                None => failed += 1,
            }
        }

        if failed > 0 {
            return Err(DatastoreError::PartialFailure {
                operation: "annotate",
                failed,
            });
        }
        Ok(())
    }
}
