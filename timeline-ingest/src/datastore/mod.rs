use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    error::DatastoreError,
    event::{EventId, EventRecord, StoredEvent},
};

pub mod memory;
pub mod opensearch;

pub use memory::MemoryDatastore;
pub use opensearch::OpenSearchGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreation {
    Created,
    AlreadyExists,
}

/// Fields to merge into an already stored event.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub id: EventId,
    pub fields: Map<String, Value>,
}

/// The search engine, seen from the ingestion side. Every call is a single
/// round trip with no retry, a connection failure surfaces as
/// `DatastoreError::Unavailable`.
#[async_trait]
pub trait Datastore: Send + Sync {
    // Idempotent, an existing index is reported rather than treated as an error
    async fn create_index(
        &self,
        index: &str,
        event_type: &str,
    ) -> Result<IndexCreation, DatastoreError>;

    async fn index_exists(&self, index: &str) -> Result<bool, DatastoreError>;

    /// Writes one batch, returning how many documents were acknowledged.
    async fn bulk_write(
        &self,
        index: &str,
        event_type: &str,
        batch: &[EventRecord],
    ) -> Result<usize, DatastoreError>;

    /// Documents acknowledged by this gateway since it was created.
    fn total_written(&self) -> u64;

    // Fails with IndexNotFound if the index is absent
    async fn delete_index(&self, index: &str) -> Result<(), DatastoreError>;

    async fn events_by_data_type(
        &self,
        index: &str,
        data_type: &str,
    ) -> Result<Vec<StoredEvent>, DatastoreError>;

    async fn annotate(&self, index: &str, annotations: &[Annotation])
        -> Result<(), DatastoreError>;
}
