use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Annotation, Datastore, IndexCreation};
use crate::{
    error::DatastoreError,
    event::{EventRecord, StoredEvent, DATA_TYPE, EVENT_TYPE_FIELD},
};

const SCROLL_KEEPALIVE: &str = "1m";

/// Talks to an OpenSearch (or Elasticsearch) cluster over its REST API.
pub struct OpenSearchGateway {
    client: Client,
    base_url: String,
    scroll_size: usize,
    written: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Value,
}

impl OpenSearchGateway {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        scroll_size: usize,
    ) -> Result<Self, DatastoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client, scroll_size))
    }

    pub fn with_client(base_url: impl Into<String>, client: Client, scroll_size: usize) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            scroll_size: scroll_size.max(1),
            written: AtomicU64::new(0),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Builds the NDJSON body for a bulk request, one action line followed by
    /// one document line per record.
    pub fn build_bulk_body(
        index: &str,
        event_type: &str,
        batch: &[EventRecord],
    ) -> Result<String, DatastoreError> {
        let action = serde_json::to_string(&json!({ "index": { "_index": index } }))?;
        let mut body = String::new();
        for record in batch {
            body.push_str(&action);
            body.push('\n');
            body.push_str(&serde_json::to_string(&record.to_document(event_type))?);
            body.push('\n');
        }
        Ok(body)
    }

    pub fn build_update_body(
        index: &str,
        annotations: &[Annotation],
    ) -> Result<String, DatastoreError> {
        let mut body = String::new();
        for annotation in annotations {
            let action = json!({ "update": { "_index": index, "_id": annotation.id } });
            body.push_str(&serde_json::to_string(&action)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&json!({ "doc": annotation.fields }))?);
            body.push('\n');
        }
        Ok(body)
    }

    async fn send_bulk(&self, operation: &'static str, body: String) -> Result<usize, DatastoreError> {
        let response = self
            .client
            .post(self.url("_bulk"))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let response = check_status(operation, response).await?;
        let parsed: BulkResponse = response.json().await?;

        let failed = if parsed.errors {
            parsed.items.iter().filter(|item| item_failed(item)).count()
        } else {
            0
        };
        if failed > 0 {
            warn!("Bulk {} reported {} failed items", operation, failed);
            return Err(DatastoreError::PartialFailure { operation, failed });
        }
        Ok(parsed.items.len())
    }

    async fn scroll_page(&self, scroll_id: &str) -> Result<SearchResponse, DatastoreError> {
        let response = self
            .client
            .post(self.url("_search/scroll"))
            .json(&json!({ "scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id }))
            .send()
            .await?;
        Ok(check_status("scroll", response).await?.json().await?)
    }

    async fn clear_scroll(&self, scroll_id: String) {
        let res = self
            .client
            .delete(self.url("_search/scroll"))
            .json(&json!({ "scroll_id": [scroll_id] }))
            .send()
            .await;
        // Scrolls expire on their own, failing to clear one early is harmless
        if let Err(e) = res {
            debug!("Failed to clear scroll: {}", e);
        }
    }
}

// Each item is {"<action>": {"status": .., "error": ..}}
fn item_failed(item: &Value) -> bool {
    item.as_object()
        .and_then(|o| o.values().next())
        .map(|result| result.get("error").is_some())
        .unwrap_or(true)
}

async fn check_status(
    operation: &'static str,
    response: Response,
) -> Result<Response, DatastoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DatastoreError::Rejected {
        operation,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Datastore for OpenSearchGateway {
    async fn create_index(
        &self,
        index: &str,
        event_type: &str,
    ) -> Result<IndexCreation, DatastoreError> {
        if self.index_exists(index).await? {
            return Ok(IndexCreation::AlreadyExists);
        }

        let mappings = json!({
            "mappings": {
                "_meta": { "event_type": event_type },
                "properties": {
                    "message": { "type": "text" },
                    "timestamp": { "type": "long" },
                    "datetime": { "type": "date" },
                    "timestamp_desc": { "type": "keyword" },
                    DATA_TYPE: { "type": "keyword" },
                    EVENT_TYPE_FIELD: { "type": "keyword" },
                }
            }
        });

        let response = self.client.put(self.url(index)).json(&mappings).send().await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            // Someone else created it between our existence check and the put
            if body.contains("resource_already_exists_exception") {
                return Ok(IndexCreation::AlreadyExists);
            }
            return Err(DatastoreError::Rejected {
                operation: "create_index",
                status: StatusCode::BAD_REQUEST.as_u16(),
                body,
            });
        }
        check_status("create_index", response).await?;
        info!("Created index {} for event type {}", index, event_type);
        Ok(IndexCreation::Created)
    }

    async fn index_exists(&self, index: &str) -> Result<bool, DatastoreError> {
        let response = self.client.head(self.url(index)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(DatastoreError::Rejected {
                operation: "index_exists",
                status: s.as_u16(),
                body: String::new(),
            }),
        }
    }

    async fn bulk_write(
        &self,
        index: &str,
        event_type: &str,
        batch: &[EventRecord],
    ) -> Result<usize, DatastoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let body = Self::build_bulk_body(index, event_type, batch)?;
        let written = self.send_bulk("bulk_write", body).await?;
        self.written.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    async fn delete_index(&self, index: &str) -> Result<(), DatastoreError> {
        let response = self.client.delete(self.url(index)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DatastoreError::IndexNotFound(index.to_string()));
        }
        check_status("delete_index", response).await?;
        info!("Deleted index {}", index);
        Ok(())
    }

    async fn events_by_data_type(
        &self,
        index: &str,
        data_type: &str,
    ) -> Result<Vec<StoredEvent>, DatastoreError> {
        // Make freshly ingested documents visible to the search below
        let response = self
            .client
            .post(self.url(&format!("{index}/_refresh")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DatastoreError::IndexNotFound(index.to_string()));
        }
        check_status("refresh", response).await?;

        let query = json!({
            "size": self.scroll_size,
            "query": { "term": { DATA_TYPE: data_type } },
            "sort": ["_doc"],
        });
        let response = self
            .client
            .post(self.url(&format!("{index}/_search?scroll={SCROLL_KEEPALIVE}")))
            .json(&query)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DatastoreError::IndexNotFound(index.to_string()));
        }
        let mut page: SearchResponse = check_status("search", response).await?.json().await?;

        let mut events = Vec::new();
        loop {
            if page.hits.hits.is_empty() {
                break;
            }
            for hit in page.hits.hits.drain(..) {
                let position = events.len() + 1;
                match EventRecord::from_document(position, hit.source) {
                    Ok(record) => events.push(StoredEvent { id: hit.id, record }),
                    Err(e) => warn!("Ignoring unreadable document {} in {}: {}", hit.id, index, e),
                }
            }
            let Some(scroll_id) = page.scroll_id.clone() else {
                break;
            };
            page = match self.scroll_page(&scroll_id).await {
                Ok(next) => next,
                Err(e) => {
                    self.clear_scroll(scroll_id).await;
                    return Err(e);
                }
            };
        }

        if let Some(scroll_id) = page.scroll_id {
            self.clear_scroll(scroll_id).await;
        }
        debug!(
            "Fetched {} events of type {} from {}",
            events.len(),
            data_type,
            index
        );
        Ok(events)
    }

    async fn annotate(
        &self,
        index: &str,
        annotations: &[Annotation],
    ) -> Result<(), DatastoreError> {
        if annotations.is_empty() {
            return Ok(());
        }
        let body = Self::build_update_body(index, annotations)?;
        self.send_bulk("annotate", body).await?;
        Ok(())
    }
}
