use std::{path::PathBuf, sync::Arc, time::Instant};

use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    datastore::{Datastore, IndexCreation},
    error::{IngestError, LifecycleError, ParseError},
    event::EventRecord,
    flush::{FlushController, DEFAULT_FLUSH_INTERVAL, MAX_FLUSH_INTERVAL},
    lifecycle::IndexLifecycleManager,
    parse::{open_records, ParseOptions, SourceFormat},
    registry::{IndexRegistration, NewRegistration},
};

pub const DEFAULT_EVENT_TYPE: &str = "generic_event";

#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Human readable name the index is registered under.
    pub name: String,
    pub path: PathBuf,
    pub format: SourceFormat,
    /// Target index. A fresh one is generated when absent.
    pub index_name: Option<String>,
    pub event_type: Option<String>,
    pub flush_interval: Option<usize>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub parse: ParseOptions,
    // Whether writing into an index that already exists is allowed
    pub allow_append: bool,
    pub default_flush_interval: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            parse: ParseOptions::default(),
            allow_append: true,
            default_flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub index_name: String,
    pub registration: IndexRegistration,
    pub index_created: bool,
    pub records_written: u64,
    pub flush_calls: usize,
    pub skipped: usize,
}

/// Runs one file through parse, flush and registration.
pub struct Ingestor {
    datastore: Arc<dyn Datastore>,
    lifecycle: Arc<IndexLifecycleManager>,
    options: IngestOptions,
}

impl Ingestor {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        lifecycle: Arc<IndexLifecycleManager>,
        options: IngestOptions,
    ) -> Self {
        Self {
            datastore,
            lifecycle,
            options,
        }
    }

    /// Nothing is registered unless every record made it into the index.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        let start = Instant::now();
        let flush_interval = request
            .flush_interval
            .unwrap_or(self.options.default_flush_interval);
        if flush_interval == 0 || flush_interval > MAX_FLUSH_INTERVAL {
            return Err(IngestError::InvalidFlushInterval(flush_interval));
        }
        let index_name = request
            .index_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let event_type = request
            .event_type
            .clone()
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());

        // Open before touching the datastore, so a bad path leaves no empty index behind
        let path = request.path.clone();
        let parse_options = self.options.parse;
        let format = request.format;
        let reader =
            tokio::task::spawn_blocking(move || open_records(&path, format, parse_options))
                .await
                .map_err(|e| IngestError::Producer(e.to_string()))??;

        let creation = self.datastore.create_index(&index_name, &event_type).await?;
        if creation == IndexCreation::AlreadyExists && !self.options.allow_append {
            return Err(LifecycleError::IndexAlreadyManaged(index_name).into());
        }

        info!(
            index = %index_name,
            path = %request.path.display(),
            format = %request.format,
            flush_interval,
            "Starting ingestion"
        );

        // One batch can be buffered in the channel while the previous one is being written
        let (tx, mut rx) = mpsc::channel::<Result<EventRecord, ParseError>>(
            flush_interval.min(DEFAULT_FLUSH_INTERVAL),
        );
        let producer = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            for item in reader.by_ref() {
                if tx.blocking_send(item).is_err() {
                    // Consumer gave up
                    break;
                }
            }
            reader.skipped()
        });

        let mut controller = FlushController::new(
            self.datastore.clone(),
            index_name.clone(),
            event_type.clone(),
            flush_interval,
        );
        while let Some(item) = rx.recv().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    error!(index = %index_name, "Ingestion aborted: {}", e);
                    return Err(e.into());
                }
            };
            if let Err(e) = controller.push(record).await {
                return Err(e.into());
            }
        }
        let flushed = controller.finish().await?;
        let skipped = producer
            .await
            .map_err(|e| IngestError::Producer(e.to_string()))?;

        let (registration, _) = self
            .lifecycle
            .register(&NewRegistration {
                name: request.name.clone(),
                index_name: index_name.clone(),
                event_type,
                owner: request.owner.clone(),
            })
            .await?;

        info!(
            index = %index_name,
            records = flushed.total_written,
            flushes = flushed.flush_calls,
            skipped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ingestion complete"
        );

        Ok(IngestSummary {
            index_name,
            registration,
            index_created: creation == IndexCreation::Created,
            records_written: flushed.total_written,
            flush_calls: flushed.flush_calls,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        datastore::MemoryDatastore,
        parse::InvalidRecordPolicy,
        registry::{MemoryRegistrationStore, RegistrationStore},
    };

    const HEADER: &str = "message,timestamp,datetime,timestamp_desc\n";

    struct Fixture {
        dir: TempDir,
        path: PathBuf,
        datastore: Arc<MemoryDatastore>,
        store: Arc<MemoryRegistrationStore>,
    }

    fn fixture(contents: &str, datastore: MemoryDatastore) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.csv");
        fs::write(&path, contents).unwrap();
        Fixture {
            dir,
            path,
            datastore: Arc::new(datastore),
            store: Arc::new(MemoryRegistrationStore::new()),
        }
    }

    fn ingestor(f: &Fixture, options: IngestOptions) -> Ingestor {
        let lifecycle = Arc::new(IndexLifecycleManager::new(
            f.store.clone(),
            f.datastore.clone(),
        ));
        Ingestor::new(f.datastore.clone(), lifecycle, options)
    }

    fn request(f: &Fixture, index: Option<&str>, flush_interval: Option<usize>) -> IngestRequest {
        IngestRequest {
            name: "events".to_string(),
            path: f.path.clone(),
            format: SourceFormat::Csv,
            index_name: index.map(str::to_string),
            event_type: None,
            flush_interval,
            owner: None,
        }
    }

    fn rows(n: usize) -> String {
        let mut s = HEADER.to_string();
        for i in 0..n {
            s.push_str(&format!("event {i},{i},2024-01-01T00:00:00Z,Time\n"));
        }
        s
    }

    #[tokio::test]
    async fn test_generated_index_names_are_unique() {
        let f = fixture(&rows(3), MemoryDatastore::new());
        let ingestor = ingestor(&f, IngestOptions::default());
        let a = ingestor.ingest(request(&f, None, None)).await.unwrap();
        let b = ingestor.ingest(request(&f, None, None)).await.unwrap();
        assert_ne!(a.index_name, b.index_name);
        assert_eq!(a.index_name.len(), 32);
        assert_eq!(a.registration.event_type, DEFAULT_EVENT_TYPE);
        assert_eq!(f.datastore.document_count(&a.index_name), 3);
    }

    #[tokio::test]
    async fn test_batches_follow_flush_interval() {
        let f = fixture(&rows(10), MemoryDatastore::new());
        let summary = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), Some(3)))
            .await
            .unwrap();
        assert_eq!(summary.records_written, 10);
        assert_eq!(summary.flush_calls, 4);
        assert_eq!(f.datastore.flush_sizes(), vec![3, 3, 3, 1]);
        assert!(summary.index_created);
    }

    #[tokio::test]
    async fn test_zero_flush_interval_is_rejected() {
        let f = fixture(&rows(1), MemoryDatastore::new());
        let res = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), Some(0)))
            .await;
        assert!(matches!(res, Err(IngestError::InvalidFlushInterval(0))));
        assert!(!f.datastore.index_exists("idx").await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_flush_interval_is_rejected() {
        let f = fixture(&rows(1), MemoryDatastore::new());
        let huge = usize::MAX / 4;
        let res = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), Some(huge)))
            .await;
        assert!(matches!(res, Err(IngestError::InvalidFlushInterval(n)) if n == huge));
        assert!(!f.datastore.index_exists("idx").await.unwrap());
    }

    #[tokio::test]
    async fn test_largest_flush_interval_is_accepted() {
        let f = fixture(&rows(3), MemoryDatastore::new());
        let summary = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), Some(MAX_FLUSH_INTERVAL)))
            .await
            .unwrap();
        assert_eq!(summary.records_written, 3);
        assert_eq!(summary.flush_calls, 1);
    }

    #[tokio::test]
    async fn test_invalid_record_aborts_without_registration() {
        let contents = format!("{HEADER}ok,1,2024-01-01T00:00:00Z,Time\nbroken,2,,Time\n");
        let f = fixture(&contents, MemoryDatastore::new());
        let res = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), Some(1)))
            .await;
        assert!(matches!(res, Err(IngestError::Parse(ParseError::Validation(_)))));
        assert_eq!(f.store.registration_count(), 0);
    }

    #[tokio::test]
    async fn test_skip_policy_counts_skipped_records() {
        let contents = format!("{HEADER}ok,1,2024-01-01T00:00:00Z,Time\nbroken,2,,Time\n");
        let f = fixture(&contents, MemoryDatastore::new());
        let options = IngestOptions {
            parse: ParseOptions {
                on_invalid: InvalidRecordPolicy::Skip,
                ..Default::default()
            },
            ..Default::default()
        };
        let summary = ingestor(&f, options)
            .ingest(request(&f, Some("idx"), None))
            .await
            .unwrap();
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_flush_failure_leaves_index_unregistered() {
        let f = fixture(&rows(5), MemoryDatastore::failing_after(1));
        let res = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), Some(2)))
            .await;
        match res {
            Err(IngestError::Flush(e)) => {
                assert_eq!(e.committed, 2);
                assert_eq!(e.batch_size, 2);
            }
            other => panic!("expected flush failure, got {other:?}"),
        }
        assert!(f.store.find_by_index("idx").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_index_without_append() {
        let f = fixture(&rows(1), MemoryDatastore::new());
        f.datastore.create_index("idx", "generic_event").await.unwrap();
        let options = IngestOptions {
            allow_append: false,
            ..Default::default()
        };
        let res = ingestor(&f, options)
            .ingest(request(&f, Some("idx"), None))
            .await;
        assert!(matches!(
            res,
            Err(IngestError::Lifecycle(LifecycleError::IndexAlreadyManaged(_)))
        ));

        let appended = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), None))
            .await
            .unwrap();
        assert!(!appended.index_created);
    }

    #[tokio::test]
    async fn test_missing_file_creates_nothing() {
        let mut f = fixture("", MemoryDatastore::new());
        f.path = f.dir.path().join("absent.csv");
        let res = ingestor(&f, IngestOptions::default())
            .ingest(request(&f, Some("idx"), None))
            .await;
        assert!(matches!(res, Err(IngestError::Parse(ParseError::Io(_)))));
        assert!(!f.datastore.index_exists("idx").await.unwrap());
    }
}
