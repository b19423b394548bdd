use std::{collections::BTreeSet, fs, path::PathBuf, sync::Arc};

use serde_json::Value;
use tempfile::TempDir;
use timeline_ingest::{
    datastore::{Datastore, MemoryDatastore},
    ingest::{IngestOptions, IngestRequest, Ingestor},
    lifecycle::{DeletionOutcome, IndexLifecycleManager},
    parse::SourceFormat,
    registry::{MemoryRegistrationStore, RegistrationStore, SketchStatus, READ_PERMISSION},
    similarity::{SimilarityConfig, SimilarityScorer, CLUSTER_ID_FIELD, CLUSTER_SIZE_FIELD},
};

struct Harness {
    dir: TempDir,
    datastore: Arc<MemoryDatastore>,
    store: Arc<MemoryRegistrationStore>,
    lifecycle: Arc<IndexLifecycleManager>,
    ingestor: Ingestor,
}

impl Harness {
    fn new() -> Self {
        let datastore = Arc::new(MemoryDatastore::new());
        let store = Arc::new(MemoryRegistrationStore::new());
        let lifecycle = Arc::new(IndexLifecycleManager::new(
            store.clone(),
            datastore.clone(),
        ));
        let ingestor = Ingestor::new(
            datastore.clone(),
            lifecycle.clone(),
            IngestOptions::default(),
        );
        Self {
            dir: TempDir::new().unwrap(),
            datastore,
            store,
            lifecycle,
            ingestor,
        }
    }

    fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }
}

fn request(name: &str, path: PathBuf, format: SourceFormat, index: &str) -> IngestRequest {
    IngestRequest {
        name: name.to_string(),
        path,
        format,
        index_name: Some(index.to_string()),
        event_type: None,
        flush_interval: Some(1),
        owner: None,
    }
}

#[tokio::test]
async fn two_row_csv_is_written_in_two_flushes_and_registered() {
    let h = Harness::new();
    let path = h.file(
        "logins.csv",
        "message,timestamp,datetime,timestamp_desc,data_type\n\
         user alice logged in,1700000000000000,2023-11-14T22:13:20+00:00,Login Time,auth:login\n\
         user bob logged in,1700000060000000,2023-11-14T22:14:20+00:00,Login Time,auth:login\n",
    );

    let summary = h
        .ingestor
        .ingest(request("logins", path, SourceFormat::Csv, "case-1-logins"))
        .await
        .unwrap();

    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.flush_calls, 2);
    assert_eq!(h.datastore.flush_sizes(), vec![1, 1]);
    assert_eq!(h.datastore.document_count("case-1-logins"), 2);
    assert_eq!(h.datastore.total_written(), 2);

    let registrations = h.lifecycle.find_by_name("logins").await.unwrap();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].index_name, "case-1-logins");

    let grants = h.lifecycle.permissions(registrations[0].id).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].permission, READ_PERMISSION);

    let doc = h.datastore.document("case-1-logins", "000000000000").unwrap();
    assert_eq!(doc["message"], Value::from("user alice logged in"));
    assert_eq!(doc["timestamp"], Value::from(1_700_000_000_000_000_i64));
    assert_eq!(doc["datetime"], Value::from("2023-11-14T22:13:20.000000Z"));
}

#[tokio::test]
async fn ingesting_the_same_file_twice_keeps_one_registration() {
    let h = Harness::new();
    let path = h.file(
        "events.jsonl",
        r#"{"message": "a", "timestamp": 1, "datetime": "1970-01-01T00:00:00Z", "timestamp_desc": "Time"}
{"message": "b", "timestamp": 2, "datetime": "1970-01-01T00:00:00Z", "timestamp_desc": "Time"}
"#,
    );

    let first = h
        .ingestor
        .ingest(request("events", path.clone(), SourceFormat::Jsonl, "idx"))
        .await
        .unwrap();
    let second = h
        .ingestor
        .ingest(request("events", path, SourceFormat::Jsonl, "idx"))
        .await
        .unwrap();

    assert_eq!(first.registration.id, second.registration.id);
    assert_eq!(h.store.registration_count(), 1);
    assert_eq!(h.datastore.document_count("idx"), 4);
}

#[tokio::test]
async fn deletion_cascades_and_retry_reports_no_such_index() {
    let h = Harness::new();
    let path = h.file(
        "events.json",
        r#"[{"message": "a", "timestamp": 1, "datetime": "1970-01-01T00:00:00Z", "timestamp_desc": "Time"}]"#,
    );
    let summary = h
        .ingestor
        .ingest(request("events", path, SourceFormat::Json, "doomed"))
        .await
        .unwrap();

    let sketch = h.store.create_sketch("case 9").await.unwrap();
    h.store
        .set_sketch_status(sketch.id, SketchStatus::Active)
        .await
        .unwrap();
    h.store
        .attach_timeline(sketch.id, summary.registration.id, "events")
        .await
        .unwrap();

    let plan = h.lifecycle.plan_deletion("doomed").await.unwrap().unwrap();
    assert_eq!(plan.dependents.len(), 1);
    assert_eq!(plan.active_sketches().len(), 1);

    let outcome = h
        .lifecycle
        .commit_deletion("doomed", plan.token)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DeletionOutcome::Deleted {
            timelines_removed: 1,
            index_removed: true
        }
    );
    assert!(!h.datastore.index_exists("doomed").await.unwrap());
    assert_eq!(h.store.timeline_count(), 0);
    assert!(h.lifecycle.find_by_name("events").await.unwrap().is_empty());

    let retry = h
        .lifecycle
        .commit_deletion("doomed", plan.token)
        .await
        .unwrap();
    assert_eq!(retry, DeletionOutcome::NoSuchIndex);
}

#[tokio::test]
async fn similarity_groups_identical_messages_of_one_data_type() {
    let h = Harness::new();
    let path = h.file(
        "syslog.jsonl",
        r#"{"message": "Failed password for invalid user admin from 203.0.113.9 port 4242 ssh2", "timestamp": 1, "datetime": "2024-03-01T10:00:00Z", "timestamp_desc": "Time", "data_type": "syslog:line"}
{"message": "systemd started daily apt upgrade and clean activities", "timestamp": 2, "datetime": "2024-03-01T10:00:01Z", "timestamp_desc": "Time", "data_type": "syslog:line"}
{"message": "Failed password for invalid user admin from 203.0.113.9 port 4242 ssh2", "timestamp": 3, "datetime": "2024-03-01T10:00:02Z", "timestamp_desc": "Time", "data_type": "syslog:line"}
"#,
    );
    h.ingestor
        .ingest(request("syslog", path, SourceFormat::Jsonl, "syslog"))
        .await
        .unwrap();

    let scorer = SimilarityScorer::new(h.datastore.clone(), SimilarityConfig::default()).unwrap();
    let report = scorer.score("syslog", "syslog:line").await.unwrap();

    assert_eq!(report.clusters.len(), 2);
    let mut sizes: Vec<usize> = report.clusters.iter().map(|c| c.size()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);

    let first = h.datastore.document("syslog", "000000000000").unwrap();
    let third = h.datastore.document("syslog", "000000000002").unwrap();
    let second = h.datastore.document("syslog", "000000000001").unwrap();
    assert_eq!(first[CLUSTER_ID_FIELD], third[CLUSTER_ID_FIELD]);
    assert_ne!(first[CLUSTER_ID_FIELD], second[CLUSTER_ID_FIELD]);
    assert_eq!(third[CLUSTER_SIZE_FIELD], Value::from(2));

    // Scoring again yields the same ids
    let again = scorer.score("syslog", "syslog:line").await.unwrap();
    assert_eq!(again, report);

    let empty = scorer.score("syslog", "nothing:here").await.unwrap();
    assert!(empty.is_empty());
}

fn syslog_line(message: &str, n: usize) -> String {
    format!(
        r#"{{"message": "{message}", "timestamp": {n}, "datetime": "2024-03-01T10:00:00Z", "timestamp_desc": "Time", "data_type": "syslog:line"}}"#
    )
}

async fn message_clusters(h: &Harness, index: &str) -> BTreeSet<BTreeSet<String>> {
    let scorer = SimilarityScorer::new(h.datastore.clone(), SimilarityConfig::default()).unwrap();
    let report = scorer.score(index, "syslog:line").await.unwrap();
    report
        .clusters
        .iter()
        .map(|cluster| {
            cluster
                .members
                .iter()
                .map(|id| {
                    let doc = h.datastore.document(index, id).unwrap();
                    doc["message"].as_str().unwrap().to_string()
                })
                .collect()
        })
        .collect()
}

#[tokio::test]
async fn clusters_do_not_depend_on_ingestion_order() {
    let h = Harness::new();
    let base = "kernel audit type 1400 apparmor denied operation open profile snap firefox \
                name proc pressure memory pid 4242 comm firefox requested mask read denied mask read \
                fsuid 1000 ouid 0 class file";
    let messages = vec![
        format!("{base} attempt one"),
        "sshd accepted publickey for deploy from 198.51.100.7 port 50022 ssh2".to_string(),
        format!("{base} attempt two"),
        "cron session opened for user root by uid 0".to_string(),
        format!("{base} attempt three"),
        "sshd accepted publickey for deploy from 198.51.100.7 port 50022 ssh2".to_string(),
        "systemd resolved using degraded feature set udp instead of edns0 for dns server".to_string(),
    ];

    let forward: Vec<String> = messages
        .iter()
        .enumerate()
        .map(|(n, m)| syslog_line(m, n))
        .collect();
    let mut backward = forward.clone();
    backward.reverse();

    let fwd = h.file("fwd.jsonl", &(forward.join("\n") + "\n"));
    let rev = h.file("rev.jsonl", &(backward.join("\n") + "\n"));
    h.ingestor
        .ingest(request("fwd", fwd, SourceFormat::Jsonl, "fwd"))
        .await
        .unwrap();
    h.ingestor
        .ingest(request("rev", rev, SourceFormat::Jsonl, "rev"))
        .await
        .unwrap();

    let forward_clusters = message_clusters(&h, "fwd").await;
    let backward_clusters = message_clusters(&h, "rev").await;
    assert_eq!(forward_clusters, backward_clusters);

    let near_duplicates: BTreeSet<String> = [0, 2, 4].iter().map(|&i| messages[i].clone()).collect();
    assert!(forward_clusters.contains(&near_duplicates));
}
