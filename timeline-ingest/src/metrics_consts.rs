pub const RECORDS_SKIPPED: &str = "timeline_ingest_records_skipped";
pub const RECORDS_WRITTEN: &str = "timeline_ingest_records_written";
pub const FLUSHES: &str = "timeline_ingest_flushes";
pub const FLUSH_FAILURES: &str = "timeline_ingest_flush_failures";
pub const FLUSH_TIME: &str = "timeline_ingest_flush_seconds";
pub const FLUSH_BATCH_SIZE: &str = "timeline_ingest_flush_batch_size";
pub const REGISTRATIONS_CREATED: &str = "timeline_ingest_registrations_created";
pub const INDICES_DELETED: &str = "timeline_ingest_indices_deleted";
pub const SIMILARITY_EVENTS_SCORED: &str = "timeline_ingest_similarity_events_scored";
pub const SIMILARITY_CLUSTERS: &str = "timeline_ingest_similarity_clusters";
pub const SIMILARITY_TIME: &str = "timeline_ingest_similarity_seconds";
