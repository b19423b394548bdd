use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Instant,
};

use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use siphasher::sip::SipHasher13;
use tracing::{debug, info};

use crate::{
    datastore::{Annotation, Datastore},
    error::SimilarityError,
    event::{EventId, MESSAGE},
    metrics_consts::{SIMILARITY_CLUSTERS, SIMILARITY_EVENTS_SCORED, SIMILARITY_TIME},
};

pub mod minhash;
pub mod shingle;
pub mod union_find;

use minhash::{estimated_jaccard, MinHasher};
use union_find::UnionFind;

pub const CLUSTER_ID_FIELD: &str = "similarity_cluster_id";
pub const CLUSTER_SIZE_FIELD: &str = "similarity_cluster_size";

// Annotations sent per bulk update request
const ANNOTATION_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityConfig {
    /// Estimated Jaccard similarity at or above which two events are merged.
    pub threshold: f64,
    pub shingle_size: usize,
    pub bands: usize,
    pub rows: usize,
    /// The event field whose text is compared.
    pub field: String,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            shingle_size: 2,
            bands: 16,
            rows: 4,
            field: MESSAGE.to_string(),
        }
    }
}

impl SimilarityConfig {
    pub fn signature_len(&self) -> usize {
        self.bands * self.rows
    }

    pub fn validate(&self) -> Result<(), SimilarityError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(SimilarityError::InvalidConfig(format!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.shingle_size == 0 || self.bands == 0 || self.rows == 0 {
            return Err(SimilarityError::InvalidConfig(
                "shingle_size, bands and rows must all be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Content addressed: the same data type and lowest member always give the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(data_type: &str, lowest_member: &str) -> Self {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(data_type.as_bytes());
        hasher.write_u8(0xff);
        hasher.write(lowest_member.as_bytes());
        ClusterId(format!("{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Sorted, the first member is the one the id is derived from.
    pub members: Vec<EventId>,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SimilarityReport {
    pub data_type: String,
    pub clusters: Vec<Cluster>,
    pub assignments: BTreeMap<EventId, ClusterId>,
}

impl SimilarityReport {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn cluster_of(&self, event: &str) -> Option<&ClusterId> {
        self.assignments.get(event)
    }
}

/// Groups signatures into near-duplicate clusters and returns, for every
/// signature, the index of the lowest-indexed member of its cluster.
///
/// Identical signatures are merged up front and only one of each takes part
/// in banding. Signatures are split into `bands` bands of `rows` values and
/// two become candidates when any band matches exactly. Within a bucket each
/// signature is compared against one representative per cluster already seen
/// there, and merged with every cluster whose representative reaches
/// `threshold`. Distinct signatures and buckets are visited in content order,
/// so the partition does not depend on the order of the input.
pub fn cluster_signatures(
    signatures: &[Vec<u64>],
    bands: usize,
    rows: usize,
    threshold: f64,
) -> Result<Vec<usize>, SimilarityError> {
    let len = bands * rows;
    if let Some(bad) = signatures.iter().position(|s| s.len() != len) {
        return Err(SimilarityError::InvalidConfig(format!(
            "signature {} has {} values, expected {} bands x {} rows",
            bad,
            signatures[bad].len(),
            bands,
            rows
        )));
    }

    let mut uf = UnionFind::new(signatures.len());

    // First index of every distinct signature, keyed by its content
    let mut distinct: BTreeMap<&[u64], usize> = BTreeMap::new();
    for (i, sig) in signatures.iter().enumerate() {
        match distinct.get(sig.as_slice()) {
            Some(&first) => {
                uf.union(first, i);
            }
            None => {
                distinct.insert(sig.as_slice(), i);
            }
        }
    }
    let distinct: Vec<usize> = distinct.into_values().collect();

    for band in 0..bands {
        let mut buckets: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for &i in &distinct {
            let slice = &signatures[i][band * rows..(band + 1) * rows];
            buckets.entry(band_key(band, slice)).or_default().push(i);
        }

        for members in buckets.values().filter(|m| m.len() > 1) {
            let mut reps: Vec<usize> = Vec::new();
            for &member in members {
                let root = uf.find(member);
                if reps.iter().any(|&rep| uf.find(rep) == root) {
                    continue;
                }
                let mut merged = false;
                for &rep in &reps {
                    if uf.find(rep) != uf.find(member)
                        && estimated_jaccard(&signatures[rep], &signatures[member]) >= threshold
                    {
                        uf.union(rep, member);
                        merged = true;
                    }
                }
                if !merged {
                    reps.push(member);
                }
            }
        }
    }

    Ok(uf.roots())
}

fn band_key(band: usize, slice: &[u64]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(band as u64, 0);
    slice.hash(&mut hasher);
    hasher.finish()
}

pub struct SimilarityScorer {
    datastore: Arc<dyn Datastore>,
    config: SimilarityConfig,
}

impl SimilarityScorer {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        config: SimilarityConfig,
    ) -> Result<Self, SimilarityError> {
        config.validate()?;
        Ok(Self { datastore, config })
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// Clusters every event of `data_type` in `index` and writes each event's
    /// cluster id and size back onto it.
    pub async fn score(
        &self,
        index: &str,
        data_type: &str,
    ) -> Result<SimilarityReport, SimilarityError> {
        let start = Instant::now();
        let mut events = self.datastore.events_by_data_type(index, data_type).await?;
        if events.is_empty() {
            info!(index = %index, data_type = %data_type, "No events to score");
            return Ok(SimilarityReport {
                data_type: data_type.to_string(),
                ..Default::default()
            });
        }

        events.sort_by(|a, b| a.id.cmp(&b.id));
        let texts: Vec<String> = events
            .iter()
            .map(|e| {
                e.record
                    .text_field(&self.config.field)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        let signatures = self.signatures(texts).await?;
        let roots = cluster_signatures(
            &signatures,
            self.config.bands,
            self.config.rows,
            self.config.threshold,
        )?;

        let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, root) in roots.iter().enumerate() {
            grouped.entry(*root).or_default().push(i);
        }

        let mut clusters = Vec::with_capacity(grouped.len());
        let mut assignments = BTreeMap::new();
        let mut annotations = Vec::with_capacity(events.len());
        for (root, members) in grouped {
            // Events are sorted, so the root is the lowest id
            let id = ClusterId::new(data_type, &events[root].id);
            let member_ids: Vec<EventId> = members.iter().map(|&i| events[i].id.clone()).collect();
            for member in &member_ids {
                let mut fields = Map::new();
                fields.insert(CLUSTER_ID_FIELD.to_string(), Value::from(id.as_str()));
                fields.insert(CLUSTER_SIZE_FIELD.to_string(), Value::from(member_ids.len()));
                annotations.push(Annotation {
                    id: member.clone(),
                    fields,
                });
                assignments.insert(member.clone(), id.clone());
            }
            clusters.push(Cluster {
                id,
                members: member_ids,
            });
        }

        for chunk in annotations.chunks(ANNOTATION_BATCH) {
            self.datastore.annotate(index, chunk).await?;
        }

        metrics::counter!(SIMILARITY_EVENTS_SCORED).increment(events.len() as u64);
        metrics::counter!(SIMILARITY_CLUSTERS).increment(clusters.len() as u64);
        metrics::histogram!(SIMILARITY_TIME).record(start.elapsed().as_secs_f64());
        info!(
            index = %index,
            data_type = %data_type,
            events = events.len(),
            clusters = clusters.len(),
            "Scored similarity"
        );

        Ok(SimilarityReport {
            data_type: data_type.to_string(),
            clusters,
            assignments,
        })
    }

    // CPU bound, so it runs on the rayon pool and the result comes back over a oneshot
    async fn signatures(&self, texts: Vec<String>) -> Result<Vec<Vec<u64>>, SimilarityError> {
        let hasher = MinHasher::new(self.config.signature_len());
        let k = self.config.shingle_size;
        let (tx, rx) = tokio::sync::oneshot::channel();

        rayon::spawn(move || {
            let work = || {
                texts
                    .par_iter()
                    .map(|text| hasher.signature(&shingle::shingles(text, k)))
                    .collect::<Vec<_>>()
            };
            if let Ok(sigs) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)) {
                drop(tx.send(sigs));
            }
        });

        let signatures = rx.await.map_err(|_| SimilarityError::WorkerLost)?;
        debug!("Computed {} signatures", signatures.len());
        Ok(signatures)
    }
}
