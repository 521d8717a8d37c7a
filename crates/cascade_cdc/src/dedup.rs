//! Digest-based deduplication of replica deliveries.
//!
//! Every source replica independently emits the same logical change, so with
//! replication factor R each mutation arrives R times. The deduplicator keeps
//! per-key state and applies exactly one copy to the sink, resolving conflicts
//! by writetime and recognizing duplicates by digest. The routing layer
//! partitions the key space across nodes, so dedup state for a key is only
//! ever touched by the node owning that key's hash bucket; within a node the
//! per-key mutex makes the apply-or-discard decision atomic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::model::{Mutation, MutationKey};

/// Outcome of observing one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupDecision {
    /// First delivery for this key, or a strictly newer writetime: applied to
    /// the sink.
    Applied,
    /// Equal writetime, identical digest: the expected replica duplicate.
    DuplicateDiscarded,
    /// Equal writetime but a different digest: replicas disagree on content.
    /// Surfaced as an anomaly; the earlier application stands.
    AnomalyRecorded,
    /// Older writetime than the applied one.
    StaleDiscarded,
}

/// Downstream index seam. The deduplicator applies exactly one copy of each
/// logical change through this.
pub trait SinkWriter: Send + Sync + 'static {
    fn apply(&self, mutation: &Mutation);
    fn last_writetime(&self, key: &MutationKey) -> Option<i64>;
}

#[derive(Debug, Default)]
struct KeyState {
    seen_nodes: HashSet<u64>,
    applied: Option<AppliedRecord>,
}

#[derive(Debug, Clone)]
struct AppliedRecord {
    digest: String,
    writetime: i64,
    node_id: u64,
}

pub struct DigestDeduplicator {
    sink: Arc<dyn SinkWriter>,
    // Outer map grows one entry per live key; the per-key mutex serializes
    // concurrent deliveries for the same key without contending across keys.
    // Retention/eviction of settled keys is an external tuning concern.
    states: RwLock<HashMap<MutationKey, Arc<Mutex<KeyState>>>>,
    anomalies: AtomicU64,
}

impl DigestDeduplicator {
    pub fn new(sink: Arc<dyn SinkWriter>) -> Self {
        Self {
            sink,
            states: RwLock::new(HashMap::new()),
            anomalies: AtomicU64::new(0),
        }
    }

    /// Count of equal-writetime digest mismatches observed so far.
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    fn state_for(&self, key: &MutationKey) -> Arc<Mutex<KeyState>> {
        if let Ok(states) = self.states.read() {
            if let Some(state) = states.get(key) {
                return Arc::clone(state);
            }
        }
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(states.entry(key.clone()).or_default())
    }

    /// Decide and (if warranted) apply one delivered mutation.
    pub fn observe(&self, mutation: &Mutation) -> DedupDecision {
        let key = mutation.mutation_key();
        let state = self.state_for(&key);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.seen_nodes.insert(mutation.node_id);

        let decision = match &state.applied {
            None => DedupDecision::Applied,
            Some(applied) if mutation.writetime > applied.writetime => DedupDecision::Applied,
            Some(applied) if mutation.writetime == applied.writetime => {
                if applied.digest == mutation.digest {
                    DedupDecision::DuplicateDiscarded
                } else {
                    DedupDecision::AnomalyRecorded
                }
            }
            Some(_) => DedupDecision::StaleDiscarded,
        };

        match decision {
            DedupDecision::Applied => {
                self.sink.apply(mutation);
                state.applied = Some(AppliedRecord {
                    digest: mutation.digest.clone(),
                    writetime: mutation.writetime,
                    node_id: mutation.node_id,
                });
            }
            DedupDecision::DuplicateDiscarded => {
                debug!(
                    table = %mutation.table,
                    node_id = mutation.node_id,
                    "replica duplicate discarded"
                );
            }
            DedupDecision::AnomalyRecorded => {
                // Replicas disagree on content for an identical writetime.
                // This is a correctness signal to surface, not to resolve
                // unilaterally; the earlier application is kept.
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                let applied = state.applied.as_ref().map(|a| a.node_id);
                warn!(
                    table = %mutation.table,
                    writetime = mutation.writetime,
                    incoming_node = mutation.node_id,
                    applied_node = ?applied,
                    incoming_digest = %mutation.digest,
                    "digest mismatch at equal writetime"
                );
            }
            DedupDecision::StaleDiscarded => {
                debug!(
                    table = %mutation.table,
                    writetime = mutation.writetime,
                    "stale duplicate discarded"
                );
            }
        }
        decision
    }
}

/// In-memory sink recording the last applied writetime per key. Backs the
/// writetime query surface and the test assertions.
#[derive(Default)]
pub struct MemorySink {
    writetimes: RwLock<HashMap<MutationKey, i64>>,
    applied: Mutex<Vec<Mutation>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn applied(&self) -> Vec<Mutation> {
        self.applied
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl SinkWriter for MemorySink {
    fn apply(&self, mutation: &Mutation) {
        if let Ok(mut writetimes) = self.writetimes.write() {
            writetimes.insert(mutation.mutation_key(), mutation.writetime);
        }
        if let Ok(mut log) = self.applied.lock() {
            log.push(mutation.clone());
        }
    }

    fn last_writetime(&self, key: &MutationKey) -> Option<i64> {
        self.writetimes.read().ok()?.get(key).copied()
    }
}
