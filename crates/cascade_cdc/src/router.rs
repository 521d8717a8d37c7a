//! Cluster hash-ownership routing.
//!
//! Each consumer node owns a set of hash-bucket ranges; a read is only served
//! by the node that also observes all deliveries for that key. The ownership
//! table is rebuilt wholesale on membership change and installed as an atomic
//! snapshot swap; readers evaluate against whichever snapshot they grabbed, so
//! a request racing a membership change may wrongly fail with `HashNotManaged`.
//! Callers treat that as retryable against fresh membership, never as
//! permanent.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::CdcError;

/// Hashing contract shared by the router and the dedup partitioning
/// assumption: one function, stable for the life of the cluster.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Node lifecycle; only `Running` serves requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// One contiguous bucket range, end-inclusive, owned by exactly one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketRange {
    pub start: u64,
    pub end: u64,
    pub owner: u64,
}

/// Immutable ownership snapshot: sorted, non-overlapping ranges collectively
/// covering the entire hash space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipTable {
    buckets: Vec<BucketRange>,
}

impl OwnershipTable {
    /// Rebuild the whole table for a membership list, splitting the hash
    /// space into one even range per live node. Never produces a partial
    /// table: membership changes always come through here.
    pub fn rebuild(members: &[u64]) -> Result<Self, CdcError> {
        if members.is_empty() {
            return Err(CdcError::InvalidKeyDescriptor(
                "ownership table requires at least one member".into(),
            ));
        }
        let count = members.len() as u64;
        let width = u64::MAX / count;
        let mut buckets = Vec::with_capacity(members.len());
        let mut start = 0u64;
        for (idx, owner) in members.iter().enumerate() {
            let end = if idx as u64 == count - 1 {
                u64::MAX
            } else {
                start + width
            };
            buckets.push(BucketRange {
                start,
                end,
                owner: *owner,
            });
            start = end.wrapping_add(1);
        }
        Ok(Self { buckets })
    }

    /// The node owning `hash`. Total: every hash falls in exactly one bucket.
    pub fn owner_of(&self, hash: u64) -> u64 {
        let idx = self
            .buckets
            .partition_point(|bucket| bucket.end < hash)
            .min(self.buckets.len() - 1);
        self.buckets[idx].owner
    }

    pub fn buckets(&self) -> &[BucketRange] {
        &self.buckets
    }
}

/// Per-node routing gate evaluated synchronously before serving a read.
pub struct ClusterHashRouter {
    node_id: u64,
    lifecycle: RwLock<NodeLifecycle>,
    ownership: RwLock<Arc<OwnershipTable>>,
}

impl ClusterHashRouter {
    pub fn new(node_id: u64, initial: OwnershipTable) -> Self {
        Self {
            node_id,
            lifecycle: RwLock::new(NodeLifecycle::NotStarted),
            ownership: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn start(&self) {
        if let Ok(mut lifecycle) = self.lifecycle.write() {
            *lifecycle = NodeLifecycle::Running;
        }
        info!(node_id = self.node_id, "router running");
    }

    pub fn stop(&self) {
        if let Ok(mut lifecycle) = self.lifecycle.write() {
            *lifecycle = NodeLifecycle::Stopped;
        }
        info!(node_id = self.node_id, "router stopped");
    }

    pub fn lifecycle(&self) -> NodeLifecycle {
        self.lifecycle
            .read()
            .map(|l| *l)
            .unwrap_or(NodeLifecycle::Stopped)
    }

    /// Install a freshly rebuilt ownership table. Wholesale swap: in-flight
    /// requests keep the snapshot they already hold.
    pub fn install(&self, table: OwnershipTable) {
        if let Ok(mut ownership) = self.ownership.write() {
            *ownership = Arc::new(table);
        }
        info!(node_id = self.node_id, "ownership table replaced");
    }

    /// Current snapshot, for callers that need to find the owning node after
    /// a `HashNotManaged` redirect.
    pub fn snapshot(&self) -> Arc<OwnershipTable> {
        self.ownership
            .read()
            .map(|ownership| Arc::clone(&ownership))
            .unwrap_or_else(|e| Arc::clone(&e.into_inner()))
    }

    /// Gate one request. Absent hash means no specific placement is required;
    /// the call then succeeds iff the node is running.
    pub fn check_hash(&self, hash: Option<u64>) -> Result<(), CdcError> {
        if self.lifecycle() != NodeLifecycle::Running {
            return Err(CdcError::ServiceNotRunning);
        }
        let Some(hash) = hash else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        if snapshot.owner_of(hash) == self.node_id {
            Ok(())
        } else {
            Err(CdcError::HashNotManaged(hash))
        }
    }
}
