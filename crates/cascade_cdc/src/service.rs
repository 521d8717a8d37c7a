//! Consumer-node wiring and the writetime query surface.
//!
//! A read request resolves to either a writetime or one of the named routing
//! errors; routing and readiness are checked synchronously before the sink is
//! consulted so a node only answers for keys whose writes it also observes.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::BusClient;
use crate::dedup::{DedupDecision, DigestDeduplicator, SinkWriter};
use crate::error::CdcError;
use crate::marshal::WireValue;
use crate::model::{self, MutationKey, TableRef};
use crate::router::ClusterHashRouter;

/// Read surface over the sink, gated by the hash router.
pub struct WritetimeService {
    router: Arc<ClusterHashRouter>,
    sink: Arc<dyn SinkWriter>,
}

impl WritetimeService {
    pub fn new(router: Arc<ClusterHashRouter>, sink: Arc<dyn SinkWriter>) -> Self {
        Self { router, sink }
    }

    /// Last known write time for a single-text-key document.
    ///
    /// Fails with `ServiceNotRunning` or `HashNotManaged` before any lookup
    /// happens, and with `WritetimeNotFound` when routing passed but the key
    /// has no applied record.
    pub fn get_writetime(
        &self,
        keyspace: &str,
        table: &str,
        id: &str,
        hash: Option<u64>,
    ) -> Result<i64, CdcError> {
        let key = model::encode_pk_key(&vec![Some(WireValue::Text(id.to_string()))]);
        self.get_writetime_key(TableRef::new(keyspace, table), key, hash)
    }

    /// Composite-key variant: the caller supplies canonical key bytes.
    pub fn get_writetime_key(
        &self,
        table: TableRef,
        key: Vec<u8>,
        hash: Option<u64>,
    ) -> Result<i64, CdcError> {
        self.router.check_hash(hash)?;
        let key = MutationKey { table, key };
        self.sink
            .last_writetime(&key)
            .ok_or_else(|| CdcError::WritetimeNotFound(format!("{}", key.table)))
    }
}

/// One consumer node: drains a table topic from the bus and feeds the
/// deduplicator. Malformed payloads are logged and skipped, never fatal.
pub struct ConsumerNode {
    bus: Arc<dyn BusClient>,
    dedup: Arc<DigestDeduplicator>,
}

impl ConsumerNode {
    pub fn new(bus: Arc<dyn BusClient>, dedup: Arc<DigestDeduplicator>) -> Self {
        Self { bus, dedup }
    }

    /// Consume everything currently delivered for `table`, returning how many
    /// mutations were applied to the sink.
    pub async fn consume_table(&self, table: &TableRef) -> Result<u64, CdcError> {
        let messages = self.bus.subscribe(&table.topic()).await?;
        let mut applied = 0u64;
        for message in messages {
            let mutation = match model::decode_message(table.clone(), &message.key, &message.payload)
            {
                Ok(mutation) => mutation,
                Err(err) => {
                    warn!(table = %table, error = %err, "dropping undecodable message");
                    continue;
                }
            };
            if self.dedup.observe(&mutation) == DedupDecision::Applied {
                applied += 1;
            }
        }
        debug!(table = %table, applied, "topic drained");
        Ok(applied)
    }
}
