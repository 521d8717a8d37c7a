//! Error taxonomy for the CDC pipeline.
//!
//! Routing and readiness failures are distinct named variants so a caller can
//! decide to redirect (`HashNotManaged`) versus retry (`ServiceNotRunning`,
//! `BrokerUnavailable`) versus fail the single column or row
//! (`UnsupportedType`, `MissingColumn`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    /// A column carried a type tag the wire schema cannot represent, or a
    /// value that does not match its tag. Fatal for the column, never retried.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// A primary-key column declared by the table was absent from an exported
    /// row. Fatal for the row; sibling rows keep going.
    #[error("missing primary key column: {0}")]
    MissingColumn(String),

    /// The message bus rejected or dropped a publish. Transient; the sender
    /// retries with bounded backoff before marking the row failed.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The consumer node is not in the `Running` lifecycle state.
    #[error("service not running")]
    ServiceNotRunning,

    /// The hash falls outside this node's owned bucket ranges. The caller must
    /// redirect to the owning node using fresher membership information.
    #[error("hash {0} not managed by this node")]
    HashNotManaged(u64),

    /// No writetime has been applied for the requested key.
    #[error("no writetime recorded for key {0}")]
    WritetimeNotFound(String),

    /// The table's primary-key descriptor is empty or out of order.
    #[error("invalid primary key descriptor: {0}")]
    InvalidKeyDescriptor(String),

    /// Malformed canonical bytes (bus key or payload).
    #[error("codec error: {0}")]
    Codec(String),
}

impl CdcError {
    /// Whether the caller may retry the same operation after a delay.
    ///
    /// `HashNotManaged` is deliberately excluded: retrying against the same
    /// node without fresher membership data can never succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CdcError::BrokerUnavailable(_) | CdcError::ServiceNotRunning
        )
    }
}
