//! Change-data-capture pipeline core.
//!
//! Propagates committed table changes into an ordered event stream and lets
//! consumers answer "what is the last known write time for this key" with
//! read-your-writes consistency. Three problems live here: lossless
//! re-encoding of column values into a wire schema ([`marshal`]), collapsing
//! the duplicate mutation copies every replica emits ([`dedup`]), and routing
//! point lookups to the consumer node that owns a key's hash bucket
//! ([`router`]). The [`backfill`] importer seeds the same stream from bulk
//! exports using the identical data model.

pub mod backfill;
pub mod bus;
pub mod dedup;
pub mod error;
pub mod marshal;
pub mod model;
pub mod resolver;
pub mod router;
pub mod sender;
pub mod service;

pub use error::CdcError;
pub use model::{Mutation, MutationKind, TableRef};
