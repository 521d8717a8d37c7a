//! Mutation data model and canonical wire codec.
//!
//! One [`Mutation`] is created per logical change, either by the tailing agent
//! or synthetically at backfill time, and never mutated afterwards. The
//! canonical byte encodings here are the deduplication contract: two replicas
//! emitting the same logical change must serialize to identical bytes and
//! therefore identical digests, so every encoder is deterministic
//! (length-prefixed big-endian, fixed field order, node id excluded from the
//! digest input).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CdcError;
use crate::marshal::{TypeTag, WireValue};

/// Immutable (keyspace, table) identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub keyspace: String,
    pub table: String,
}

impl TableRef {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
        }
    }

    /// Per-table bus topic, `events-{keyspace}.{table}`.
    pub fn topic(&self) -> String {
        format!("events-{}.{}", self.keyspace, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}

/// Role of a column within its table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    PartitionKey,
    Clustering,
    Regular,
    Static,
}

/// One declared column: name, logical type, role, and ordinal position
/// within that role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub tag: TypeTag,
    pub role: ColumnRole,
    pub position: usize,
}

/// Ordered primary-key descriptor: partition-key columns first (by position),
/// then clustering columns (by position).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PkDescriptor {
    columns: Vec<ColumnSpec>,
}

impl PkDescriptor {
    /// Build a descriptor from declared columns, keeping only key columns and
    /// enforcing the canonical order. Every table must yield a non-empty,
    /// uniquely ordered descriptor.
    pub fn from_columns(columns: &[ColumnSpec]) -> Result<Self, CdcError> {
        let mut partition: Vec<ColumnSpec> = columns
            .iter()
            .filter(|c| c.role == ColumnRole::PartitionKey)
            .cloned()
            .collect();
        let mut clustering: Vec<ColumnSpec> = columns
            .iter()
            .filter(|c| c.role == ColumnRole::Clustering)
            .cloned()
            .collect();
        partition.sort_by_key(|c| c.position);
        clustering.sort_by_key(|c| c.position);

        if partition.is_empty() {
            return Err(CdcError::InvalidKeyDescriptor(
                "table has no partition key columns".into(),
            ));
        }
        for group in [&partition, &clustering] {
            for (idx, col) in group.iter().enumerate() {
                if col.position != idx {
                    return Err(CdcError::InvalidKeyDescriptor(format!(
                        "column {} has position {} but sorts at {}",
                        col.name, col.position, idx
                    )));
                }
            }
        }

        partition.extend(clustering);
        Ok(Self { columns: partition })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Ordered key values, one per descriptor entry. `None` marks a logically
/// deleted or not-yet-set column (static-only updates, partition deletes).
pub type PkTuple = Vec<Option<WireValue>>;

/// Kind of logical change carried by a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Update,
    PartitionDelete,
    RangeDelete,
}

impl MutationKind {
    fn to_byte(self) -> u8 {
        match self {
            MutationKind::Insert => 0,
            MutationKind::Update => 1,
            MutationKind::PartitionDelete => 2,
            MutationKind::RangeDelete => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CdcError> {
        match byte {
            0 => Ok(MutationKind::Insert),
            1 => Ok(MutationKind::Update),
            2 => Ok(MutationKind::PartitionDelete),
            3 => Ok(MutationKind::RangeDelete),
            other => Err(CdcError::Codec(format!("unknown mutation kind {other}"))),
        }
    }
}

/// Identity of one logical row on the consumer side: table plus canonical
/// primary-key bytes. Dedup state and sink writetimes are keyed by this.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MutationKey {
    pub table: TableRef,
    pub key: Vec<u8>,
}

/// Canonical record of one logical change. Immutable after construction; the
/// digest is fixed at build time.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub table: TableRef,
    pub pk: PkTuple,
    /// Source-assigned logical timestamp in microseconds. Monotonic per
    /// column, not globally ordered across keys.
    pub writetime: i64,
    /// Identifier of the replica that emitted this copy. Excluded from the
    /// digest so replica copies stay byte-identical where it matters.
    pub node_id: u64,
    /// Hex SHA-256 over the canonical body (table, key, writetime, kind,
    /// cells).
    pub digest: String,
    pub kind: MutationKind,
    /// Non-key column values by name, `None` for deleted cells.
    pub cells: Vec<(String, Option<WireValue>)>,
}

impl Mutation {
    pub fn new(
        table: TableRef,
        pk: PkTuple,
        writetime: i64,
        node_id: u64,
        kind: MutationKind,
        cells: Vec<(String, Option<WireValue>)>,
    ) -> Self {
        let digest = compute_digest(&table, &pk, writetime, kind, &cells);
        Self {
            table,
            pk,
            writetime,
            node_id,
            digest,
            kind,
            cells,
        }
    }

    /// Canonical bus key bytes for this mutation's primary key.
    pub fn key_bytes(&self) -> Vec<u8> {
        encode_pk_key(&self.pk)
    }

    pub fn mutation_key(&self) -> MutationKey {
        MutationKey {
            table: self.table.clone(),
            key: self.key_bytes(),
        }
    }
}

fn compute_digest(
    table: &TableRef,
    pk: &PkTuple,
    writetime: i64,
    kind: MutationKind,
    cells: &[(String, Option<WireValue>)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table.to_string().as_bytes());
    hasher.update(encode_pk_key(pk));
    hasher.update(writetime.to_be_bytes());
    hasher.update([kind.to_byte()]);
    for (name, value) in cells {
        let mut buf = Vec::new();
        write_str(&mut buf, name);
        write_opt_value(&mut buf, value);
        hasher.update(&buf);
    }
    hex::encode(hasher.finalize())
}

// Wire value tag bytes for the canonical codec. 0x00 is reserved for absent
// cells.
const WV_TEXT: u8 = 0x01;
const WV_BOOLEAN: u8 = 0x02;
const WV_BYTES: u8 = 0x03;
const WV_INT: u8 = 0x04;
const WV_BIGINT: u8 = 0x05;
const WV_FLOAT: u8 = 0x06;
const WV_DOUBLE: u8 = 0x07;
const WV_DATE: u8 = 0x08;
const WV_VARINT: u8 = 0x09;
const WV_DECIMAL: u8 = 0x0a;
const WV_DURATION: u8 = 0x0b;
const WV_ABSENT: u8 = 0x00;

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn write_value(out: &mut Vec<u8>, value: &WireValue) {
    match value {
        WireValue::Text(s) => {
            out.push(WV_TEXT);
            write_str(out, s);
        }
        WireValue::Boolean(b) => {
            out.push(WV_BOOLEAN);
            out.push(*b as u8);
        }
        WireValue::Bytes(b) => {
            out.push(WV_BYTES);
            write_bytes(out, b);
        }
        WireValue::Int(v) => {
            out.push(WV_INT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        WireValue::BigInt(v) => {
            out.push(WV_BIGINT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        WireValue::Float(v) => {
            out.push(WV_FLOAT);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        WireValue::Double(v) => {
            out.push(WV_DOUBLE);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        WireValue::Date(v) => {
            out.push(WV_DATE);
            out.extend_from_slice(&v.to_be_bytes());
        }
        WireValue::VarInt(b) => {
            out.push(WV_VARINT);
            write_bytes(out, b);
        }
        WireValue::Decimal { unscaled, scale } => {
            out.push(WV_DECIMAL);
            write_bytes(out, unscaled);
            out.extend_from_slice(&scale.to_be_bytes());
        }
        WireValue::Duration {
            months,
            days,
            nanos,
        } => {
            out.push(WV_DURATION);
            out.extend_from_slice(&months.to_be_bytes());
            out.extend_from_slice(&days.to_be_bytes());
            out.extend_from_slice(&nanos.to_be_bytes());
        }
    }
}

fn write_opt_value(out: &mut Vec<u8>, value: &Option<WireValue>) {
    match value {
        None => out.push(WV_ABSENT),
        Some(v) => write_value(out, v),
    }
}

fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8, CdcError> {
    let Some(byte) = data.get(*offset) else {
        return Err(CdcError::Codec("short u8".into()));
    };
    *offset += 1;
    Ok(*byte)
}

fn read_exact<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], CdcError> {
    if *offset + len > data.len() {
        return Err(CdcError::Codec(format!("short read of {len} bytes")));
    }
    let out = &data[*offset..*offset + len];
    *offset += len;
    Ok(out)
}

fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16, CdcError> {
    let bytes = read_exact(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, CdcError> {
    let bytes = read_exact(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(data: &[u8], offset: &mut usize) -> Result<i32, CdcError> {
    Ok(read_u32(data, offset)? as i32)
}

fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64, CdcError> {
    let bytes = read_exact(data, offset, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

fn read_i64(data: &[u8], offset: &mut usize) -> Result<i64, CdcError> {
    Ok(read_u64(data, offset)? as i64)
}

fn read_len_bytes(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, CdcError> {
    let len = read_u32(data, offset)? as usize;
    Ok(read_exact(data, offset, len)?.to_vec())
}

fn read_str(data: &[u8], offset: &mut usize) -> Result<String, CdcError> {
    let bytes = read_len_bytes(data, offset)?;
    String::from_utf8(bytes).map_err(|err| CdcError::Codec(format!("bad utf8: {err}")))
}

fn read_opt_value(data: &[u8], offset: &mut usize) -> Result<Option<WireValue>, CdcError> {
    let tag = read_u8(data, offset)?;
    let value = match tag {
        WV_ABSENT => return Ok(None),
        WV_TEXT => WireValue::Text(read_str(data, offset)?),
        WV_BOOLEAN => WireValue::Boolean(read_u8(data, offset)? != 0),
        WV_BYTES => WireValue::Bytes(read_len_bytes(data, offset)?),
        WV_INT => WireValue::Int(read_i32(data, offset)?),
        WV_BIGINT => WireValue::BigInt(read_i64(data, offset)?),
        WV_FLOAT => WireValue::Float(f32::from_bits(read_u32(data, offset)?)),
        WV_DOUBLE => WireValue::Double(f64::from_bits(read_u64(data, offset)?)),
        WV_DATE => WireValue::Date(read_u32(data, offset)?),
        WV_VARINT => WireValue::VarInt(read_len_bytes(data, offset)?),
        WV_DECIMAL => {
            let unscaled = read_len_bytes(data, offset)?;
            let scale = read_i32(data, offset)?;
            WireValue::Decimal { unscaled, scale }
        }
        WV_DURATION => {
            let months = read_i32(data, offset)?;
            let days = read_i32(data, offset)?;
            let nanos = read_i64(data, offset)?;
            WireValue::Duration {
                months,
                days,
                nanos,
            }
        }
        other => return Err(CdcError::Codec(format!("unknown value tag {other:#04x}"))),
    };
    Ok(Some(value))
}

/// Canonical encoding of a primary-key tuple: cell count followed by each
/// cell's tagged encoding in descriptor order. Composite keys therefore get a
/// single defined key encoding covering all key fields.
pub fn encode_pk_key(pk: &PkTuple) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(pk.len() as u16).to_be_bytes());
    for cell in pk {
        write_opt_value(&mut out, cell);
    }
    out
}

/// Inverse of [`encode_pk_key`]. The codec is self-describing, so no
/// descriptor is needed to recover the tuple.
pub fn decode_pk_key(data: &[u8]) -> Result<PkTuple, CdcError> {
    let mut offset = 0usize;
    let count = read_u16(data, &mut offset)? as usize;
    let mut pk = Vec::with_capacity(count);
    for _ in 0..count {
        pk.push(read_opt_value(data, &mut offset)?);
    }
    if offset != data.len() {
        return Err(CdcError::Codec("trailing bytes after pk tuple".into()));
    }
    Ok(pk)
}

const MESSAGE_VERSION: u8 = 1;

/// Serialize the bus payload: node id, writetime, digest, kind, and non-key
/// cells. The primary key travels separately as the message key.
pub fn encode_message(mutation: &Mutation) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(MESSAGE_VERSION);
    out.extend_from_slice(&mutation.node_id.to_be_bytes());
    out.extend_from_slice(&mutation.writetime.to_be_bytes());
    out.push(mutation.kind.to_byte());
    write_str(&mut out, &mutation.digest);
    out.extend_from_slice(&(mutation.cells.len() as u16).to_be_bytes());
    for (name, value) in &mutation.cells {
        write_str(&mut out, name);
        write_opt_value(&mut out, value);
    }
    out
}

/// Rebuild a [`Mutation`] from a delivered bus message. The digest is the one
/// carried on the wire, not recomputed; the deduplicator compares digests, it
/// does not re-derive them.
pub fn decode_message(table: TableRef, key: &[u8], payload: &[u8]) -> Result<Mutation, CdcError> {
    let mut offset = 0usize;
    let version = read_u8(payload, &mut offset)?;
    if version != MESSAGE_VERSION {
        return Err(CdcError::Codec(format!(
            "unknown message version {version}"
        )));
    }
    let node_id = read_u64(payload, &mut offset)?;
    let writetime = read_i64(payload, &mut offset)?;
    let kind = MutationKind::from_byte(read_u8(payload, &mut offset)?)?;
    let digest = read_str(payload, &mut offset)?;
    let cell_count = read_u16(payload, &mut offset)? as usize;
    let mut cells = Vec::with_capacity(cell_count);
    for _ in 0..cell_count {
        let name = read_str(payload, &mut offset)?;
        let value = read_opt_value(payload, &mut offset)?;
        cells.push((name, value));
    }
    if offset != payload.len() {
        return Err(CdcError::Codec("trailing bytes after message".into()));
    }

    let pk = decode_pk_key(key)?;
    Ok(Mutation {
        table,
        pk,
        writetime,
        node_id,
        digest,
        kind,
        cells,
    })
}
