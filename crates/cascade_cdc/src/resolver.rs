//! Aligns exported rows to a table's declared primary-key order.
//!
//! Export files carry columns in whatever order the exporter produced them;
//! the resolver walks the [`PkDescriptor`] instead, so the output tuple is
//! always in table key order.

use std::collections::HashMap;

use crate::error::CdcError;
use crate::marshal::{self, CqlValue, TypeTag};
use crate::model::{PkDescriptor, PkTuple};

/// One exported row: column name to (native value, type tag), order
/// unspecified. The export may carry its own writetime for the row.
#[derive(Clone, Debug, Default)]
pub struct ExportedRow {
    columns: HashMap<String, (CqlValue, TypeTag)>,
    pub writetime: Option<i64>,
}

impl ExportedRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: CqlValue, tag: TypeTag) -> Self {
        self.columns.insert(name.into(), (value, tag));
        self
    }

    pub fn with_writetime(mut self, writetime: i64) -> Self {
        self.writetime = Some(writetime);
        self
    }

    pub fn get(&self, name: &str) -> Option<&(CqlValue, TypeTag)> {
        self.columns.get(name)
    }

    /// Column names present in the row, in no particular order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

/// Marshal a row's key columns into a [`PkTuple`] in descriptor order.
///
/// The descriptor's type tag wins over the row's own tag: the table schema is
/// authoritative for key columns. A key column absent from the row fails the
/// whole row with [`CdcError::MissingColumn`].
pub fn resolve_pk(descriptor: &PkDescriptor, row: &ExportedRow) -> Result<PkTuple, CdcError> {
    let mut pk = Vec::with_capacity(descriptor.len());
    for column in descriptor.columns() {
        let Some((value, _row_tag)) = row.get(&column.name) else {
            return Err(CdcError::MissingColumn(column.name.clone()));
        };
        pk.push(Some(marshal::encode(value, column.tag)?));
    }
    Ok(pk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::WireValue;
    use crate::model::{ColumnRole, ColumnSpec};

    fn spec(name: &str, tag: TypeTag, role: ColumnRole, position: usize) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            tag,
            role,
            position,
        }
    }

    fn two_part_descriptor() -> PkDescriptor {
        PkDescriptor::from_columns(&[
            spec("pk", TypeTag::Text, ColumnRole::PartitionKey, 0),
            spec("ck", TypeTag::Int, ColumnRole::Clustering, 0),
        ])
        .unwrap()
    }

    #[test]
    fn output_order_is_descriptor_order() {
        let descriptor = two_part_descriptor();

        // Same logical row, inserted in both orders.
        let forward = ExportedRow::new()
            .with_column("pk", CqlValue::Text("k".into()), TypeTag::Text)
            .with_column("ck", CqlValue::Int(9), TypeTag::Int);
        let reversed = ExportedRow::new()
            .with_column("ck", CqlValue::Int(9), TypeTag::Int)
            .with_column("pk", CqlValue::Text("k".into()), TypeTag::Text);

        let expected = vec![
            Some(WireValue::Text("k".into())),
            Some(WireValue::Int(9)),
        ];
        assert_eq!(resolve_pk(&descriptor, &forward).unwrap(), expected);
        assert_eq!(resolve_pk(&descriptor, &reversed).unwrap(), expected);
    }

    #[test]
    fn missing_key_column_fails_the_row() {
        let descriptor = two_part_descriptor();
        let row = ExportedRow::new().with_column("pk", CqlValue::Text("k".into()), TypeTag::Text);
        let err = resolve_pk(&descriptor, &row).unwrap_err();
        assert!(matches!(err, CdcError::MissingColumn(name) if name == "ck"));
    }

    #[test]
    fn bad_column_value_is_unsupported_type() {
        let descriptor = two_part_descriptor();
        let row = ExportedRow::new()
            .with_column("pk", CqlValue::Text("k".into()), TypeTag::Text)
            .with_column("ck", CqlValue::Boolean(true), TypeTag::Boolean);
        let err = resolve_pk(&descriptor, &row).unwrap_err();
        assert!(matches!(err, CdcError::UnsupportedType(_)));
    }
}
