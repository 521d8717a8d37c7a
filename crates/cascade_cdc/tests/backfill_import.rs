//! Backfill import scenarios over delimited exports, with the sender mocked
//! out so the emitted mutations can be captured and inspected.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use cascade_cdc::backfill::{BackfillImporter, CsvRowSource, ExitStatus, StaticMetadata};
use cascade_cdc::error::CdcError;
use cascade_cdc::marshal::{self, CqlValue, TypeTag, WireValue};
use cascade_cdc::model::{ColumnRole, ColumnSpec, Mutation, MutationKind, TableRef};
use cascade_cdc::sender::{MutationSender, SendHandle};

/// Sender double: records every mutation and resolves the handle immediately.
#[derive(Default)]
struct CapturingSender {
    sent: Mutex<Vec<Mutation>>,
}

impl MutationSender for CapturingSender {
    fn send_async(&self, mutation: Mutation) -> SendHandle {
        self.sent.lock().unwrap().push(mutation);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(Ok(()));
        SendHandle::from_receiver(rx)
    }
}

fn spec(name: &str, tag: TypeTag, role: ColumnRole, position: usize) -> ColumnSpec {
    ColumnSpec {
        name: name.into(),
        tag,
        role,
        position,
    }
}

fn write_export(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file.flush().unwrap();
    file
}

fn run_import(
    file: &tempfile::NamedTempFile,
    columns: Vec<ColumnSpec>,
    sender: Arc<CapturingSender>,
) -> ExitStatus {
    let table = TableRef::new("ks1", "table1");
    let importer = BackfillImporter::new(
        table.clone(),
        Arc::new(CsvRowSource::new(file.path())),
        Arc::new(StaticMetadata::new(table, columns)),
        sender,
        1,
    );
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(importer.run())
        .status
}

#[test]
fn import_with_partition_key_only() {
    let file = write_export("key:ascii\nid3\nid8\n");
    let sender = Arc::new(CapturingSender::default());
    let status = run_import(
        &file,
        vec![spec("key", TypeTag::Ascii, ColumnRole::PartitionKey, 0)],
        sender.clone(),
    );

    assert_eq!(status, ExitStatus::Ok);
    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 2, "exactly one send per stored row");

    let mut ids: Vec<String> = sent
        .iter()
        .map(|m| match &m.pk[0] {
            Some(WireValue::Text(s)) => s.clone(),
            other => panic!("unexpected pk cell {other:?}"),
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["id3", "id8"]);
    assert!(sent.iter().all(|m| m.kind == MutationKind::Insert));
}

#[test]
fn import_with_composite_primary_key() {
    let file = write_export(
        "xtext:text,xboolean:boolean,xint:int,xtime:time,xdate:date,xblob:blob\n\
         vtext,true,2,01:02:03,2023-03-02,0001\n\
         v2text,false,3,01:02:04,2023-03-01,01\n",
    );
    let columns = vec![
        spec("xtext", TypeTag::Text, ColumnRole::PartitionKey, 0),
        spec("xboolean", TypeTag::Boolean, ColumnRole::Clustering, 0),
        spec("xint", TypeTag::Int, ColumnRole::Clustering, 1),
        spec("xtime", TypeTag::Time, ColumnRole::Clustering, 2),
        spec("xdate", TypeTag::Date, ColumnRole::Clustering, 3),
        spec("xblob", TypeTag::Blob, ColumnRole::Clustering, 4),
    ];
    let sender = Arc::new(CapturingSender::default());
    let status = run_import(&file, columns.clone(), sender.clone());

    assert_eq!(status, ExitStatus::Ok);
    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);

    let decode_tuple = |mutation: &Mutation| -> Vec<CqlValue> {
        mutation
            .pk
            .iter()
            .zip(&columns)
            .map(|(cell, column)| {
                marshal::decode(cell.as_ref().expect("key cell present"), column.tag).unwrap()
            })
            .collect()
    };

    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    let day = |y: i32, m: u32, d: u32| -> i32 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .signed_duration_since(epoch)
            .num_days() as i32
    };

    assert_eq!(
        decode_tuple(&sent[0]),
        vec![
            CqlValue::Text("vtext".into()),
            CqlValue::Boolean(true),
            CqlValue::Int(2),
            CqlValue::Time(3_723_000_000_000), // 01:02:03
            CqlValue::Date(day(2023, 3, 2)),
            CqlValue::Blob(vec![0x00, 0x01]),
        ]
    );
    assert_eq!(
        decode_tuple(&sent[1]),
        vec![
            CqlValue::Text("v2text".into()),
            CqlValue::Boolean(false),
            CqlValue::Int(3),
            CqlValue::Time(3_724_000_000_000), // 01:02:04
            CqlValue::Date(day(2023, 3, 1)),
            CqlValue::Blob(vec![0x01]),
        ]
    );
}

#[test]
fn import_order_of_columns_in_export_does_not_matter() {
    // Same rows as the partition-key scenario, but the key column is last in
    // the file; resolution still follows descriptor order.
    let file = write_export("n:int,key:ascii\n7,id3\n8,id8\n");
    let sender = Arc::new(CapturingSender::default());
    let status = run_import(
        &file,
        vec![spec("key", TypeTag::Ascii, ColumnRole::PartitionKey, 0)],
        sender.clone(),
    );

    assert_eq!(status, ExitStatus::Ok);
    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].pk, vec![Some(WireValue::Text("id3".into()))]);
    // The non-key column travels as a regular cell.
    assert_eq!(sent[0].cells, vec![("n".into(), Some(WireValue::Int(7)))]);
}

#[test]
fn unparsable_header_type_is_fatal() {
    let file = write_export("key:wat\nid3\n");
    let sender = Arc::new(CapturingSender::default());
    let status = run_import(
        &file,
        vec![spec("key", TypeTag::Ascii, ColumnRole::PartitionKey, 0)],
        sender,
    );
    assert_eq!(status, ExitStatus::Fatal);
}

#[test]
fn missing_export_file_is_a_codec_error() {
    let source = CsvRowSource::new("/nonexistent/export.csv");
    let err = cascade_cdc::backfill::RowSource::rows(&source)
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, CdcError::Codec(_)));
}
