//! Batch → Parquet encoding.
//!
//! Records are flattened first: nested objects become dot-separated columns
//! and arrays stay lists. A column keeps a typed arrow representation when its
//! values are scalars (conflicting scalars widen to strings) or flat lists of
//! scalars. Any other column, such as one mixing scalars and lists or holding
//! objects inside lists, is written as text: strings as they are, every other
//! value as its JSON serialization. If typed encoding still fails, the whole
//! batch is written with text columns, so every batch of JSON objects encodes.
//!
//! Two provenance columns, `_partition` and `_offset`, are added to every row
//! and take precedence over user keys of the same name.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::ReaderBuilder;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::accumulator::Batch;
use crate::error::EncodeError;
use crate::metrics_consts::{ENCODE_TEXT_COLUMNS, ENCODE_TEXT_FALLBACKS, FLATTEN_COLLISIONS};
use crate::record::Record;

pub const PARTITION_COLUMN: &str = "_partition";
pub const OFFSET_COLUMN: &str = "_offset";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParquetCompression {
    #[default]
    Snappy,
    Zstd,
    None,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCompressionError(pub String);

impl FromStr for ParquetCompression {
    type Err = ParseCompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(ParquetCompression::Snappy),
            "zstd" => Ok(ParquetCompression::Zstd),
            "none" | "uncompressed" => Ok(ParquetCompression::None),
            other => Err(ParseCompressionError(other.to_string())),
        }
    }
}

impl fmt::Display for ParquetCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParquetCompression::Snappy => "snappy",
            ParquetCompression::Zstd => "zstd",
            ParquetCompression::None => "none",
        };
        f.write_str(name)
    }
}

impl From<ParquetCompression> for Compression {
    fn from(value: ParquetCompression) -> Self {
        match value {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        }
    }
}

/// A whole parquet file held in memory.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub body: Bytes,
    pub rows: usize,
    pub columns: usize,
}

pub fn encode_batch(
    batch: &Batch,
    compression: ParquetCompression,
) -> Result<EncodedBatch, EncodeError> {
    if batch.is_empty() {
        return Err(EncodeError::EmptyBatch);
    }

    let mut rows: Vec<Value> = batch
        .records()
        .iter()
        .map(|record| Value::Object(to_row(record)))
        .collect();

    let irregular = irregular_columns(&rows);
    if !irregular.is_empty() {
        debug!(columns = ?irregular, "Writing irregular columns as text");
        metrics::counter!(ENCODE_TEXT_COLUMNS).increment(irregular.len() as u64);
        for (column, value) in cells_mut(&mut rows) {
            if irregular.contains(column.as_str()) {
                to_text(value);
            }
        }
    }

    let typed = infer_json_schema_from_iterator(rows.iter().map(Ok::<_, ArrowError>))
        .map_err(EncodeError::from)
        .and_then(|schema| write_parquet(&rows, Arc::new(schema), compression));

    match typed {
        Ok(encoded) => Ok(encoded),
        Err(e) => {
            warn!(
                records = rows.len(),
                "Typed parquet encoding failed, writing every column as text: {e}"
            );
            metrics::counter!(ENCODE_TEXT_FALLBACKS).increment(1);
            let schema = text_schema(&rows);
            for (column, value) in cells_mut(&mut rows) {
                if !is_provenance(column) {
                    to_text(value);
                }
            }
            write_parquet(&rows, schema, compression)
        }
    }
}

fn write_parquet(
    rows: &[Value],
    schema: SchemaRef,
    compression: ParquetCompression,
) -> Result<EncodedBatch, EncodeError> {
    let mut decoder = ReaderBuilder::new(schema.clone())
        .with_batch_size(rows.len())
        .with_coerce_primitive(true)
        .build_decoder()?;
    decoder.serialize(rows)?;
    let record_batch = decoder.flush()?.ok_or(EncodeError::EmptyBatch)?;

    let props = WriterProperties::builder()
        .set_compression(compression.into())
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(props))?;
    writer.write(&record_batch)?;
    let body = writer.into_inner()?;

    Ok(EncodedBatch {
        body: Bytes::from(body),
        rows: record_batch.num_rows(),
        columns: record_batch.num_columns(),
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct ColumnShape {
    scalars: bool,
    lists: bool,
    nested: bool,
}

/// Columns that cannot be decoded into one typed arrow column: scalars mixed
/// with lists, or lists holding objects or other lists.
fn irregular_columns(rows: &[Value]) -> HashSet<String> {
    let mut shapes: HashMap<&str, ColumnShape> = HashMap::new();

    for row in rows.iter().filter_map(Value::as_object) {
        for (column, value) in row {
            let shape = shapes.entry(column.as_str()).or_default();
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    shape.lists = true;
                    shape.nested |= items
                        .iter()
                        .any(|item| matches!(item, Value::Array(_) | Value::Object(_)));
                }
                Value::Object(_) => shape.nested = true,
                _ => shape.scalars = true,
            }
        }
    }

    shapes
        .into_iter()
        .filter(|(_, shape)| shape.nested || (shape.lists && shape.scalars))
        .map(|(column, _)| column.to_string())
        .collect()
}

fn cells_mut(rows: &mut [Value]) -> impl Iterator<Item = (&String, &mut Value)> {
    rows.iter_mut()
        .filter_map(Value::as_object_mut)
        .flat_map(|row| row.iter_mut())
}

/// Strings are kept as they are, other values become their JSON text.
fn to_text(value: &mut Value) {
    if matches!(value, Value::Null | Value::String(_)) {
        return;
    }
    let text = value.to_string();
    *value = Value::String(text);
}

fn is_provenance(column: &str) -> bool {
    column == PARTITION_COLUMN || column == OFFSET_COLUMN
}

/// Every user column as nullable text, provenance columns as integers.
fn text_schema(rows: &[Value]) -> SchemaRef {
    let columns: BTreeSet<&str> = rows
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|row| row.keys().map(String::as_str))
        .filter(|column| !is_provenance(column))
        .collect();

    let mut fields = vec![
        Field::new(PARTITION_COLUMN, DataType::Int64, false),
        Field::new(OFFSET_COLUMN, DataType::Int64, false),
    ];
    fields.extend(
        columns
            .into_iter()
            .map(|column| Field::new(column, DataType::Utf8, true)),
    );
    Arc::new(Schema::new(fields))
}

/// Flattened fields of a record plus its provenance columns.
fn to_row(record: &Record) -> Map<String, Value> {
    let mut row = Map::new();
    let collisions = flatten_into(None, record.fields(), &mut row);
    if collisions > 0 {
        debug!(
            partition = record.partition().partition_number(),
            offset = record.offset(),
            collisions = collisions,
            "Flattened keys collided, first value kept"
        );
        metrics::counter!(FLATTEN_COLLISIONS).increment(collisions as u64);
    }
    row.insert(
        PARTITION_COLUMN.to_string(),
        Value::from(record.partition().partition_number()),
    );
    row.insert(OFFSET_COLUMN.to_string(), Value::from(record.offset()));
    row
}

/// `{"a": {"b": 1}}` becomes `{"a.b": 1}`. Empty nested objects become null.
///
/// A literal dotted key and a nested path can name the same column
/// (`{"a.b": 1, "a": {"b": 2}}`). The first value in key order is kept and
/// the number of discarded values is returned.
pub fn flatten_into(
    prefix: Option<&str>,
    fields: &Map<String, Value>,
    out: &mut Map<String, Value>,
) -> usize {
    let mut collisions = 0;
    for (key, value) in fields {
        let column = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                collisions += flatten_into(Some(&column), inner, out);
            }
            _ if out.contains_key(&column) => collisions += 1,
            Value::Object(_) => {
                out.insert(column, Value::Null);
            }
            other => {
                out.insert(column, other.clone());
            }
        }
    }
    collisions
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{DataType, Int64Type};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;

    use super::*;
    use crate::kafka::types::Partition;

    fn record(offset: i64, value: Value) -> Record {
        let Value::Object(fields) = value else {
            panic!("test records must be objects");
        };
        Record::new(Partition::new("events", 1), offset, fields)
    }

    fn read_back(encoded: &EncodedBatch) -> arrow::record_batch::RecordBatch {
        let reader = ParquetRecordBatchReaderBuilder::try_new(encoded.body.clone())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        arrow::compute::concat_batches(&batches[0].schema(), &batches).unwrap()
    }

    #[test]
    fn test_flatten_nested_objects() {
        let Value::Object(fields) = json!({
            "id": 1,
            "user": {"name": "ada", "address": {"city": "london"}},
            "tags": ["a", "b"],
            "empty": {}
        }) else {
            unreachable!()
        };
        let mut out = Map::new();
        assert_eq!(flatten_into(None, &fields, &mut out), 0);

        assert_eq!(out.get("id"), Some(&json!(1)));
        assert_eq!(out.get("user.name"), Some(&json!("ada")));
        assert_eq!(out.get("user.address.city"), Some(&json!("london")));
        assert_eq!(out.get("tags"), Some(&json!(["a", "b"])));
        assert_eq!(out.get("empty"), Some(&Value::Null));
        assert!(!out.contains_key("user"));
    }

    #[test]
    fn test_encode_heterogeneous_records() {
        let batch = Batch::new(vec![
            record(10, json!({"event": "click", "user": {"id": 7}})),
            record(11, json!({"event": "view", "duration": 1.5})),
            record(12, json!({})),
        ]);

        let encoded = encode_batch(&batch, ParquetCompression::Snappy).unwrap();
        assert_eq!(encoded.rows, 3);

        let decoded = read_back(&encoded);
        assert_eq!(decoded.num_rows(), 3);

        let schema = decoded.schema();
        for column in ["event", "user.id", "duration", PARTITION_COLUMN, OFFSET_COLUMN] {
            assert!(schema.field_with_name(column).is_ok(), "missing {column}");
        }

        let offsets = decoded
            .column_by_name(OFFSET_COLUMN)
            .unwrap()
            .as_primitive::<Int64Type>();
        assert_eq!(offsets.values().to_vec(), vec![10, 11, 12]);

        let events = decoded.column_by_name("event").unwrap().as_string::<i32>();
        assert_eq!(events.value(0), "click");
        assert!(events.is_null(2));
    }

    #[test]
    fn test_conflicting_scalars_widen_to_string() {
        let batch = Batch::new(vec![
            record(0, json!({"value": 1})),
            record(1, json!({"value": "one"})),
        ]);

        let decoded = read_back(&encode_batch(&batch, ParquetCompression::None).unwrap());
        let field = decoded.schema().field_with_name("value").unwrap().clone();
        assert_eq!(field.data_type(), &DataType::Utf8);

        let values = decoded.column_by_name("value").unwrap().as_string::<i32>();
        assert_eq!(values.value(0), "1");
        assert_eq!(values.value(1), "one");
    }

    fn text_column(decoded: &arrow::record_batch::RecordBatch, name: &str) -> Vec<Option<String>> {
        let field = decoded.schema().field_with_name(name).unwrap().clone();
        assert_eq!(field.data_type(), &DataType::Utf8, "{name} is not text");
        decoded
            .column_by_name(name)
            .unwrap()
            .as_string::<i32>()
            .iter()
            .map(|value| value.map(str::to_string))
            .collect()
    }

    #[test]
    fn test_scalar_and_list_in_one_column_are_written_as_text() {
        let batch = Batch::new(vec![
            record(0, json!({"v": 1, "kept": [1, 2]})),
            record(1, json!({"v": [1]})),
            record(2, json!({"v": "one"})),
            record(3, json!({"v": null})),
        ]);

        let decoded = read_back(&encode_batch(&batch, ParquetCompression::Snappy).unwrap());
        assert_eq!(decoded.num_rows(), 4);
        assert_eq!(
            text_column(&decoded, "v"),
            vec![
                Some("1".to_string()),
                Some("[1]".to_string()),
                Some("one".to_string()),
                None
            ]
        );

        // a regular list column next to it stays a list
        let kept = decoded.schema().field_with_name("kept").unwrap().clone();
        assert!(matches!(kept.data_type(), DataType::List(_)));
    }

    #[test]
    fn test_objects_inside_lists_are_written_as_text() {
        let batch = Batch::new(vec![
            record(0, json!({"v": [{"a": 1}]})),
            record(1, json!({"v": 1})),
        ]);

        let decoded = read_back(&encode_batch(&batch, ParquetCompression::Snappy).unwrap());
        assert_eq!(
            text_column(&decoded, "v"),
            vec![Some(r#"[{"a":1}]"#.to_string()), Some("1".to_string())]
        );
    }

    #[test]
    fn test_list_of_empty_object_is_written_as_text() {
        let batch = Batch::new(vec![
            record(0, json!({"event": "ok"})),
            record(1, json!({"l": [{}]})),
        ]);

        let decoded = read_back(&encode_batch(&batch, ParquetCompression::Zstd).unwrap());
        assert_eq!(
            text_column(&decoded, "l"),
            vec![None, Some("[{}]".to_string())]
        );
        assert_eq!(
            text_column(&decoded, "event"),
            vec![Some("ok".to_string()), None]
        );
    }

    #[test]
    fn test_nested_lists_are_written_as_text() {
        let batch = Batch::new(vec![
            record(0, json!({"matrix": [[1, 2], [3]]})),
            record(1, json!({"matrix": []})),
        ]);

        let decoded = read_back(&encode_batch(&batch, ParquetCompression::None).unwrap());
        assert_eq!(
            text_column(&decoded, "matrix"),
            vec![Some("[[1,2],[3]]".to_string()), Some("[]".to_string())]
        );
    }

    #[test]
    fn test_text_schema_keeps_provenance_typed() {
        let rows = vec![json!({"_partition": 1, "_offset": 7, "b": "x", "a": 1})];
        let schema = text_schema(&rows);

        assert_eq!(
            schema.field_with_name(OFFSET_COLUMN).unwrap().data_type(),
            &DataType::Int64
        );
        assert_eq!(schema.field_with_name("a").unwrap().data_type(), &DataType::Utf8);
        assert_eq!(schema.fields().len(), 4);
    }

    #[test]
    fn test_dotted_key_and_nested_path_collide() {
        let Value::Object(fields) = json!({"a.b": 1, "a": {"b": 2}}) else {
            unreachable!()
        };
        let expected = match fields.keys().next().map(String::as_str) {
            Some("a") => json!(2),
            _ => json!(1),
        };

        let mut out = Map::new();
        assert_eq!(flatten_into(None, &fields, &mut out), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("a.b"), Some(&expected));
    }

    #[test]
    fn test_provenance_columns_override_user_keys() {
        let batch = Batch::new(vec![record(5, json!({"_offset": "user value"}))]);

        let decoded = read_back(&encode_batch(&batch, ParquetCompression::Zstd).unwrap());
        let offsets = decoded
            .column_by_name(OFFSET_COLUMN)
            .unwrap()
            .as_primitive::<Int64Type>();
        assert_eq!(offsets.value(0), 5);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        assert!(matches!(
            encode_batch(&Batch::default(), ParquetCompression::Snappy),
            Err(EncodeError::EmptyBatch)
        ));
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!("snappy".parse(), Ok(ParquetCompression::Snappy));
        assert_eq!("ZSTD".parse(), Ok(ParquetCompression::Zstd));
        assert_eq!("none".parse(), Ok(ParquetCompression::None));
        assert!("lz4".parse::<ParquetCompression>().is_err());
    }
}
