//! Conversion between [`CellValue`] and SQLite column values.
//!
//! Scalars map to native SQLite types (booleans as 0/1 integers). Lists and
//! link cells are stored as JSON text. An empty list is stored, and read
//! back, as NULL so that "no linked records" has a single representation.

use rusqlite::types::Value as SqlValue;

use cellflow_core::{CellValue, CellValueType, Field, FieldKind, Schema, ValueShape};

use crate::error::StorageError;

/// How one column's values are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnCodec {
    pub shape: ValueShape,
    /// Whether the column holds JSON text.
    pub json: bool,
}

impl ColumnCodec {
    pub fn new(shape: ValueShape, json: bool) -> Self {
        ColumnCodec { shape, json }
    }

    /// Codec of `field`'s persisted column.
    pub fn for_field(schema: &Schema, field: &Field) -> Self {
        let shape = schema
            .shape_of(&field.id)
            .unwrap_or(ValueShape::scalar(CellValueType::String));
        let json = shape.is_json() || matches!(field.kind, FieldKind::Link(_));
        ColumnCodec { shape, json }
    }

    pub fn decode(&self, raw: SqlValue) -> Result<CellValue, StorageError> {
        let value = match raw {
            SqlValue::Null => CellValue::Null,
            SqlValue::Integer(i) if self.shape.cell_type == CellValueType::Boolean => {
                CellValue::Bool(i != 0)
            }
            SqlValue::Integer(i) => CellValue::Number(i as f64),
            SqlValue::Real(r) if self.shape.cell_type == CellValueType::Boolean => {
                CellValue::Bool(r != 0.0)
            }
            SqlValue::Real(r) => CellValue::Number(r),
            SqlValue::Text(text) if self.json => {
                let json: serde_json::Value = serde_json::from_str(&text)?;
                let value = CellValue::from_json(json);
                self.normalize(value)
            }
            SqlValue::Text(text) => CellValue::Text(text),
            SqlValue::Blob(_) => {
                return Err(StorageError::IntegrityError {
                    reason: "unexpected BLOB in a record column".to_string(),
                })
            }
        };
        Ok(value)
    }

    /// Flattens nested lists, converts boolean-shaped numbers and maps an
    /// empty list to null.
    fn normalize(&self, value: CellValue) -> CellValue {
        match value {
            CellValue::List(items) => {
                let mut flat = Vec::with_capacity(items.len());
                flatten_into(items, &mut flat);
                let flat: Vec<CellValue> = flat.into_iter().map(|v| self.scalar(v)).collect();
                if flat.is_empty() {
                    CellValue::Null
                } else {
                    CellValue::List(flat)
                }
            }
            other => self.scalar(other),
        }
    }

    fn scalar(&self, value: CellValue) -> CellValue {
        match value {
            CellValue::Number(n) if self.shape.cell_type == CellValueType::Boolean => {
                CellValue::Bool(n != 0.0)
            }
            other => other,
        }
    }
}

fn flatten_into(items: Vec<CellValue>, out: &mut Vec<CellValue>) {
    for item in items {
        match item {
            CellValue::List(inner) => flatten_into(inner, out),
            other => out.push(other),
        }
    }
}

/// Encodes a value for storage.
pub fn encode(value: &CellValue) -> Result<SqlValue, StorageError> {
    let raw = match value {
        CellValue::Null => SqlValue::Null,
        CellValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        CellValue::Number(n) => SqlValue::Real(*n),
        CellValue::Text(s) => SqlValue::Text(s.clone()),
        CellValue::Link { .. } => SqlValue::Text(serde_json::to_string(value)?),
        CellValue::List(items) if items.is_empty() => SqlValue::Null,
        CellValue::List(_) => SqlValue::Text(serde_json::to_string(value)?),
    };
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellflow_core::RecordId;

    fn list_of(cell_type: CellValueType) -> ColumnCodec {
        ColumnCodec::new(ValueShape::multiple(cell_type), true)
    }

    #[test]
    fn empty_json_array_reads_as_null() {
        let codec = list_of(CellValueType::String);
        assert_eq!(codec.decode(SqlValue::Text("[]".into())).unwrap(), CellValue::Null);
        assert_eq!(encode(&CellValue::List(vec![])).unwrap(), SqlValue::Null);
    }

    #[test]
    fn booleans_round_trip_through_integers() {
        let codec = ColumnCodec::new(ValueShape::scalar(CellValueType::Boolean), false);
        let raw = encode(&CellValue::Bool(true)).unwrap();
        assert_eq!(raw, SqlValue::Integer(1));
        assert_eq!(codec.decode(raw).unwrap(), CellValue::Bool(true));

        let lists = list_of(CellValueType::Boolean);
        assert_eq!(
            lists.decode(SqlValue::Text("[1,0]".into())).unwrap(),
            CellValue::List(vec![CellValue::Bool(true), CellValue::Bool(false)])
        );
    }

    #[test]
    fn link_cells_decode_to_links() {
        let id = RecordId::parse("recAAAAAAAAAAAAAAAA").unwrap();
        let codec = ColumnCodec::new(ValueShape::scalar(CellValueType::String), true);
        let cell = CellValue::Link {
            id: id.clone(),
            title: Some("Alpha".into()),
        };
        let raw = encode(&cell).unwrap();
        assert_eq!(codec.decode(raw).unwrap(), cell);
    }

    #[test]
    fn nested_lookup_lists_flatten() {
        let codec = list_of(CellValueType::Number);
        assert_eq!(
            codec.decode(SqlValue::Text("[[1,2],[3]]".into())).unwrap(),
            CellValue::List(vec![1.0.into(), 2.0.into(), 3.0.into()])
        );
    }
}
