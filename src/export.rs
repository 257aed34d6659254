//! Incremental output envelopes.
//!
//! A result set is written as a sequence of chunks whose concatenation is one valid CSV
//! document or one valid JSON document. The encoder carries the state that has to survive
//! between chunks: whether the header/opener went out, whether the next row needs a
//! separating comma, and the CSV column order. Columns come from the select list when the
//! caller knows it, otherwise from the first rows.

use serde_json::Value;

use crate::models::enums::OutputFormat;
use crate::models::structs::Row;
use crate::query_ast::errors::QueryAstError;

const JSON_OPENER: &str = r#"{"data":["#;
const JSON_CLOSER: &str = "]";
const GEOJSON_OPENER: &str = r#"{"data":[{"type":"FeatureCollection","features":["#;
const GEOJSON_CLOSER: &str = "]}]";

#[derive(Debug, Default, Clone)]
struct EncoderState {
    wrote_header: bool,
    wrote_opener: bool,
    pending_comma: bool,
    closed: bool,
    columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    format: OutputFormat,
    is_download: bool,
    clone_metadata: Option<Value>,
    state: EncoderState,
}

impl ChunkEncoder {
    pub fn new(format: OutputFormat, is_download: bool, clone_metadata: Option<Value>) -> Self {
        Self { format, is_download, clone_metadata, state: EncoderState::default() }
    }

    /// Fix the CSV columns up front. Rows missing a column get an empty cell; keys outside the
    /// list are not written.
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.state.columns = columns;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Encode the next batch of rows. `has_more = false` closes the envelope.
    pub fn encode(&mut self, rows: &[Row], has_more: bool) -> Result<String, QueryAstError> {
        if self.state.closed {
            return Err(QueryAstError::Encode("envelope already closed".into()));
        }
        let chunk = match self.format {
            OutputFormat::Csv => self.encode_csv(rows)?,
            OutputFormat::Json | OutputFormat::GeoJson => self.encode_json(rows, has_more)?,
        };
        if !has_more {
            self.state.closed = true;
        }
        Ok(chunk)
    }

    /// Close whatever is open. With nothing written yet this yields the empty envelope.
    pub fn finish(&mut self) -> Result<String, QueryAstError> {
        if self.state.closed {
            return Ok(String::new());
        }
        self.encode(&[], false)
    }

    fn encode_json(&mut self, rows: &[Row], has_more: bool) -> Result<String, QueryAstError> {
        let mut out = String::new();
        if !self.state.wrote_opener {
            out.push_str(match self.format {
                OutputFormat::GeoJson => GEOJSON_OPENER,
                _ => JSON_OPENER,
            });
            self.state.wrote_opener = true;
        }
        for row in rows {
            if self.state.pending_comma {
                out.push(',');
            }
            out.push_str(&serde_json::to_string(row)?);
            self.state.pending_comma = true;
        }
        if !has_more {
            out.push_str(match self.format {
                OutputFormat::GeoJson => GEOJSON_CLOSER,
                _ => JSON_CLOSER,
            });
            if !self.is_download {
                let meta = self.clone_metadata.clone().unwrap_or_else(|| Value::Object(Default::default()));
                out.push_str(r#","meta":"#);
                out.push_str(&serde_json::to_string(&meta)?);
            }
            out.push('}');
        }
        Ok(out)
    }

    fn encode_csv(&mut self, rows: &[Row]) -> Result<String, QueryAstError> {
        if rows.is_empty() {
            return Ok(String::new());
        }
        if self.state.columns.is_empty() {
            self.state.columns = collect_columns(rows);
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        if !self.state.wrote_header {
            writer.write_record(&self.state.columns)?;
            self.state.wrote_header = true;
        }
        for row in rows {
            writer.write_record(self.state.columns.iter().map(|c| csv_cell(column_value(row, c))))?;
        }
        let bytes = writer.into_inner().map_err(|e| QueryAstError::Encode(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| QueryAstError::Encode(e.to_string()))
    }
}

/// One-shot form for callers that track first/last themselves.
pub fn convert_to_chunk(
    rows: &[Row],
    format: OutputFormat,
    is_first: bool,
    has_more: bool,
    clone_metadata: Option<&Value>,
    is_download: bool,
) -> Result<String, QueryAstError> {
    let mut encoder = ChunkEncoder::new(format, is_download, clone_metadata.cloned());
    if !is_first {
        encoder.state.wrote_opener = true;
        encoder.state.wrote_header = true;
        encoder.state.pending_comma = true;
    }
    encoder.encode(rows, has_more)
}

fn collect_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// `a.b` falls back to the nested object path when the row has no flat `a.b` key.
fn column_value<'r>(row: &'r Row, column: &str) -> Option<&'r Value> {
    row.get(column).or_else(|| {
        let mut parts = column.split('.');
        let mut value = row.get(parts.next()?)?;
        for part in parts {
            value = value.get(part)?;
        }
        Some(value)
    })
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn json_chunks_concatenate_to_valid_document() {
        let meta = json!({"clone": {"dataset": "abc"}});
        let mut enc = ChunkEncoder::new(OutputFormat::Json, false, Some(meta.clone()));
        let mut out = String::new();
        out += &enc.encode(&[row(json!({"a": 1})), row(json!({"a": 2}))], true).unwrap();
        out += &enc.encode(&[], true).unwrap();
        out += &enc.encode(&[row(json!({"a": 3}))], false).unwrap();
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["data"].as_array().unwrap().len(), 3);
        assert_eq!(doc["meta"], meta);
        assert!(enc.is_closed());
        assert!(enc.encode(&[], false).is_err());
    }

    #[test]
    fn download_has_no_meta() {
        let mut enc = ChunkEncoder::new(OutputFormat::Json, true, Some(json!({"x": 1})));
        let out = enc.encode(&[row(json!({"a": 1}))], false).unwrap();
        assert_eq!(out, r#"{"data":[{"a":1}]}"#);
    }

    #[test]
    fn empty_envelopes() {
        let mut json_enc = ChunkEncoder::new(OutputFormat::Json, false, None);
        assert_eq!(json_enc.finish().unwrap(), r#"{"data":[],"meta":{}}"#);
        assert_eq!(json_enc.finish().unwrap(), "");

        let mut geo = ChunkEncoder::new(OutputFormat::GeoJson, true, None);
        let out = geo.finish().unwrap();
        assert_eq!(out, r#"{"data":[{"type":"FeatureCollection","features":[]}]}"#);
        serde_json::from_str::<Value>(&out).unwrap();
    }

    #[test]
    fn csv_header_only_once() {
        let mut enc = ChunkEncoder::new(OutputFormat::Csv, false, None);
        let first = enc.encode(&[row(json!({"iso": "COL", "n": 2}))], true).unwrap();
        let empty = enc.encode(&[], true).unwrap();
        let second = enc.encode(&[row(json!({"iso": "USA", "tags": ["a"]}))], false).unwrap();
        assert_eq!(first, "iso,n\nCOL,2\n");
        assert_eq!(empty, "");
        assert_eq!(second, "USA,\n");
    }

    #[test]
    fn csv_seeded_columns_keep_sparse_fields() {
        let mut enc = ChunkEncoder::new(OutputFormat::Csv, true, None)
            .with_columns(vec!["iso".into(), "pop".into(), "year_data.year".into()]);
        let first = enc.encode(&[row(json!({"iso": "A"}))], true).unwrap();
        let second = enc
            .encode(&[row(json!({"iso": "B", "pop": 7, "year_data": {"year": 2001}, "other": 1}))], false)
            .unwrap();
        assert_eq!(first, "iso,pop,year_data.year\nA,,\n");
        assert_eq!(second, "B,7,2001\n");
    }

    #[test]
    fn csv_nested_values_are_json() {
        let mut enc = ChunkEncoder::new(OutputFormat::Csv, false, None);
        let out = enc.encode(&[row(json!({"g": {"type": "Point"}, "s": null}))], false).unwrap();
        assert_eq!(out, "g,s\n\"{\"\"type\"\":\"\"Point\"\"}\",\n");
    }

    #[test]
    fn stateless_middle_chunk() {
        let chunk = convert_to_chunk(&[row(json!({"a": 1}))], OutputFormat::Json, false, true, None, false).unwrap();
        assert_eq!(chunk, r#",{"a":1}"#);
        let last = convert_to_chunk(&[], OutputFormat::GeoJson, false, false, None, true).unwrap();
        assert_eq!(last, "]}]}");
    }
}
