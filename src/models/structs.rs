use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::models::enums::FieldType;

/// One output row. Key order is the order columns appear in the output.
pub type Row = Map<String, Value>;

/// Field name -> datatype for one index. Sub-object fields use dotted paths (`a.b.c`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldMapping {
    fields: HashMap<String, FieldType>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, ty: FieldType) {
        self.fields.insert(field.into(), ty);
    }

    pub fn field_type(&self, field: &str) -> Option<&FieldType> {
        self.fields.get(field)
    }

    pub fn is_text(&self, field: &str) -> bool {
        matches!(self.fields.get(field), Some(FieldType::Text))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse a `GET /<index>/_mapping` response.
    ///
    /// Handles both the typeless layout (`{idx: {mappings: {properties}}}`) and the older
    /// typed one (`{idx: {mappings: {<type>: {properties}}}}`). When the name resolves to
    /// several indices (alias or pattern) their fields are merged.
    pub fn from_mapping_response(body: &Value) -> Self {
        let mut mapping = FieldMapping::new();
        let Some(indices) = body.as_object() else { return mapping };
        for index_body in indices.values() {
            let Some(mappings) = index_body.get("mappings").and_then(Value::as_object) else { continue };
            if let Some(props) = mappings.get("properties").and_then(Value::as_object) {
                collect_properties(props, "", &mut mapping);
                continue;
            }
            for typed in mappings.values() {
                if let Some(props) = typed.get("properties").and_then(Value::as_object) {
                    collect_properties(props, "", &mut mapping);
                }
            }
        }
        mapping
    }
}

fn collect_properties(props: &Map<String, Value>, prefix: &str, out: &mut FieldMapping) {
    for (name, def) in props {
        let path = if prefix.is_empty() { name.clone() } else { format!("{}.{}", prefix, name) };
        let sub = def.get("properties").and_then(Value::as_object);
        let ty = match def.get("type").and_then(Value::as_str) {
            Some(t) => FieldType::from(t),
            None if sub.is_some() => FieldType::Object,
            None => continue,
        };
        out.insert(path.clone(), ty);
        if let Some(sub) = sub {
            collect_properties(sub, &path, out);
        }
    }
}

/// A page of results as returned by a search or scroll call.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultPage {
    /// Aggregation tree; always a single page.
    Aggregations { aggregations: Map<String, Value>, scroll_id: Option<String> },
    Hits { hits: Vec<Value>, scroll_id: Option<String>, total: Option<u64> },
}

impl ResultPage {
    pub fn from_response(body: Value) -> Self {
        let Value::Object(mut body) = body else {
            return ResultPage::Hits { hits: Vec::new(), scroll_id: None, total: None };
        };
        let scroll_id = body.get("_scroll_id").and_then(Value::as_str).map(str::to_string);
        if let Some(Value::Object(aggs)) = body.remove("aggregations")
            && !aggs.is_empty()
        {
            return ResultPage::Aggregations { aggregations: aggs, scroll_id };
        }
        let mut hits_obj = match body.remove("hits") {
            Some(Value::Object(h)) => h,
            _ => Map::new(),
        };
        // ES 7 wraps the total as {value, relation}; ES 6 uses a bare number
        let total = hits_obj.get("total").and_then(|t| t.as_u64().or_else(|| t.get("value").and_then(Value::as_u64)));
        let hits = match hits_obj.remove("hits") {
            Some(Value::Array(a)) => a,
            _ => Vec::new(),
        };
        ResultPage::Hits { hits, scroll_id, total }
    }

    pub fn scroll_id(&self) -> Option<&str> {
        match self {
            ResultPage::Aggregations { scroll_id, .. } | ResultPage::Hits { scroll_id, .. } => scroll_id.as_deref(),
        }
    }

    pub fn hit_count(&self) -> usize {
        match self {
            ResultPage::Hits { hits, .. } => hits.len(),
            ResultPage::Aggregations { .. } => 0,
        }
    }

    pub fn is_aggregation(&self) -> bool {
        matches!(self, ResultPage::Aggregations { .. })
    }
}
