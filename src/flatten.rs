//! Turns result pages into flat rows.
//!
//! Aggregation trees are walked bucket by bucket: every GROUP BY level becomes a column and
//! the metrics of the innermost bucket become the remaining columns of its row.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::structs::{ResultPage, Row};
use crate::query_ast::ast::{SelectItem, SelectKind};
use crate::query_ast::rewrite::GEOMETRY_FIELD;

const NESTED_MARKER: &str = "@NESTED";

/// `SUM(pop)_1` -> `SUM(pop)`; the engine appends the counter when a metric is repeated.
static REPEATED_METRIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+\))_\d+$").expect("static regex"));
/// `.keyword` added by the rewriter, also inside function keys such as `count(name.keyword)`.
static KEYWORD_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.keyword\b").expect("static regex"));

pub fn flatten_page(page: &ResultPage, select: &[SelectItem]) -> Vec<Row> {
    let rows = match page {
        ResultPage::Aggregations { aggregations, .. } => flatten_aggregations(aggregations),
        ResultPage::Hits { hits, .. } => flatten_hits(hits),
    };
    format_alias(rows, select)
}

/// A hit contributes its `_source`; anything already flat is passed through.
pub fn flatten_hits(hits: &[Value]) -> Vec<Row> {
    hits.iter()
        .filter_map(|hit| match hit.get("_source") {
            Some(Value::Object(src)) => Some(src.clone()),
            _ => hit.as_object().cloned(),
        })
        .collect()
}

pub fn flatten_aggregations(aggs: &Map<String, Value>) -> Vec<Row> {
    for (name, value) in aggs {
        if let Some((inner, buckets)) = sub_buckets(name, value) {
            return flatten_buckets(inner, buckets);
        }
    }
    // no GROUP BY: a single row of metrics
    let mut row = Row::new();
    for (name, value) in aggs {
        if let Some(v) = metric_value(value) {
            row.insert(column_name(name), v);
        }
    }
    if row.is_empty() { Vec::new() } else { vec![row] }
}

fn flatten_buckets(name: &str, buckets: &[Value]) -> Vec<Row> {
    let column = column_name(name);
    let mut rows = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let Some(obj) = bucket.as_object() else { continue };
        let key = obj
            .get("key_as_string")
            .or_else(|| obj.get("key"))
            .cloned()
            .unwrap_or(Value::Null);
        let entries: Vec<(&String, &Value)> = obj.iter().filter(|(k, _)| !is_bucket_meta(k)).collect();

        if let [(child_name, child)] = entries.as_slice()
            && let Some((inner, child_buckets)) = sub_buckets(child_name, child)
        {
            for child_row in flatten_buckets(inner, child_buckets) {
                let mut row = Row::new();
                row.insert(column.clone(), key.clone());
                row.extend(child_row);
                rows.push(row);
            }
            continue;
        }

        let mut row = Row::new();
        row.insert(column.clone(), key);
        for (k, v) in entries {
            if let Some(value) = metric_value(v) {
                row.insert(column_name(k), value);
            }
        }
        rows.push(row);
    }
    rows
}

/// The bucket list under an aggregation entry, unwrapping one `@NESTED` level.
fn sub_buckets<'a>(name: &'a str, value: &'a Value) -> Option<(&'a str, &'a [Value])> {
    if let Some(b) = value.get("buckets").and_then(Value::as_array) {
        return Some((name, b.as_slice()));
    }
    if name.contains(NESTED_MARKER) {
        let obj = value.as_object()?;
        return obj
            .iter()
            .filter(|(k, _)| !is_bucket_meta(k))
            .find_map(|(k, v)| v.get("buckets").and_then(Value::as_array).map(|b| (k.as_str(), b.as_slice())));
    }
    None
}

fn metric_value(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    obj.get("value").or_else(|| obj.get("values")).cloned()
}

fn is_bucket_meta(key: &str) -> bool {
    matches!(key, "key" | "key_as_string" | "doc_count")
}

/// Output column for an aggregation key.
pub fn column_name(key: &str) -> String {
    if key.to_ascii_lowercase().contains("geohash") {
        return "geohash".into();
    }
    let key = key.trim_end_matches(NESTED_MARKER);
    let key = KEYWORD_SUFFIX.replace_all(key, "");
    match REPEATED_METRIC.captures(&key) {
        Some(c) => c[1].to_string(),
        None => key.to_string(),
    }
}

/// Rename flattened columns to the aliases of the original select list.
pub fn format_alias(rows: Vec<Row>, select: &[SelectItem]) -> Vec<Row> {
    let renames = alias_renames(select);
    if renames.is_empty() {
        return rows;
    }
    rows.into_iter()
        .map(|mut row| {
            for (source, alias) in &renames {
                rename_column(&mut row, source, alias);
            }
            row
        })
        .collect()
}

/// (column produced by the engine, alias) pairs, in select order.
fn alias_renames(select: &[SelectItem]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < select.len() {
        let item = &select[i];
        // `year_data . year AS year` arrives as three items
        if item.kind == SelectKind::Literal
            && select.get(i + 1).is_some_and(|d| d.kind == SelectKind::Dot)
            && let Some(sub) = select.get(i + 2)
        {
            if let Some(alias) = sub.alias.as_ref().or(item.alias.as_ref()) {
                out.push((format!("{}.{}", item.value, sub.value), alias.clone()));
            }
            i += 3;
            continue;
        }
        match (item.kind, &item.alias) {
            (SelectKind::Literal, Some(alias)) => out.push((item.value.clone(), alias.clone())),
            (SelectKind::Function, Some(alias)) => out.push((item.natural_name(), alias.clone())),
            _ => {}
        }
        i += 1;
    }
    out
}

/// Column names a select list produces for search hits, in select order. `None` when the list
/// has a wildcard and the columns can only be discovered from the rows.
pub fn output_columns(select: &[SelectItem]) -> Option<Vec<String>> {
    if select.is_empty() || select.iter().any(|s| s.kind == SelectKind::Wildcard) {
        return None;
    }
    let mut out = Vec::with_capacity(select.len());
    let mut i = 0;
    while i < select.len() {
        let item = &select[i];
        if item.kind == SelectKind::Literal
            && select.get(i + 1).is_some_and(|d| d.kind == SelectKind::Dot)
            && let Some(sub) = select.get(i + 2)
        {
            let path = format!("{}.{}", item.value, sub.value);
            out.push(sub.alias.clone().or_else(|| item.alias.clone()).unwrap_or(path));
            i += 3;
            continue;
        }
        match item.kind {
            SelectKind::Literal => out.push(item.alias.clone().unwrap_or_else(|| item.value.clone())),
            SelectKind::Function => out.push(item.alias.clone().unwrap_or_else(|| item.natural_name())),
            _ => {}
        }
        i += 1;
    }
    Some(out)
}

fn rename_column(row: &mut Row, source: &str, alias: &str) {
    if source == alias {
        return;
    }
    if row.contains_key(source) {
        // rebuild to keep the column in place
        *row = std::mem::take(row)
            .into_iter()
            .map(|(k, v)| if k == source { (alias.to_string(), v) } else { (k, v) })
            .collect();
        return;
    }
    if source.contains('.')
        && let Some(value) = take_path(row, source)
    {
        row.insert(alias.to_string(), value);
    }
}

/// Remove `a.b.c` from nested objects, dropping parents left empty.
fn take_path(map: &mut Map<String, Value>, path: &str) -> Option<Value> {
    let (head, rest) = path.split_once('.')?;
    let child = map.get_mut(head)?.as_object_mut()?;
    let taken = if rest.contains('.') {
        take_path(child, rest)
    } else if child.contains_key(rest) {
        let mut taken = None;
        *child = std::mem::take(child)
            .into_iter()
            .filter_map(|(k, v)| if k == rest { taken = Some(v); None } else { Some((k, v)) })
            .collect();
        taken
    } else {
        None
    };
    let value = taken?;
    if child.is_empty() {
        *map = std::mem::take(map).into_iter().filter(|(k, _)| k != head).collect();
    }
    Some(value)
}

/// Wrap rows as GeoJSON features, lifting the raw geometry column out of the properties.
pub fn to_features(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            let mut geometry = Value::Null;
            let properties: Map<String, Value> = row
                .into_iter()
                .filter_map(|(k, v)| {
                    if k == GEOMETRY_FIELD {
                        geometry = v;
                        None
                    } else {
                        Some((k, v))
                    }
                })
                .collect();
            let geometry = match geometry {
                Value::String(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                    debug!("geometry column is not GeoJSON ({}), emitting null geometry", e);
                    Value::Null
                }),
                other => other,
            };
            let mut feature = Row::new();
            feature.insert("type".into(), Value::String("Feature".into()));
            feature.insert("geometry".into(), geometry);
            feature.insert("properties".into(), Value::Object(properties));
            feature
        })
        .collect()
}
