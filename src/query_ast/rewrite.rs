use log::{debug, warn};
use serde_json::Value;

use super::{
    ast::{Node, QueryAst, SelectKind},
    errors::{QueryAstError, RewriteError},
    executor::MappingLookup,
    geo,
};
use crate::models::structs::FieldMapping;

/// Limit forced onto grouped queries that carry none. The terms aggregation behind GROUP BY
/// otherwise stops at the engine's default bucket count (10k).
pub const GROUP_BY_LIMIT: u64 = 9_999_999;

/// Point field the geohash grid aggregation runs on.
pub const GEOHASH_FIELD: &str = "the_geom_point";
/// Shape field spatial predicates are evaluated against.
pub const GEOMETRY_FIELD: &str = "the_geom";

const KEYWORD_SUFFIX: &str = ".keyword";

/// Produce an engine-ready copy of `query`. The caller's tree is left untouched.
pub async fn rewrite_query<M>(query: &QueryAst, index: &str, mappings: &M) -> Result<QueryAst, QueryAstError>
where
    M: MappingLookup + ?Sized,
{
    let mut out = query.clone();

    let mapping = if !out.group.is_empty() || !out.order_by.is_empty() {
        let m = mappings.get_mapping(index).await.map_err(RewriteError::Mapping)?;
        debug!("fetched mapping for {} ({} fields)", index, m.len());
        Some(m)
    } else {
        None
    };

    if let Some(mapping) = &mapping {
        rewrite_group(&mut out, mapping);
        for item in out.order_by.iter_mut() {
            keyword_suffix(&mut item.node, mapping);
        }
        for item in out.select.iter_mut().filter(|s| s.kind == SelectKind::Function) {
            for arg in item.arguments.iter_mut() {
                keyword_suffix(arg, mapping);
            }
        }
    }

    if !out.group.is_empty() && out.limit.is_none() {
        out.limit = Some(GROUP_BY_LIMIT);
    }

    if let Some(pred) = out.r#where.as_mut() {
        rewrite_intersects(pred);
    }
    Ok(out)
}

fn rewrite_group(query: &mut QueryAst, mapping: &FieldMapping) {
    let resolved: Vec<Node> = query
        .group
        .iter()
        .map(|node| match node {
            Node::Literal(name) => resolve_alias(query, name).unwrap_or_else(|| node.clone()),
            _ => node.clone(),
        })
        .collect();
    query.group = resolved
        .into_iter()
        .map(|mut node| {
            if let Some(grid) = geohash_grid(&node) {
                return grid;
            }
            keyword_suffix(&mut node, mapping);
            node
        })
        .collect();
}

/// The select item a GROUP BY alias names. A dotted field arrives as `base`, `.`, `sub AS alias`
/// and resolves to the whole path.
fn resolve_alias(query: &QueryAst, alias: &str) -> Option<Node> {
    let i = query.alias_position(alias)?;
    let item = &query.select[i];
    if i >= 2
        && query.select[i - 1].kind == SelectKind::Dot
        && query.select[i - 2].kind == SelectKind::Literal
    {
        return Some(Node::Literal(format!("{}.{}", query.select[i - 2].value, item.value)));
    }
    Some(item.to_node())
}

/// `geohash(<field>, <precision>)` -> `geohash_grid(field=the_geom_point, precision=<precision>)`
fn geohash_grid(node: &Node) -> Option<Node> {
    match node {
        Node::Function { name, arguments } if name.eq_ignore_ascii_case("geohash") && arguments.len() == 2 => {
            Some(Node::function(
                "geohash_grid",
                vec![
                    Node::operator("=", Node::literal("field"), Node::literal(GEOHASH_FIELD)),
                    Node::operator("=", Node::literal("precision"), arguments[1].clone()),
                ],
            ))
        }
        _ => None,
    }
}

fn keyword_suffix(node: &mut Node, mapping: &FieldMapping) {
    if let Node::Literal(field) = node
        && !field.ends_with(KEYWORD_SUFFIX)
        && mapping.is_text(field)
    {
        field.push_str(KEYWORD_SUFFIX);
    }
}

fn rewrite_intersects(root: &mut Node) {
    let Some(node) = find_intersects(root) else { return };
    let Node::Function { arguments, .. } = &*node else { return };

    let mut geometry = None;
    let mut srid = None;
    for arg in arguments {
        match arg {
            Node::String(s) => geometry = Some(s.clone()),
            Node::Number(n) => srid = Some(n.clone()),
            _ => {}
        }
    }
    let Some(raw) = geometry else {
        warn!("ST_INTERSECTS without a GeoJSON argument, leaving predicate as-is");
        return;
    };
    let stripped = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    let geojson: Value = match serde_json::from_str(stripped) {
        Ok(v) => v,
        Err(e) => {
            warn!("ST_INTERSECTS argument is not GeoJSON ({}), skipping rewrite", e);
            return;
        }
    };
    let wkt = match geo::to_wkt(&geojson) {
        Ok(w) => w,
        Err(e) => {
            warn!("cannot convert ST_INTERSECTS geometry to WKT ({}), skipping rewrite", e);
            return;
        }
    };
    if let Some(srid) = srid {
        debug!("ST_INTERSECTS srid {} (engine assumes WGS84)", srid);
    }
    *node = Node::function("GEO_INTERSECTS", vec![Node::literal(GEOMETRY_FIELD), Node::String(wkt)]);
}

/// Depth-first; a conditional yields its left branch's match before its right.
fn find_intersects(node: &mut Node) -> Option<&mut Node> {
    if node.is_function_named("ST_INTERSECTS") {
        return Some(node);
    }
    match node {
        Node::Conditional { left, right, .. } => {
            if let Some(found) = find_intersects(left) {
                return Some(found);
            }
            find_intersects(right)
        }
        _ => None,
    }
}
