//! GeoJSON -> Well-Known Text.
//!
//! Only what spatial predicates need: the seven geometry types plus Feature /
//! single-feature FeatureCollection wrappers. Coordinates are written as `x y` (or `x y z`).

use serde_json::Value;

use super::errors::GeoError;

pub fn to_wkt(geojson: &Value) -> Result<String, GeoError> {
    let kind = geojson
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GeoError::InvalidGeometry("missing \"type\"".into()))?;

    match kind {
        "Feature" => {
            let geometry = geojson
                .get("geometry")
                .filter(|g| !g.is_null())
                .ok_or_else(|| GeoError::InvalidGeometry("feature without geometry".into()))?;
            to_wkt(geometry)
        }
        "FeatureCollection" => {
            let features = geojson.get("features").and_then(Value::as_array);
            match features.map(Vec::as_slice) {
                Some([single]) => to_wkt(single),
                _ => Err(GeoError::Unsupported("FeatureCollection with more than one feature".into())),
            }
        }
        "GeometryCollection" => {
            let geometries = geojson
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| GeoError::InvalidGeometry("missing \"geometries\"".into()))?;
            if geometries.is_empty() {
                return Ok("GEOMETRYCOLLECTION EMPTY".into());
            }
            let parts = geometries.iter().map(to_wkt).collect::<Result<Vec<_>, _>>()?;
            Ok(format!("GEOMETRYCOLLECTION ({})", parts.join(", ")))
        }
        other => {
            let coords = geojson
                .get("coordinates")
                .ok_or_else(|| GeoError::InvalidGeometry("missing \"coordinates\"".into()))?;
            let (tag, depth) = match other {
                "Point" => ("POINT", 0),
                "LineString" => ("LINESTRING", 1),
                "MultiPoint" => ("MULTIPOINT", 1),
                "Polygon" => ("POLYGON", 2),
                "MultiLineString" => ("MULTILINESTRING", 2),
                "MultiPolygon" => ("MULTIPOLYGON", 3),
                _ => return Err(GeoError::Unsupported(other.to_string())),
            };
            if coords.as_array().is_some_and(Vec::is_empty) {
                return Ok(format!("{} EMPTY", tag));
            }
            Ok(format!("{} {}", tag, nested(coords, depth)?))
        }
    }
}

/// `depth` is the number of array levels above a single position.
fn nested(value: &Value, depth: usize) -> Result<String, GeoError> {
    if depth == 0 {
        return Ok(format!("({})", position(value)?));
    }
    let items = value
        .as_array()
        .ok_or_else(|| GeoError::InvalidGeometry(format!("expected array, got {}", value)))?;
    let parts = if depth == 1 {
        items.iter().map(position).collect::<Result<Vec<_>, _>>()?
    } else {
        items.iter().map(|v| nested(v, depth - 1)).collect::<Result<Vec<_>, _>>()?
    };
    Ok(format!("({})", parts.join(", ")))
}

fn position(value: &Value) -> Result<String, GeoError> {
    let ords = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| GeoError::InvalidGeometry(format!("bad position {}", value)))?;
    ords.iter()
        .take(3)
        .map(|o| {
            o.as_f64()
                .map(format_ordinate)
                .ok_or_else(|| GeoError::InvalidGeometry(format!("non-numeric ordinate {}", o)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|v| v.join(" "))
}

fn format_ordinate(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}
