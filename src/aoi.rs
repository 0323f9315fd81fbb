//! AOI (area-of-interest) geometry validation (spec §6).
//!
//! Accepts exactly one of WKT or GeoJSON, and only `Polygon`/`MultiPolygon`
//! shapes. This is a structural check, not a geometry library: we don't
//! parse coordinates into a ring type, we just confirm the input looks like
//! a non-empty polygon of the right kind. No geometry crate appears anywhere
//! in the example pack, so there's nothing to reach for here beyond what the
//! shape itself tells us.

use serde_json::Value;

use crate::error::ValidationError;
use crate::model::AoiInput;

pub fn validate_aoi(aoi: &AoiInput) -> Result<(), ValidationError> {
    match (&aoi.wkt, &aoi.geojson) {
        (Some(_), Some(_)) => Err(ValidationError::invalid(
            "aoi",
            "exactly one of wkt or geojson must be set, not both",
        )),
        (None, None) => Err(ValidationError::invalid(
            "aoi",
            "exactly one of wkt or geojson must be set",
        )),
        (Some(wkt), None) => validate_wkt(wkt),
        (None, Some(geojson)) => validate_geojson(geojson),
    }
}

fn validate_wkt(wkt: &str) -> Result<(), ValidationError> {
    let trimmed = wkt.trim();
    let upper = trimmed.to_ascii_uppercase();
    let is_polygon = upper.starts_with("POLYGON");
    let is_multipolygon = upper.starts_with("MULTIPOLYGON");
    if !is_polygon && !is_multipolygon {
        return Err(ValidationError::invalid(
            "aoi.wkt",
            "must start with POLYGON or MULTIPOLYGON",
        ));
    }

    let open = trimmed.matches('(').count();
    let close = trimmed.matches(')').count();
    if open == 0 || open != close {
        return Err(ValidationError::invalid("aoi.wkt", "unbalanced parentheses"));
    }

    if !trimmed.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::invalid("aoi.wkt", "no coordinates found"));
    }

    Ok(())
}

fn validate_geojson(geojson: &Value) -> Result<(), ValidationError> {
    let obj = geojson
        .as_object()
        .ok_or_else(|| ValidationError::invalid("aoi.geojson", "must be a JSON object"))?;

    let geo_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::invalid("aoi.geojson", "missing 'type' field"))?;

    if geo_type != "Polygon" && geo_type != "MultiPolygon" {
        return Err(ValidationError::invalid(
            "aoi.geojson",
            "type must be Polygon or MultiPolygon",
        ));
    }

    let coordinates = obj
        .get("coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::invalid("aoi.geojson", "missing 'coordinates' array"))?;

    if coordinates.is_empty() {
        return Err(ValidationError::invalid("aoi.geojson", "coordinates must be non-empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wkt(s: &str) -> AoiInput {
        AoiInput {
            wkt: Some(s.to_string()),
            geojson: None,
        }
    }

    fn geo(v: Value) -> AoiInput {
        AoiInput {
            wkt: None,
            geojson: Some(v),
        }
    }

    #[test]
    fn rejects_both_and_neither() {
        assert!(validate_aoi(&AoiInput { wkt: None, geojson: None }).is_err());
        let both = AoiInput {
            wkt: Some("POLYGON((0 0,1 1,1 0,0 0))".to_string()),
            geojson: Some(json!({"type": "Polygon", "coordinates": [[[0,0]]]})),
        };
        assert!(validate_aoi(&both).is_err());
    }

    #[test]
    fn accepts_valid_wkt_polygon_and_multipolygon() {
        assert!(validate_aoi(&wkt("POLYGON((0 0, 1 1, 1 0, 0 0))")).is_ok());
        assert!(validate_aoi(&wkt("MULTIPOLYGON(((0 0, 1 1, 1 0, 0 0)))")).is_ok());
    }

    #[test]
    fn rejects_malformed_wkt() {
        assert!(validate_aoi(&wkt("LINESTRING(0 0, 1 1)")).is_err());
        assert!(validate_aoi(&wkt("POLYGON((0 0, 1 1")).is_err());
        assert!(validate_aoi(&wkt("POLYGON()")).is_err());
    }

    #[test]
    fn accepts_valid_geojson_polygon() {
        let g = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]]
        });
        assert!(validate_aoi(&geo(g)).is_ok());
    }

    #[test]
    fn rejects_wrong_geojson_type_and_empty_coordinates() {
        assert!(validate_aoi(&geo(json!({"type": "Point", "coordinates": [0.0, 0.0]}))).is_err());
        assert!(validate_aoi(&geo(json!({"type": "Polygon", "coordinates": []}))).is_err());
        assert!(validate_aoi(&geo(json!({"type": "Polygon"}))).is_err());
    }
}
