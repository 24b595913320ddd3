//! WPS request parameters.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use ows_common::error::{OwsError, OwsResult};

use crate::geojson::{FeatureCollection, Geometry};
use crate::query::{first, RawQuery};

static WPS_RULES: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("service", Regex::new(r"(?i)^wps$").unwrap());
    m.insert(
        "request",
        Regex::new(r"^(GetCapabilities|DescribeProcess|Execute)$").unwrap(),
    );
    m.insert("version", Regex::new(r"^\d+\.\d+(\.\d+)?$").unwrap());
    m.insert("identifier", Regex::new(r"^[\w\-\.]+$").unwrap());
    m
});

/// Typed WPS request record.
#[derive(Debug, Clone, Default)]
pub struct WpsParams {
    pub service: Option<String>,
    pub request: Option<String>,
    pub version: Option<String>,
    pub identifier: Option<String>,
    pub feature_collection: Option<FeatureCollection>,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
}

fn checked<'q>(query: &'q RawQuery, key: &'static str) -> OwsResult<Option<&'q str>> {
    let Some(value) = first(query, key) else {
        return Ok(None);
    };
    let re = &WPS_RULES[key];
    if !re.is_match(value) {
        return Err(OwsError::invalid(key, format!("malformed value '{}'", value)));
    }
    Ok(Some(value))
}

/// Build a [`WpsParams`] record from a normalised query (POST body map).
pub fn parse_wps(query: &RawQuery) -> OwsResult<WpsParams> {
    let mut p = WpsParams::default();

    p.service = checked(query, "service")?.map(|s| s.to_uppercase());
    p.request = checked(query, "request")?.map(str::to_string);
    p.version = checked(query, "version")?.map(str::to_string);
    p.identifier = checked(query, "identifier")?.map(str::to_string);

    if let Some(raw) = first(query, "featurecollection").or(first(query, "feature_collection")) {
        let fc: FeatureCollection = serde_json::from_str(raw)
            .map_err(|e| OwsError::invalid("featurecollection", e.to_string()))?;
        p.feature_collection = Some(fc);
    }

    p.start_datetime = first(query, "start_datetime")
        .or(first(query, "startdatetime"))
        .map(str::to_string);
    p.end_datetime = first(query, "end_datetime")
        .or(first(query, "enddatetime"))
        .map(str::to_string);

    Ok(p)
}

impl WpsParams {
    /// The single Execute geometry: exactly one feature, Point, Polygon or
    /// MultiPolygon.
    pub fn execute_geometry(&self) -> OwsResult<&Geometry> {
        let fc = self.feature_collection.as_ref().ok_or_else(|| {
            OwsError::invalid("featurecollection", "the request does not contain the 'feature' property")
        })?;
        if fc.features.len() != 1 {
            return Err(OwsError::invalid(
                "featurecollection",
                format!("expected exactly one feature, got {}", fc.features.len()),
            ));
        }
        let geom = &fc.features[0].geometry;
        if !geom.is_point() && !geom.is_areal() {
            return Err(OwsError::invalid(
                "featurecollection",
                "geometry not supported, only Point, Polygon and MultiPolygon are available",
            ));
        }
        Ok(geom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_query;

    fn polygon_body(coords: &str) -> RawQuery {
        let fc = format!(
            r#"{{"type":"FeatureCollection","features":[{{"type":"Feature","geometry":{{"type":"Polygon","coordinates":{}}},"properties":{{}}}}]}}"#,
            coords
        );
        let body = format!(
            "service=WPS&request=Execute&identifier=P&featureCollection={}",
            url::form_urlencoded::byte_serialize(fc.as_bytes()).collect::<String>()
        );
        parse_query(&body)
    }

    #[test]
    fn test_parse_execute() {
        let q = polygon_body("[[[0,0],[1,0],[1,1],[0,0]]]");
        let p = parse_wps(&q).unwrap();
        assert_eq!(p.identifier.as_deref(), Some("P"));
        let geom = p.execute_geometry().unwrap();
        assert!(geom.is_areal());
    }

    #[test]
    fn test_execute_requires_single_feature() {
        let q = parse_query(
            "service=WPS&request=Execute&identifier=P&featureCollection=%7B%22type%22%3A%22FeatureCollection%22%2C%22features%22%3A%5B%5D%7D",
        );
        let p = parse_wps(&q).unwrap();
        assert!(p.execute_geometry().is_err());
    }

    #[test]
    fn test_execute_rejects_line_geometry() {
        let fc = r#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":{"type":"LineString","coordinates":[[0,0],[1,1]]},"properties":{}}]}"#;
        let body = format!(
            "service=WPS&request=Execute&identifier=P&featureCollection={}",
            url::form_urlencoded::byte_serialize(fc.as_bytes()).collect::<String>()
        );
        let p = parse_wps(&parse_query(&body)).unwrap();
        assert!(p.execute_geometry().is_err());
    }

    #[test]
    fn test_malformed_feature_collection() {
        let q = parse_query("service=WPS&request=Execute&featureCollection=%7Bnope");
        assert!(parse_wps(&q).is_err());
    }
}
