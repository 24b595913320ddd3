//! WCS request parameters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use ows_common::bbox::BoundingBox;
use ows_common::error::{OwsError, OwsResult};
use ows_common::time;

use crate::query::{first, RawQuery};
use crate::wms::{FLOAT_LIST_4, ISO_TIME};

static WCS_RULES: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("service", Regex::new(r"(?i)^wcs$").unwrap());
    m.insert(
        "request",
        Regex::new(r"^(GetCapabilities|DescribeCoverage|GetCoverage)$").unwrap(),
    );
    m.insert("version", Regex::new(r"^\d+\.\d+(\.\d+)?$").unwrap());
    m.insert("coverage", Regex::new(r"^.+$").unwrap());
    m.insert("coverages", Regex::new(r"^.+$").unwrap());
    m.insert("styles", Regex::new(r"^.*$").unwrap());
    m.insert("crs", Regex::new(r"(?i)^[a-z]+:\d+$").unwrap());
    m.insert("srs", Regex::new(r"(?i)^[a-z]+:\d+$").unwrap());
    m.insert("bbox", Regex::new(FLOAT_LIST_4).unwrap());
    m.insert("width", Regex::new(r"^[-+]?\d+$").unwrap());
    m.insert("height", Regex::new(r"^[-+]?\d+$").unwrap());
    m.insert("time", Regex::new(ISO_TIME).unwrap());
    m.insert("format", Regex::new(r"^[\w/\-\+\.]+$").unwrap());
    m
});

/// Typed WCS request record.
#[derive(Debug, Clone, Default)]
pub struct WcsParams {
    pub service: Option<String>,
    pub request: Option<String>,
    pub version: Option<String>,
    pub coverages: Vec<String>,
    pub styles: Vec<String>,
    pub crs: Option<String>,
    pub bbox: Option<BoundingBox>,
    /// Zero or negative means "resolve via the extent probe".
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub time: Option<DateTime<Utc>>,
    pub format: Option<String>,
}

pub fn check_wcs_version(version: &str) -> bool {
    version == "1.0.0"
}

fn checked<'q>(query: &'q RawQuery, key: &'static str) -> OwsResult<Option<&'q str>> {
    let Some(value) = first(query, key) else {
        return Ok(None);
    };
    let re = &WCS_RULES[key];
    if !re.is_match(value) {
        return Err(OwsError::invalid(key, format!("malformed value '{}'", value)));
    }
    Ok(Some(value))
}

/// Build a [`WcsParams`] record from a normalised query.
pub fn parse_wcs(query: &RawQuery) -> OwsResult<WcsParams> {
    let mut p = WcsParams::default();

    p.service = checked(query, "service")?.map(|s| s.to_uppercase());
    p.request = checked(query, "request")?.map(str::to_string);
    p.version = checked(query, "version")?.map(str::to_string);

    if let Some(coverages) = checked(query, "coverage")?.or(checked(query, "coverages")?) {
        p.coverages = coverages.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(styles) = checked(query, "styles")? {
        p.styles = styles.split(',').map(|s| s.trim().to_string()).collect();
    }

    p.crs = checked(query, "crs")?
        .or(checked(query, "srs")?)
        .map(|s| s.to_uppercase());

    if let Some(bbox) = checked(query, "bbox")? {
        p.bbox = Some(
            BoundingBox::from_kvp(bbox).map_err(|e| OwsError::invalid("bbox", e.to_string()))?,
        );
    }

    if let Some(width) = checked(query, "width")? {
        p.width = Some(
            width
                .parse()
                .map_err(|_| OwsError::invalid("width", "not an integer"))?,
        );
    }
    if let Some(height) = checked(query, "height")? {
        p.height = Some(
            height
                .parse()
                .map_err(|_| OwsError::invalid("height", "not an integer"))?,
        );
    }

    if let Some(t) = checked(query, "time")? {
        p.time =
            Some(time::parse_iso(t).map_err(|e| OwsError::invalid("time", e.to_string()))?);
    }

    p.format = checked(query, "format")?.map(str::to_string);

    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_query;

    #[test]
    fn test_parse_get_coverage() {
        let q = parse_query(
            "service=WCS&request=GetCoverage&version=1.0.0&coverage=L&crs=EPSG:4326&bbox=100,-45,155,-10&width=4096&height=4096&format=geotiff&time=2020-01-15T00:00:00.000Z",
        );
        let p = parse_wcs(&q).unwrap();
        assert_eq!(p.coverages, vec!["L"]);
        assert_eq!(p.width, Some(4096));
        assert_eq!(p.format.as_deref(), Some("geotiff"));
    }

    #[test]
    fn test_coverage_name_with_punctuation_is_accepted() {
        // Sanitisation happens at response-filename time, not parse time.
        let q = parse_query("service=WCS&request=GetCoverage&coverage=My%20Layer/X!");
        let p = parse_wcs(&q).unwrap();
        assert_eq!(p.coverages, vec!["My Layer/X!"]);
    }

    #[test]
    fn test_zero_extent_probe_dimensions() {
        let q = parse_query("service=WCS&request=GetCoverage&width=0&height=0");
        let p = parse_wcs(&q).unwrap();
        assert_eq!(p.width, Some(0));
        assert_eq!(p.height, Some(0));
    }

    #[test]
    fn test_version_allowlist() {
        assert!(check_wcs_version("1.0.0"));
        assert!(!check_wcs_version("1.1.0"));
        assert!(!check_wcs_version("2.0.1"));
    }
}
