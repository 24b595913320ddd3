//! WMS request parameters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use ows_common::bbox::BoundingBox;
use ows_common::error::{OwsError, OwsResult};
use ows_common::{crs, time};

use crate::query::{first, RawQuery};

/// Validation table: canonical field name to value pattern. Fields not in
/// the table are ignored by the checker.
static WMS_RULES: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("service", Regex::new(r"(?i)^wms$").unwrap());
    m.insert(
        "request",
        Regex::new(r"^(GetCapabilities|GetMap|GetFeatureInfo|DescribeLayer|GetLegendGraphic)$")
            .unwrap(),
    );
    m.insert("version", Regex::new(r"^\d+\.\d+(\.\d+)?$").unwrap());
    m.insert("layers", Regex::new(r"^.+$").unwrap());
    m.insert("layer", Regex::new(r"^.+$").unwrap());
    m.insert("styles", Regex::new(r"^.*$").unwrap());
    m.insert("style", Regex::new(r"^.*$").unwrap());
    m.insert("crs", Regex::new(r"(?i)^[a-z]+:\d+$").unwrap());
    m.insert("srs", Regex::new(r"(?i)^[a-z]+:\d+$").unwrap());
    m.insert("bbox", Regex::new(FLOAT_LIST_4).unwrap());
    m.insert("width", Regex::new(r"^[-+]?\d+$").unwrap());
    m.insert("height", Regex::new(r"^[-+]?\d+$").unwrap());
    m.insert("time", Regex::new(ISO_TIME).unwrap());
    m.insert("format", Regex::new(r"^[\w/\-\+\.]+$").unwrap());
    m.insert("info_format", Regex::new(r"^[\w/\-\+\.]+$").unwrap());
    m.insert("i", Regex::new(r"^\d+$").unwrap());
    m.insert("j", Regex::new(r"^\d+$").unwrap());
    m.insert("x", Regex::new(r"^[-+]?\d+$").unwrap());
    m.insert("y", Regex::new(r"^[-+]?\d+$").unwrap());
    m
});

pub(crate) const FLOAT_LIST_4: &str =
    r"^[-+]?\d*\.?\d+([eE][-+]?\d+)?(\s*,\s*[-+]?\d*\.?\d+([eE][-+]?\d+)?){3}$";
pub(crate) const ISO_TIME: &str = r"^\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}:\d{2}(\.\d+)?Z?)?$";

/// Typed WMS request record.
#[derive(Debug, Clone, Default)]
pub struct WmsParams {
    pub service: Option<String>,
    pub request: Option<String>,
    pub version: Option<String>,
    pub layers: Vec<String>,
    pub styles: Vec<String>,
    pub crs: Option<String>,
    pub bbox: Option<BoundingBox>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub time: Option<DateTime<Utc>>,
    pub format: Option<String>,
    pub info_format: Option<String>,
    /// Feature-info pixel column/row.
    pub i: Option<u32>,
    pub j: Option<u32>,
    /// Worker-mode master-frame offsets.
    pub off_x: Option<i64>,
    pub off_y: Option<i64>,
}

impl WmsParams {
    /// Apply the (version, CRS) quirks from the adjustment table: WMS
    /// 1.3.0 receives lat/lon ordered bboxes for EPSG:4326, and `CRS:84`
    /// maps onto `EPSG:4326` with x/y ordering already correct.
    pub fn apply_crs_quirks(&mut self) {
        let Some(version) = self.version.as_deref() else {
            return;
        };
        let Some(crs_raw) = self.crs.as_deref() else {
            return;
        };
        let upper = crs_raw.to_uppercase();
        if crs::VersionAdjust::for_wms(version, &upper).swap_bbox_axes {
            if let Some(bbox) = &self.bbox {
                self.bbox = Some(bbox.swapped_axes());
            }
        }
        if version == "1.3.0" && upper == "CRS:84" {
            self.crs = Some("EPSG:4326".to_string());
            return;
        }
        self.crs = Some(upper);
    }

    /// Resolution adjustments for this request's version and CRS.
    pub fn version_adjust(&self) -> crs::VersionAdjust {
        crs::VersionAdjust::for_wms(
            self.version.as_deref().unwrap_or(""),
            self.crs.as_deref().unwrap_or(""),
        )
    }
}

pub fn check_wms_version(version: &str) -> bool {
    matches!(version, "1.1.1" | "1.3.0")
}

fn checked<'q>(query: &'q RawQuery, key: &'static str) -> OwsResult<Option<&'q str>> {
    let Some(value) = first(query, key) else {
        return Ok(None);
    };
    let re = &WMS_RULES[key];
    if !re.is_match(value) {
        return Err(OwsError::invalid(key, format!("malformed value '{}'", value)));
    }
    Ok(Some(value))
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

/// Build a [`WmsParams`] record from a normalised query.
pub fn parse_wms(query: &RawQuery) -> OwsResult<WmsParams> {
    let mut p = WmsParams::default();

    p.service = checked(query, "service")?.map(|s| s.to_uppercase());
    p.request = checked(query, "request")?.map(str::to_string);
    p.version = checked(query, "version")?.map(str::to_string);

    if let Some(layers) = checked(query, "layers")?.or(checked(query, "layer")?) {
        p.layers = split_list(layers);
    }
    if let Some(styles) = checked(query, "styles")?.or(checked(query, "style")?) {
        p.styles = split_list(styles);
    }

    p.crs = checked(query, "crs")?
        .or(checked(query, "srs")?)
        .map(str::to_string);

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
    p.info_format = checked(query, "info_format")?.map(str::to_string);

    if let Some(i) = checked(query, "i")? {
        p.i = i.parse().ok();
    }
    if let Some(j) = checked(query, "j")? {
        p.j = j.parse().ok();
    }
    if let Some(x) = checked(query, "x")? {
        p.off_x = x.parse().ok();
    }
    if let Some(y) = checked(query, "y")? {
        p.off_y = y.parse().ok();
    }

    Ok(p)
}
