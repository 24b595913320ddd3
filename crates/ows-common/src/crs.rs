//! Coordinate reference system handling.
//!
//! The two protocol-version quirks live here as a table keyed by
//! (version, CRS): the WMS 1.3.0 lat/lon axis swap for `EPSG:4326`, and
//! the legacy-version resolution scaling used for zoom-limit comparisons.

use thiserror::Error;

/// Normalise a CRS identifier: uppercases, and maps `CRS:84` onto
/// `EPSG:4326` (same datum, lon/lat axis order already matches x/y).
pub fn normalize_crs(crs: &str) -> String {
    let upper = crs.trim().to_uppercase();
    if upper == "CRS:84" {
        "EPSG:4326".to_string()
    } else {
        upper
    }
}

/// Extract the numeric EPSG code from identifiers such as "EPSG:4326".
pub fn extract_epsg_code(crs: &str) -> Result<u32, CrsError> {
    let upper = crs.trim().to_uppercase();
    if upper == "CRS:84" {
        return Ok(4326);
    }
    let code = upper
        .strip_prefix("EPSG:")
        .ok_or_else(|| CrsError::Unsupported(crs.to_string()))?;
    code.parse()
        .map_err(|_| CrsError::Unsupported(crs.to_string()))
}

/// Per-(version, CRS) request adjustments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionAdjust {
    /// The received bbox is in y,x order and must be reordered before use.
    /// Only WMS 1.3.0 with `EPSG:4326` sends lat/lon ordering; `CRS:84`
    /// keeps x/y ordering even though it names the same datum.
    pub swap_bbox_axes: bool,
    /// Multiplier applied to the request resolution before comparing it
    /// against a layer zoom limit. Legacy clients send degree-space values
    /// that the meter-space limits predate.
    pub resolution_scale: f64,
}

impl VersionAdjust {
    /// Look up the adjustment for a WMS request. `crs` is the uppercased
    /// request value, before any `CRS:84` renaming.
    pub fn for_wms(version: &str, crs: &str) -> VersionAdjust {
        let swap = version == "1.3.0" && crs == "EPSG:4326";
        let scale = if version == "1.1.1" { 100_000.0 } else { 1.0 };
        VersionAdjust {
            swap_bbox_axes: swap,
            resolution_scale: scale,
        }
    }
}

#[derive(Debug, Error)]
pub enum CrsError {
    #[error("Invalid CRS code {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_crs("epsg:3857"), "EPSG:3857");
        assert_eq!(normalize_crs("CRS:84"), "EPSG:4326");
    }

    #[test]
    fn test_extract_epsg() {
        assert_eq!(extract_epsg_code("EPSG:4326").unwrap(), 4326);
        assert_eq!(extract_epsg_code("epsg:3857").unwrap(), 3857);
        assert_eq!(extract_epsg_code("CRS:84").unwrap(), 4326);
        assert!(extract_epsg_code("WGS84").is_err());
    }

    #[test]
    fn test_axis_swap_only_for_130_epsg4326() {
        assert!(VersionAdjust::for_wms("1.3.0", "EPSG:4326").swap_bbox_axes);
        assert!(!VersionAdjust::for_wms("1.3.0", "EPSG:3857").swap_bbox_axes);
        assert!(!VersionAdjust::for_wms("1.3.0", "EPSG:4283").swap_bbox_axes);
        assert!(!VersionAdjust::for_wms("1.3.0", "CRS:84").swap_bbox_axes);
        assert!(!VersionAdjust::for_wms("1.1.1", "EPSG:4326").swap_bbox_axes);
    }

    #[test]
    fn test_legacy_resolution_scale() {
        assert_eq!(
            VersionAdjust::for_wms("1.1.1", "EPSG:4326").resolution_scale,
            100_000.0
        );
        assert_eq!(
            VersionAdjust::for_wms("1.3.0", "EPSG:4326").resolution_scale,
            1.0
        );
    }
}
