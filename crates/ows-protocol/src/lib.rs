//! Request parameter parsing for the WMS, WCS and WPS protocol families.
//!
//! Each protocol has a table-driven checker mapping canonical field names
//! to a validation regex and a conversion into a typed parameter record.
//! Unknown fields are ignored; malformed known fields are request errors.

pub mod geojson;
pub mod query;
pub mod wms;
pub mod wcs;
pub mod wps;

pub use geojson::{Feature, FeatureCollection, Geometry};
pub use query::RawQuery;
pub use wms::{check_wms_version, parse_wms, WmsParams};
pub use wcs::{check_wcs_version, parse_wcs, WcsParams};
pub use wps::{parse_wps, WpsParams};
