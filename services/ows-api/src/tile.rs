//! Units of work flowing through the tile and drill pipelines.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ows_common::bbox::BoundingBox;
use ows_common::config::{BandExpressions, Mask, Palette};

/// Namespace of the sentinel granule meaning "no data at this window".
/// The sentinel is still delivered so downstream can tell empty from error.
pub const EMPTY_TILE: &str = "EmptyTile";

/// Post-decode value transform.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ScaleParams {
    pub offset: f64,
    pub scale: f64,
    pub clip: f64,
}

/// The unit of work submitted to the tile pipeline.
///
/// Owned exclusively by the handler for its lifetime; granules derived from
/// it share it through an `Arc`.
#[derive(Debug, Clone)]
pub struct GeoTileRequest {
    pub collection: String,
    pub crs: String,
    pub bbox: BoundingBox,
    /// Geometry sent to the index, overriding the bbox ring. Set for drill
    /// requests whose footprint is not a rectangle.
    pub wkt: Option<String>,
    /// Output raster size. Positive whenever the request reaches a worker;
    /// zero only for extent probes against the indexer.
    pub width: usize,
    pub height: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Placement of this tile's output within the master frame.
    pub off_x: usize,
    pub off_y: usize,

    pub namespaces: Vec<String>,
    pub band_expr: BandExpressions,
    pub mask: Option<Mask>,
    pub palette: Option<Palette>,
    pub scale_params: ScaleParams,
    pub zoom_limit: f64,
    pub polygon_segments: usize,
    /// Per-node worker concurrency for polygon-shattered requests.
    pub conc_limit: usize,
    /// Index query limit; negative means unlimited.
    pub query_limit: i64,
}

/// One (file, namespace, timestamp) candidate emitted by the indexer.
#[derive(Debug, Clone)]
pub struct GeoTileGranule {
    pub request: Arc<GeoTileRequest>,
    pub path: String,
    pub namespace: String,
    pub raster_type: String,
    pub timestamp: DateTime<Utc>,
    pub polygon: String,
}

impl GeoTileGranule {
    pub fn empty(request: Arc<GeoTileRequest>) -> Self {
        let timestamp = request.start_time;
        Self {
            request,
            path: "NULL".to_string(),
            namespace: EMPTY_TILE.to_string(),
            raster_type: "Byte".to_string(),
            timestamp,
            polygon: String::new(),
        }
    }

    pub fn is_empty_tile(&self) -> bool {
        self.namespace == EMPTY_TILE
    }
}

/// Decoded pixels for one tile, top-left origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedTile {
    pub width: usize,
    pub height: usize,
    pub raster_type: String,
    /// One buffer per output band, row-major.
    pub bands: Vec<Vec<f32>>,
    pub nodata: f32,
    pub off_x: usize,
    pub off_y: usize,
}

impl DecodedTile {
    /// A zero-dimensioned tile, the decoded form of the EmptyTile sentinel.
    pub fn empty(off_x: usize, off_y: usize) -> Self {
        Self {
            off_x,
            off_y,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.bands.is_empty()
    }
}

/// The unit of work for the drill pipeline: a geometry-bounded aggregation.
#[derive(Debug, Clone)]
pub struct GeoDrillRequest {
    /// The feature geometry serialized as GeoJSON, passed to the workers.
    pub geometry: String,
    /// The same geometry as WKT, passed to the index.
    pub wkt: String,
    pub bbox: BoundingBox,
    pub crs: String,
    pub collection: String,
    pub namespaces: Vec<String>,
    pub band_expr: BandExpressions,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
