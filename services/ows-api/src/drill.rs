//! The drill pipeline behind WPS Execute.
//!
//! A drill request aggregates band statistics inside a geometry over a time
//! range. The indexer enumerates candidate granules for the geometry's
//! footprint, workers aggregate each granule, and the samples are folded
//! into one time series serialized as CSV lines.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use ows_common::bbox::BoundingBox;
use ows_common::config::DataSource;
use ows_common::error::OwsError;
use ows_common::time::parse_iso;
use ows_protocol::geojson::Geometry;

use crate::indexer::run_indexer;
use crate::pipeline::TaskGuard;
use crate::tile::{GeoDrillRequest, GeoTileRequest, ScaleParams};
use crate::worker::{DrillSample, WorkerClient};

/// Render a geometry as WKT for the index query.
pub fn geometry_wkt(geom: &Geometry) -> String {
    fn pos(p: &[f64]) -> String {
        format!("{} {}", p.first().unwrap_or(&0.0), p.get(1).unwrap_or(&0.0))
    }
    fn ring(r: &[Vec<f64>]) -> String {
        let verts: Vec<String> = r.iter().map(|p| pos(p)).collect();
        format!("({})", verts.join(", "))
    }
    fn rings(rs: &[Vec<Vec<f64>>]) -> String {
        let parts: Vec<String> = rs.iter().map(|r| ring(r)).collect();
        format!("({})", parts.join(", "))
    }

    match geom {
        Geometry::Point { coordinates } => format!("POINT ({})", pos(coordinates)),
        Geometry::Polygon { coordinates } => {
            format!("POLYGON {}", rings(coordinates))
        }
        Geometry::MultiPolygon { coordinates } => {
            let polys: Vec<String> = coordinates.iter().map(|p| rings(p)).collect();
            format!("MULTIPOLYGON ({})", polys.join(", "))
        }
        Geometry::LineString { coordinates } => {
            format!("LINESTRING {}", ring(coordinates))
        }
        Geometry::MultiPoint { coordinates } => {
            let pts: Vec<String> = coordinates.iter().map(|p| pos(p)).collect();
            format!("MULTIPOINT ({})", pts.join(", "))
        }
        Geometry::MultiLineString { coordinates } => {
            let lines: Vec<String> = coordinates.iter().map(|r| ring(r)).collect();
            format!("MULTILINESTRING ({})", lines.join(", "))
        }
    }
}

/// The axis-aligned footprint of a geometry.
pub fn geometry_bbox(geom: &Geometry) -> BoundingBox {
    let mut bbox = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    let mut extend = |p: &[f64]| {
        if p.len() >= 2 {
            bbox.min_x = bbox.min_x.min(p[0]);
            bbox.min_y = bbox.min_y.min(p[1]);
            bbox.max_x = bbox.max_x.max(p[0]);
            bbox.max_y = bbox.max_y.max(p[1]);
        }
    };
    match geom {
        Geometry::Point { coordinates } => extend(coordinates),
        Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
            coordinates.iter().for_each(|p| extend(p))
        }
        Geometry::Polygon { coordinates } | Geometry::MultiLineString { coordinates } => {
            coordinates.iter().flatten().for_each(|p| extend(p))
        }
        Geometry::MultiPolygon { coordinates } => coordinates
            .iter()
            .flatten()
            .flatten()
            .for_each(|p| extend(p)),
    }
    if !bbox.min_x.is_finite() {
        return BoundingBox::new(0.0, 0.0, 0.0, 0.0);
    }
    bbox
}

/// The zero time used when neither the request nor the data source sets a
/// start date.
pub fn zero_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
}

/// Start time resolution: request value, else the data source's start date,
/// else the zero time.
pub fn resolve_start_time(param: Option<&str>, ds: &DataSource) -> DateTime<Utc> {
    if let Some(raw) = param {
        if let Ok(t) = parse_iso(raw) {
            return t;
        }
        if !raw.is_empty() {
            debug!(value = %raw, "invalid input start date");
        }
    }
    let configured = ds.start_iso_date.trim();
    if !configured.is_empty() {
        if let Ok(t) = parse_iso(configured) {
            return t;
        }
        debug!(value = %configured, "failed to parse data source start date, defaulting to no start date");
    }
    zero_time()
}

/// End time resolution: request value, else the data source's end date
/// unless it is `"now"`, else now.
pub fn resolve_end_time(param: Option<&str>, ds: &DataSource, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(raw) = param {
        if let Ok(t) = parse_iso(raw) {
            return t;
        }
        if !raw.is_empty() {
            debug!(value = %raw, "invalid input end date");
        }
    }
    let configured = ds.end_iso_date.trim();
    if !configured.is_empty() && !configured.eq_ignore_ascii_case("now") {
        if let Ok(t) = parse_iso(configured) {
            return t;
        }
        debug!(value = %configured, "failed to parse data source end date, defaulting to now");
    }
    now
}

/// Fold drill samples into CSV lines, one per timestamp in ascending
/// order. Samples sharing a timestamp are combined by sample-count-weighted
/// means.
pub fn aggregate_samples(samples: Vec<DrillSample>, bands: usize) -> String {
    let mut grouped: BTreeMap<String, (Vec<f64>, Vec<i64>)> = BTreeMap::new();
    for sample in samples {
        let entry = grouped
            .entry(sample.timestamp)
            .or_insert_with(|| (vec![0.0; bands], vec![0; bands]));
        for b in 0..bands {
            let mean = sample.means.get(b).copied().unwrap_or(0.0);
            let count = sample.sample_counts.get(b).copied().unwrap_or(0);
            entry.0[b] += mean * count as f64;
            entry.1[b] += count;
        }
    }

    let mut out = String::new();
    for (timestamp, (sums, counts)) in grouped {
        out.push_str(&timestamp);
        for b in 0..bands {
            if counts[b] > 0 {
                out.push_str(&format!(",{}", sums[b] / counts[b] as f64));
            } else {
                out.push_str(",NaN");
            }
        }
        out.push('\n');
    }
    out
}

/// The drill pipeline: indexer plus worker aggregation.
pub struct DrillPipeline {
    pub index_address: String,
    pub workers: Arc<WorkerClient>,
    pub http: reqwest::Client,
    pub err_tx: mpsc::Sender<OwsError>,
}

impl DrillPipeline {
    /// Run one drill request to completion; the serialized time series
    /// arrives on the returned channel.
    pub fn process(&self, request: GeoDrillRequest, guard: &mut TaskGuard) -> mpsc::Receiver<String> {
        let (out_tx, out_rx) = mpsc::channel::<String>(1);
        let (granule_tx, mut granule_rx) = mpsc::channel(100);

        let index_request = Arc::new(GeoTileRequest {
            collection: request.collection.clone(),
            crs: request.crs.clone(),
            bbox: request.bbox,
            wkt: Some(request.wkt.clone()),
            width: 0,
            height: 0,
            start_time: request.start_time,
            end_time: Some(request.end_time),
            off_x: 0,
            off_y: 0,
            namespaces: request.namespaces.clone(),
            band_expr: request.band_expr.clone(),
            mask: None,
            palette: None,
            scale_params: ScaleParams::default(),
            zoom_limit: 0.0,
            polygon_segments: 2,
            conc_limit: 1,
            query_limit: -1,
        });

        guard.push(tokio::spawn(run_indexer(
            self.http.clone(),
            self.index_address.clone(),
            index_request,
            granule_tx,
            self.err_tx.clone(),
        )));

        let workers = self.workers.clone();
        let err_tx = self.err_tx.clone();
        guard.push(tokio::spawn(async move {
            let bands = request.band_expr.expressions.len().max(1);
            let mut samples = Vec::new();
            while let Some(granule) = granule_rx.recv().await {
                if granule.is_empty_tile() {
                    continue;
                }
                match workers
                    .drill(&request, &granule.path, &granule.timestamp)
                    .await
                {
                    Ok(sample) => samples.push(sample),
                    Err(e) => {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                }
            }
            let _ = out_tx.send(aggregate_samples(samples, bands)).await;
        }));

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Geometry {
        Geometry::Polygon {
            coordinates: vec![vec![
                vec![147.0, -35.0],
                vec![148.0, -35.0],
                vec![148.0, -34.0],
                vec![147.0, -34.0],
                vec![147.0, -35.0],
            ]],
        }
    }

    #[test]
    fn test_geometry_wkt() {
        let wkt = geometry_wkt(&square());
        assert!(wkt.starts_with("POLYGON (("));
        assert!(wkt.contains("147 -35"));

        let point = Geometry::Point {
            coordinates: vec![147.5, -34.5],
        };
        assert_eq!(geometry_wkt(&point), "POINT (147.5 -34.5)");
    }

    #[test]
    fn test_geometry_bbox() {
        let bbox = geometry_bbox(&square());
        assert_eq!(bbox.min_x, 147.0);
        assert_eq!(bbox.max_y, -34.0);
    }

    #[test]
    fn test_resolve_start_time_precedence() {
        let mut ds = DataSource::default();
        ds.start_iso_date = "2015-01-01T00:00:00.000Z".to_string();

        // Request wins.
        let t = resolve_start_time(Some("2020-06-01T00:00:00.000Z"), &ds);
        assert_eq!(t, parse_iso("2020-06-01T00:00:00.000Z").unwrap());

        // Invalid request falls back to the data source.
        let t = resolve_start_time(Some("garbage"), &ds);
        assert_eq!(t, parse_iso("2015-01-01T00:00:00.000Z").unwrap());

        // Nothing configured: zero time.
        let t = resolve_start_time(None, &DataSource::default());
        assert_eq!(t, zero_time());
    }

    #[test]
    fn test_resolve_end_time_now_keyword() {
        let now = Utc::now();
        let mut ds = DataSource::default();

        ds.end_iso_date = "now".to_string();
        assert_eq!(resolve_end_time(None, &ds, now), now);

        ds.end_iso_date = "2021-01-01T00:00:00.000Z".to_string();
        assert_eq!(
            resolve_end_time(None, &ds, now),
            parse_iso("2021-01-01T00:00:00.000Z").unwrap()
        );

        assert_eq!(
            resolve_end_time(Some("2022-02-02T00:00:00.000Z"), &ds, now),
            parse_iso("2022-02-02T00:00:00.000Z").unwrap()
        );

        assert_eq!(resolve_end_time(None, &DataSource::default(), now), now);
    }

    #[test]
    fn test_aggregate_samples_weighted_merge() {
        let samples = vec![
            DrillSample {
                timestamp: "2020-01-15T00:00:00.000Z".to_string(),
                means: vec![10.0],
                sample_counts: vec![1],
            },
            DrillSample {
                timestamp: "2020-01-15T00:00:00.000Z".to_string(),
                means: vec![20.0],
                sample_counts: vec![3],
            },
            DrillSample {
                timestamp: "2020-01-01T00:00:00.000Z".to_string(),
                means: vec![5.0],
                sample_counts: vec![2],
            },
        ];
        let csv = aggregate_samples(samples, 1);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        // Ascending timestamps; the repeated timestamp combines to 17.5.
        assert_eq!(lines[0], "2020-01-01T00:00:00.000Z,5");
        assert_eq!(lines[1], "2020-01-15T00:00:00.000Z,17.5");
    }

    #[test]
    fn test_aggregate_samples_empty_band() {
        let samples = vec![DrillSample {
            timestamp: "2020-01-01T00:00:00.000Z".to_string(),
            means: vec![],
            sample_counts: vec![],
        }];
        let csv = aggregate_samples(samples, 1);
        assert_eq!(csv, "2020-01-01T00:00:00.000Z,NaN\n");
    }
}
