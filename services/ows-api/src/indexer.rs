//! Client for the metadata index service.
//!
//! Turns a geo-request into an intersection query against the index and
//! expands the matching datasets into granules, one per (file, namespace,
//! timestamp). When the index has nothing for a window, a single EmptyTile
//! sentinel is emitted so downstream still advances; on failure an error is
//! surfaced on the error channel and the sentinel is emitted as well.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use ows_common::error::OwsError;
use ows_common::time::format_iso;

use crate::tile::{GeoTileGranule, GeoTileRequest};

/// One dataset entry of the index response.
#[derive(Debug, Clone, Deserialize)]
pub struct GdalDataset {
    pub ds_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub array_type: String,
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub polygon: String,
    #[serde(default)]
    pub means: Vec<f64>,
    #[serde(default)]
    pub sample_counts: Vec<i64>,
    #[serde(default)]
    pub nodata: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetadataResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, rename = "gdal")]
    pub gdal_datasets: Vec<GdalDataset>,
}

/// Build the index query URL for a request window.
pub fn index_url(
    api_address: &str,
    req: &GeoTileRequest,
    collection: &str,
    namespaces: &str,
) -> String {
    let mut url = format!(
        "http://{}{}?intersects&metadata=gdal&time={}",
        api_address,
        collection,
        format_iso(&req.start_time)
    );
    if let Some(end) = &req.end_time {
        url.push_str(&format!("&until={}", format_iso(end)));
    }
    let wkt = match &req.wkt {
        Some(wkt) => wkt.clone(),
        None => req.bbox.to_wkt(),
    };
    url.push_str(&format!(
        "&srs={}&wkt={}&namespace={}&nseg={}&limit={}",
        req.crs, wkt, namespaces, req.polygon_segments, req.query_limit
    ));
    url.replace(' ', "%20")
}

/// Whether a dataset timestamp matches the request window: the exact start
/// instant, or within `[start, end)` in accumulation mode.
fn in_window(t: &DateTime<Utc>, start: &DateTime<Utc>, end: Option<&DateTime<Utc>>) -> bool {
    t == start || end.is_some_and(|end| t > start && t < end)
}

async fn query_one(
    http: &reqwest::Client,
    url: String,
    req: &Arc<GeoTileRequest>,
    out: &mpsc::Sender<GeoTileGranule>,
    err_tx: &mpsc::Sender<OwsError>,
) {
    debug!(url = %url, "index query");

    let empty = || GeoTileGranule::empty(req.clone());

    let body = match http.get(&url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                let _ = err_tx
                    .send(OwsError::IndexError(format!(
                        "error reading response body from {}: {}",
                        url, e
                    )))
                    .await;
                let _ = out.send(empty()).await;
                return;
            }
        },
        Err(e) => {
            let _ = err_tx
                .send(OwsError::IndexError(format!(
                    "GET request to {} failed: {}",
                    url, e
                )))
                .await;
            let _ = out.send(empty()).await;
            return;
        }
    };

    let metadata: MetadataResponse = match serde_json::from_str(&body) {
        Ok(m) => m,
        Err(e) => {
            let _ = err_tx
                .send(OwsError::IndexError(format!(
                    "problem parsing JSON response from {}: {}",
                    url, e
                )))
                .await;
            let _ = out.send(empty()).await;
            return;
        }
    };

    if metadata.gdal_datasets.is_empty() {
        if !metadata.error.is_empty() {
            let _ = err_tx
                .send(OwsError::IndexError(format!(
                    "index returned error: {}",
                    metadata.error
                )))
                .await;
        }
        let _ = out.send(empty()).await;
        return;
    }

    for ds in metadata.gdal_datasets {
        for t in &ds.timestamps {
            if in_window(t, &req.start_time, req.end_time.as_ref()) {
                let granule = GeoTileGranule {
                    request: req.clone(),
                    path: ds.ds_name.clone(),
                    namespace: ds.namespace.clone(),
                    raster_type: ds.array_type.clone(),
                    timestamp: *t,
                    polygon: ds.polygon.clone(),
                };
                if out.send(granule).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Run the index stage for one request: the primary query, plus a parallel
/// mask query when the mask names a different collection or namespace.
pub async fn run_indexer(
    http: reqwest::Client,
    api_address: String,
    req: Arc<GeoTileRequest>,
    out: mpsc::Sender<GeoTileGranule>,
    err_tx: mpsc::Sender<OwsError>,
) {
    let namespaces = if req.namespaces.is_empty() {
        String::new()
    } else {
        req.namespaces.join(",")
    };

    let primary = index_url(&api_address, &req, &req.collection, &namespaces);

    let mask_url = req.mask.as_ref().and_then(|mask| {
        let mask_collection = if mask.data_source.is_empty() {
            req.collection.as_str()
        } else {
            mask.data_source.as_str()
        };
        if mask_collection != req.collection || mask.id != namespaces {
            Some(index_url(&api_address, &req, mask_collection, &mask.id))
        } else {
            None
        }
    });

    match mask_url {
        Some(mask) => {
            tokio::join!(
                query_one(&http, primary, &req, &out, &err_tx),
                query_one(&http, mask, &req, &out, &err_tx),
            );
        }
        None => query_one(&http, primary, &req, &out, &err_tx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ows_common::bbox::BoundingBox;
    use ows_common::config::BandExpressions;
    use crate::tile::ScaleParams;

    fn test_request(end: Option<DateTime<Utc>>) -> GeoTileRequest {
        GeoTileRequest {
            collection: "/g/data/test".to_string(),
            crs: "EPSG:4326".to_string(),
            bbox: BoundingBox::new(100.0, -45.0, 155.0, -10.0),
            wkt: None,
            width: 256,
            height: 256,
            start_time: Utc.with_ymd_and_hms(2020, 1, 15, 0, 0, 0).unwrap(),
            end_time: end,
            off_x: 0,
            off_y: 0,
            namespaces: vec!["nbart_red".to_string(), "nbart_green".to_string()],
            band_expr: BandExpressions::default(),
            mask: None,
            palette: None,
            scale_params: ScaleParams::default(),
            zoom_limit: 0.0,
            polygon_segments: 2,
            conc_limit: 16,
            query_limit: -1,
        }
    }

    #[test]
    fn test_index_url_shape() {
        let req = test_request(None);
        let url = index_url("mas:8888", &req, &req.collection, "nbart_red,nbart_green");
        assert!(url.starts_with("http://mas:8888/g/data/test?intersects&metadata=gdal"));
        assert!(url.contains("&time=2020-01-15T00:00:00.000Z"));
        assert!(!url.contains("&until="));
        assert!(url.contains("&srs=EPSG:4326"));
        assert!(url.contains("&namespace=nbart_red,nbart_green"));
        assert!(url.contains("&nseg=2"));
        assert!(url.contains("&limit=-1"));
        assert!(url.contains("POLYGON"));
        assert!(!url.contains(' '));
    }

    #[test]
    fn test_index_url_range_mode() {
        let end = Utc.with_ymd_and_hms(2020, 1, 16, 0, 0, 0).unwrap();
        let req = test_request(Some(end));
        let url = index_url("mas:8888", &req, &req.collection, "");
        assert!(url.contains("&until=2020-01-16T00:00:00.000Z"));
    }

    #[test]
    fn test_timestamp_window() {
        let start = Utc.with_ymd_and_hms(2020, 1, 15, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 16, 0, 0, 0).unwrap();
        let mid = Utc.with_ymd_and_hms(2020, 1, 15, 12, 0, 0).unwrap();

        // Instant mode matches only the exact start.
        assert!(in_window(&start, &start, None));
        assert!(!in_window(&mid, &start, None));

        // Range mode is [start, end).
        assert!(in_window(&start, &start, Some(&end)));
        assert!(in_window(&mid, &start, Some(&end)));
        assert!(!in_window(&end, &start, Some(&end)));
    }

    #[test]
    fn test_metadata_response_parsing() {
        let json = r#"{
            "files": ["/g/data/test/a.nc"],
            "gdal": [{
                "ds_name": "NETCDF:\"/g/data/test/a.nc\":nbart_red",
                "namespace": "nbart_red",
                "array_type": "Int16",
                "timestamps": ["2020-01-15T00:00:00.000Z"],
                "polygon": "POLYGON ((100 -45, 155 -45, 155 -10, 100 -10, 100 -45))",
                "nodata": -999.0
            }]
        }"#;
        let resp: MetadataResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.gdal_datasets.len(), 1);
        assert_eq!(resp.gdal_datasets[0].namespace, "nbart_red");
        assert_eq!(resp.gdal_datasets[0].nodata, -999.0);
    }

    #[test]
    fn test_error_response_parsing() {
        let resp: MetadataResponse =
            serde_json::from_str(r#"{"error": "no such collection"}"#).unwrap();
        assert_eq!(resp.error, "no such collection");
        assert!(resp.gdal_datasets.is_empty());
    }
}
