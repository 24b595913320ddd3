//! Client for the raster worker fleet.
//!
//! Workers expose three calls over HTTP/JSON: `decode` reads a file list
//! plus a geographic window and returns decoded pixels, `drill` aggregates
//! pixel statistics inside a geometry, and `extent` suggests an output grid
//! for a bounding box. Requests are spread round-robin over the configured
//! nodes and response sizes are bounded.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use ows_common::config::{BandExpressions, Mask};
use ows_common::error::{OwsError, OwsResult};
use ows_common::time::format_iso;

use crate::tile::{DecodedTile, GeoDrillRequest, GeoTileGranule};

#[derive(Debug, Serialize)]
struct DecodeBody<'a> {
    collection: &'a str,
    files: Vec<&'a str>,
    bbox: [f64; 4],
    crs: &'a str,
    width: usize,
    height: usize,
    bands: &'a BandExpressions,
    #[serde(skip_serializing_if = "Option::is_none")]
    mask: Option<&'a Mask>,
    polygon_segments: usize,
    conc_limit: usize,
}

#[derive(Debug, Deserialize)]
struct DecodeReply {
    width: usize,
    height: usize,
    #[serde(default)]
    raster_type: String,
    bands: Vec<Vec<f32>>,
    #[serde(default)]
    nodata: f32,
}

#[derive(Debug, Serialize)]
struct DrillBody<'a> {
    collection: &'a str,
    files: Vec<&'a str>,
    geometry: &'a str,
    crs: &'a str,
    bands: &'a BandExpressions,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct DrillReply {
    #[serde(default)]
    means: Vec<f64>,
    #[serde(default)]
    sample_counts: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct ExtentBody<'a> {
    collection: &'a str,
    files: Vec<&'a str>,
    bbox: [f64; 4],
    epsg: u32,
}

#[derive(Debug, Deserialize)]
struct ExtentReply {
    width: i64,
    height: i64,
}

/// One drill sample: a timestamp plus per-band aggregates.
#[derive(Debug, Clone)]
pub struct DrillSample {
    pub timestamp: String,
    pub means: Vec<f64>,
    pub sample_counts: Vec<i64>,
}

pub struct WorkerClient {
    nodes: Vec<String>,
    next: AtomicUsize,
    http: reqwest::Client,
    max_msg_size: usize,
}

impl WorkerClient {
    pub fn new(nodes: Vec<String>, http: reqwest::Client, max_msg_size: usize) -> Self {
        Self {
            nodes,
            next: AtomicUsize::new(0),
            http,
            max_msg_size,
        }
    }

    fn next_node(&self) -> OwsResult<&str> {
        if self.nodes.is_empty() {
            return Err(OwsError::WorkerError("no worker nodes configured".to_string()));
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        Ok(&self.nodes[i])
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> OwsResult<R> {
        let node = self.next_node()?;
        let url = format!("http://{}/{}", node, endpoint);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| OwsError::WorkerError(format!("{}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(OwsError::WorkerError(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        if let Some(len) = resp.content_length() {
            if len as usize > self.max_msg_size {
                return Err(OwsError::WorkerError(format!(
                    "{} response of {} bytes exceeds the {} byte limit",
                    url, len, self.max_msg_size
                )));
            }
        }

        resp.json()
            .await
            .map_err(|e| OwsError::WorkerError(format!("{}: {}", url, e)))
    }

    /// Fetch decoded pixels for one granule's window.
    pub async fn decode(&self, granule: &GeoTileGranule) -> OwsResult<DecodedTile> {
        let req = &granule.request;
        if granule.is_empty_tile() {
            return Ok(DecodedTile::empty(req.off_x, req.off_y));
        }

        let body = DecodeBody {
            collection: &req.collection,
            files: vec![granule.path.as_str()],
            bbox: [req.bbox.min_x, req.bbox.min_y, req.bbox.max_x, req.bbox.max_y],
            crs: &req.crs,
            width: req.width,
            height: req.height,
            bands: &req.band_expr,
            mask: req.mask.as_ref(),
            polygon_segments: req.polygon_segments,
            conc_limit: req.conc_limit,
        };
        let reply: DecodeReply = self.post("decode", &body).await?;
        Ok(DecodedTile {
            width: reply.width,
            height: reply.height,
            raster_type: reply.raster_type,
            bands: reply.bands,
            nodata: reply.nodata,
            off_x: req.off_x,
            off_y: req.off_y,
        })
    }

    /// Aggregate band statistics inside the drill geometry for one granule.
    pub async fn drill(
        &self,
        req: &GeoDrillRequest,
        path: &str,
        timestamp: &chrono::DateTime<chrono::Utc>,
    ) -> OwsResult<DrillSample> {
        let body = DrillBody {
            collection: &req.collection,
            files: vec![path],
            geometry: &req.geometry,
            crs: &req.crs,
            bands: &req.band_expr,
            timestamp: format_iso(timestamp),
        };
        let reply: DrillReply = self.post("drill", &body).await?;
        Ok(DrillSample {
            timestamp: format_iso(timestamp),
            means: reply.means,
            sample_counts: reply.sample_counts,
        })
    }

    /// Suggest an output grid for a bbox from a granule's native grid.
    pub async fn extent(
        &self,
        collection: &str,
        path: &str,
        bbox: [f64; 4],
        epsg: u32,
    ) -> OwsResult<(i64, i64)> {
        let body = ExtentBody {
            collection,
            files: vec![path],
            bbox,
            epsg,
        };
        let reply: ExtentReply = self.post("extent", &body).await?;
        Ok((reply.width, reply.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_nodes() {
        let client = WorkerClient::new(
            vec!["a:1".to_string(), "b:2".to_string()],
            reqwest::Client::new(),
            1024,
        );
        assert_eq!(client.next_node().unwrap(), "a:1");
        assert_eq!(client.next_node().unwrap(), "b:2");
        assert_eq!(client.next_node().unwrap(), "a:1");
    }

    #[test]
    fn test_no_nodes_is_error() {
        let client = WorkerClient::new(vec![], reqwest::Client::new(), 1024);
        assert!(client.next_node().is_err());
    }

    #[test]
    fn test_decode_body_shape() {
        let bands = BandExpressions::from_expressions(vec!["red".to_string()]);
        let body = DecodeBody {
            collection: "/g/data/test",
            files: vec!["/g/data/test/a.nc"],
            bbox: [100.0, -45.0, 155.0, -10.0],
            crs: "EPSG:4326",
            width: 256,
            height: 256,
            bands: &bands,
            mask: None,
            polygon_segments: 2,
            conc_limit: 16,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["width"], 256);
        assert_eq!(json["bbox"][2], 155.0);
        assert!(json.get("mask").is_none());
    }
}
