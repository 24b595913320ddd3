//! The GetCoverage orchestrator.
//!
//! A coverage request is decomposed into a grid of tiles, tile batches are
//! forwarded to sibling frontends as worker-mode requests, the local batch
//! runs through the tile pipeline into a streaming encoder, and peer
//! results are merged into the same master frame as they arrive. The
//! orchestrator is the single owner of the encoder handle; every local
//! write and peer merge happens on this task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use ows_common::bbox::BoundingBox;
use ows_common::config::{Config, Layer};
use ows_common::crs::extract_epsg_code;
use ows_common::error::{OwsError, OwsResult};
use ows_common::time::format_iso;
use ows_protocol::query::RawQuery;
use ows_protocol::wcs::WcsParams;
use ows_protocol::wms::parse_wms;

use crate::encoding::{MasterEncoder, MergeWindow, RasterFormat};
use crate::handlers::{http_error, ows_error};
use crate::handlers::wms::build_pipeline;
use crate::indexer::run_indexer;
use crate::pipeline::TaskGuard;
use crate::state::AppState;
use crate::tile::{DecodedTile, GeoTileRequest, ScaleParams};
use crate::worker::WorkerClient;

/// Flush the encoder every this many local tiles to cap dirty memory.
const CHECKPOINT_THRESHOLD: usize = 300;
/// Lower bound on the batch size handed to any one frontend.
const MIN_TILES_PER_WORKER: usize = 5;

static RE_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&width\s*=\s*[-+]?[0-9]+").unwrap());
static RE_HEIGHT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&height\s*=\s*[-+]?[0-9]+").unwrap());
static RE_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\-_\s]").unwrap());

/// Decompose the master frame into tiles of at most `max_w` x `max_h`
/// pixels, snapping the trailing tiles to the remainder. `off_y` places the
/// worker's top-left-origin tile in the master frame.
pub(crate) fn decompose_tiles(
    bbox: &BoundingBox,
    width: usize,
    height: usize,
    max_w: usize,
    max_h: usize,
) -> Vec<(usize, usize, BoundingBox, usize, usize)> {
    let (x_res, y_res) = bbox.resolution(width, height);
    let mut tiles = Vec::new();

    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            let y_min = bbox.min_y + y as f64 * y_res;
            let y_max = (bbox.min_y + (y + max_h) as f64 * y_res).min(bbox.max_y);
            let x_min = bbox.min_x + x as f64 * x_res;
            let x_max = (bbox.min_x + (x + max_w) as f64 * x_res).min(bbox.max_x);

            let tile_w = (0.5 + (x_max - x_min) / x_res) as usize;
            let tile_h = (0.5 + (y_max - y_min) / y_res) as usize;

            tiles.push((
                tile_w,
                tile_h,
                BoundingBox::new(x_min, y_min, x_max, y_max),
                x,
                height - y - tile_h,
            ));
            x += max_w;
        }
        y += max_h;
    }
    tiles
}

/// Sibling frontends eligible for batch forwarding: every cluster node
/// whose host differs from our own. The comparison is host-only, so two
/// peers on different ports of one host collapse.
pub(crate) fn peer_nodes(cluster_nodes: &[String], own_hostname: &str) -> Vec<String> {
    let own_host = own_hostname.split(':').next().unwrap_or(own_hostname);
    let mut peers = Vec::new();
    for node in cluster_nodes {
        let Ok(parsed) = url::Url::parse(node) else {
            debug!(node = %node, "invalid worker hostname");
            continue;
        };
        match parsed.host_str() {
            Some(host) if host == own_host && !own_host.is_empty() => {
                debug!(node = %node, "skipping worker whose host is our own");
            }
            Some(_) => peers.push(node.clone()),
            None => debug!(node = %node, "invalid worker hostname"),
        }
    }
    peers
}

/// Contiguous batch ranges over `total` tiles for `n_workers` frontends.
/// The batch size is the rounded per-worker share, floored at
/// [`MIN_TILES_PER_WORKER`]; the final batch absorbs the remainder, so
/// fewer batches than frontends is possible.
pub(crate) fn assign_batches(total: usize, n_workers: usize) -> Vec<(usize, usize)> {
    let mut per_worker = (total as f64 / n_workers as f64).round() as usize;
    if per_worker < MIN_TILES_PER_WORKER {
        per_worker = MIN_TILES_PER_WORKER;
    }

    let mut batches = Vec::new();
    for i in 0..n_workers {
        let begin = i * per_worker;
        let mut end = begin + per_worker;
        let last = end >= total;
        if last {
            end = total;
        }
        if begin >= end {
            break;
        }
        batches.push((begin, end));
        if last {
            break;
        }
    }
    batches
}

/// Sanitise the coverage name for the attachment filename.
pub(crate) fn sanitize_coverage_name(name: &str) -> String {
    RE_FILENAME.replace_all(name, "-").into_owned()
}

/// Strip any `width`/`height` pair from a request URL and append the
/// resolved values, so forwarded worker URLs carry them.
pub(crate) fn rewrite_extent(req_url: &str, width: i64, height: i64) -> String {
    let url = RE_WIDTH.replace_all(req_url, "");
    let url = RE_HEIGHT.replace_all(&url, "");
    format!("{}&width={}&height={}", url, width, height)
}

/// Resolve an extent probe (`width <= 0 || height <= 0`) by querying the
/// index for candidate files and asking a worker for the output grid of
/// each, keeping the maximum.
async fn compute_reprojection_extent(
    state: &AppState,
    conf: &Config,
    layer: &Layer,
    probe: GeoTileRequest,
    epsg: u32,
) -> OwsResult<(i64, i64)> {
    let bbox = [
        probe.bbox.min_x,
        probe.bbox.min_y,
        probe.bbox.max_x,
        probe.bbox.max_y,
    ];
    let collection = probe.collection.clone();

    let (granule_tx, mut granule_rx) = mpsc::channel(100);
    let (err_tx, mut err_rx) = mpsc::channel(8);
    let mut guard = TaskGuard::new();
    guard.push(tokio::spawn(run_indexer(
        state.http.clone(),
        conf.service_config.mas_address.clone(),
        Arc::new(probe),
        granule_tx,
        err_tx,
    )));

    let workers = WorkerClient::new(
        conf.service_config.worker_nodes.clone(),
        state.http.clone(),
        layer.max_worker_msg_size,
    );

    let (mut max_w, mut max_h) = (0i64, 0i64);
    loop {
        tokio::select! {
            granule = granule_rx.recv() => match granule {
                Some(g) if !g.is_empty_tile() => {
                    let (w, h) = workers.extent(&collection, &g.path, bbox, epsg).await?;
                    max_w = max_w.max(w);
                    max_h = max_h.max(h);
                }
                Some(_) => {}
                None => break,
            },
            Some(e) = err_rx.recv() => return Err(e),
        }
    }
    Ok((max_w, max_h))
}

/// Parse the worker-mode parallel arrays into this frontend's batch.
fn parse_worker_batch(
    query: &RawQuery,
    make: impl Fn(usize, usize, BoundingBox, usize, usize) -> GeoTileRequest,
) -> Result<Vec<GeoTileRequest>, Response> {
    let wbbox = query.get("wbbox").cloned().unwrap_or_default();
    for key in ["wwidth", "wheight", "woffx", "woffy"] {
        let len = query.get(key).map(|v| v.len()).unwrap_or(0);
        if len != wbbox.len() {
            return Err(http_error(
                StatusCode::BAD_REQUEST,
                &format!("worker parameter {} has different length from wbbox", key),
            ));
        }
    }

    let mut batch = Vec::with_capacity(wbbox.len());
    for i in 0..wbbox.len() {
        let mut tile_query = RawQuery::new();
        tile_query.insert("bbox".to_string(), vec![wbbox[i].clone()]);
        tile_query.insert("width".to_string(), vec![query["wwidth"][i].clone()]);
        tile_query.insert("height".to_string(), vec![query["wheight"][i].clone()]);
        tile_query.insert("x".to_string(), vec![query["woffx"][i].clone()]);
        tile_query.insert("y".to_string(), vec![query["woffy"][i].clone()]);

        let parsed = match parse_wms(&tile_query) {
            Ok(p) => p,
            Err(e) => {
                return Err(http_error(
                    StatusCode::BAD_REQUEST,
                    &format!("worker parameter error: {}", e),
                ))
            }
        };
        let (Some(bbox), Some(w), Some(h), Some(off_x), Some(off_y)) = (
            parsed.bbox,
            parsed.width,
            parsed.height,
            parsed.off_x,
            parsed.off_y,
        ) else {
            return Err(http_error(
                StatusCode::BAD_REQUEST,
                "worker parameter error: incomplete tile parameters",
            ));
        };
        if w <= 0 || h <= 0 || off_x < 0 || off_y < 0 {
            return Err(http_error(
                StatusCode::BAD_REQUEST,
                "worker parameter error: negative tile geometry",
            ));
        }
        batch.push(make(w as usize, h as usize, bbox, off_x as usize, off_y as usize));
    }
    Ok(batch)
}

/// Download one peer batch into its temp file.
async fn fetch_peer(
    http: reqwest::Client,
    url: String,
    path: std::path::PathBuf,
) -> OwsResult<()> {
    let resp = http
        .get(&url)
        .send()
        .await
        .map_err(|e| OwsError::PeerError(format!("worker error: {}", e)))?;
    if !resp.status().is_success() {
        return Err(OwsError::PeerError(format!(
            "worker {} returned {}",
            url,
            resp.status()
        )));
    }

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| OwsError::PeerError(format!("failed to open raster temp file: {}", e)))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| OwsError::PeerError(format!("worker read error: {}", e)))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| OwsError::PeerError(format!("worker write error: {}", e)))?;
    }
    file.flush()
        .await
        .map_err(|e| OwsError::PeerError(format!("worker write error: {}", e)))?;
    Ok(())
}

struct PeerBatch {
    windows: Vec<MergeWindow>,
    temp: NamedTempFile,
}

pub async fn get_coverage(
    state: &AppState,
    conf: Arc<Config>,
    mut params: WcsParams,
    query: &RawQuery,
    req_url: &str,
) -> Response {
    let Some(coverage_name) = params.coverages.first().cloned() else {
        return http_error(
            StatusCode::BAD_REQUEST,
            "Malformed WCS GetCoverage request: missing 'coverage' parameter",
        );
    };
    let idx = match conf.layer_index(&coverage_name) {
        Ok(idx) => idx,
        Err(e) => return http_error(StatusCode::BAD_REQUEST, &format!("{}: {}", e, req_url)),
    };
    let layer = &conf.layers[idx];

    if params.time.is_none() {
        match layer.latest_date(Utc::now()) {
            Ok(t) => params.time = Some(t),
            Err(e) => {
                return http_error(StatusCode::BAD_REQUEST, &format!("{}: {}", e, req_url))
            }
        }
    }
    let Some(crs) = params.crs.clone() else {
        return http_error(
            StatusCode::BAD_REQUEST,
            &format!("Request {} should contain a valid ISO 'crs/srs' parameter.", req_url),
        );
    };
    let Some(bbox) = params.bbox else {
        return http_error(
            StatusCode::BAD_REQUEST,
            &format!("Request {} should contain a valid 'bbox' parameter.", req_url),
        );
    };
    let (Some(mut width), Some(mut height)) = (params.width, params.height) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            &format!("Request {} should contain valid 'width' and 'height' parameters.", req_url),
        );
    };
    let Some(format_name) = params.format.clone() else {
        return http_error(StatusCode::BAD_REQUEST, "Unsupported encoding format");
    };

    let start_time = params.time.unwrap();
    let end_time = layer.accum_end(start_time);

    // Style selection: an explicit unknown style is a 400; with none
    // requested, a single configured style is implied and several are
    // ambiguous.
    let style_idx = match conf.style_index(idx, &params.styles) {
        Ok(Some(s)) => Some(s),
        Ok(None) => match layer.styles.len() {
            0 => None,
            1 => Some(0),
            _ => {
                error!("WCS style not specified");
                return http_error(StatusCode::BAD_REQUEST, "WCS style not specified");
            }
        },
        Err(e) => {
            return http_error(
                StatusCode::BAD_REQUEST,
                &format!("Malformed WCS GetCoverage request: {}", e),
            )
        }
    };
    let style_layer = layer.style_or_self(style_idx);

    let epsg = match extract_epsg_code(&crs) {
        Ok(code) => code,
        Err(_) => {
            return http_error(StatusCode::BAD_REQUEST, &format!("Invalid CRS code {}", crs))
        }
    };

    let is_worker = query.contains_key("wbbox");

    let scale_params = ScaleParams {
        offset: style_layer.offset_value,
        scale: style_layer.scale_value,
        clip: style_layer.clip_value,
    };
    let make_tile_request = |w: usize, h: usize, bbox: BoundingBox, off_x: usize, off_y: usize| {
        GeoTileRequest {
            collection: style_layer.data_source.clone(),
            crs: crs.clone(),
            bbox,
            wkt: None,
            width: w,
            height: h,
            start_time,
            end_time,
            off_x,
            off_y,
            namespaces: style_layer.rgb_expressions.var_list.clone(),
            band_expr: style_layer.rgb_expressions.clone(),
            mask: style_layer.mask.clone(),
            palette: style_layer.palette.clone(),
            scale_params,
            zoom_limit: 0.0,
            polygon_segments: layer.wcs_polygon_segments,
            conc_limit: layer.wcs_conc_per_node,
            query_limit: -1,
        }
    };

    // Extent probe: zero dimensions ask the index (and a worker) for the
    // native output grid, and the request URL is rewritten so forwarded
    // URLs carry the resolved values.
    let mut req_url = req_url.to_string();
    if width <= 0 || height <= 0 {
        if is_worker {
            let msg = "WCS: worker width or height negative";
            info!("{}", msg);
            return http_error(StatusCode::INTERNAL_SERVER_ERROR, msg);
        }
        let probe = make_tile_request(0, 0, bbox, 0, 0);
        match compute_reprojection_extent(state, &conf, layer, probe, epsg).await {
            Ok((w, h)) if w > 0 && h > 0 => {
                if state.verbose {
                    info!(width = w, height = h, "WCS: output image size");
                }
                width = w;
                height = h;
                req_url = rewrite_extent(&req_url, w, h);
            }
            _ => {
                let msg = "WCS: failed to compute output extent";
                info!("{}", msg);
                return http_error(StatusCode::INTERNAL_SERVER_ERROR, msg);
            }
        }
    }

    if width as usize > layer.wcs_max_width || height as usize > layer.wcs_max_height {
        return http_error(
            StatusCode::BAD_REQUEST,
            &format!(
                "Requested width/height is too large, max width:{}, height:{}",
                layer.wcs_max_width, layer.wcs_max_height
            ),
        );
    }
    let width = width as usize;
    let height = height as usize;

    // Build the batches: ours first, one per peer after it.
    let mut batches: Vec<Vec<GeoTileRequest>> = Vec::new();
    let mut peers: Vec<String> = Vec::new();

    if !is_worker {
        if width > layer.wcs_max_tile_width || height > layer.wcs_max_tile_height {
            let tiles: Vec<GeoTileRequest> = decompose_tiles(
                &bbox,
                width,
                height,
                layer.wcs_max_tile_width,
                layer.wcs_max_tile_height,
            )
            .into_iter()
            .map(|(w, h, tile_bbox, off_x, off_y)| make_tile_request(w, h, tile_bbox, off_x, off_y))
            .collect();

            peers = peer_nodes(
                &conf.service_config.ows_cluster_nodes,
                &conf.service_config.ows_hostname,
            );
            for (begin, end) in assign_batches(tiles.len(), peers.len() + 1) {
                batches.push(tiles[begin..end].to_vec());
            }
        } else {
            batches.push(vec![make_tile_request(width, height, bbox, 0, 0)]);
        }
    } else {
        match parse_worker_batch(query, make_tile_request) {
            Ok(batch) => batches.push(batch),
            Err(resp) => return resp,
        }
    }

    let (err_tx, mut err_rx) = mpsc::channel::<OwsError>(100);
    let (worker_err_tx, mut worker_err_rx) = mpsc::channel::<OwsError>(100);
    let (done_tx, mut done_rx) = mpsc::channel::<String>(batches.len().max(1));
    let mut guard = TaskGuard::new();

    // Forward the peer batches. Each peer owns a temp file until its
    // download completes; the orchestrator keeps the handles so deferred
    // cleanup removes them on every exit path.
    let mut peer_batches: HashMap<String, PeerBatch> = HashMap::new();
    if !is_worker && batches.len() > 1 {
        for (iw, batch) in batches.iter().enumerate().skip(1) {
            let peer_host = &peers[iw - 1];
            let mut query_url = format!("{}{}", peer_host, req_url);
            for tile in batch {
                query_url.push_str(&format!(
                    "&wbbox={:.6},{:.6},{:.6},{:.6}&wwidth={}&wheight={}&woffx={}&woffy={}",
                    tile.bbox.min_x,
                    tile.bbox.min_y,
                    tile.bbox.max_x,
                    tile.bbox.max_y,
                    tile.width,
                    tile.height,
                    tile.off_x,
                    tile.off_y,
                ));
            }
            if state.verbose {
                info!(worker = iw, total = batches.len() - 1, url = %query_url, "WCS worker");
            }

            let temp = match tempfile::Builder::new()
                .prefix("worker_raster_")
                .tempfile_in(&conf.service_config.temp_dir)
            {
                Ok(t) => t,
                Err(e) => {
                    let msg =
                        format!("WCS: failed to create raster temp file for WCS worker: {}", e);
                    info!("{}", msg);
                    return http_error(StatusCode::INTERNAL_SERVER_ERROR, &msg);
                }
            };
            let path = temp.path().to_path_buf();
            let name = path.to_string_lossy().into_owned();
            let windows = batch
                .iter()
                .map(|t| MergeWindow {
                    off_x: t.off_x,
                    off_y: t.off_y,
                    width: t.width,
                    height: t.height,
                })
                .collect();
            peer_batches.insert(name.clone(), PeerBatch { windows, temp });

            let http = state.http.clone();
            let done_tx = done_tx.clone();
            let worker_err_tx = worker_err_tx.clone();
            guard.push(tokio::spawn(async move {
                match fetch_peer(http, query_url, path).await {
                    Ok(()) => {
                        let _ = done_tx.send(name).await;
                    }
                    Err(e) => {
                        let _ = worker_err_tx.send(e).await;
                    }
                }
            }));
        }
    }
    drop(done_tx);

    // A worker always encodes GeoTIFF regardless of the requested format,
    // so merges only ever read one layout.
    let driver_format = if is_worker {
        RasterFormat::GeoTiff
    } else {
        RasterFormat::from_name(&format_name)
    };
    let geotransform = bbox.geotransform(width, height);
    let band_count = style_layer.rgb_expressions.expressions.len().max(1);
    let band_names: Vec<String> = (0..band_count)
        .map(|i| {
            style_layer
                .rgb_expressions
                .var_list
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("band_{}", i + 1))
        })
        .collect();

    let mut master_temp: Option<NamedTempFile> = None;
    let mut encoder: Option<MasterEncoder> = None;
    let open_encoder = |master_temp: &mut Option<NamedTempFile>| -> OwsResult<MasterEncoder> {
        let temp = tempfile::Builder::new()
            .prefix("raster_")
            .tempfile_in(&conf.service_config.temp_dir)
            .map_err(|e| OwsError::EncodeError(format!("failed to create raster temp file: {}", e)))?;
        let enc = MasterEncoder::create(
            temp.path(),
            &driver_format,
            geotransform,
            epsg,
            width,
            height,
            &band_names,
        )?;
        *master_temp = Some(temp);
        Ok(enc)
    };

    let pipeline = build_pipeline(
        state,
        &conf,
        layer.max_worker_msg_size,
        layer.wcs_polygon_shard_conc_limit,
        err_tx.clone(),
    );
    drop(err_tx);

    let timeout = tokio::time::sleep(Duration::from_secs(layer.wcs_timeout));
    tokio::pin!(timeout);

    // Local batch: strictly sequential against the single encoder handle.
    let local_batch = &batches[0];
    for (ir, geo_req) in local_batch.iter().enumerate() {
        if state.verbose {
            info!(
                tile = ir + 1,
                total = local_batch.len(),
                off_x = geo_req.off_x,
                off_y = geo_req.off_y,
                width = geo_req.width,
                height = geo_req.height,
                "WCS: processing tile"
            );
        }

        let mut tile_rx = pipeline.process(geo_req.clone(), &mut guard);
        tokio::select! {
            tile = tile_rx.recv() => {
                let tile = tile.unwrap_or_else(|| DecodedTile::empty(geo_req.off_x, geo_req.off_y));
                if encoder.is_none() {
                    match open_encoder(&mut master_temp) {
                        Ok(enc) => encoder = Some(enc),
                        Err(e) => {
                            info!(error = %e, "encoder open failed");
                            return ows_error(&e);
                        }
                    }
                }
                if let Some(enc) = encoder.as_mut() {
                    if let Err(e) = enc.write_window(&tile) {
                        info!(error = %e, "encoder write failed");
                        return ows_error(&e);
                    }
                }
            }
            Some(e) = err_rx.recv() => {
                info!(error = %e, "WCS: error in the pipeline");
                return ows_error(&e);
            }
            Some(e) = worker_err_rx.recv() => {
                info!(error = %e, "WCS worker error");
                return ows_error(&e);
            }
            _ = &mut timeout => {
                error!(threshold = layer.wcs_timeout, "WCS pipeline timed out");
                return http_error(StatusCode::INTERNAL_SERVER_ERROR, "WCS pipeline timed out");
            }
        }

        if (ir + 1) % CHECKPOINT_THRESHOLD == 0 {
            if let Some(enc) = encoder.as_mut() {
                if let Err(e) = enc.flush() {
                    return ows_error(&e);
                }
            }
        }
    }

    // Peer completion: merges are serialized here, against the same handle
    // the local loop used.
    if !is_worker && batches.len() > 1 {
        let mut n_done = 0;
        let n_peer_batches = batches.len() - 1;
        while n_done < n_peer_batches {
            tokio::select! {
                name = done_rx.recv() => {
                    let Some(name) = name else {
                        return http_error(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "WCS: peer workers terminated unexpectedly",
                        );
                    };
                    let Some(batch) = peer_batches.remove(&name) else { continue };
                    if encoder.is_none() {
                        match open_encoder(&mut master_temp) {
                            Ok(enc) => encoder = Some(enc),
                            Err(e) => return ows_error(&e),
                        }
                    }
                    let merge_started = std::time::Instant::now();
                    if let Some(enc) = encoder.as_mut() {
                        if let Err(e) = enc.merge(batch.temp.path(), &batch.windows) {
                            info!(error = %e, "WCS: worker merge failed");
                            return ows_error(&e);
                        }
                    }
                    drop(batch.temp);
                    n_done += 1;
                    if state.verbose {
                        info!(
                            merged = n_done,
                            total = n_peer_batches,
                            elapsed = ?merge_started.elapsed(),
                            "WCS: worker merge done"
                        );
                    }
                }
                Some(e) = worker_err_rx.recv() => {
                    info!(error = %e, "WCS worker error");
                    return ows_error(&e);
                }
            }
        }
    }

    if encoder.is_none() {
        match open_encoder(&mut master_temp) {
            Ok(enc) => encoder = Some(enc),
            Err(e) => return ows_error(&e),
        }
    }
    if let Some(enc) = encoder.take() {
        if let Err(e) = enc.close() {
            return ows_error(&e);
        }
    }
    let Some(master_temp) = master_temp else {
        return http_error(StatusCode::INTERNAL_SERVER_ERROR, "WCS: no master raster");
    };

    // Finalization: naming always follows the requested format, even for
    // worker-mode responses whose payload is GeoTIFF.
    let naming = RasterFormat::from_name(&format_name);
    let filename = format!(
        "{}.{}.{}",
        sanitize_coverage_name(&coverage_name),
        format_iso(&start_time),
        naming.extension()
    );

    let size = match std::fs::metadata(master_temp.path()) {
        Ok(meta) => meta.len(),
        Err(e) => {
            let msg = format!("file stat() failed: {}", e);
            info!("{}", msg);
            return http_error(StatusCode::INTERNAL_SERVER_ERROR, &msg);
        }
    };

    let file = match tokio::fs::File::open(master_temp.path()).await {
        Ok(f) => f,
        Err(e) => {
            let msg = format!("Error opening raster file: {}", e);
            info!("{}", msg);
            return http_error(StatusCode::INTERNAL_SERVER_ERROR, &msg);
        }
    };

    // The temp file handle rides along with the stream so the file is
    // unlinked when the response completes or the client goes away.
    let stream = futures::stream::unfold(
        (file, master_temp),
        |(mut file, temp)| async move {
            let mut buf = vec![0u8; 64 * 1024];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok::<_, std::io::Error>(Bytes::from(buf)), (file, temp)))
                }
                Err(e) => Some((Err(e), (file, temp))),
            }
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", filename),
        )
        .header(header::CONTENT_TYPE, naming.content_type())
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompose_16_tiles() {
        let bbox = BoundingBox::new(100.0, -45.0, 155.0, -10.0);
        let tiles = decompose_tiles(&bbox, 4096, 4096, 1024, 1024);
        assert_eq!(tiles.len(), 16);

        // Every tile is full-size here; offsets follow the bottom-left
        // master-frame convention.
        let (w, h, first_bbox, off_x, off_y) = tiles[0];
        assert_eq!((w, h), (1024, 1024));
        assert_eq!(off_x, 0);
        assert_eq!(off_y, 4096 - 1024);
        assert!((first_bbox.min_x - 100.0).abs() < 1e-9);
        assert!((first_bbox.min_y - -45.0).abs() < 1e-9);

        let (_, _, _, off_x, off_y) = tiles[15];
        assert_eq!(off_x, 3072);
        assert_eq!(off_y, 0);
    }

    #[test]
    fn test_decompose_snaps_trailing_tile() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let tiles = decompose_tiles(&bbox, 1000, 700, 512, 512);
        assert_eq!(tiles.len(), 4);
        // Trailing column and row snap to the remainder.
        assert_eq!(tiles[1].0, 1000 - 512);
        assert_eq!(tiles[2].1, 700 - 512);
        // The partition covers every pixel exactly once.
        let total: usize = tiles.iter().map(|t| t.0 * t.1).sum();
        assert_eq!(total, 1000 * 700);
    }

    #[test]
    fn test_peer_nodes_self_exclusion_host_only() {
        let cluster = vec![
            "http://alpha:8080".to_string(),
            "http://beta:8080".to_string(),
            "http://alpha:9090".to_string(),
            "not a url at all \u{7f}".to_string(),
        ];
        // Port differences collapse: both alpha entries are excluded.
        let peers = peer_nodes(&cluster, "alpha:8080");
        assert_eq!(peers, vec!["http://beta:8080".to_string()]);
    }

    #[test]
    fn test_assign_batches_floor() {
        // 16 tiles over 4 frontends: the rounded share of 4 is floored at
        // 5, so the last batch absorbs only the single remaining tile.
        let batches = assign_batches(16, 4);
        assert_eq!(batches, vec![(0, 5), (5, 10), (10, 15), (15, 16)]);
    }

    #[test]
    fn test_assign_batches_large() {
        let batches = assign_batches(100, 4);
        assert_eq!(batches, vec![(0, 25), (25, 50), (50, 75), (75, 100)]);
    }

    #[test]
    fn test_assign_batches_fewer_tiles_than_workers() {
        let batches = assign_batches(3, 4);
        assert_eq!(batches, vec![(0, 3)]);
    }

    #[test]
    fn test_sanitize_coverage_name() {
        assert_eq!(sanitize_coverage_name("My Layer/X!"), "My Layer-X-");
        assert_eq!(sanitize_coverage_name("plain-name_1"), "plain-name_1");
    }

    #[test]
    fn test_rewrite_extent() {
        let url = rewrite_extent(
            "/ows/.?service=WCS&request=GetCoverage&width=0&height=0&format=geotiff",
            4096,
            2048,
        );
        assert!(!url.contains("width=0"));
        assert!(!url.contains("height=0"));
        assert!(url.ends_with("&width=4096&height=2048"));
    }

    #[test]
    fn test_worker_batch_arity_mismatch() {
        let mut query = RawQuery::new();
        query.insert("wbbox".to_string(), vec!["0,0,1,1".to_string(), "1,0,2,1".to_string()]);
        query.insert("wwidth".to_string(), vec!["64".to_string()]);
        query.insert("wheight".to_string(), vec!["64".to_string(), "64".to_string()]);
        query.insert("woffx".to_string(), vec!["0".to_string(), "64".to_string()]);
        query.insert("woffy".to_string(), vec!["0".to_string(), "0".to_string()]);

        let result = parse_worker_batch(&query, |w, h, bbox, off_x, off_y| {
            crate::tile::GeoTileRequest {
                collection: String::new(),
                crs: "EPSG:4326".to_string(),
                bbox,
                wkt: None,
                width: w,
                height: h,
                start_time: Utc::now(),
                end_time: None,
                off_x,
                off_y,
                namespaces: vec![],
                band_expr: Default::default(),
                mask: None,
                palette: None,
                scale_params: Default::default(),
                zoom_limit: 0.0,
                polygon_segments: 2,
                conc_limit: 16,
                query_limit: -1,
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_worker_batch_parses_tiles() {
        let mut query = RawQuery::new();
        query.insert("wbbox".to_string(), vec!["0,0,1,1".to_string(), "1,0,2,1".to_string()]);
        query.insert("wwidth".to_string(), vec!["64".to_string(), "64".to_string()]);
        query.insert("wheight".to_string(), vec!["32".to_string(), "32".to_string()]);
        query.insert("woffx".to_string(), vec!["0".to_string(), "64".to_string()]);
        query.insert("woffy".to_string(), vec!["96".to_string(), "96".to_string()]);

        let batch = parse_worker_batch(&query, |w, h, bbox, off_x, off_y| {
            crate::tile::GeoTileRequest {
                collection: String::new(),
                crs: "EPSG:4326".to_string(),
                bbox,
                wkt: None,
                width: w,
                height: h,
                start_time: Utc::now(),
                end_time: None,
                off_x,
                off_y,
                namespaces: vec![],
                band_expr: Default::default(),
                mask: None,
                palette: None,
                scale_params: Default::default(),
                zoom_limit: 0.0,
                polygon_segments: 2,
                conc_limit: 16,
                query_limit: -1,
            }
        })
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].width, 64);
        assert_eq!(batch[0].height, 32);
        assert_eq!(batch[1].off_x, 64);
        assert_eq!(batch[1].off_y, 96);
        assert_eq!(batch[1].bbox.max_x, 2.0);
    }
}
