//! WMS handlers: GetCapabilities, DescribeLayer, GetLegendGraphic,
//! GetFeatureInfo and the GetMap orchestrator.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info};

use ows_common::config::{Config, Layer};
use ows_common::error::OwsError;
use ows_common::time::format_iso;
use ows_protocol::query::RawQuery;
use ows_protocol::wms::{check_wms_version, parse_wms, WmsParams};

use crate::capabilities;
use crate::handlers::{http_error, ows_error, png_response, xml_response};
use crate::indexer::run_indexer;
use crate::pipeline::{TaskGuard, TilePipeline};
use crate::render;
use crate::state::AppState;
use crate::tile::{DecodedTile, GeoTileRequest, ScaleParams};
use crate::worker::WorkerClient;

const ERR_CHAN_BUFFER: usize = 100;

/// Build the tile request for a map window from the style-resolved layer.
fn map_tile_request(
    layer: &Layer,
    style_layer: &Layer,
    params: &WmsParams,
    end_time: Option<chrono::DateTime<Utc>>,
) -> GeoTileRequest {
    GeoTileRequest {
        collection: style_layer.data_source.clone(),
        crs: params.crs.clone().unwrap_or_default(),
        bbox: params.bbox.unwrap(),
        wkt: None,
        width: params.width.unwrap_or(0).max(0) as usize,
        height: params.height.unwrap_or(0).max(0) as usize,
        start_time: params.time.unwrap(),
        end_time,
        off_x: 0,
        off_y: 0,
        namespaces: style_layer.rgb_expressions.var_list.clone(),
        band_expr: style_layer.rgb_expressions.clone(),
        mask: style_layer.mask.clone(),
        palette: style_layer.palette.clone(),
        scale_params: ScaleParams {
            offset: style_layer.offset_value,
            scale: style_layer.scale_value,
            clip: style_layer.clip_value,
        },
        zoom_limit: layer.zoom_limit,
        polygon_segments: layer.wms_polygon_segments,
        conc_limit: layer.wms_conc_per_node,
        query_limit: -1,
    }
}

pub(crate) fn build_pipeline(
    state: &AppState,
    conf: &Config,
    max_msg_size: usize,
    shard_conc_limit: usize,
    err_tx: mpsc::Sender<OwsError>,
) -> TilePipeline {
    // The per-layer message cap never exceeds the service-wide buffer cap.
    let msg_size = max_msg_size.min(conf.service_config.max_buffer_size);
    TilePipeline {
        index_address: conf.service_config.mas_address.clone(),
        workers: Arc::new(WorkerClient::new(
            conf.service_config.worker_nodes.clone(),
            state.http.clone(),
            msg_size,
        )),
        shard_conc_limit,
        http: state.http.clone(),
        err_tx,
    }
}

pub async fn serve_wms(
    state: &AppState,
    conf: Arc<Config>,
    query: &RawQuery,
    req_url: &str,
) -> Response {
    let params = match parse_wms(query) {
        Ok(p) => p,
        Err(e) => {
            return http_error(
                StatusCode::BAD_REQUEST,
                &format!("Wrong WMS parameters on URL: {}", e),
            )
        }
    };

    let Some(request) = params.request.clone() else {
        return http_error(
            StatusCode::BAD_REQUEST,
            "Malformed WMS, a Request field needs to be specified",
        );
    };

    match request.as_str() {
        "GetCapabilities" => {
            if let Some(version) = params.version.as_deref() {
                if !check_wms_version(version) {
                    return http_error(
                        StatusCode::BAD_REQUEST,
                        &format!(
                            "This server can only accept WMS requests compliant with version 1.1.1 and 1.3.0: {}",
                            req_url
                        ),
                    );
                }
            }
            let version = params.version.as_deref().unwrap_or("1.3.0");
            xml_response(capabilities::wms_capabilities(&conf, version, Utc::now()))
        }

        "DescribeLayer" => {
            let name = params.layers.first().cloned().unwrap_or_default();
            match conf.layer_index(&name) {
                Ok(idx) => {
                    xml_response(capabilities::wms_describe_layer(&conf, &conf.layers[idx]))
                }
                Err(e) => {
                    error!(error = %e, "DescribeLayer failed");
                    http_error(
                        StatusCode::BAD_REQUEST,
                        &format!("Malformed WMS DescribeLayer request: {}", e),
                    )
                }
            }
        }

        "GetLegendGraphic" => get_legend_graphic(&conf, &params),

        "GetFeatureInfo" => get_feature_info(state, &conf, params, req_url).await,

        "GetMap" => get_map(state, &conf, params, req_url).await,

        other => http_error(
            StatusCode::BAD_REQUEST,
            &format!("{} not recognised.", other),
        ),
    }
}

fn get_legend_graphic(conf: &Config, params: &WmsParams) -> Response {
    let name = params.layers.first().cloned().unwrap_or_default();
    let idx = match conf.layer_index(&name) {
        Ok(idx) => idx,
        Err(e) => return ows_error(&e),
    };
    let style_idx = match conf.style_index(idx, &params.styles) {
        Ok(s) => s,
        Err(e) => return ows_error(&e),
    };
    let style_layer = conf.layers[idx].style_or_self(style_idx);

    match std::fs::read(&style_layer.legend_path) {
        Ok(bytes) => png_response(bytes),
        Err(e) => {
            error!(path = %style_layer.legend_path, error = %e, "error reading legend image");
            http_error(StatusCode::INTERNAL_SERVER_ERROR, "Legend graphics not found")
        }
    }
}

/// Shared GetMap/GetFeatureInfo validation: resolve the layer, default the
/// time, and demand a complete spatial window.
fn validate_map_params<'c>(
    conf: &'c Config,
    params: &mut WmsParams,
    req_url: &str,
) -> Result<(usize, &'c Layer), Response> {
    let name = params.layers.first().cloned().unwrap_or_default();
    let idx = conf
        .layer_index(&name)
        .map_err(|e| http_error(StatusCode::BAD_REQUEST, &format!("Malformed WMS GetMap request: {}", e)))?;
    let layer = &conf.layers[idx];

    if params.time.is_none() {
        let t = layer
            .latest_date(Utc::now())
            .map_err(|e| http_error(StatusCode::BAD_REQUEST, &format!("{}: {}", e, req_url)))?;
        params.time = Some(t);
    }
    if params.crs.is_none() {
        return Err(http_error(
            StatusCode::BAD_REQUEST,
            &format!("Request {} should contain a valid ISO 'crs/srs' parameter.", req_url),
        ));
    }
    if params.bbox.is_none() {
        return Err(http_error(
            StatusCode::BAD_REQUEST,
            &format!("Request {} should contain a valid 'bbox' parameter.", req_url),
        ));
    }
    match (params.width, params.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => {}
        _ => {
            return Err(http_error(
                StatusCode::BAD_REQUEST,
                &format!(
                    "Request {} should contain valid 'width' and 'height' parameters.",
                    req_url
                ),
            ))
        }
    }
    Ok((idx, layer))
}

async fn get_map(
    state: &AppState,
    conf: &Config,
    mut params: WmsParams,
    req_url: &str,
) -> Response {
    match params.version.as_deref() {
        Some(v) if check_wms_version(v) => {}
        _ => {
            return http_error(
                StatusCode::BAD_REQUEST,
                &format!(
                    "This server can only accept WMS requests compliant with version 1.1.1 and 1.3.0: {}",
                    req_url
                ),
            )
        }
    }

    let (idx, layer) = match validate_map_params(conf, &mut params, req_url) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    params.apply_crs_quirks();

    let width = params.width.unwrap();
    let height = params.height.unwrap();
    if width as usize > layer.wms_max_width || height as usize > layer.wms_max_height {
        return http_error(
            StatusCode::BAD_REQUEST,
            &format!(
                "Requested width/height is too large, max width:{}, height:{}",
                layer.wms_max_width, layer.wms_max_height
            ),
        );
    }

    // Some legacy clients send a literal "default" style name.
    if params.version.as_deref() == Some("1.1.1") && !params.styles.is_empty() {
        params.styles[0] = String::new();
    }
    let style_idx = match conf.style_index(idx, &params.styles) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "GetMap style lookup failed");
            return http_error(
                StatusCode::BAD_REQUEST,
                &format!("Malformed WMS GetMap request: {}", e),
            );
        }
    };
    let style_layer = layer.style_or_self(style_idx);

    let end_time = layer.accum_end(params.time.unwrap());
    let geo_req = map_tile_request(layer, style_layer, &params, end_time);

    let (err_tx, mut err_rx) = mpsc::channel::<OwsError>(ERR_CHAN_BUFFER);
    let mut guard = TaskGuard::new();

    // Zoom-limit probe: above the threshold the pipeline issues no worker
    // RPCs at all; the index alone decides which placeholder is served.
    let bbox = params.bbox.unwrap();
    let x_res = bbox.width() / width as f64;
    let y_res = bbox.height() / height as f64;
    let req_res = x_res.max(y_res) * params.version_adjust().resolution_scale;

    if layer.zoom_limit != 0.0 && req_res > layer.zoom_limit {
        let mut probe = geo_req.clone();
        probe.mask = None;
        probe.query_limit = 1;

        let (granule_tx, mut granule_rx) = mpsc::channel(ERR_CHAN_BUFFER);
        guard.push(tokio::spawn(run_indexer(
            state.http.clone(),
            conf.service_config.mas_address.clone(),
            Arc::new(probe),
            granule_tx,
            err_tx.clone(),
        )));

        let mut has_data = false;
        loop {
            tokio::select! {
                granule = granule_rx.recv() => match granule {
                    Some(g) if !g.is_empty_tile() => {
                        has_data = true;
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
                Some(e) = err_rx.recv() => {
                    info!(error = %e, "zoom probe error");
                    break;
                }
            }
        }

        let zoom_path = state.data_dir.join("zoom.png");
        let path = if has_data {
            zoom_path.to_string_lossy().into_owned()
        } else {
            String::new()
        };
        return match render::placeholder_png(&path, width as usize, height as usize) {
            Ok(png) => png_response(png),
            Err(e) => ows_error(&e),
        };
    }

    let pipeline = build_pipeline(
        state,
        conf,
        layer.max_worker_msg_size,
        layer.wms_polygon_shard_conc_limit,
        err_tx,
    );
    let mut tile_rx = pipeline.process(geo_req, &mut guard);

    // The per-layer timeout runs on its own clock, so it stays authoritative
    // even when the client has disconnected mid-response.
    let timeout = tokio::time::sleep(Duration::from_secs(layer.wms_timeout));
    tokio::pin!(timeout);

    tokio::select! {
        tile = tile_rx.recv() => {
            let tile = tile.unwrap_or_else(|| DecodedTile::empty(0, 0));
            render_map_tile(&tile, style_layer, width as usize, height as usize)
        }
        Some(e) = err_rx.recv() => {
            info!(error = %e, "error in the pipeline");
            ows_error(&e)
        }
        _ = &mut timeout => {
            error!(threshold = layer.wms_timeout, "WMS pipeline timed out");
            http_error(StatusCode::INTERNAL_SERVER_ERROR, "WMS request timed out")
        }
    }
}

fn render_map_tile(
    tile: &DecodedTile,
    style_layer: &Layer,
    width: usize,
    height: usize,
) -> Response {
    let scale_params = ScaleParams {
        offset: style_layer.offset_value,
        scale: style_layer.scale_value,
        clip: style_layer.clip_value,
    };

    if tile.is_empty() {
        return match render::placeholder_png(&style_layer.no_data_legend_path, width, height) {
            Ok(png) => png_response(png),
            Err(e) => ows_error(&e),
        };
    }

    let raster = render::scale_tile(tile, scale_params);
    match render::render_png(&raster, style_layer.palette.as_ref()) {
        Ok(png) => png_response(png),
        Err(e) => {
            info!(error = %e, "error encoding PNG");
            ows_error(&e)
        }
    }
}

async fn get_feature_info(
    state: &AppState,
    conf: &Config,
    mut params: WmsParams,
    req_url: &str,
) -> Response {
    let (_idx, layer) = match validate_map_params(conf, &mut params, req_url) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    params.apply_crs_quirks();

    let (Some(i), Some(j)) = (
        params.i.or(params.off_x.map(|x| x.max(0) as u32)),
        params.j.or(params.off_y.map(|y| y.max(0) as u32)),
    ) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            &format!("Malformed WMS GetFeatureInfo request: {}", req_url),
        );
    };

    let bbox = params.bbox.unwrap();
    let width = params.width.unwrap() as usize;
    let height = params.height.unwrap() as usize;
    if i as usize >= width || j as usize >= height {
        return http_error(
            StatusCode::BAD_REQUEST,
            "GetFeatureInfo pixel coordinates are outside the map window",
        );
    }

    let (x_res, y_res) = bbox.resolution(width, height);
    let x = bbox.min_x + (i as f64 + 0.5) * x_res;
    let y = bbox.max_y - (j as f64 + 0.5) * y_res;

    // Probe a single pixel through the tile pipeline.
    let style_layer = layer.style_or_self(None);
    let mut probe_params = params.clone();
    probe_params.bbox = Some(ows_common::BoundingBox::new(
        bbox.min_x + i as f64 * x_res,
        bbox.max_y - (j as f64 + 1.0) * y_res,
        bbox.min_x + (i as f64 + 1.0) * x_res,
        bbox.max_y - j as f64 * y_res,
    ));
    probe_params.width = Some(1);
    probe_params.height = Some(1);
    let end_time = layer.accum_end(params.time.unwrap());
    let geo_req = map_tile_request(layer, style_layer, &probe_params, end_time);

    let (err_tx, mut err_rx) = mpsc::channel::<OwsError>(ERR_CHAN_BUFFER);
    let mut guard = TaskGuard::new();
    let pipeline = build_pipeline(
        state,
        conf,
        layer.max_worker_msg_size,
        layer.wms_polygon_shard_conc_limit,
        err_tx,
    );
    let mut tile_rx = pipeline.process(geo_req, &mut guard);

    let timeout = tokio::time::sleep(Duration::from_secs(layer.wms_timeout));
    tokio::pin!(timeout);

    let band_info = tokio::select! {
        tile = tile_rx.recv() => {
            let mut values = Vec::new();
            if let Some(tile) = tile {
                if !tile.is_empty() {
                    for (bi, band) in tile.bands.iter().enumerate() {
                        let Some(value) = band.first() else { continue };
                        let name = layer
                            .rgb_expressions
                            .var_list
                            .get(bi)
                            .cloned()
                            .unwrap_or_else(|| format!("band_{}", bi + 1));
                        values.push(format!(r#""{}": {}"#, name, value));
                    }
                }
            }
            values.join(", ")
        }
        Some(e) = err_rx.recv() => {
            error!(error = %e, "GetFeatureInfo pipeline error");
            format!(r#""error": "{}""#, e)
        }
        _ = &mut timeout => {
            return http_error(StatusCode::INTERNAL_SERVER_ERROR, "WMS request timed out");
        }
    };

    let time_str = format!(r#""time": "{}""#, format_iso(&params.time.unwrap()));
    let properties = if band_info.is_empty() {
        format!(r#""x":{:.6}, "y":{:.6}, {}"#, x, y, time_str)
    } else {
        format!(r#""x":{:.6}, "y":{:.6}, {}, {}"#, x, y, time_str, band_info)
    };
    let body = format!(
        r#"{{"type":"FeatureCollection","features":[{{"type":"Feature","properties":{{{}}}}}]}}"#,
        properties
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ows_common::config::BandExpressions;

    fn layer_with_limits() -> Layer {
        Layer {
            name: "L".to_string(),
            data_source: "/g/data/test".to_string(),
            dates: vec!["2020-01-15T00:00:00.000Z".to_string()],
            zoom_limit: 0.05,
            rgb_expressions: BandExpressions::from_expressions(vec!["red".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_map_tile_request_carries_style_fields() {
        let layer = layer_with_limits();
        let mut params = WmsParams::default();
        params.crs = Some("EPSG:4326".to_string());
        params.bbox = Some(ows_common::BoundingBox::new(100.0, -45.0, 155.0, -10.0));
        params.width = Some(256);
        params.height = Some(256);
        params.time = Some(chrono::Utc::now());

        let req = map_tile_request(&layer, &layer, &params, None);
        assert_eq!(req.collection, "/g/data/test");
        assert_eq!(req.width, 256);
        assert_eq!(req.zoom_limit, 0.05);
        assert_eq!(req.namespaces, vec!["red"]);
        assert_eq!(req.query_limit, -1);
    }

    #[test]
    fn test_validate_map_params_defaults_time() {
        let mut conf = Config::default();
        conf.layers.push(layer_with_limits());
        let mut params = WmsParams {
            layers: vec!["L".to_string()],
            crs: Some("EPSG:4326".to_string()),
            bbox: Some(ows_common::BoundingBox::new(0.0, 0.0, 1.0, 1.0)),
            width: Some(256),
            height: Some(256),
            ..Default::default()
        };
        let (idx, _) = validate_map_params(&conf, &mut params, "/ows").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(
            format_iso(&params.time.unwrap()),
            "2020-01-15T00:00:00.000Z"
        );
    }

    #[test]
    fn test_validate_map_params_rejects_zero_dimensions() {
        let mut conf = Config::default();
        conf.layers.push(layer_with_limits());
        let mut params = WmsParams {
            layers: vec!["L".to_string()],
            crs: Some("EPSG:4326".to_string()),
            bbox: Some(ows_common::BoundingBox::new(0.0, 0.0, 1.0, 1.0)),
            width: Some(0),
            height: Some(256),
            time: Some(chrono::Utc::now()),
            ..Default::default()
        };
        assert!(validate_map_params(&conf, &mut params, "/ows").is_err());
    }
}
