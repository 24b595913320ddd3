//! WPS handlers: GetCapabilities, DescribeProcess and the Execute
//! orchestrator.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info};

use ows_common::config::Config;
use ows_common::error::OwsError;
use ows_protocol::query::RawQuery;
use ows_protocol::wps::{parse_wps, WpsParams};

use crate::capabilities;
use crate::drill::{
    geometry_bbox, geometry_wkt, resolve_end_time, resolve_start_time, DrillPipeline,
};
use crate::handlers::{http_error, ows_error, xml_response};
use crate::pipeline::TaskGuard;
use crate::state::AppState;
use crate::tile::GeoDrillRequest;
use crate::worker::WorkerClient;

pub async fn serve_wps(
    state: &AppState,
    conf: Arc<Config>,
    query: &RawQuery,
    req_url: &str,
) -> Response {
    let params = match parse_wps(query) {
        Ok(p) => p,
        Err(e) => {
            return http_error(
                StatusCode::BAD_REQUEST,
                &format!("Wrong WPS parameters on URL: {}", e),
            )
        }
    };

    let Some(request) = params.request.clone() else {
        return http_error(
            StatusCode::BAD_REQUEST,
            "Malformed WPS, a Request field needs to be specified",
        );
    };

    match request.as_str() {
        "GetCapabilities" => xml_response(capabilities::wps_capabilities(&conf)),

        "DescribeProcess" => {
            let identifier = params.identifier.clone().unwrap_or_default();
            match conf.process_index(&identifier) {
                Ok(idx) => xml_response(capabilities::wps_describe_process(&conf.processes[idx])),
                Err(e) => {
                    error!(error = %e, url = %req_url, "requested process not found");
                    http_error(StatusCode::BAD_REQUEST, &format!("{}: {}", e, req_url))
                }
            }
        }

        "Execute" => execute(state, &conf, params, req_url).await,

        other => http_error(
            StatusCode::BAD_REQUEST,
            &format!("{} not recognised.", other),
        ),
    }
}

async fn execute(
    state: &AppState,
    conf: &Config,
    params: WpsParams,
    req_url: &str,
) -> Response {
    let identifier = params.identifier.clone().unwrap_or_default();
    let idx = match conf.process_index(&identifier) {
        Ok(idx) => idx,
        Err(e) => {
            error!(error = %e, url = %req_url, "requested process not found");
            return http_error(StatusCode::BAD_REQUEST, &format!("{}: {}", e, req_url));
        }
    };
    let process = &conf.processes[idx];
    if process.data_sources.is_empty() {
        error!("no data source specified");
        return http_error(StatusCode::INTERNAL_SERVER_ERROR, "No data source specified");
    }

    let geometry = match params.execute_geometry() {
        Ok(g) => g.clone(),
        Err(e) => return ows_error(&e),
    };

    if geometry.is_areal() {
        let area = geometry.planar_area();
        info!(area = area, "requested polygon area");
        if area == 0.0 || area > process.max_area {
            info!(area = area, max_area = process.max_area, "requested area too large");
            return ows_error(&OwsError::AreaTooLarge);
        }
    }

    let feature = ows_protocol::geojson::Feature::new(geometry.clone());
    let feature_json = match serde_json::to_string(&feature) {
        Ok(json) => json,
        Err(e) => {
            return http_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to serialize geometry: {}", e),
            )
        }
    };
    let wkt = geometry_wkt(&geometry);
    let bbox = geometry_bbox(&geometry);

    let (err_tx, mut err_rx) = mpsc::channel::<OwsError>(100);
    let mut guard = TaskGuard::new();
    let now = Utc::now();

    let mut result = String::new();
    for (ids, data_source) in process.data_sources.iter().enumerate() {
        info!(
            collection = %data_source.data_source,
            source = ids + 1,
            total = process.data_sources.len(),
            "WPS: processing data source"
        );

        let start_time = resolve_start_time(params.start_datetime.as_deref(), data_source);
        let end_time = resolve_end_time(params.end_datetime.as_deref(), data_source, now);

        let drill_req = GeoDrillRequest {
            geometry: feature_json.clone(),
            wkt: wkt.clone(),
            bbox,
            crs: "EPSG:4326".to_string(),
            collection: data_source.data_source.clone(),
            namespaces: data_source.rgb_expressions.var_list.clone(),
            band_expr: data_source.rgb_expressions.clone(),
            start_time,
            end_time,
        };

        let pipeline = DrillPipeline {
            index_address: conf.service_config.mas_address.clone(),
            workers: Arc::new(WorkerClient::new(
                conf.service_config.worker_nodes.clone(),
                state.http.clone(),
                conf.service_config.max_buffer_size,
            )),
            http: state.http.clone(),
            err_tx: err_tx.clone(),
        };
        let mut result_rx = pipeline.process(drill_req, &mut guard);

        tokio::select! {
            res = result_rx.recv() => {
                if let Some(res) = res {
                    result.push_str(&res);
                }
            }
            Some(e) = err_rx.recv() => {
                info!(error = %e, "error in the pipeline");
                return ows_error(&e);
            }
        }
    }
    xml_response(capabilities::wps_execute_response(&result))
}
