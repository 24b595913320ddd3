//! WCS handlers: GetCapabilities, DescribeCoverage and GetCoverage.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use tracing::error;

use ows_common::config::Config;
use ows_protocol::query::RawQuery;
use ows_protocol::wcs::{check_wcs_version, parse_wcs};

use crate::capabilities;
use crate::coverage;
use crate::handlers::{http_error, xml_response};
use crate::state::AppState;

pub async fn serve_wcs(
    state: &AppState,
    conf: Arc<Config>,
    query: &RawQuery,
    req_url: &str,
) -> Response {
    let params = match parse_wcs(query) {
        Ok(p) => p,
        Err(e) => {
            return http_error(
                StatusCode::BAD_REQUEST,
                &format!("Wrong WCS parameters on URL: {}", e),
            )
        }
    };

    let Some(request) = params.request.clone() else {
        return http_error(
            StatusCode::BAD_REQUEST,
            "Malformed WCS, a Request field needs to be specified",
        );
    };

    match request.as_str() {
        "GetCapabilities" => {
            if let Some(version) = params.version.as_deref() {
                if !check_wcs_version(version) {
                    return http_error(
                        StatusCode::BAD_REQUEST,
                        &format!(
                            "This server can only accept WCS requests compliant with version 1.0.0: {}",
                            req_url
                        ),
                    );
                }
            }
            xml_response(capabilities::wcs_capabilities(&conf, Utc::now()))
        }

        "DescribeCoverage" => {
            let name = params.coverages.first().cloned().unwrap_or_default();
            match conf.layer_index(&name) {
                Ok(idx) => xml_response(capabilities::wcs_describe_coverage(
                    &conf.layers[idx],
                    Utc::now(),
                )),
                Err(e) => {
                    error!(error = %e, "DescribeCoverage failed");
                    http_error(
                        StatusCode::BAD_REQUEST,
                        &format!("Malformed WCS DescribeCoverage request: {}", e),
                    )
                }
            }
        }

        "GetCoverage" => {
            match params.version.as_deref() {
                Some(v) if check_wcs_version(v) => {}
                _ => {
                    return http_error(
                        StatusCode::BAD_REQUEST,
                        &format!(
                            "This server can only accept WCS requests compliant with version 1.0.0: {}",
                            req_url
                        ),
                    )
                }
            }
            coverage::get_coverage(state, conf, params, query, req_url).await
        }

        other => http_error(
            StatusCode::BAD_REQUEST,
            &format!("{} not recognised.", other),
        ),
    }
}
