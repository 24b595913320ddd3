//! Request dispatch.
//!
//! Every request under the service root lands here: the namespace is taken
//! from the URL path suffix, the query (GET) or body (POST) is parsed into
//! a normalised parameter map, the protocol family is classified, and the
//! request is handed to the protocol handler with a configuration snapshot.

pub mod wms;
pub mod wcs;
pub mod wps;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, info};

use ows_common::error::OwsError;
use ows_protocol::query::{self, RawQuery};

use crate::state::AppState;

/// Plain-text error response; the status is written before any body bytes.
pub fn http_error(status: StatusCode, msg: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(format!("{}\n", msg).into())
        .unwrap()
}

pub fn ows_error(err: &OwsError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    http_error(status, &err.to_string())
}

pub fn xml_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate, max-age=0",
        )
        .body(body.into())
        .unwrap()
}

pub fn png_response(bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .body(bytes.into())
        .unwrap()
}

/// Infer the protocol family from a `request` value when `service` is
/// absent.
fn infer_service(request: &str) -> Option<&'static str> {
    match request {
        "GetFeatureInfo" | "GetMap" | "DescribeLayer" | "GetLegendGraphic" => Some("WMS"),
        "DescribeCoverage" | "GetCoverage" => Some("WCS"),
        "DescribeProcess" | "Execute" => Some("WPS"),
        _ => None,
    }
}

/// Namespace from the URL path suffix after the service root; `.` when
/// absent.
fn path_namespace(path: &str) -> String {
    let suffix = path.strip_prefix("/ows").unwrap_or("");
    let suffix = suffix.strip_prefix('/').unwrap_or(suffix);
    if suffix.is_empty() {
        ".".to_string()
    } else {
        suffix.to_string()
    }
}

/// Entry point for every request under `/ows`.
pub async fn ows_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let req_url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    debug!(url = %req_url, "request");

    let namespace = path_namespace(uri.path());
    let Some(conf) = state.namespace_config(&namespace).await else {
        info!(namespace = %namespace, url = %req_url, "invalid dataset namespace");
        return http_error(
            StatusCode::NOT_FOUND,
            &format!("Invalid dataset namespace: {}", namespace),
        );
    };

    let mut query: RawQuery = match method {
        Method::POST => match std::str::from_utf8(&body) {
            Ok(text) => query::parse_query(text),
            Err(e) => {
                return http_error(
                    StatusCode::BAD_REQUEST,
                    &format!("Error parsing POST payload: {}", e),
                )
            }
        },
        _ => query::parse_query(uri.query().unwrap_or("")),
    };

    if !query.contains_key("service") {
        let inferred = query
            .get("request")
            .and_then(|r| r.first())
            .and_then(|r| infer_service(r));
        match inferred {
            Some(service) => {
                query.insert("service".to_string(), vec![service.to_string()]);
            }
            None => {
                return http_error(
                    StatusCode::BAD_REQUEST,
                    "Not an OWS request. Request does not contain a 'service' parameter.",
                )
            }
        }
    }

    match query["service"][0].as_str() {
        "WMS" => wms::serve_wms(&state, conf, &query, &req_url).await,
        "WCS" => wcs::serve_wcs(&state, conf, &query, &req_url).await,
        "WPS" => wps::serve_wps(&state, conf, &query, &req_url).await,
        other => http_error(
            StatusCode::BAD_REQUEST,
            &format!(
                "Not a valid OWS request. URL {} does not contain a valid 'request' parameter ({}).",
                req_url, other
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_namespace() {
        assert_eq!(path_namespace("/ows"), ".");
        assert_eq!(path_namespace("/ows/"), ".");
        assert_eq!(path_namespace("/ows/geoglam"), "geoglam");
        assert_eq!(path_namespace("/ows/a/b"), "a/b");
    }

    #[test]
    fn test_infer_service() {
        assert_eq!(infer_service("GetMap"), Some("WMS"));
        assert_eq!(infer_service("GetLegendGraphic"), Some("WMS"));
        assert_eq!(infer_service("GetCoverage"), Some("WCS"));
        assert_eq!(infer_service("Execute"), Some("WPS"));
        assert_eq!(infer_service("GetCapabilities"), None);
        assert_eq!(infer_service("Bogus"), None);
    }
}
