//! OGC web service frontend.
//!
//! A single HTTP frontend multiplexing the WMS, WCS and WPS protocol
//! families behind a shared dispatch, on top of an external metadata index
//! and a raster worker fleet.

pub mod capabilities;
pub mod coverage;
pub mod drill;
pub mod encoding;
pub mod handlers;
pub mod indexer;
pub mod pipeline;
pub mod render;
pub mod state;
pub mod tile;
pub mod worker;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Every response carries a permissive CORS origin, including errors.
async fn allow_all_origins(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    response
}

/// Build the service router: the three protocol families under `/ows`,
/// static assets from the data directory on `/`.
pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.data_dir.join("static");
    Router::new()
        .route("/ows", get(handlers::ows_handler).post(handlers::ows_handler))
        .route("/ows/", get(handlers::ows_handler).post(handlers::ows_handler))
        .route(
            "/ows/*namespace",
            get(handlers::ows_handler).post(handlers::ows_handler),
        )
        .fallback_service(ServeDir::new(static_dir))
        .layer(middleware::from_fn(allow_all_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "layers": [{
                    "name": "L",
                    "title": "Test Layer",
                    "data_source": "/g/data/test",
                    "dates": ["2020-01-15T00:00:00.000Z"]
                }],
                "processes": [{
                    "identifier": "P",
                    "title": "Drill",
                    "max_area": 100.0,
                    "data_sources": [{"data_source": "/g/data/test"}]
                }]
            }"#,
        )
        .unwrap();
        let state = AppState::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            false,
        )
        .unwrap();
        // Leak the tempdir so config files outlive the test state.
        std::mem::forget(dir);
        Arc::new(state)
    }

    async fn get_response(app: Router, uri: &str) -> (StatusCode, String, Option<String>) {
        let response = app
            .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let cors = response
            .headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned(), cors)
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_404() {
        let app = router(test_state().await);
        let (status, body, cors) =
            get_response(app, "/ows/nope?service=WMS&request=GetCapabilities").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("Invalid dataset namespace"));
        assert_eq!(cors.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_unclassifiable_request_is_400() {
        let app = router(test_state().await);
        let (status, body, _) = get_response(app, "/ows?request=GetCapabilities").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("service"));
    }

    #[tokio::test]
    async fn test_service_inferred_from_request_name() {
        let app = router(test_state().await);
        // GetCoverage infers WCS; the missing version then fails its check.
        let (status, body, _) = get_response(app, "/ows?request=GetCoverage&coverage=L").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("1.0.0"));
    }

    #[tokio::test]
    async fn test_wms_capabilities_roundtrip() {
        let app = router(test_state().await);
        let (status, body, cors) =
            get_response(app, "/ows?service=WMS&request=GetCapabilities&version=1.3.0").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<Name>L</Name>"));
        assert!(body.contains("2020-01-15T00:00:00.000Z"));
        assert_eq!(cors.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_wms_capabilities_version_allowlist() {
        let app = router(test_state().await);
        let (status, _, _) =
            get_response(app, "/ows?service=WMS&request=GetCapabilities&version=2.0.0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wcs_describe_coverage() {
        let app = router(test_state().await);
        let (status, body, _) =
            get_response(app, "/ows?service=WCS&request=DescribeCoverage&coverage=L").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<name>L</name>"));
    }

    #[tokio::test]
    async fn test_wcs_get_coverage_requires_format() {
        let app = router(test_state().await);
        let (status, body, _) = get_response(
            app,
            "/ows?service=WCS&request=GetCoverage&version=1.0.0&coverage=L&crs=EPSG:4326&bbox=100,-45,155,-10&width=64&height=64",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Unsupported encoding format"));
    }

    #[tokio::test]
    async fn test_wcs_get_coverage_clamps_size() {
        let app = router(test_state().await);
        let (status, body, _) = get_response(
            app,
            "/ows?service=WCS&request=GetCoverage&version=1.0.0&coverage=L&crs=EPSG:4326&bbox=100,-45,155,-10&width=100000&height=64&format=geotiff",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("too large"));
    }

    #[tokio::test]
    async fn test_wcs_worker_mode_arity_mismatch() {
        let app = router(test_state().await);
        let (status, body, _) = get_response(
            app,
            "/ows?service=WCS&request=GetCoverage&version=1.0.0&coverage=L&crs=EPSG:4326&bbox=100,-45,155,-10&width=64&height=64&format=geotiff&wbbox=100,-45,128,-17&wbbox=128,-45,155,-17&wwidth=64",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("different length from wbbox"));
    }

    #[tokio::test]
    async fn test_wms_get_map_unknown_layer() {
        let app = router(test_state().await);
        let (status, body, _) = get_response(
            app,
            "/ows?service=WMS&request=GetMap&version=1.3.0&layers=Missing&crs=EPSG:4326&bbox=100,-45,155,-10&width=64&height=64",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Layer not found"));
    }

    #[tokio::test]
    async fn test_wps_execute_rejects_large_area() {
        use url::form_urlencoded::byte_serialize;

        let app = router(test_state().await);
        // 20 x 20 degrees is far above the configured 100 unit max area.
        let fc = r#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[100,-40],[120,-40],[120,-20],[100,-20],[100,-40]]]},"properties":{}}]}"#;
        let body = format!(
            "service=WPS&request=Execute&identifier=P&featureCollection={}",
            byte_serialize(fc.as_bytes()).collect::<String>()
        );
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/ows")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("area is too large"));
    }

    #[tokio::test]
    async fn test_wps_describe_process() {
        let app = router(test_state().await);
        let (status, body, _) =
            get_response(app, "/ows?service=WPS&request=DescribeProcess&identifier=P").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<ows:Identifier>P</ows:Identifier>"));
    }
}
