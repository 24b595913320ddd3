//! Common types and utilities shared across the OWS services.

pub mod bbox;
pub mod config;
pub mod crs;
pub mod error;
pub mod time;

pub use bbox::BoundingBox;
pub use config::{Config, ConfigMap, DataSource, Layer, Process, ServiceConfig, Style};
pub use crs::{extract_epsg_code, normalize_crs, VersionAdjust};
pub use error::{OwsError, OwsResult};
pub use time::{format_iso, parse_iso, ISO_FORMAT};
