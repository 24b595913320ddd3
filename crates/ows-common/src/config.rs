//! Per-namespace service configuration.
//!
//! A configuration directory holds one `config.json` for the root namespace
//! (`.`) and one subdirectory per additional namespace, each with its own
//! `config.json`. The loaded map is immutable from a request's perspective;
//! the service hot-swaps the whole map when files change on disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OwsError, OwsResult};
use crate::time;

/// Namespace -> configuration, published atomically by the watcher.
pub type ConfigMap = HashMap<String, Arc<Config>>;

/// Per-band expressions over indexed namespaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BandExpressions {
    /// One expression per output band, e.g. `"nbart_red"` or `"(b1+b2)/2"`.
    pub expressions: Vec<String>,
    /// Distinct namespaces referenced by the expressions, in first-use
    /// order. Filled by [`BandExpressions::compile`] when absent.
    #[serde(default)]
    pub var_list: Vec<String>,
}

impl BandExpressions {
    pub fn from_expressions(expressions: Vec<String>) -> Self {
        let mut bands = Self {
            expressions,
            var_list: Vec::new(),
        };
        bands.compile();
        bands
    }

    /// Extract the namespace identifiers referenced by the expressions.
    pub fn compile(&mut self) {
        if !self.var_list.is_empty() {
            return;
        }
        for expr in &self.expressions {
            let mut ident = String::new();
            for c in expr.chars().chain(std::iter::once(' ')) {
                if c.is_ascii_alphanumeric() || c == '_' {
                    ident.push(c);
                } else {
                    if !ident.is_empty()
                        && !ident.chars().next().unwrap().is_ascii_digit()
                        && !self.var_list.contains(&ident)
                    {
                        self.var_list.push(ident.clone());
                    }
                    ident.clear();
                }
            }
        }
    }
}

/// A mask applied to the primary bands, indexed separately when it lives in
/// another collection or namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mask {
    pub id: String,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Colour palette applied when encoding map tiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Palette {
    /// RGBA control points, interpolated to a 256-entry lookup table.
    pub colours: Vec<[u8; 4]>,
    #[serde(default = "default_true")]
    pub interpolate: bool,
}

fn default_true() -> bool {
    true
}

/// A named addressable data product.
///
/// Styles are layers too: a style entry overrides the visual fields of its
/// parent layer and inherits the rest through serde defaults at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Layer {
    pub name: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_: String,

    pub data_source: String,
    /// Ascending ISO timestamps with data available.
    pub dates: Vec<String>,
    /// When `dates` is empty, dates are generated from here up to now.
    pub start_iso_date: String,

    pub accum: bool,
    pub step_days: i64,
    pub step_hours: i64,
    pub step_minutes: i64,

    pub styles: Vec<Layer>,

    pub rgb_expressions: BandExpressions,
    pub mask: Option<Mask>,
    pub palette: Option<Palette>,

    pub offset_value: f64,
    pub scale_value: f64,
    pub clip_value: f64,

    /// Resolution threshold above which the map path serves a placeholder.
    /// Zero disables the limit.
    pub zoom_limit: f64,

    pub legend_path: String,
    pub no_data_legend_path: String,

    pub wms_max_width: usize,
    pub wms_max_height: usize,
    pub wcs_max_width: usize,
    pub wcs_max_height: usize,
    pub wcs_max_tile_width: usize,
    pub wcs_max_tile_height: usize,

    /// Seconds before the per-layer pipeline deadline fires.
    pub wms_timeout: u64,
    pub wcs_timeout: u64,

    pub wms_polygon_segments: usize,
    pub wcs_polygon_segments: usize,
    pub wms_polygon_shard_conc_limit: usize,
    pub wcs_polygon_shard_conc_limit: usize,
    pub wms_conc_per_node: usize,
    pub wcs_conc_per_node: usize,
    pub max_worker_msg_size: usize,
}

impl Default for Layer {
    fn default() -> Self {
        Self {
            name: String::new(),
            title: String::new(),
            abstract_: String::new(),
            data_source: String::new(),
            dates: Vec::new(),
            start_iso_date: String::new(),
            accum: false,
            step_days: 0,
            step_hours: 0,
            step_minutes: 0,
            styles: Vec::new(),
            rgb_expressions: BandExpressions::default(),
            mask: None,
            palette: None,
            offset_value: 0.0,
            scale_value: 0.0,
            clip_value: 0.0,
            zoom_limit: 0.0,
            legend_path: String::new(),
            no_data_legend_path: String::new(),
            wms_max_width: 512,
            wms_max_height: 512,
            wcs_max_width: 50_000,
            wcs_max_height: 30_000,
            wcs_max_tile_width: 1024,
            wcs_max_tile_height: 1024,
            wms_timeout: 20,
            wcs_timeout: 300,
            wms_polygon_segments: 2,
            wcs_polygon_segments: 2,
            wms_polygon_shard_conc_limit: 2,
            wcs_polygon_shard_conc_limit: 10,
            wms_conc_per_node: 16,
            wcs_conc_per_node: 16,
            max_worker_msg_size: 100 * 1024 * 1024,
        }
    }
}

/// Style alias: styles are stored as layer overrides.
pub type Style = Layer;

impl Layer {
    /// The accumulation window `[t, t+step)` end for a start time, when the
    /// layer accumulates.
    pub fn accum_end(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.accum {
            return None;
        }
        let step = Duration::minutes(
            60 * 24 * self.step_days + 60 * self.step_hours + self.step_minutes,
        );
        Some(start + step)
    }

    /// The date list with generation rules applied: an explicit list is
    /// used as-is, otherwise dates are stepped from `start_iso_date` up to
    /// `now`.
    pub fn refreshed_dates(&self, now: DateTime<Utc>) -> Vec<String> {
        if !self.dates.is_empty() || self.start_iso_date.is_empty() {
            return self.dates.clone();
        }
        let Ok(start) = time::parse_iso(&self.start_iso_date) else {
            return Vec::new();
        };
        let step_minutes = 60 * 24 * self.step_days + 60 * self.step_hours + self.step_minutes;
        if step_minutes <= 0 {
            return vec![time::format_iso(&start)];
        }
        let step = Duration::minutes(step_minutes);
        let mut dates = Vec::new();
        let mut t = start;
        while t <= now {
            dates.push(time::format_iso(&t));
            t += step;
        }
        dates
    }

    /// Resolve an absent `time` parameter to the most recent date.
    pub fn latest_date(&self, now: DateTime<Utc>) -> OwsResult<DateTime<Utc>> {
        time::latest_date(&self.refreshed_dates(now))
            .map_err(|e| OwsError::invalid("time", e.to_string()))
    }

    /// The layer to read visual fields from: the selected style, or the
    /// layer itself when no style applies.
    pub fn style_or_self(&self, style_idx: Option<usize>) -> &Layer {
        match style_idx {
            Some(i) => &self.styles[i],
            None => self,
        }
    }
}

/// A WPS process definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Process {
    pub identifier: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_: String,
    /// Maximum planar polygon area accepted by Execute.
    pub max_area: f64,
    pub identity_tol: f64,
    pub dp_tol: f64,
    pub approx: bool,
    pub data_sources: Vec<DataSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSource {
    pub data_source: String,
    pub rgb_expressions: BandExpressions,
    pub start_iso_date: String,
    /// ISO timestamp, or the literal `"now"`.
    pub end_iso_date: String,
    pub band_strides: usize,
    pub metadata_url: String,
}

/// Frontend-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// This frontend's own hostname, for peer self-exclusion.
    pub ows_hostname: String,
    /// Metadata index address (host[:port]).
    pub mas_address: String,
    /// Raster worker nodes.
    pub worker_nodes: Vec<String>,
    /// Sibling frontends eligible for coverage batch forwarding.
    pub ows_cluster_nodes: Vec<String>,
    pub temp_dir: String,
    pub max_buffer_size: usize,
    /// Injected from the URL path at dispatch time.
    #[serde(skip)]
    pub namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ows_hostname: String::new(),
            mas_address: "127.0.0.1:8888".to_string(),
            worker_nodes: Vec::new(),
            ows_cluster_nodes: Vec::new(),
            temp_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            max_buffer_size: 512 * 1024 * 1024,
            namespace: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_config: ServiceConfig,
    pub layers: Vec<Layer>,
    pub processes: Vec<Process>,
}

impl Config {
    pub fn from_file(path: &Path) -> OwsResult<Config> {
        let raw = fs::read_to_string(path)
            .map_err(|e| OwsError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| OwsError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.compile();
        config.validate(path)?;
        Ok(config)
    }

    fn compile(&mut self) {
        for layer in &mut self.layers {
            layer.rgb_expressions.compile();
            for style in &mut layer.styles {
                // Styles inherit the parent data source unless overridden.
                if style.data_source.is_empty() {
                    style.data_source = layer.data_source.clone();
                }
                style.rgb_expressions.compile();
            }
        }
        for process in &mut self.processes {
            for ds in &mut process.data_sources {
                ds.rgb_expressions.compile();
            }
        }
    }

    fn validate(&self, path: &Path) -> OwsResult<()> {
        for layer in &self.layers {
            if layer.name.is_empty() {
                return Err(OwsError::ConfigError(format!(
                    "{}: layer with empty name",
                    path.display()
                )));
            }
        }
        for process in &self.processes {
            if process.identifier.is_empty() {
                return Err(OwsError::ConfigError(format!(
                    "{}: process with empty identifier",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Index of the layer named by the request.
    pub fn layer_index(&self, name: &str) -> OwsResult<usize> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| OwsError::LayerNotFound(name.to_string()))
    }

    /// Style index within a layer: `None` when the request selects no style
    /// and the layer itself should be used.
    pub fn style_index(&self, layer_idx: usize, styles: &[String]) -> OwsResult<Option<usize>> {
        let layer = &self.layers[layer_idx];
        let requested = styles.first().map(|s| s.trim()).unwrap_or("");
        if requested.is_empty() || requested.eq_ignore_ascii_case("default") {
            return Ok(None);
        }
        layer
            .styles
            .iter()
            .position(|s| s.name == requested)
            .map(Some)
            .ok_or_else(|| OwsError::StyleNotFound(requested.to_string()))
    }

    pub fn process_index(&self, identifier: &str) -> OwsResult<usize> {
        self.processes
            .iter()
            .position(|p| p.identifier == identifier)
            .ok_or_else(|| OwsError::ProcessNotFound(identifier.to_string()))
    }
}

/// Load every namespace configuration under `conf_dir`.
///
/// `conf_dir/config.json` is the root namespace `.`; each subdirectory with
/// a `config.json` contributes a namespace named after the subdirectory.
pub fn load_config_map(conf_dir: &Path) -> OwsResult<ConfigMap> {
    let mut map = ConfigMap::new();

    let root = conf_dir.join("config.json");
    if root.is_file() {
        let mut config = Config::from_file(&root)?;
        config.service_config.namespace = ".".to_string();
        map.insert(".".to_string(), Arc::new(config));
    }

    let entries = fs::read_dir(conf_dir)
        .map_err(|e| OwsError::ConfigError(format!("{}: {}", conf_dir.display(), e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let nested = path.join("config.json");
        if nested.is_file() {
            let ns = entry.file_name().to_string_lossy().into_owned();
            let mut config = Config::from_file(&nested)?;
            config.service_config.namespace = ns.clone();
            map.insert(ns, Arc::new(config));
        }
    }

    if map.is_empty() {
        return Err(OwsError::ConfigError(format!(
            "no config.json found under {}",
            conf_dir.display()
        )));
    }
    Ok(map)
}

/// Canonical JSON of the whole configuration map, for `--dump-conf`.
pub fn dump_config_map(map: &ConfigMap) -> OwsResult<String> {
    let ordered: std::collections::BTreeMap<&String, &Config> =
        map.iter().map(|(k, v)| (k, v.as_ref())).collect();
    Ok(serde_json::to_string_pretty(&ordered)?)
}
