//! Per-request streaming pipelines.
//!
//! A pipeline is built per request and torn down with it:
//!
//! ```text
//! GeoTileRequest -> indexer -> [GeoTileGranule] -> worker fetch -> merger
//! ```
//!
//! The merger folds every granule's decoded raster into one output tile per
//! request, filling nodata gaps in granule order of arrival.
//!
//! Stages run as spawned tasks connected by bounded channels; any stage may
//! report a fatal error on the shared error channel and exit. Dropping the
//! returned [`TaskGuard`] aborts every stage, which is how client
//! disconnects and timeouts propagate into the pipeline.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use ows_common::error::OwsError;

use crate::indexer::run_indexer;
use crate::tile::{DecodedTile, GeoTileGranule, GeoTileRequest};
use crate::worker::WorkerClient;

const STAGE_BUFFER: usize = 100;

/// Aborts the held tasks when dropped, releasing worker RPCs and index
/// queries on every exit path of the owning handler.
pub struct TaskGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl TaskGuard {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }
}

impl Default for TaskGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The tile pipeline: indexer fan-in, worker fan-out, decoded-tile fan-in.
pub struct TilePipeline {
    pub index_address: String,
    pub workers: Arc<WorkerClient>,
    /// Concurrent worker fetches per polygon-shattered request.
    pub shard_conc_limit: usize,
    pub http: reqwest::Client,
    pub err_tx: mpsc::Sender<OwsError>,
}

impl TilePipeline {
    /// Start the pipeline for one request. Exactly one merged tile arrives
    /// on the returned channel; its `(off_x, off_y)` places it within the
    /// master frame.
    pub fn process(
        &self,
        request: GeoTileRequest,
        guard: &mut TaskGuard,
    ) -> mpsc::Receiver<DecodedTile> {
        let off = (request.off_x, request.off_y);
        let request = Arc::new(request);
        let (granule_tx, granule_rx) = mpsc::channel::<GeoTileGranule>(STAGE_BUFFER);
        let (tile_tx, tile_rx) = mpsc::channel::<DecodedTile>(STAGE_BUFFER);
        let (out_tx, out_rx) = mpsc::channel::<DecodedTile>(1);

        guard.push(tokio::spawn(run_indexer(
            self.http.clone(),
            self.index_address.clone(),
            request,
            granule_tx,
            self.err_tx.clone(),
        )));

        guard.push(tokio::spawn(fetch_stage(
            self.workers.clone(),
            self.shard_conc_limit.max(1),
            granule_rx,
            tile_tx,
            self.err_tx.clone(),
        )));

        guard.push(tokio::spawn(merge_stage(tile_rx, out_tx, off)));

        out_rx
    }
}

/// Merger stage: fold per-granule rasters into one output tile. The first
/// non-empty raster seeds the tile; later ones fill its nodata gaps.
async fn merge_stage(
    mut tile_rx: mpsc::Receiver<DecodedTile>,
    out_tx: mpsc::Sender<DecodedTile>,
    off: (usize, usize),
) {
    let mut merged: Option<DecodedTile> = None;
    while let Some(tile) = tile_rx.recv().await {
        if tile.is_empty() {
            continue;
        }
        match &mut merged {
            None => merged = Some(tile),
            Some(out) => merge_into(out, &tile),
        }
    }
    let result = merged.unwrap_or_else(|| DecodedTile::empty(off.0, off.1));
    let _ = out_tx.send(result).await;
}

fn merge_into(out: &mut DecodedTile, tile: &DecodedTile) {
    if tile.width != out.width || tile.height != out.height {
        return;
    }
    let bands = out.bands.len().min(tile.bands.len());
    for b in 0..bands {
        for i in 0..out.width * out.height {
            let current = out.bands[b][i];
            let incoming = tile.bands[b][i];
            if (current == out.nodata || !current.is_finite())
                && incoming != tile.nodata
                && incoming.is_finite()
            {
                out.bands[b][i] = incoming;
            }
        }
    }
}

/// Worker-fetch stage: decode granules with bounded concurrency, preserving
/// backpressure through the bounded output channel.
async fn fetch_stage(
    workers: Arc<WorkerClient>,
    conc_limit: usize,
    mut granule_rx: mpsc::Receiver<GeoTileGranule>,
    tile_tx: mpsc::Sender<DecodedTile>,
    err_tx: mpsc::Sender<OwsError>,
) {
    let sem = Arc::new(Semaphore::new(conc_limit));
    let mut in_flight = tokio::task::JoinSet::new();

    while let Some(granule) = granule_rx.recv().await {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let workers = workers.clone();
        let tile_tx = tile_tx.clone();
        let err_tx = err_tx.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            match workers.decode(&granule).await {
                Ok(tile) => {
                    let _ = tile_tx.send(tile).await;
                }
                Err(e) => {
                    let _ = err_tx.send(e).await;
                }
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    debug!("tile pipeline worker stage done");
}
