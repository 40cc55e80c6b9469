use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::extract::{Path as UrlPath, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::time;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::ServerConfig;
use crate::error::{RequestError, StoreError};
use crate::io;
use crate::mercator::MAX_ZOOM;
use crate::model::{Layer, TileCoord};
use crate::mbtiles::TileStore;

/// Route segment that picks the layer from the requested zoom.
pub const OWNERSHIP_ROUTE: &str = "ownership";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Identity of the artifact file a store was opened from.
type FileStamp = (Option<SystemTime>, u64);

fn file_stamp(path: &Path) -> Option<FileStamp> {
    fs::metadata(path).ok().map(|m| (m.modified().ok(), m.len()))
}

/// The live tile store. Each request loads its own `Arc`, so swapping in a
/// new generation never disturbs reads already in flight; the previous store
/// closes when its last reader drops it.
pub struct StoreHandle {
    path: PathBuf,
    current: ArcSwap<TileStore>,
    generation: AtomicU64,
    stamp: Mutex<Option<FileStamp>>,
}

impl StoreHandle {
    /// Open the artifact. Refuses a store that fails validation.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let stamp = file_stamp(path);
        let store = TileStore::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: ArcSwap::from_pointee(store),
            generation: AtomicU64::new(1),
            stamp: Mutex::new(stamp),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<TileStore> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Open the artifact afresh and make it the live store. The old store
    /// keeps serving if the new one does not validate.
    pub fn reload(&self) -> Result<u64, StoreError> {
        let stamp = file_stamp(&self.path);
        let store = TileStore::open(&self.path)?;
        self.current.store(Arc::new(store));
        *self.stamp.lock().unwrap_or_else(PoisonError::into_inner) = stamp;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Serving generation {} of {:?}", generation, self.path);
        Ok(generation)
    }

    /// Reload only when the artifact file has been replaced since the last open.
    pub fn reload_if_changed(&self) -> Result<bool, StoreError> {
        let stamp = file_stamp(&self.path);
        let known = *self.stamp.lock().unwrap_or_else(PoisonError::into_inner);
        if stamp.is_none() || stamp == known {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }

    /// Poll for a newly published artifact until the task is dropped.
    pub async fn watch(self: Arc<Self>, every: Duration) {
        let mut interval = time::interval(every);
        interval.tick().await;
        info!("Watching {:?} for new artifacts every {:?}", self.path, every);

        loop {
            interval.tick().await;
            let handle = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || handle.reload_if_changed()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Ignoring unusable artifact, keeping generation {}: {}", self.generation(), e),
                Err(e) => error!("Artifact reload task failed: {}", e),
            }
        }
    }
}

/// A fully formed tile response.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TileResponse {
    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    fn text(status: StatusCode, message: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        Self {
            status,
            headers,
            body: message.into_bytes(),
        }
    }
}

impl IntoResponse for TileResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// How a store read ended.
#[derive(Debug)]
enum ReadOutcome {
    Tile(Vec<u8>),
    Absent,
    Failed(String),
    TimedOut,
}

/// Which layer a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerRoute {
    Fixed(Layer),
    ByZoom,
}

fn parse_layer(value: &str) -> Result<LayerRoute, RequestError> {
    if value == OWNERSHIP_ROUTE {
        return Ok(LayerRoute::ByZoom);
    }
    value.parse().map(LayerRoute::Fixed)
}

fn parse_number(field: &'static str, value: &str) -> Result<u64, RequestError> {
    let malformed = || RequestError::Malformed {
        field,
        value: value.to_string(),
    };
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    value.parse::<u64>().map_err(|_| malformed())
}

/// Parse web tile coordinates. `y` may carry a `.pbf` extension.
pub fn parse_coord(z: &str, x: &str, y: &str) -> Result<TileCoord, RequestError> {
    let y = y.strip_suffix(".pbf").unwrap_or(y);
    let z = parse_number("z", z)?;
    if z > MAX_ZOOM as u64 {
        return Err(RequestError::ZoomOutOfRange(z));
    }
    let size = 1u64 << z;
    let z = z as u8;
    let x = parse_number("x", x)?;
    if x >= size {
        return Err(RequestError::OutsideGrid {
            field: "x",
            value: x,
            z,
            size,
        });
    }
    let y = parse_number("y", y)?;
    if y >= size {
        return Err(RequestError::OutsideGrid {
            field: "y",
            value: y,
            z,
            size,
        });
    }
    Ok(TileCoord::new(z, x as u32, y as u32))
}

/// Answers tile requests against the live store.
#[derive(Clone)]
pub struct TileService {
    store: Arc<StoreHandle>,
    cache_control: HeaderValue,
    read_timeout: Duration,
}

impl TileService {
    pub fn new(store: Arc<StoreHandle>, config: &ServerConfig) -> Self {
        let cache_control = HeaderValue::from_str(&format!(
            "public, max-age={}, immutable",
            config.cache_max_age
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("public, max-age=31536000, immutable"));
        Self {
            store,
            cache_control,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        &self.store
    }

    /// Serve one tile request from raw path segments.
    ///
    /// 200 with the stored payload, 204 when no tile exists, 400 for
    /// malformed coordinates, 404 for an unknown layer, 503 when the read
    /// times out and 500 when the store fails.
    pub async fn handle(&self, layer: &str, z: &str, x: &str, y: &str) -> TileResponse {
        let route = match parse_layer(layer) {
            Ok(route) => route,
            Err(e) => return TileResponse::text(StatusCode::NOT_FOUND, e.to_string()),
        };
        let coord = match parse_coord(z, x, y) {
            Ok(coord) => coord,
            Err(e) => {
                debug!("Rejected tile request {}/{}/{}/{}: {}", layer, z, x, y, e);
                return TileResponse::text(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let store = self.store.current();
        let layer = match route {
            LayerRoute::Fixed(layer) => layer,
            LayerRoute::ByZoom => match store.layer_for_zoom(coord.z) {
                Some(layer) => layer,
                None => return self.respond(ReadOutcome::Absent),
            },
        };

        let read = tokio::task::spawn_blocking(move || store.get_tile(layer, coord));
        let outcome = match time::timeout(self.read_timeout, read).await {
            Err(_) => {
                warn!("Read of {} {} timed out after {:?}", layer, coord, self.read_timeout);
                ReadOutcome::TimedOut
            }
            Ok(Err(e)) => ReadOutcome::Failed(e.to_string()),
            Ok(Ok(Err(e))) => ReadOutcome::Failed(e.to_string()),
            Ok(Ok(Ok(None))) => ReadOutcome::Absent,
            Ok(Ok(Ok(Some(data)))) => ReadOutcome::Tile(data),
        };
        if let ReadOutcome::Failed(reason) = &outcome {
            error!("Failed to read {} {}: {}", layer, coord, reason);
        }
        self.respond(outcome)
    }

    fn respond(&self, outcome: ReadOutcome) -> TileResponse {
        match outcome {
            ReadOutcome::Tile(data) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
                if data.starts_with(&GZIP_MAGIC) {
                    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                }
                headers.insert(CACHE_CONTROL, self.cache_control.clone());
                TileResponse {
                    status: StatusCode::OK,
                    headers,
                    body: data,
                }
            }
            ReadOutcome::Absent => TileResponse::empty(StatusCode::NO_CONTENT),
            ReadOutcome::TimedOut => TileResponse::text(
                StatusCode::SERVICE_UNAVAILABLE,
                "tile read timed out".to_string(),
            ),
            ReadOutcome::Failed(_) => TileResponse::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "tile store error".to_string(),
            ),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub tiles: TileService,
    pub export_path: PathBuf,
}

pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/tiles/{layer}/{z}/{x}/{y}", get(tile))
        .route("/data/ownership.geojson", get(export))
        .layer(cors_layer(config))
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() || config.allowed_origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

async fn tile(
    State(state): State<AppState>,
    UrlPath((layer, z, x, y)): UrlPath<(String, String, String, String)>,
) -> TileResponse {
    state.tiles.handle(&layer, &z, &x, &y).await
}

async fn index() -> impl IntoResponse {
    Json(json!({
        "name": "US Ownership Tile Server",
        "endpoints": {
            "tiles": "/tiles/{layer}/{z}/{x}/{y}.pbf",
            "layers": [OWNERSHIP_ROUTE, Layer::PadusLow.as_str(), Layer::PadusHi.as_str()],
            "health": "/health",
            "export": "/data/ownership.geojson"
        }
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let handle = state.tiles.store();
    let store = handle.current();
    let metadata = store.metadata();
    Json(json!({
        "status": "ok",
        "artifact": handle.path(),
        "generation": handle.generation(),
        "minzoom": metadata.min_zoom,
        "maxzoom": metadata.max_zoom,
        "layers": metadata.vector_layers.iter().map(|l| &l.id).collect::<Vec<_>>(),
    }))
}

async fn export(State(state): State<AppState>) -> Response {
    let path = state.export_path.clone();
    if !path.is_file() {
        return (StatusCode::NOT_FOUND, "export not found").into_response();
    }
    match tokio::task::spawn_blocking(move || io::export_as_feature_collection(&path)).await {
        Ok(Ok(body)) => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/geo+json"));
            (StatusCode::OK, headers, body).into_response()
        }
        Ok(Err(e)) => {
            error!("Failed to read export {:?}: {}", state.export_path, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "export unavailable").into_response()
        }
        Err(e) => {
            error!("Export task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "export unavailable").into_response()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Serve tiles until Ctrl-C. The store must already be open and valid.
pub async fn serve(config: &ServerConfig, store: Arc<StoreHandle>, export_path: PathBuf) -> Result<()> {
    let watcher = tokio::spawn(
        Arc::clone(&store).watch(Duration::from_secs(config.reload_interval_secs.max(1))),
    );

    let state = AppState {
        tiles: TileService::new(store, config),
        export_path,
    };
    let app = router(state, config);

    let listener = tokio::net::TcpListener::bind(config.bind.as_str()).await?;
    info!("Serving tiles at http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.abort();
    Ok(())
}
