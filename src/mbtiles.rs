//! MBTiles artifact: a single SQLite file holding both tile layers.
//!
//! Rows are stored bottom-left-origin (TMS) while everything outside this
//! module speaks the top-left-origin web scheme; the flip happens here, on
//! both the write and the read path.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use geo::{Intersects, Rect};
use log::{debug, info};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, StoreError};
use crate::mercator::{self, MAX_ZOOM};
use crate::model::{Layer, TileCoord};

/// Read connections kept open per store.
const READ_POOL_SIZE: usize = 4;

const KNOWN_FORMATS: [&str; 4] = ["pbf", "png", "jpg", "webp"];

/// One entry of the `vector_layers` list in the `json` metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorLayer {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub minzoom: u8,
    pub maxzoom: u8,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TileJson {
    vector_layers: Vec<VectorLayer>,
}

/// Parsed metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub format: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// west, south, east, north in degrees
    pub bounds: [f64; 4],
    /// lon, lat, zoom
    pub center: [f64; 3],
    pub vector_layers: Vec<VectorLayer>,
}

impl Metadata {
    fn rows(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let join = |v: &[f64]| v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",");
        let json = serde_json::to_string(&TileJson {
            vector_layers: self.vector_layers.clone(),
        })?;
        Ok(vec![
            ("name", self.name.clone()),
            ("description", self.description.clone()),
            ("version", self.version.clone()),
            ("format", self.format.clone()),
            ("type", "overlay".to_string()),
            ("minzoom", self.min_zoom.to_string()),
            ("maxzoom", self.max_zoom.to_string()),
            ("bounds", join(&self.bounds)),
            ("center", join(&self.center)),
            ("json", json),
        ])
    }

    fn from_rows(path: &Path, rows: &HashMap<String, String>) -> Result<Self, StoreError> {
        let get = |key: &str| {
            rows.get(key)
                .cloned()
                .ok_or_else(|| StoreError::corrupt(path, format!("metadata is missing {:?}", key)))
        };
        let zoom = |key: &str| -> Result<u8, StoreError> {
            let value = get(key)?;
            match value.trim().parse::<u8>() {
                Ok(z) if z <= MAX_ZOOM => Ok(z),
                _ => Err(StoreError::corrupt(path, format!("{} {:?} is not a zoom level", key, value))),
            }
        };
        let numbers = |key: &str, len: usize| -> Result<Vec<f64>, StoreError> {
            let value = get(key)?;
            let parsed: Option<Vec<f64>> = value
                .split(',')
                .map(|n| n.trim().parse::<f64>().ok().filter(|n| n.is_finite()))
                .collect();
            parsed
                .filter(|v| v.len() == len)
                .ok_or_else(|| StoreError::corrupt(path, format!("{} {:?} is malformed", key, value)))
        };

        let format = get("format")?;
        if !KNOWN_FORMATS.contains(&format.as_str()) {
            return Err(StoreError::corrupt(path, format!("unknown tile format {:?}", format)));
        }
        let min_zoom = zoom("minzoom")?;
        let max_zoom = zoom("maxzoom")?;
        if min_zoom > max_zoom {
            return Err(StoreError::corrupt(
                path,
                format!("minzoom {} exceeds maxzoom {}", min_zoom, max_zoom),
            ));
        }

        let b = numbers("bounds", 4)?;
        let bounds = [b[0], b[1], b[2], b[3]];
        let [west, south, east, north] = bounds;
        if !(-180.0..=180.0).contains(&west)
            || !(-180.0..=180.0).contains(&east)
            || !(-90.0..=90.0).contains(&south)
            || !(-90.0..=90.0).contains(&north)
            || west > east
            || south > north
        {
            return Err(StoreError::corrupt(path, format!("bounds {:?} are out of range", bounds)));
        }
        let center = match rows.get("center") {
            Some(_) => {
                let c = numbers("center", 3)?;
                [c[0], c[1], c[2]]
            }
            None => [(west + east) / 2.0, (south + north) / 2.0, min_zoom as f64],
        };

        let vector_layers = if format == "pbf" {
            let json = get("json")?;
            let tile_json: TileJson = serde_json::from_str(&json)
                .map_err(|e| StoreError::corrupt(path, format!("json metadata: {}", e)))?;
            if tile_json.vector_layers.is_empty() {
                return Err(StoreError::corrupt(path, "no vector layers declared"));
            }
            for layer in &tile_json.vector_layers {
                layer
                    .id
                    .parse::<Layer>()
                    .map_err(|e| StoreError::corrupt(path, e.to_string()))?;
                if layer.minzoom > layer.maxzoom
                    || layer.minzoom < min_zoom
                    || layer.maxzoom > max_zoom
                {
                    return Err(StoreError::corrupt(
                        path,
                        format!(
                            "layer {} zooms {}..={} fall outside {}..={}",
                            layer.id, layer.minzoom, layer.maxzoom, min_zoom, max_zoom
                        ),
                    ));
                }
            }
            tile_json.vector_layers
        } else {
            Vec::new()
        };

        Ok(Self {
            name: rows.get("name").cloned().unwrap_or_default(),
            description: rows.get("description").cloned().unwrap_or_default(),
            version: rows.get("version").cloned().unwrap_or_default(),
            format,
            min_zoom,
            max_zoom,
            bounds,
            center,
            vector_layers,
        })
    }

    fn bounds_rect(&self) -> Rect<f64> {
        let [west, south, east, north] = self.bounds;
        Rect::new((west, south), (east, north))
    }
}

/// Write side of the artifact. All tiles go into one transaction which is
/// committed by [`MbtilesWriter::finish`].
pub struct MbtilesWriter {
    conn: Connection,
    path: PathBuf,
    tiles_written: usize,
}

impl MbtilesWriter {
    /// Create a fresh artifact at `path`, replacing any leftover file.
    pub fn create(path: &Path) -> Result<Self, BuildError> {
        let io_err = |source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        if path.exists() {
            fs::remove_file(path).map_err(io_err)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = OFF;
             PRAGMA synchronous = OFF;
             CREATE TABLE metadata (name TEXT, value TEXT);
             CREATE UNIQUE INDEX name ON metadata (name);
             CREATE TABLE tiles (
                 zoom_level INTEGER,
                 tile_column INTEGER,
                 tile_row INTEGER,
                 tile_data BLOB
             );
             CREATE UNIQUE INDEX tile_index ON tiles (zoom_level, tile_column, tile_row);
             BEGIN;",
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            tiles_written: 0,
        })
    }

    pub fn write_metadata(&self, metadata: &Metadata) -> Result<(), BuildError> {
        let rows = metadata
            .rows()
            .map_err(|e| BuildError::InvalidConfig(format!("metadata json: {}", e)))?;
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)")?;
        for (name, value) in rows {
            stmt.execute(params![name, value])?;
        }
        Ok(())
    }

    /// Store one tile under its web address.
    pub fn put_tile(&mut self, coord: TileCoord, data: &[u8]) -> Result<(), BuildError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![coord.z, coord.x, coord.tms_row(), data])?;
        self.tiles_written += 1;
        Ok(())
    }

    /// Commit and close. Returns the number of tiles written.
    pub fn finish(self) -> Result<usize, BuildError> {
        self.conn.execute_batch("COMMIT;")?;
        self.conn.close().map_err(|(_, e)| BuildError::Sqlite(e))?;
        debug!("Wrote {} tiles to {:?}", self.tiles_written, self.path);
        Ok(self.tiles_written)
    }
}

/// Read-only view of a published artifact.
pub struct TileStore {
    path: PathBuf,
    metadata: Metadata,
    connections: Vec<Mutex<Connection>>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for TileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileStore")
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Connection::open_with_flags(path, flags).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })
}

impl TileStore {
    /// Open and validate an artifact. Fails on anything that would make
    /// serving from it unsafe.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.is_file() {
            return Err(StoreError::corrupt(path, "artifact does not exist"));
        }
        let first = open_read_only(path)?;

        let tables: Vec<String> = {
            let mut stmt = first
                .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view')")
                .map_err(|e| StoreError::corrupt(path, e.to_string()))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
                .map_err(|e| StoreError::corrupt(path, e.to_string()))?;
            names
        };
        for table in ["metadata", "tiles"] {
            if !tables.iter().any(|t| t == table) {
                return Err(StoreError::corrupt(path, format!("missing {} table", table)));
            }
        }

        let rows: HashMap<String, String> = {
            let mut stmt = first.prepare("SELECT name, value FROM metadata")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<HashMap<_, _>, _>>()?;
            rows
        };
        let metadata = Metadata::from_rows(path, &rows)?;

        let mut connections = Vec::with_capacity(READ_POOL_SIZE);
        connections.push(Mutex::new(first));
        for _ in 1..READ_POOL_SIZE {
            connections.push(Mutex::new(open_read_only(path)?));
        }

        info!(
            "Opened tile store {:?} ({}, zooms {}..={}, layers: {})",
            path,
            metadata.format,
            metadata.min_zoom,
            metadata.max_zoom,
            metadata
                .vector_layers
                .iter()
                .map(|l| l.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            connections,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn connection(&self) -> &Mutex<Connection> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        &self.connections[index]
    }

    fn layer_range(&self, layer: Layer) -> Option<(u8, u8)> {
        self.metadata
            .vector_layers
            .iter()
            .find(|l| l.id == layer.as_str())
            .map(|l| (l.minzoom, l.maxzoom))
    }

    /// The layer whose zoom band contains `z`, if any.
    pub fn layer_for_zoom(&self, z: u8) -> Option<Layer> {
        Layer::ALL.into_iter().find(|layer| {
            self.layer_range(*layer)
                .is_some_and(|(min, max)| (min..=max).contains(&z))
        })
    }

    /// Fetch a tile by web address. Anything outside the declared zooms,
    /// the grid or the bounds is simply absent.
    pub fn get_tile(&self, layer: Layer, coord: TileCoord) -> Result<Option<Vec<u8>>, StoreError> {
        if coord.z < self.metadata.min_zoom || coord.z > self.metadata.max_zoom {
            return Ok(None);
        }
        match self.layer_range(layer) {
            Some((min, max)) if (min..=max).contains(&coord.z) => {}
            _ => return Ok(None),
        }
        if !coord.in_grid() {
            return Ok(None);
        }
        if !mercator::tile_bounds(coord).intersects(&self.metadata.bounds_rect()) {
            return Ok(None);
        }

        let conn = self.connection().lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare_cached(
            "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
        )?;
        let data = stmt
            .query_row(params![coord.z, coord.x, coord.tms_row()], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(data)
    }

    /// Tile count per zoom level, ascending.
    pub fn zoom_counts(&self) -> Result<Vec<(u8, u64)>, StoreError> {
        let conn = self.connection().lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT zoom_level, COUNT(*) FROM tiles GROUP BY zoom_level ORDER BY zoom_level",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, u8>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Every stored tile under its web address, ordered by address.
    pub fn tiles(&self) -> Result<Vec<(TileCoord, Vec<u8>)>, StoreError> {
        let conn = self.connection().lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt =
            conn.prepare("SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles")?;
        let mut tiles = stmt
            .query_map([], |row| {
                let z: u8 = row.get(0)?;
                let x: u32 = row.get(1)?;
                let tms_row: u32 = row.get(2)?;
                Ok((
                    TileCoord::new(z, x, mercator::flip_row(z, tms_row)),
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        tiles.sort_by_key(|(coord, _)| *coord);
        Ok(tiles)
    }
}
