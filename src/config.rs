use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Serialize};

use crate::mercator::MAX_ZOOM;

/// Top-level configuration, loadable from TOML. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub etl: EtlConfig,
    pub tiles: TilesConfig,
    pub server: ServerConfig,
}

/// Preparation stage: input, provenance stamps and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// GeoJSON FeatureCollection or line-delimited GeoJSON
    pub input: PathBuf,
    /// Bulk export of classified features (NDJSON)
    pub export_path: PathBuf,
    /// Optional GeoJSON dump of the dissolved units
    pub dissolved_path: Option<PathBuf>,
    pub source: String,
    /// Date-of-record stamped on every feature (YYYY-MM-DD)
    pub asof: String,
    /// Owner and unit names are cut to this many characters
    pub max_name_chars: usize,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("data/padus/padus.geojson"),
            export_path: PathBuf::from("data/padus/padus_clean.ndjson"),
            dissolved_path: Some(PathBuf::from("data/padus/padus_dissolved.geojson")),
            source: "PAD-US".to_string(),
            asof: "2023-09-01".to_string(),
            max_name_chars: 100,
        }
    }
}

/// Tiling stage: zoom bands, per-tier limits and the published artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilesConfig {
    pub artifact_path: PathBuf,
    pub name: String,
    pub description: String,
    /// First zoom of the coarse tier
    pub low_min_zoom: u8,
    /// First zoom of the fine tier; the coarse tier ends just below it
    pub mid_zoom: u8,
    /// Last zoom of the fine tier (inclusive)
    pub hi_max_zoom: u8,
    /// Tile coordinate extent (pixels per tile side)
    pub extent: u32,
    /// Clip buffer around each tile, in tile pixels
    pub buffer: f64,
    pub low: TierConfig,
    pub hi: TierConfig,
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("data/tiles/ownership.mbtiles"),
            name: "US Ownership".to_string(),
            description: "US Public Land Ownership".to_string(),
            low_min_zoom: 4,
            mid_zoom: 10,
            hi_max_zoom: 14,
            extent: 4096,
            buffer: 64.0,
            low: TierConfig {
                simplification: 4.0,
                ..TierConfig::default()
            },
            hi: TierConfig::default(),
        }
    }
}

impl TilesConfig {
    pub fn low_zooms(&self) -> std::ops::RangeInclusive<u8> {
        self.low_min_zoom..=self.mid_zoom.saturating_sub(1)
    }

    pub fn hi_zooms(&self) -> std::ops::RangeInclusive<u8> {
        self.mid_zoom..=self.hi_max_zoom
    }

    pub fn validate(&self) -> Result<()> {
        if self.low_min_zoom >= self.mid_zoom {
            bail!(
                "low_min_zoom ({}) must be below mid_zoom ({})",
                self.low_min_zoom,
                self.mid_zoom
            );
        }
        if self.mid_zoom > self.hi_max_zoom {
            bail!(
                "mid_zoom ({}) must not exceed hi_max_zoom ({})",
                self.mid_zoom,
                self.hi_max_zoom
            );
        }
        if self.hi_max_zoom > MAX_ZOOM {
            bail!("hi_max_zoom ({}) exceeds {}", self.hi_max_zoom, MAX_ZOOM);
        }
        if self.extent == 0 {
            bail!("tile extent must be positive");
        }
        if !(self.buffer >= 0.0) {
            bail!("clip buffer must be non-negative");
        }
        self.low.validate("low")?;
        self.hi.validate("hi")?;
        Ok(())
    }
}

/// Simplification and size limits of one zoom tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Douglas-Peucker tolerance in tile pixels for the first attempt
    pub simplification: f64,
    /// How many times the tolerance may double before giving up on simplification alone
    pub max_simplification_steps: u32,
    /// Largest compressed payload allowed for one tile
    pub max_tile_bytes: usize,
    /// Drop the smallest features once simplification is exhausted
    pub drop_smallest_features: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            simplification: 1.0,
            max_simplification_steps: 6,
            max_tile_bytes: 500_000,
            drop_smallest_features: true,
        }
    }
}

impl TierConfig {
    fn validate(&self, tier: &str) -> Result<()> {
        if !(self.simplification > 0.0) {
            bail!("{} tier simplification must be positive", tier);
        }
        if self.max_tile_bytes == 0 {
            bail!("{} tier max_tile_bytes must be positive", tier);
        }
        Ok(())
    }
}

/// Tile server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Origins allowed by CORS; empty or "*" allows any
    pub allowed_origins: Vec<String>,
    pub cache_max_age: u64,
    pub read_timeout_ms: u64,
    /// How often the artifact is checked for a newer generation
    pub reload_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            cache_max_age: 31_536_000,
            read_timeout_ms: 5_000,
            reload_interval_secs: 30,
        }
    }
}

impl Config {
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if NaiveDate::parse_from_str(&self.etl.asof, "%Y-%m-%d").is_err() {
            bail!("asof {:?} is not a YYYY-MM-DD date", self.etl.asof);
        }
        if self.etl.max_name_chars == 0 {
            bail!("max_name_chars must be positive");
        }
        self.tiles.validate()?;
        if self.server.read_timeout_ms == 0 {
            bail!("read_timeout_ms must be positive");
        }
        Ok(())
    }
}
