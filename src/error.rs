use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{Layer, TileCoord};

/// Why the validator refused a geometry. These are data-quality outcomes:
/// counted and logged, never fatal to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    SelfIntersection,
    DegenerateRing,
    EmptyGeometry,
    UnsupportedType,
}

impl RejectReason {
    pub const ALL: [RejectReason; 4] = [
        RejectReason::SelfIntersection,
        RejectReason::DegenerateRing,
        RejectReason::EmptyGeometry,
        RejectReason::UnsupportedType,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::SelfIntersection => "self_intersection",
            RejectReason::DegenerateRing => "degenerate_ring",
            RejectReason::EmptyGeometry => "empty_geometry",
            RejectReason::UnsupportedType => "unsupported_type",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failures that abort a tile build. The previously published artifact is
/// left untouched whenever one of these is returned.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("nothing to tile: no valid features survived preparation")]
    NoFeatures,

    #[error(
        "tile {layer} {coord} is {bytes} bytes after maximum simplification (cap {cap} bytes)"
    )]
    TileTooLarge {
        layer: Layer,
        coord: TileCoord,
        bytes: usize,
        cap: usize,
    },

    #[error("failed to encode tile {coord}: {reason}")]
    Encode { coord: TileCoord, reason: String },

    #[error("tile store write failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("built artifact failed validation: {0}")]
    Validation(#[from] StoreError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures opening or reading a published artifact.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tile store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to open tile store {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("tile store query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A client asked for something that cannot be a tile address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("{field} is not a non-negative integer: {value:?}")]
    Malformed { field: &'static str, value: String },

    #[error("zoom {0} is outside [0, {max}]", max = crate::mercator::MAX_ZOOM)]
    ZoomOutOfRange(u64),

    #[error("{field} {value} is outside the {size}x{size} grid of zoom {z}")]
    OutsideGrid {
        field: &'static str,
        value: u64,
        z: u8,
        size: u64,
    },

    #[error("unknown layer {0:?}")]
    UnknownLayer(String),
}
