use std::fmt;
use std::str::FromStr;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Canonical ownership category assigned to every emitted feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerClass {
    Federal,
    State,
    Local,
    Tribal,
    OtherPublic,
}

impl OwnerClass {
    pub const ALL: [OwnerClass; 5] = [
        OwnerClass::Federal,
        OwnerClass::State,
        OwnerClass::Local,
        OwnerClass::Tribal,
        OwnerClass::OtherPublic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerClass::Federal => "federal",
            OwnerClass::State => "state",
            OwnerClass::Local => "local",
            OwnerClass::Tribal => "tribal",
            OwnerClass::OtherPublic => "other_public",
        }
    }

    /// Human label used when a feature carries no usable owner name.
    pub fn label(&self) -> &'static str {
        match self {
            OwnerClass::Federal => "Federal",
            OwnerClass::State => "State",
            OwnerClass::Local => "Local",
            OwnerClass::Tribal => "Tribal",
            OwnerClass::OtherPublic => "Other Public",
        }
    }

    pub fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for OwnerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, classified ownership polygon ready for export and tiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Position in the source stream; gives every downstream step a stable order.
    pub id: u64,
    pub owner_class: OwnerClass,
    pub owner_name: String,
    pub unit_name: String,
    pub source: String,
    pub asof: String,
    pub geometry: MultiPolygon<f64>,
}

/// Union of every feature of one class. Only lives between dissolve and tiling.
#[derive(Debug, Clone, PartialEq)]
pub struct DissolvedUnit {
    pub owner_class: OwnerClass,
    pub geometry: MultiPolygon<f64>,
    pub member_count: usize,
}

/// Named vector layer inside the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    /// Dissolved, heavily simplified coarse tier.
    PadusLow,
    /// Full-detail fine tier with per-feature attributes.
    PadusHi,
}

impl Layer {
    pub const ALL: [Layer; 2] = [Layer::PadusLow, Layer::PadusHi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::PadusLow => "padus_low",
            Layer::PadusHi => "padus_hi",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "padus_low" => Ok(Layer::PadusLow),
            "padus_hi" => Ok(Layer::PadusHi),
            other => Err(RequestError::UnknownLayer(other.to_string())),
        }
    }
}

/// Tile address in the web (XYZ, top-left origin) scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles along one axis at this zoom.
    pub fn grid_size(&self) -> u64 {
        1u64 << self.z
    }

    pub fn in_grid(&self) -> bool {
        (self.x as u64) < self.grid_size() && (self.y as u64) < self.grid_size()
    }

    /// Row in the bottom-left-origin (TMS) numbering used by the artifact.
    pub fn tms_row(&self) -> u32 {
        crate::mercator::flip_row(self.z, self.y)
    }

    /// The four tiles one zoom deeper that cover this one.
    pub fn children(&self) -> [TileCoord; 4] {
        let (z, x, y) = (self.z + 1, self.x * 2, self.y * 2);
        [
            TileCoord::new(z, x, y),
            TileCoord::new(z, x + 1, y),
            TileCoord::new(z, x, y + 1),
            TileCoord::new(z, x + 1, y + 1),
        ]
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_class_serializes_snake_case() {
        let json = serde_json::to_string(&OwnerClass::OtherPublic).unwrap();
        assert_eq!(json, "\"other_public\"");
        let back: OwnerClass = serde_json::from_str("\"tribal\"").unwrap();
        assert_eq!(back, OwnerClass::Tribal);
    }

    #[test]
    fn layer_names_parse() {
        assert_eq!("padus_low".parse::<Layer>().unwrap(), Layer::PadusLow);
        assert_eq!("padus_hi".parse::<Layer>().unwrap(), Layer::PadusHi);
        assert_eq!(
            "roads".parse::<Layer>(),
            Err(RequestError::UnknownLayer("roads".into()))
        );
    }

    #[test]
    fn grid_membership() {
        assert!(TileCoord::new(0, 0, 0).in_grid());
        assert!(!TileCoord::new(0, 1, 0).in_grid());
        assert!(TileCoord::new(10, 1023, 1023).in_grid());
        assert!(!TileCoord::new(10, 1024, 0).in_grid());
    }
}
