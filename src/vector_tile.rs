//! Per-tile encoding of ownership polygons into gzip'd Mapbox Vector Tiles.

use std::io::Write;

use flate2::{Compression, GzBuilder};
use geo::{
    Area, BooleanOps, BoundingRect, Coord, LineString, MapCoords, MultiPolygon, Polygon, Rect,
    Simplify, Winding,
};
use mvt::{GeomEncoder, GeomType, Tile};

use crate::error::BuildError;
use crate::mercator;
use crate::model::{DissolvedUnit, Feature, Layer, OwnerClass, TileCoord};

/// Text attributes carried by the fine tier.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub owner_name: String,
    pub unit_name: String,
    pub source: String,
    pub asof: String,
}

/// A feature prepared for tiling: geometry already in unit-Mercator space.
#[derive(Debug, Clone)]
pub struct TileFeature {
    pub id: u64,
    pub owner_class: OwnerClass,
    pub attributes: Option<Attributes>,
    pub geometry: MultiPolygon<f64>,
    pub bbox: Rect<f64>,
    /// Area in unit-Mercator space, used to rank features when dropping
    pub area: f64,
}

impl TileFeature {
    pub(crate) fn new(
        id: u64,
        owner_class: OwnerClass,
        attributes: Option<Attributes>,
        geometry: MultiPolygon<f64>,
    ) -> Option<Self> {
        let bbox = geometry.bounding_rect()?;
        let area = geometry.unsigned_area();
        Some(Self {
            id,
            owner_class,
            attributes,
            geometry,
            bbox,
            area,
        })
    }

    /// Fine-tier input: every attribute kept.
    pub fn from_feature(feature: &Feature) -> Option<Self> {
        Self::new(
            feature.id,
            feature.owner_class,
            Some(Attributes {
                owner_name: feature.owner_name.clone(),
                unit_name: feature.unit_name.clone(),
                source: feature.source.clone(),
                asof: feature.asof.clone(),
            }),
            feature.geometry.map_coords(mercator::project),
        )
    }

    /// Coarse-tier input: class only.
    pub fn from_unit(unit: &DissolvedUnit) -> Option<Self> {
        Self::new(
            unit.owner_class.ordinal() as u64,
            unit.owner_class,
            None,
            unit.geometry.map_coords(mercator::project),
        )
    }

    /// The part of this feature inside `bounds`, or `None` when nothing is.
    /// Keeps the full feature's area so ranking for drops is unaffected.
    pub fn clipped(&self, bounds: Rect<f64>) -> Option<TileFeature> {
        let (min, max) = (bounds.min(), bounds.max());
        let (bmin, bmax) = (self.bbox.min(), self.bbox.max());
        if bmax.x < min.x || bmin.x > max.x || bmax.y < min.y || bmin.y > max.y {
            return None;
        }
        if bmin.x >= min.x && bmax.x <= max.x && bmin.y >= min.y && bmax.y <= max.y {
            return Some(self.clone());
        }

        let clip = |ring: &LineString<f64>| close_ring(clip_ring(&ring.0, bounds));
        let polygons: Vec<Polygon<f64>> = self
            .geometry
            .0
            .iter()
            .filter_map(|polygon| {
                let exterior = clip(polygon.exterior())?;
                let interiors = polygon.interiors().iter().filter_map(clip).collect();
                Some(Polygon::new(exterior, interiors))
            })
            .collect();
        let geometry = MultiPolygon::new(polygons);
        let bbox = geometry.bounding_rect()?;
        Some(TileFeature {
            id: self.id,
            owner_class: self.owner_class,
            attributes: self.attributes.clone(),
            geometry,
            bbox,
            area: self.area,
        })
    }
}

/// Geometry parameters shared by every tile of a build.
#[derive(Debug, Clone, Copy)]
pub struct TileGeometry {
    pub extent: u32,
    /// Clip buffer in tile pixels
    pub buffer: f64,
}

impl TileGeometry {
    /// Unit-Mercator rectangle covered by a tile including its buffer.
    pub fn buffered_bounds(&self, coord: TileCoord) -> Rect<f64> {
        let n = coord.grid_size() as f64;
        let pad = self.buffer / self.extent as f64;
        Rect::new(
            Coord {
                x: (coord.x as f64 - pad) / n,
                y: (coord.y as f64 - pad) / n,
            },
            Coord {
                x: (coord.x as f64 + 1.0 + pad) / n,
                y: (coord.y as f64 + 1.0 + pad) / n,
            },
        )
    }
}

/// Encode the features of one tile. Returns `None` when nothing survives
/// clipping, so callers can leave the tile absent.
pub fn encode_tile(
    layer: Layer,
    coord: TileCoord,
    features: &[&TileFeature],
    geometry: TileGeometry,
    tolerance: f64,
) -> Result<Option<Vec<u8>>, BuildError> {
    let encode_err = |e: mvt::Error| BuildError::Encode {
        coord,
        reason: e.to_string(),
    };

    let tile = Tile::new(geometry.extent);
    let mut mvt_layer = tile.create_layer(layer.as_str());
    let mut written = 0usize;

    for feature in features {
        let polygons = tile_polygons(feature, coord, geometry, tolerance);
        if polygons.is_empty() {
            continue;
        }

        let mut encoder = GeomEncoder::new(GeomType::Polygon);
        for rings in &polygons {
            for ring in rings {
                // The closing point is implied by ClosePath.
                for c in &ring.0[..ring.0.len() - 1] {
                    encoder = encoder.point(c.x, c.y).map_err(encode_err)?;
                }
                encoder = encoder.complete().map_err(encode_err)?;
            }
        }
        let geom_data = encoder.encode().map_err(encode_err)?;

        let mut mvt_feature = mvt_layer.into_feature(geom_data);
        mvt_feature.set_id(feature.id);
        mvt_feature.add_tag_string("owner_class", feature.owner_class.as_str());
        if let Some(attrs) = &feature.attributes {
            mvt_feature.add_tag_string("owner_name", &attrs.owner_name);
            mvt_feature.add_tag_string("unit_name", &attrs.unit_name);
            mvt_feature.add_tag_string("source", &attrs.source);
            mvt_feature.add_tag_string("asof", &attrs.asof);
        }
        mvt_layer = mvt_feature.into_layer();
        written += 1;
    }

    if written == 0 {
        return Ok(None);
    }

    let mut tile = tile;
    tile.add_layer(mvt_layer).map_err(encode_err)?;
    let raw = tile.to_bytes().map_err(encode_err)?;
    gzip(&raw)
        .map(Some)
        .map_err(|e| BuildError::Encode {
            coord,
            reason: e.to_string(),
        })
}

/// Gzip with a zeroed header timestamp so identical input gives identical bytes.
pub fn gzip(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

/// Rings of each polygon, clipped, simplified and snapped to the tile grid.
/// The first ring of each entry is the exterior; rings are closed.
fn tile_polygons(
    feature: &TileFeature,
    coord: TileCoord,
    geometry: TileGeometry,
    tolerance: f64,
) -> Vec<Vec<LineString<f64>>> {
    let extent = geometry.extent as f64;
    let window = Rect::new(
        Coord {
            x: -geometry.buffer,
            y: -geometry.buffer,
        },
        Coord {
            x: extent + geometry.buffer,
            y: extent + geometry.buffer,
        },
    );
    let to_pixels = |ring: &LineString<f64>| -> Option<LineString<f64>> {
        let pixels: Vec<Coord<f64>> = ring
            .coords()
            .map(|c| mercator::to_tile_pixels(*c, coord, extent))
            .collect();
        let clipped = close_ring(clip_ring(&pixels, window))?;
        let snapped = clipped.simplify(&tolerance).map_coords(|c| Coord {
            x: c.x.round(),
            y: c.y.round(),
        });
        let ring = clean_ring(snapped)?;
        (Polygon::new(ring.clone(), vec![]).unsigned_area() >= 0.5).then_some(ring)
    };

    let mut out = Vec::new();
    for polygon in &feature.geometry.0 {
        let Some(exterior) = to_pixels(polygon.exterior()) else {
            continue;
        };
        let mut rings = vec![orient(exterior, false)];
        rings.extend(
            polygon
                .interiors()
                .iter()
                .filter_map(to_pixels)
                .map(|ring| orient(ring, true)),
        );
        out.push(rings);
    }
    out
}

/// Sutherland-Hodgman clip of a ring against an axis-aligned rectangle.
/// The result is open and empty when the ring misses the rectangle.
fn clip_ring(ring: &[Coord<f64>], bounds: Rect<f64>) -> Vec<Coord<f64>> {
    let (min, max) = (bounds.min(), bounds.max());
    let at_x = |a: &Coord<f64>, b: &Coord<f64>, x: f64| Coord {
        x,
        y: a.y + (x - a.x) / (b.x - a.x) * (b.y - a.y),
    };
    let at_y = |a: &Coord<f64>, b: &Coord<f64>, y: f64| Coord {
        x: a.x + (y - a.y) / (b.y - a.y) * (b.x - a.x),
        y,
    };

    let mut out = clip_against_edge(ring, |p| p.x >= min.x, |a, b| at_x(a, b, min.x));
    out = clip_against_edge(&out, |p| p.x <= max.x, |a, b| at_x(a, b, max.x));
    out = clip_against_edge(&out, |p| p.y >= min.y, |a, b| at_y(a, b, min.y));
    out = clip_against_edge(&out, |p| p.y <= max.y, |a, b| at_y(a, b, max.y));
    out.dedup();
    out
}

fn clip_against_edge<F, I>(ring: &[Coord<f64>], inside: F, intersect: I) -> Vec<Coord<f64>>
where
    F: Fn(&Coord<f64>) -> bool,
    I: Fn(&Coord<f64>, &Coord<f64>) -> Coord<f64>,
{
    let n = ring.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let current = &ring[i];
        let next = &ring[(i + 1) % n];
        match (inside(current), inside(next)) {
            (true, true) => out.push(*next),
            (true, false) => out.push(intersect(current, next)),
            (false, true) => {
                out.push(intersect(current, next));
                out.push(*next);
            }
            (false, false) => {}
        }
    }
    out
}

fn close_ring(coords: Vec<Coord<f64>>) -> Option<LineString<f64>> {
    if coords.len() < 3 {
        return None;
    }
    let mut ring = LineString::new(coords);
    ring.close();
    Some(ring)
}

/// Drop repeated points and A-B-A spikes. `None` when fewer than three
/// distinct points remain.
fn clean_ring(ring: LineString<f64>) -> Option<LineString<f64>> {
    let mut cleaned: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for p in ring.0 {
        if cleaned.last() == Some(&p) {
            continue;
        }
        if cleaned.len() >= 2 && cleaned[cleaned.len() - 2] == p {
            cleaned.pop();
            continue;
        }
        cleaned.push(p);
    }
    while cleaned.len() > 1 && cleaned.first() == cleaned.last() {
        cleaned.pop();
    }
    close_ring(cleaned)
}

/// Vector tiles want exteriors clockwise on screen and holes counter-clockwise.
/// Tile pixels run y-down, so screen-clockwise is geo's counter-clockwise.
fn orient(mut ring: LineString<f64>, is_hole: bool) -> LineString<f64> {
    if is_hole {
        ring.make_cw_winding();
    } else {
        ring.make_ccw_winding();
    }
    ring
}

/// Restrict a unit-Mercator geometry to a tile's buffered square.
pub fn clip_to_tile(geometry: &MultiPolygon<f64>, bounds: Rect<f64>) -> MultiPolygon<f64> {
    geometry.intersection(&MultiPolygon::new(vec![bounds.to_polygon()]))
}
