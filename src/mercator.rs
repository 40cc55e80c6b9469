//! Spherical-Mercator tile arithmetic.
//!
//! Geometry is carried in "unit Mercator" space: x and y both in `[0, 1]`,
//! origin at the top-left (north-west) corner of the world, matching the XYZ
//! tile scheme. A tile `(z, x, y)` covers `[x / 2^z, (x + 1) / 2^z)` on each axis.

use std::f64::consts::PI;

use geo::{Coord, Rect};

use crate::model::TileCoord;

/// Highest zoom the tile scheme accepts.
pub const MAX_ZOOM: u8 = 30;

/// Latitude limit of the square Mercator world.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Convert a web (top-left origin) row into the artifact's bottom-left origin
/// row, or back again. The transform is its own inverse.
pub fn flip_row(z: u8, row: u32) -> u32 {
    (((1u64 << z) - 1) - row as u64) as u32
}

/// Project a lon/lat coordinate into unit Mercator space.
pub fn project(c: Coord<f64>) -> Coord<f64> {
    let lat = c.y.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (c.x + 180.0) / 360.0;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0;
    Coord {
        x: x.clamp(0.0, 1.0),
        y: y.clamp(0.0, 1.0),
    }
}

/// Inverse of [`project`].
pub fn unproject(c: Coord<f64>) -> Coord<f64> {
    let lon = c.x * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * c.y)).sinh().atan().to_degrees();
    Coord { x: lon, y: lat }
}

/// Tile column containing a unit-Mercator x, clamped to the grid.
pub fn unit_to_tile(v: f64, z: u8) -> u32 {
    let n = (1u64 << z) as f64;
    ((v * n).floor()).clamp(0.0, n - 1.0) as u32
}

pub fn lon_to_tile_x(lon: f64, z: u8) -> u32 {
    unit_to_tile(project(Coord { x: lon, y: 0.0 }).x, z)
}

pub fn lat_to_tile_y(lat: f64, z: u8) -> u32 {
    unit_to_tile(project(Coord { x: 0.0, y: lat }).y, z)
}

/// Geographic (lon/lat) bounds of a tile.
pub fn tile_bounds(coord: TileCoord) -> Rect<f64> {
    let n = coord.grid_size() as f64;
    let north_west = unproject(Coord {
        x: coord.x as f64 / n,
        y: coord.y as f64 / n,
    });
    let south_east = unproject(Coord {
        x: (coord.x as f64 + 1.0) / n,
        y: (coord.y as f64 + 1.0) / n,
    });
    Rect::new(north_west, south_east)
}

/// Unit-Mercator square covered by a tile.
pub fn tile_rect(coord: TileCoord) -> Rect<f64> {
    let n = coord.grid_size() as f64;
    Rect::new(
        Coord {
            x: coord.x as f64 / n,
            y: coord.y as f64 / n,
        },
        Coord {
            x: (coord.x as f64 + 1.0) / n,
            y: (coord.y as f64 + 1.0) / n,
        },
    )
}

/// Map a unit-Mercator coordinate into the pixel space of one tile.
pub fn to_tile_pixels(c: Coord<f64>, coord: TileCoord, extent: f64) -> Coord<f64> {
    let n = coord.grid_size() as f64;
    Coord {
        x: (c.x * n - coord.x as f64) * extent,
        y: (c.y * n - coord.y as f64) * extent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flip_row_at_zoom_zero() {
        assert_eq!(flip_row(0, 0), 0);
    }

    #[test]
    fn flip_row_at_low_and_high_zoom() {
        assert_eq!(flip_row(1, 0), 1);
        assert_eq!(flip_row(1, 1), 0);
        assert_eq!(flip_row(4, 5), 10);
        assert_eq!(flip_row(10, 353), 670);
        assert_eq!(flip_row(14, 0), 16383);
        assert_eq!(flip_row(30, 0), (1u32 << 30) - 1);
    }

    proptest! {
        #[test]
        fn flip_row_is_an_involution(z in 0u8..=MAX_ZOOM, seed in any::<u64>()) {
            let row = (seed % (1u64 << z)) as u32;
            prop_assert_eq!(flip_row(z, flip_row(z, row)), row);
        }
    }

    #[test]
    fn children_tile_their_parent() {
        let parent = TileCoord::new(3, 2, 5);
        let rect = tile_rect(parent);
        let area: f64 = parent
            .children()
            .iter()
            .map(|c| {
                let r = tile_rect(*c);
                assert!(r.min().x >= rect.min().x && r.max().x <= rect.max().x);
                assert!(r.min().y >= rect.min().y && r.max().y <= rect.max().y);
                r.width() * r.height()
            })
            .sum();
        assert!((area - rect.width() * rect.height()).abs() < 1e-15);
        assert_eq!(parent.children()[3], TileCoord::new(4, 5, 11));
    }

    #[test]
    fn known_tile_for_puget_sound() {
        assert_eq!(lon_to_tile_x(-122.5, 10), 163);
        assert_eq!(lat_to_tile_y(48.6, 10), 353);
    }

    #[test]
    fn projection_round_trips() {
        let c = Coord { x: -111.04, y: 45.68 };
        let back = unproject(project(c));
        assert!((back.x - c.x).abs() < 1e-9);
        assert!((back.y - c.y).abs() < 1e-9);
    }

    #[test]
    fn tile_bounds_of_world_tile() {
        let b = tile_bounds(TileCoord::new(0, 0, 0));
        assert!((b.min().x + 180.0).abs() < 1e-9);
        assert!((b.max().x - 180.0).abs() < 1e-9);
        assert!((b.max().y - MAX_LATITUDE).abs() < 1e-6);
    }
}
