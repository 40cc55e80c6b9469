use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{Area, BooleanOps, Coord, Line, LineString, MultiPolygon, Polygon, Validation, unary_union};
use rstar::{AABB, RTree, RTreeObject};

use crate::error::RejectReason;
use crate::io::geojson::Geometry;

/// Rings enclosing less than this (in squared degrees) carry no area.
const DEGENERATE_AREA: f64 = 1e-20;

/// A geometry that passed validation, possibly after repair.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub geometry: MultiPolygon<f64>,
    pub repaired: bool,
}

/// Validate a source geometry, repairing it where possible.
pub fn validate_geometry(geometry: Option<&Geometry>) -> Result<Validated, RejectReason> {
    let geometry = geometry.ok_or(RejectReason::EmptyGeometry)?;
    let mp = geometry
        .to_multi_polygon()
        .ok_or(RejectReason::UnsupportedType)?;
    validate_multi_polygon(mp)
}

/// Validate a polygonal geometry.
///
/// Degenerate holes are dropped and degenerate shells drop their polygon.
/// Edges that cross or touch, holes outside their shell and parts that
/// overlap each other all trigger a rebuild. A geometry left without area
/// is rejected.
pub fn validate_multi_polygon(mp: MultiPolygon<f64>) -> Result<Validated, RejectReason> {
    let mut repaired = false;
    let mut saw_degenerate = false;
    let mut polygons = Vec::with_capacity(mp.0.len());

    for polygon in &mp.0 {
        let exterior = match clean_ring(polygon.exterior()) {
            RingState::Valid(ring) => ring,
            RingState::Empty => continue,
            RingState::Degenerate => {
                saw_degenerate = true;
                continue;
            }
        };
        let mut interiors = Vec::with_capacity(polygon.interiors().len());
        for hole in polygon.interiors() {
            match clean_ring(hole) {
                RingState::Valid(ring) => interiors.push(ring),
                RingState::Empty | RingState::Degenerate => repaired = true,
            }
        }
        polygons.push(Polygon::new(exterior, interiors));
    }

    if polygons.is_empty() {
        return Err(if saw_degenerate {
            RejectReason::DegenerateRing
        } else {
            RejectReason::EmptyGeometry
        });
    }
    repaired |= saw_degenerate;
    let cleaned = MultiPolygon::new(polygons);

    let edges = scan_edges(&cleaned);
    if edges == EdgeScan::Clean && cleaned.is_valid() {
        return Ok(Validated {
            geometry: cleaned,
            repaired,
        });
    }

    let rebuilt = make_valid(&cleaned);
    if rebuilt.unsigned_area() <= DEGENERATE_AREA {
        return Err(match edges {
            EdgeScan::Clean => RejectReason::DegenerateRing,
            EdgeScan::Touching | EdgeScan::Crossing => RejectReason::SelfIntersection,
        });
    }
    if scan_edges(&rebuilt) == EdgeScan::Crossing {
        return Err(RejectReason::SelfIntersection);
    }
    Ok(Validated {
        geometry: rebuilt,
        repaired: true,
    })
}

/// Rebuild each shell through a union with nothing, cut its holes out of it,
/// then merge the parts so nested or overlapping ones count once.
fn make_valid(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let empty = MultiPolygon::<f64>::new(vec![]);
    let parts: Vec<MultiPolygon<f64>> = mp
        .0
        .iter()
        .map(|polygon| {
            let shell = Polygon::new(polygon.exterior().clone(), vec![]).union(&empty);
            if polygon.interiors().is_empty() {
                return shell;
            }
            let holes: Vec<Polygon<f64>> = polygon
                .interiors()
                .iter()
                .map(|hole| Polygon::new(hole.clone(), vec![]))
                .collect();
            shell.difference(&MultiPolygon::new(holes).union(&empty))
        })
        .collect();
    MultiPolygon::new(
        unary_union(&parts)
            .0
            .into_iter()
            .filter(|p| p.unsigned_area() > DEGENERATE_AREA)
            .collect(),
    )
}

enum RingState {
    Empty,
    Degenerate,
    Valid(LineString<f64>),
}

fn clean_ring(ring: &LineString<f64>) -> RingState {
    if ring.0.is_empty() {
        return RingState::Empty;
    }
    if ring.0.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return RingState::Degenerate;
    }

    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len() + 1);
    for c in &ring.0 {
        if coords.last() != Some(c) {
            coords.push(*c);
        }
    }
    if coords.first() != coords.last() {
        coords.push(coords[0]);
    }

    if coords.len() < 4 {
        return RingState::Degenerate;
    }
    let ring = LineString::from(coords);
    if Polygon::new(ring.clone(), vec![]).unsigned_area() <= DEGENERATE_AREA {
        return RingState::Degenerate;
    }
    RingState::Valid(ring)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EdgeScan {
    Clean,
    /// A ring meets itself at a point without crossing
    Touching,
    /// Edges cross or overlap along a stretch
    Crossing,
}

// Ring edge wrapped for the R-tree
struct RingEdge {
    line: Line<f64>,
    ring: usize,
    index: usize,
    ring_edges: usize,
}

impl RTreeObject for RingEdge {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.line.start.x, self.line.start.y],
            [self.line.end.x, self.line.end.y],
        )
    }
}

impl RingEdge {
    fn is_adjacent(&self, other: &RingEdge) -> bool {
        if self.ring != other.ring {
            return false;
        }
        let (lo, hi) = if self.index < other.index {
            (self.index, other.index)
        } else {
            (other.index, self.index)
        };
        hi - lo == 1 || (lo == 0 && hi == self.ring_edges - 1)
    }
}

fn scan_edges(mp: &MultiPolygon<f64>) -> EdgeScan {
    let mut edges = Vec::new();
    let mut ring_id = 0;
    for polygon in &mp.0 {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            let lines: Vec<Line<f64>> = ring.lines().collect();
            let ring_edges = lines.len();
            edges.extend(lines.into_iter().enumerate().map(|(index, line)| RingEdge {
                line,
                ring: ring_id,
                index,
                ring_edges,
            }));
            ring_id += 1;
        }
    }
    if edges.len() < 2 {
        return EdgeScan::Clean;
    }

    let rtree = RTree::bulk_load(edges);
    let mut result = EdgeScan::Clean;

    for a in rtree.iter() {
        for b in rtree.locate_in_envelope_intersecting(&a.envelope()) {
            if (b.ring, b.index) <= (a.ring, a.index) {
                continue;
            }
            let found = match line_intersection(a.line, b.line) {
                None => EdgeScan::Clean,
                Some(LineIntersection::Collinear { intersection }) => {
                    if intersection.start == intersection.end {
                        touch_kind(a, b)
                    } else {
                        EdgeScan::Crossing
                    }
                }
                Some(LineIntersection::SinglePoint { is_proper: true, .. }) => EdgeScan::Crossing,
                Some(LineIntersection::SinglePoint { is_proper: false, .. }) => touch_kind(a, b),
            };
            if found == EdgeScan::Crossing {
                return EdgeScan::Crossing;
            }
            result = result.max(found);
        }
    }
    result
}

// Rings may meet other rings at single points; a ring meeting itself away
// from its shared vertices is a self-touch.
fn touch_kind(a: &RingEdge, b: &RingEdge) -> EdgeScan {
    if a.ring != b.ring || a.is_adjacent(b) {
        EdgeScan::Clean
    } else {
        EdgeScan::Touching
    }
}
