use std::collections::BTreeMap;
use std::time::Instant;

use geo::{Area, BooleanOps, BoundingRect, MultiPolygon};
use log::{debug, info};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::model::{DissolvedUnit, Feature, OwnerClass};

type SortKey = (OrderedFloat<f64>, OrderedFloat<f64>, OrderedFloat<f64>, u64);

/// Order-independent key: position and size first, source id only for ties.
fn sort_key(feature: &Feature) -> SortKey {
    let (x, y) = feature
        .geometry
        .bounding_rect()
        .map(|r| (r.min().x, r.min().y))
        .unwrap_or((f64::INFINITY, f64::INFINITY));
    (
        OrderedFloat(x),
        OrderedFloat(y),
        OrderedFloat(feature.geometry.unsigned_area()),
        feature.id,
    )
}

/// Union a list of geometries as a balanced binary tree. The pairing depends
/// only on list order, so the result is reproducible; each level's unions
/// run in parallel.
pub fn union_all(mut level: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    if level.is_empty() {
        return MultiPolygon::new(vec![]);
    }
    if level.len() == 1 {
        // A lone geometry still goes through the overlay to merge its own parts.
        return level[0].union(&MultiPolygon::<f64>::new(vec![]));
    }
    while level.len() > 1 {
        level = level
            .par_chunks(2)
            .map(|pair| match pair {
                [a, b] => a.union(b),
                [a] => a.clone(),
                _ => MultiPolygon::new(vec![]),
            })
            .collect();
    }
    level.pop().unwrap_or_else(|| MultiPolygon::new(vec![]))
}

/// Group features by owner class and union each group. Produces at most one
/// unit per class, ordered by class; classes without features are absent.
/// Per-feature names are deliberately not carried over.
pub fn dissolve(features: &[Feature]) -> Vec<DissolvedUnit> {
    let start_time = Instant::now();

    let mut groups: BTreeMap<OwnerClass, Vec<&Feature>> = BTreeMap::new();
    for feature in features {
        groups.entry(feature.owner_class).or_default().push(feature);
    }

    let units: Vec<DissolvedUnit> = groups
        .into_iter()
        .map(|(owner_class, mut members)| {
            members.sort_by_cached_key(|f| sort_key(f));
            debug!("Dissolving {} {} features", members.len(), owner_class);
            let geometry = union_all(members.iter().map(|f| f.geometry.clone()).collect());
            DissolvedUnit {
                owner_class,
                geometry,
                member_count: members.len(),
            }
        })
        .filter(|unit| !unit.geometry.0.is_empty())
        .collect();

    info!(
        "Dissolved {} features into {} units in {:?}",
        features.len(),
        units.len(),
        start_time.elapsed()
    );
    units
}
