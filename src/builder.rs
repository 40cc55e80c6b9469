use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use geo::{BoundingRect, Intersects, Rect};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::{TierConfig, TilesConfig};
use crate::dissolve::union_all;
use crate::error::{BuildError, StoreError};
use crate::mbtiles::{MbtilesWriter, Metadata, TileStore, VectorLayer};
use crate::mercator::{self, MAX_LATITUDE};
use crate::model::{DissolvedUnit, Feature, Layer, OwnerClass, TileCoord};
use crate::vector_tile::{self, Attributes, TileFeature, TileGeometry};

/// Fraction of a tile's features removed per drop step.
const DROP_FRACTION: f64 = 0.1;

/// Attributes each layer declares in the artifact metadata.
fn layer_fields(layer: Layer) -> &'static [&'static str] {
    match layer {
        Layer::PadusLow => &["owner_class"],
        Layer::PadusHi => &["owner_class", "owner_name", "unit_name", "source", "asof"],
    }
}

/// What it took to fit one tile under its cap.
#[derive(Debug, Default, Clone, Copy)]
struct Escalation {
    simplification_steps: u32,
    coalesced: bool,
    dropped: usize,
}

/// A tile address with its features already clipped to the buffered tile.
type TileJob = (TileCoord, Vec<TileFeature>);

struct EncodedTile {
    coord: TileCoord,
    data: Vec<u8>,
    escalation: Escalation,
}

/// Counters reported once a build has been published.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub artifact: PathBuf,
    pub tiles: BTreeMap<Layer, usize>,
    pub largest_tile_bytes: usize,
    pub tiles_resimplified: usize,
    pub tiles_coalesced: usize,
    pub features_dropped: usize,
    pub elapsed: Duration,
}

impl BuildSummary {
    pub fn total_tiles(&self) -> usize {
        self.tiles.values().sum()
    }
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tiles in {:?}", self.total_tiles(), self.artifact)?;
        for (layer, count) in &self.tiles {
            write!(f, ", {} {}", count, layer)?;
        }
        write!(
            f,
            "; largest {} bytes, {} re-simplified, {} coalesced, {} features dropped, took {:?}",
            self.largest_tile_bytes,
            self.tiles_resimplified,
            self.tiles_coalesced,
            self.features_dropped,
            self.elapsed
        )
    }
}

/// Builds both tiers into one MBTiles artifact and publishes it atomically.
pub struct TileBuilder {
    config: TilesConfig,
}

impl TileBuilder {
    pub fn new(config: TilesConfig) -> Self {
        Self { config }
    }

    fn geometry(&self) -> TileGeometry {
        TileGeometry {
            extent: self.config.extent,
            buffer: self.config.buffer,
        }
    }

    /// Tile the dissolved units over the coarse band and the full features
    /// over the fine band, then replace the artifact. On error the previous
    /// artifact is left as it was.
    pub fn build(
        &self,
        features: &[Feature],
        units: &[DissolvedUnit],
    ) -> Result<BuildSummary, BuildError> {
        let start_time = Instant::now();
        self.config
            .validate()
            .map_err(|e| BuildError::InvalidConfig(e.to_string()))?;
        if features.is_empty() {
            return Err(BuildError::NoFeatures);
        }

        let hi: Vec<TileFeature> = features
            .par_iter()
            .filter_map(TileFeature::from_feature)
            .collect();
        let low: Vec<TileFeature> = units.iter().filter_map(TileFeature::from_unit).collect();
        info!(
            "Tiling {} dissolved units over z{}-{} and {} features over z{}-{}",
            low.len(),
            self.config.low_min_zoom,
            self.config.mid_zoom.saturating_sub(1),
            hi.len(),
            self.config.mid_zoom,
            self.config.hi_max_zoom
        );

        let mp = MultiProgress::new();
        let mut encoded = self.build_layer(Layer::PadusLow, &low, &self.config.low, &mp)?;
        let low_count = encoded.len();
        encoded.extend(self.build_layer(Layer::PadusHi, &hi, &self.config.hi, &mp)?);

        let mut summary = BuildSummary {
            artifact: self.config.artifact_path.clone(),
            ..BuildSummary::default()
        };
        summary.tiles.insert(Layer::PadusLow, low_count);
        summary.tiles.insert(Layer::PadusHi, encoded.len() - low_count);
        for tile in &encoded {
            summary.largest_tile_bytes = summary.largest_tile_bytes.max(tile.data.len());
            if tile.escalation.simplification_steps > 0 {
                summary.tiles_resimplified += 1;
            }
            if tile.escalation.coalesced {
                summary.tiles_coalesced += 1;
            }
            summary.features_dropped += tile.escalation.dropped;
        }

        let metadata = self.metadata(features);
        let tiles: Vec<(TileCoord, Vec<u8>)> =
            encoded.into_iter().map(|t| (t.coord, t.data)).collect();
        self.publish(&metadata, tiles)?;

        summary.elapsed = start_time.elapsed();
        info!("Published {}", summary);
        Ok(summary)
    }

    fn zooms(&self, layer: Layer) -> std::ops::RangeInclusive<u8> {
        match layer {
            Layer::PadusLow => self.config.low_zooms(),
            Layer::PadusHi => self.config.hi_zooms(),
        }
    }

    /// Tiles of the layer's first zoom, each holding its features clipped to
    /// the buffered tile. Candidates come from each polygon part's bounding
    /// box rather than the whole feature's.
    fn seed_tiles(&self, z: u8, features: &[TileFeature]) -> Vec<TileJob> {
        let mut candidates: BTreeMap<TileCoord, BTreeSet<usize>> = BTreeMap::new();
        for (index, feature) in features.iter().enumerate() {
            for part in feature.geometry.0.iter().filter_map(|p| p.bounding_rect()) {
                let (min, max) = (part.min(), part.max());
                for x in mercator::unit_to_tile(min.x, z)..=mercator::unit_to_tile(max.x, z) {
                    for y in mercator::unit_to_tile(min.y, z)..=mercator::unit_to_tile(max.y, z) {
                        candidates.entry(TileCoord::new(z, x, y)).or_default().insert(index);
                    }
                }
            }
        }

        let geometry = self.geometry();
        let candidates: Vec<(TileCoord, BTreeSet<usize>)> = candidates.into_iter().collect();
        candidates
            .into_par_iter()
            .filter_map(|(coord, members)| {
                let bounds = geometry.buffered_bounds(coord);
                let clipped: Vec<TileFeature> = members
                    .into_iter()
                    .filter_map(|i| features[i].clipped(bounds))
                    .collect();
                (!clipped.is_empty()).then_some((coord, clipped))
            })
            .collect()
    }

    /// Split every tile into its four children, clipping only what the
    /// parent kept. A child only takes features whose kept part reaches into
    /// the child itself, not just its buffer.
    fn descend(&self, level: &[TileJob]) -> Vec<TileJob> {
        let geometry = self.geometry();
        level
            .par_iter()
            .flat_map_iter(|(parent, members)| {
                parent.children().into_iter().filter_map(move |child| {
                    let area = mercator::tile_rect(child);
                    let bounds = geometry.buffered_bounds(child);
                    let clipped: Vec<TileFeature> = members
                        .iter()
                        .filter(|f| f.bbox.intersects(&area))
                        .filter_map(|f| f.clipped(bounds))
                        .collect();
                    (!clipped.is_empty()).then_some((child, clipped))
                })
            })
            .collect()
    }

    fn build_layer(
        &self,
        layer: Layer,
        features: &[TileFeature],
        tier: &TierConfig,
        mp: &MultiProgress,
    ) -> Result<Vec<EncodedTile>, BuildError> {
        let start_time = Instant::now();
        let zooms = self.zooms(layer);

        let pb = mp.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar().template(&format!(
            "[{{elapsed_precise}}] {{bar:40.cyan/blue}} {{pos}}/{{len}} ({{eta}}) - Encoding {}",
            layer
        )) {
            pb.set_style(style.progress_chars("##-"));
        }

        let mut tiles = Vec::new();
        let mut candidates = 0;
        let first = *zooms.start();
        let mut level = self.seed_tiles(first, features);
        for z in zooms {
            if z > first {
                level = self.descend(&level);
            }
            if level.is_empty() {
                break;
            }
            debug!("{} z{}: {} candidate tiles", layer, z, level.len());
            candidates += level.len();
            pb.inc_length(level.len() as u64);

            let results: Vec<Option<EncodedTile>> = level
                .par_iter()
                .map(|(coord, members)| {
                    let members: Vec<Cow<TileFeature>> = members.iter().map(Cow::Borrowed).collect();
                    let result = self.encode_within_cap(layer, *coord, members, tier);
                    pb.inc(1);
                    result
                })
                .collect::<Result<_, _>>()?;
            tiles.extend(results.into_iter().flatten());
        }

        pb.finish_with_message(format!("{} encoded", layer));
        info!(
            "Encoded {} {} tiles ({} candidates) in {:?}",
            tiles.len(),
            layer,
            candidates,
            start_time.elapsed()
        );
        Ok(tiles)
    }

    /// Encode a tile, escalating until it fits the tier's byte cap: first
    /// doubling the simplification tolerance, then (fine tier) coalescing
    /// same-class fragments if that alone fits, then dropping the smallest
    /// features. A tile that still does not fit fails the build.
    fn encode_within_cap(
        &self,
        layer: Layer,
        coord: TileCoord,
        mut candidates: Vec<Cow<'_, TileFeature>>,
        tier: &TierConfig,
    ) -> Result<Option<EncodedTile>, BuildError> {
        let geometry = self.geometry();
        let cap = tier.max_tile_bytes;
        let mut tolerance = tier.simplification;
        let mut escalation = Escalation::default();

        let encode = |candidates: &[Cow<'_, TileFeature>], tolerance: f64| {
            let refs: Vec<&TileFeature> = candidates.iter().map(|c| c.as_ref()).collect();
            vector_tile::encode_tile(layer, coord, &refs, geometry, tolerance)
        };

        let Some(mut data) = encode(&candidates, tolerance)? else {
            return Ok(None);
        };

        while data.len() > cap && escalation.simplification_steps < tier.max_simplification_steps {
            // Stop before simplification erases the whole tile.
            let Some(next) = encode(&candidates, tolerance * 2.0)? else {
                break;
            };
            tolerance *= 2.0;
            escalation.simplification_steps += 1;
            data = next;
        }

        if data.len() > cap && layer == Layer::PadusHi {
            let merged: Vec<Cow<'_, TileFeature>> = coalesce(&candidates, geometry.buffered_bounds(coord))
                .into_iter()
                .map(Cow::Owned)
                .collect();
            if merged.len() < candidates.len() {
                if let Some(next) = encode(&merged, tolerance)?.filter(|d| d.len() <= cap) {
                    escalation.coalesced = true;
                    candidates = merged;
                    data = next;
                }
            }
        }

        if data.len() > cap && tier.drop_smallest_features {
            candidates.sort_by(|a, b| b.area.total_cmp(&a.area).then(a.id.cmp(&b.id)));
            while data.len() > cap && candidates.len() > 1 {
                let drop = ((candidates.len() as f64 * DROP_FRACTION).ceil() as usize)
                    .clamp(1, candidates.len() - 1);
                candidates.truncate(candidates.len() - drop);
                escalation.dropped += drop;
                let Some(next) = encode(&candidates, tolerance)? else {
                    break;
                };
                data = next;
            }
            if escalation.dropped > 0 {
                warn!(
                    "{} {}: dropped {} smallest features to fit {} bytes",
                    layer, coord, escalation.dropped, cap
                );
            }
        }

        if data.len() > cap {
            return Err(BuildError::TileTooLarge {
                layer,
                coord,
                bytes: data.len(),
                cap,
            });
        }
        Ok(Some(EncodedTile {
            coord,
            data,
            escalation,
        }))
    }

    fn metadata(&self, features: &[Feature]) -> Metadata {
        let extent = features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                    (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
                )
            });
        let bounds = match extent {
            Some(r) => [
                r.min().x.max(-180.0),
                r.min().y.max(-MAX_LATITUDE),
                r.max().x.min(180.0),
                r.max().y.min(MAX_LATITUDE),
            ],
            None => [-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE],
        };

        let vector_layers = Layer::ALL
            .into_iter()
            .map(|layer| {
                let zooms = self.zooms(layer);
                VectorLayer {
                    id: layer.as_str().to_string(),
                    description: match layer {
                        Layer::PadusLow => "Ownership dissolved by class".to_string(),
                        Layer::PadusHi => "Ownership parcels".to_string(),
                    },
                    minzoom: *zooms.start(),
                    maxzoom: *zooms.end(),
                    fields: layer_fields(layer)
                        .iter()
                        .map(|f| (f.to_string(), "String".to_string()))
                        .collect(),
                }
            })
            .collect();

        Metadata {
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            version: "1.0".to_string(),
            format: "pbf".to_string(),
            min_zoom: self.config.low_min_zoom,
            max_zoom: self.config.hi_max_zoom,
            bounds,
            center: [
                (bounds[0] + bounds[2]) / 2.0,
                (bounds[1] + bounds[3]) / 2.0,
                self.config.low_min_zoom as f64,
            ],
            vector_layers,
        }
    }

    /// Write to a sibling `.building` file, validate it as a reader would,
    /// then rename it over the artifact.
    fn publish(&self, metadata: &Metadata, tiles: Vec<(TileCoord, Vec<u8>)>) -> Result<(), BuildError> {
        let artifact = &self.config.artifact_path;
        let building = building_path(artifact);

        match write_and_validate(&building, metadata, tiles) {
            Ok(count) => {
                fs::rename(&building, artifact).map_err(|source| BuildError::Io {
                    path: artifact.clone(),
                    source,
                })?;
                if let Some(parent) = artifact.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if let Err(e) = File::open(parent).and_then(|d| d.sync_all()) {
                        debug!("Could not sync {:?}: {}", parent, e);
                    }
                }
                info!("Published {} tiles to {:?}", count, artifact);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&building);
                Err(e)
            }
        }
    }
}

/// Temp path the artifact is built at before being renamed into place.
pub fn building_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().unwrap_or_default().to_os_string();
    name.push(".building");
    artifact.with_file_name(name)
}

fn write_and_validate(
    path: &Path,
    metadata: &Metadata,
    tiles: Vec<(TileCoord, Vec<u8>)>,
) -> Result<usize, BuildError> {
    let mut writer = MbtilesWriter::create(path)?;
    writer.write_metadata(metadata)?;
    for (coord, data) in &tiles {
        writer.put_tile(*coord, data)?;
    }
    let count = writer.finish()?;

    let store = TileStore::open(path)?;
    let stored: u64 = store.zoom_counts()?.iter().map(|(_, n)| n).sum();
    if stored != count as u64 {
        return Err(StoreError::corrupt(
            path,
            format!("wrote {} tiles but {} are readable", count, stored),
        )
        .into());
    }
    drop(store);

    File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(count)
}

/// Merge fragments of the same class into one feature per class, clipped to
/// the tile. Text attributes accumulate as the distinct non-empty values in
/// feature-id order joined by "; ".
fn coalesce(features: &[Cow<'_, TileFeature>], bounds: Rect<f64>) -> Vec<TileFeature> {
    let mut groups: BTreeMap<OwnerClass, Vec<&TileFeature>> = BTreeMap::new();
    for feature in features {
        groups.entry(feature.owner_class).or_default().push(feature.as_ref());
    }

    groups
        .into_iter()
        .filter_map(|(owner_class, mut members)| {
            members.sort_by_key(|f| f.id);
            let geometry = union_all(
                members
                    .iter()
                    .map(|f| vector_tile::clip_to_tile(&f.geometry, bounds))
                    .collect(),
            );
            let attributes = members.iter().any(|f| f.attributes.is_some()).then(|| {
                let field = |get: fn(&Attributes) -> &str| {
                    accumulate(members.iter().filter_map(|f| f.attributes.as_ref().map(get)))
                };
                Attributes {
                    owner_name: field(|a| a.owner_name.as_str()),
                    unit_name: field(|a| a.unit_name.as_str()),
                    source: field(|a| a.source.as_str()),
                    asof: field(|a| a.asof.as_str()),
                }
            });
            TileFeature::new(members[0].id, owner_class, attributes, geometry)
        })
        .collect()
}

fn accumulate<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for value in values {
        if !value.is_empty() && !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{MultiPolygon, polygon};

    fn feature(id: u64, owner_class: OwnerClass, name: &str, lon: f64, lat: f64, half: f64) -> Feature {
        Feature {
            id,
            owner_class,
            owner_name: name.into(),
            unit_name: format!("unit {}", id),
            source: "PAD-US".into(),
            asof: "2023-09-01".into(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: lon - half, y: lat - half),
                (x: lon + half, y: lat - half),
                (x: lon + half, y: lat + half),
                (x: lon - half, y: lat + half),
                (x: lon - half, y: lat - half),
            ]]),
        }
    }

    fn config(dir: &Path) -> TilesConfig {
        TilesConfig {
            artifact_path: dir.join("ownership.mbtiles"),
            low_min_zoom: 4,
            mid_zoom: 6,
            hi_max_zoom: 7,
            ..TilesConfig::default()
        }
    }

    #[test]
    fn accumulation_keeps_distinct_values_in_order() {
        let values = ["BLM", "", "USFS", "BLM", "NPS"];
        assert_eq!(accumulate(values.into_iter()), "BLM; USFS; NPS");
        assert_eq!(accumulate(std::iter::empty()), "");
    }

    #[test]
    fn coalesce_merges_per_class_in_id_order() {
        let features = [
            feature(5, OwnerClass::Federal, "USFS", -100.0, 40.0, 0.1),
            feature(2, OwnerClass::Federal, "BLM", -100.1, 40.0, 0.1),
            feature(9, OwnerClass::State, "State Parks", -99.8, 40.0, 0.05),
        ];
        let tile_features: Vec<TileFeature> =
            features.iter().filter_map(TileFeature::from_feature).collect();
        let cows: Vec<Cow<TileFeature>> = tile_features.iter().map(Cow::Borrowed).collect();
        let bounds = Rect::new((0.0, 0.0), (1.0, 1.0));

        let merged = coalesce(&cows, bounds);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].owner_class, OwnerClass::Federal);
        assert_eq!(merged[0].id, 2);
        let attrs = merged[0].attributes.as_ref().unwrap();
        assert_eq!(attrs.owner_name, "BLM; USFS");
        assert_eq!(attrs.unit_name, "unit 2; unit 5");
        assert_eq!(attrs.source, "PAD-US");
        assert_eq!(merged[1].owner_class, OwnerClass::State);
    }

    #[test]
    fn builds_both_layers_into_disjoint_zoom_bands() {
        let dir = tempfile::tempdir().unwrap();
        let features = vec![feature(0, OwnerClass::Federal, "BLM", -105.0, 40.0, 0.5)];
        let units = crate::dissolve::dissolve(&features);
        let summary = TileBuilder::new(config(dir.path())).build(&features, &units).unwrap();

        assert!(summary.tiles[&Layer::PadusLow] > 0);
        assert!(summary.tiles[&Layer::PadusHi] > 0);
        assert!(!building_path(&summary.artifact).exists());

        let store = TileStore::open(&summary.artifact).unwrap();
        let zooms: Vec<u8> = store.zoom_counts().unwrap().iter().map(|(z, _)| *z).collect();
        assert_eq!(zooms, vec![4, 5, 6, 7]);
        assert_eq!(store.layer_for_zoom(5), Some(Layer::PadusLow));
        assert_eq!(store.layer_for_zoom(6), Some(Layer::PadusHi));
        let meta = store.metadata();
        assert_eq!(meta.format, "pbf");
        assert!((meta.bounds[0] + 105.5).abs() < 1e-9);
        assert!((meta.bounds[3] - 40.5).abs() < 1e-9);
    }

    #[test]
    fn size_cap_escalates_then_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let features: Vec<Feature> = (0..40)
            .map(|i| {
                feature(
                    i,
                    if i % 2 == 0 { OwnerClass::Federal } else { OwnerClass::Local },
                    &format!("agency {}", i),
                    -105.0 + (i % 8) as f64 * 0.2,
                    40.0 + (i / 8) as f64 * 0.2,
                    0.08,
                )
            })
            .collect();
        let units = crate::dissolve::dissolve(&features);

        // Cap every fine tile at the size of the largest single-parcel tile:
        // crowded tiles only fit after dropping.
        let mut cfg = config(dir.path());
        let builder = TileBuilder::new(cfg.clone());
        let parcels: Vec<TileFeature> = features.iter().filter_map(TileFeature::from_feature).collect();
        let mut level = builder.seed_tiles(cfg.mid_zoom, &parcels);
        let mut single = 0;
        for z in cfg.hi_zooms() {
            if z > cfg.mid_zoom {
                level = builder.descend(&level);
            }
            for (coord, members) in &level {
                for member in members {
                    let data = vector_tile::encode_tile(
                        Layer::PadusHi,
                        *coord,
                        &[member],
                        builder.geometry(),
                        cfg.hi.simplification,
                    )
                    .unwrap();
                    if let Some(data) = data {
                        single = single.max(data.len());
                    }
                }
            }
        }
        assert!(single > 0);

        cfg.hi.max_tile_bytes = single;
        let summary = TileBuilder::new(cfg.clone()).build(&features, &units).unwrap();
        assert!(summary.features_dropped > 0);
        let store = TileStore::open(&cfg.artifact_path).unwrap();
        for (coord, data) in store.tiles().unwrap() {
            if coord.z >= cfg.mid_zoom {
                assert!(data.len() <= single, "{} is {} bytes", coord, data.len());
            }
        }
        drop(store);
        let published = fs::read(&cfg.artifact_path).unwrap();

        // Without dropping the cap cannot be met; the artifact stays as it was.
        cfg.hi.drop_smallest_features = false;
        cfg.hi.max_tile_bytes = 40;
        let err = TileBuilder::new(cfg.clone()).build(&features, &units).unwrap_err();
        assert!(
            matches!(err, BuildError::TileTooLarge { layer: Layer::PadusHi, cap: 40, .. }),
            "{:?}",
            err
        );
        assert_eq!(fs::read(&cfg.artifact_path).unwrap(), published);
        assert!(!building_path(&cfg.artifact_path).exists());
    }

    #[test]
    fn thin_diagonal_only_visits_tiles_it_crosses() {
        let sliver = Feature {
            geometry: MultiPolygon::new(vec![polygon![
                (x: -110.0, y: 35.0),
                (x: -105.0, y: 40.0),
                (x: -105.0, y: 40.001),
                (x: -110.0, y: 35.001),
                (x: -110.0, y: 35.0),
            ]]),
            ..feature(1, OwnerClass::Federal, "BLM", 0.0, 0.0, 0.1)
        };
        let parcels: Vec<TileFeature> = TileFeature::from_feature(&sliver).into_iter().collect();
        let bbox = parcels[0].bbox;
        let builder = TileBuilder::new(TilesConfig::default());
        let cfg = TilesConfig::default();

        let mut level = builder.seed_tiles(cfg.mid_zoom, &parcels);
        for _ in cfg.hi_zooms().skip(1) {
            level = builder.descend(&level);
        }
        let z = cfg.hi_max_zoom;
        let columns = mercator::unit_to_tile(bbox.max().x, z) - mercator::unit_to_tile(bbox.min().x, z) + 1;
        let rows = mercator::unit_to_tile(bbox.max().y, z) - mercator::unit_to_tile(bbox.min().y, z) + 1;
        assert!((columns * rows) as usize > 50_000);
        assert!(level.len() >= columns as usize, "{} tiles", level.len());
        assert!(level.len() < 3_000, "{} tiles", level.len());
        for (coord, members) in &level {
            assert_eq!(coord.z, z);
            assert_eq!(members.len(), 1);
            assert!(mercator::tile_rect(*coord).intersects(&bbox), "{}", coord);
        }
    }

    #[test]
    fn descent_covers_every_tile_with_content() {
        let parcel = feature(3, OwnerClass::State, "State Parks", -105.0, 40.0, 0.03);
        let parcels: Vec<TileFeature> = TileFeature::from_feature(&parcel).into_iter().collect();
        let bbox = parcels[0].bbox;
        let cfg = TilesConfig {
            hi_max_zoom: 12,
            ..TilesConfig::default()
        };
        let builder = TileBuilder::new(cfg.clone());

        let mut level = builder.seed_tiles(cfg.mid_zoom, &parcels);
        for z in cfg.hi_zooms() {
            if z > cfg.mid_zoom {
                level = builder.descend(&level);
            }
            let visited: BTreeSet<TileCoord> = level.iter().map(|(coord, _)| *coord).collect();
            let (min, max) = (bbox.min(), bbox.max());
            for x in mercator::unit_to_tile(min.x, z)..=mercator::unit_to_tile(max.x, z) {
                for y in mercator::unit_to_tile(min.y, z)..=mercator::unit_to_tile(max.y, z) {
                    let coord = TileCoord::new(z, x, y);
                    let full = vector_tile::encode_tile(
                        Layer::PadusHi,
                        coord,
                        &[&parcels[0]],
                        builder.geometry(),
                        cfg.hi.simplification,
                    )
                    .unwrap();
                    if full.is_some() {
                        assert!(visited.contains(&coord), "{} has content but was skipped", coord);
                    }
                }
            }
        }
    }

    #[test]
    fn refuses_an_empty_build() {
        let dir = tempfile::tempdir().unwrap();
        let err = TileBuilder::new(config(dir.path())).build(&[], &[]).unwrap_err();
        assert!(matches!(err, BuildError::NoFeatures));
        assert!(!dir.path().join("ownership.mbtiles").exists());
    }

    #[test]
    fn invalid_config_is_rejected_before_tiling() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.mid_zoom = 2;
        let features = vec![feature(0, OwnerClass::Federal, "BLM", -105.0, 40.0, 0.5)];
        let err = TileBuilder::new(cfg).build(&features, &[]).unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }
}
