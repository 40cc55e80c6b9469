use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::model::{DissolvedUnit, Feature};

pub mod geojson {
    use super::*;

    /// GeoJSON geometry as it appears in the source. Anything that is not
    /// polygonal is kept only as a tag so it can be reported.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum Geometry {
        Polygon {
            coordinates: Vec<Vec<Vec<f64>>>,
        },
        MultiPolygon {
            coordinates: Vec<Vec<Vec<Vec<f64>>>>,
        },
        #[serde(other)]
        Unsupported,
    }

    /// One source record.
    #[derive(Debug, Clone, Deserialize)]
    pub struct SourceFeature {
        #[serde(default)]
        pub id: Option<Value>,

        #[serde(default)]
        pub geometry: Option<Geometry>,

        #[serde(default)]
        pub properties: Option<Map<String, Value>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FeatureCollection {
        pub features: Vec<Value>,
    }

    fn ring_from_positions(positions: &[Vec<f64>]) -> LineString<f64> {
        positions
            .iter()
            .map(|p| Coord {
                x: p.first().copied().unwrap_or(f64::NAN),
                y: p.get(1).copied().unwrap_or(f64::NAN),
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn polygon_from_rings(rings: &[Vec<Vec<f64>>]) -> Option<Polygon<f64>> {
        let (exterior, interiors) = rings.split_first()?;
        Some(Polygon::new(
            ring_from_positions(exterior),
            interiors.iter().map(|r| ring_from_positions(r)).collect(),
        ))
    }

    impl Geometry {
        /// Polygonal geometries become a multipolygon (possibly with empty
        /// parts); anything else yields `None`.
        pub fn to_multi_polygon(&self) -> Option<MultiPolygon<f64>> {
            match self {
                Geometry::Polygon { coordinates } => Some(MultiPolygon::new(
                    polygon_from_rings(coordinates).into_iter().collect(),
                )),
                Geometry::MultiPolygon { coordinates } => Some(MultiPolygon::new(
                    coordinates
                        .iter()
                        .filter_map(|rings| polygon_from_rings(rings))
                        .collect(),
                )),
                Geometry::Unsupported => None,
            }
        }
    }

    fn ring_positions(ring: &LineString<f64>) -> Vec<Vec<f64>> {
        ring.coords().map(|c| vec![c.x, c.y]).collect()
    }

    fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Vec<Vec<f64>>> {
        std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .map(ring_positions)
            .collect()
    }

    impl From<&MultiPolygon<f64>> for Geometry {
        fn from(mp: &MultiPolygon<f64>) -> Self {
            if mp.0.len() == 1 {
                Geometry::Polygon {
                    coordinates: polygon_rings(&mp.0[0]),
                }
            } else {
                Geometry::MultiPolygon {
                    coordinates: mp.0.iter().map(polygon_rings).collect(),
                }
            }
        }
    }
}

use geojson::{FeatureCollection, Geometry, SourceFeature};

/// A source record, or the reason it could not be decoded.
#[derive(Debug)]
pub enum SourceRecord {
    Feature(SourceFeature),
    Unreadable { index: usize, error: String },
}

fn is_line_delimited(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ndjson" | "geojsonl" | "jsonl")
    )
}

/// Read every record of a GeoJSON FeatureCollection or line-delimited GeoJSON
/// file. Records that fail to decode are returned as `Unreadable` rather than
/// failing the whole read.
pub fn read_source(path: &Path) -> Result<Vec<SourceRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open input {:?}", path))?;
    let reader = BufReader::new(file);

    if is_line_delimited(path) {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {:?}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(match serde_json::from_str::<SourceFeature>(&line) {
                Ok(feature) => SourceRecord::Feature(feature),
                Err(e) => SourceRecord::Unreadable {
                    index,
                    error: e.to_string(),
                },
            });
        }
        Ok(records)
    } else {
        let collection: FeatureCollection = serde_json::from_reader(reader)
            .with_context(|| format!("{:?} is not a GeoJSON FeatureCollection", path))?;
        Ok(parse_features(collection.features))
    }
}

/// Decode already-parsed JSON features one by one.
pub fn parse_features(values: Vec<Value>) -> Vec<SourceRecord> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| match serde_json::from_value::<SourceFeature>(value) {
            Ok(feature) => SourceRecord::Feature(feature),
            Err(e) => SourceRecord::Unreadable {
                index,
                error: e.to_string(),
            },
        })
        .collect()
}

/// GeoJSON representation of a classified feature, as used by the bulk export.
pub fn feature_to_geojson(feature: &Feature) -> Value {
    json!({
        "type": "Feature",
        "geometry": Geometry::from(&feature.geometry),
        "properties": {
            "owner_class": feature.owner_class,
            "owner_name": feature.owner_name,
            "unit_name": feature.unit_name,
            "source": feature.source,
            "asof": feature.asof,
        }
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write through a sibling temp file and rename into place so readers never
/// see a half-written file.
fn write_atomically(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    let result: Result<()> = (|| {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            fs::rename(&tmp, path)
                .with_context(|| format!("Failed to move {:?} into place", tmp))?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Write the bulk export: one GeoJSON feature per line.
pub fn write_export(path: &Path, features: &[Feature]) -> Result<()> {
    write_atomically(path, |w| {
        for feature in features {
            serde_json::to_writer(&mut *w, &feature_to_geojson(feature))?;
            w.write_all(b"\n")?;
        }
        Ok(())
    })?;
    debug!("Wrote {} features to {:?}", features.len(), path);
    Ok(())
}

/// Write dissolved units as a FeatureCollection for inspection.
pub fn write_dissolved(path: &Path, units: &[DissolvedUnit], source: &str, asof: &str) -> Result<()> {
    let features: Vec<Value> = units
        .iter()
        .map(|unit| {
            json!({
                "type": "Feature",
                "geometry": Geometry::from(&unit.geometry),
                "properties": {
                    "owner_class": unit.owner_class,
                    "owner_name": unit.owner_class.label(),
                    "unit_name": "",
                    "source": source,
                    "asof": asof,
                    "member_count": unit.member_count,
                }
            })
        })
        .collect();
    write_atomically(path, |w| {
        serde_json::to_writer(
            &mut *w,
            &json!({ "type": "FeatureCollection", "features": features }),
        )?;
        Ok(())
    })
}

/// Wrap the NDJSON export into a single FeatureCollection document without
/// re-parsing each line.
pub fn export_as_feature_collection(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("Failed to open export {:?}", path))?;
    let mut out = Vec::with_capacity(file.metadata().map(|m| m.len() as usize + 64).unwrap_or(0));
    out.extend_from_slice(br#"{"type":"FeatureCollection","features":["#);
    let mut first = true;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !first {
            out.push(b',');
        }
        first = false;
        out.extend_from_slice(line.as_bytes());
    }
    out.extend_from_slice(b"]}");
    if first {
        warn!("Export {:?} contains no features", path);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerClass;
    use geo::polygon;

    #[test]
    fn decodes_polygon_and_unsupported_geometries() {
        let poly: SourceFeature = serde_json::from_str(
            r#"{"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{"Own_Type":"FED"}}"#,
        )
        .unwrap();
        let mp = poly.geometry.unwrap().to_multi_polygon().unwrap();
        assert_eq!(mp.0.len(), 1);
        assert_eq!(mp.0[0].exterior().0.len(), 4);

        let point: SourceFeature = serde_json::from_str(
            r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]},"properties":{}}"#,
        )
        .unwrap();
        assert_eq!(point.geometry, Some(Geometry::Unsupported));

        let null: SourceFeature =
            serde_json::from_str(r#"{"type":"Feature","geometry":null,"properties":null}"#).unwrap();
        assert!(null.geometry.is_none());
    }

    #[test]
    fn reads_ndjson_and_keeps_bad_lines_as_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.ndjson");
        fs::write(
            &path,
            concat!(
                r#"{"type":"Feature","geometry":null,"properties":{}}"#,
                "\n\n",
                "{not json\n",
            ),
        )
        .unwrap();
        let records = read_source(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], SourceRecord::Feature(_)));
        assert!(matches!(records[1], SourceRecord::Unreadable { index: 2, .. }));
    }

    #[test]
    fn export_round_trips_into_a_feature_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/padus_clean.ndjson");
        let feature = Feature {
            id: 0,
            owner_class: OwnerClass::State,
            owner_name: "State Parks".into(),
            unit_name: "Lake".into(),
            source: "PAD-US".into(),
            asof: "2023-09-01".into(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
            ]]),
        };
        write_export(&path, &[feature.clone(), feature]).unwrap();

        let bytes = export_as_feature_collection(&path).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["type"], "FeatureCollection");
        assert_eq!(doc["features"].as_array().unwrap().len(), 2);
        assert_eq!(doc["features"][0]["properties"]["owner_class"], "state");
        assert_eq!(doc["features"][0]["geometry"]["type"], "Polygon");
        assert!(!temp_sibling(&path).exists());
    }
}
