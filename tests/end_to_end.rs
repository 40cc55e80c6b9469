use std::fs;
use std::path::Path;
use std::sync::Arc;

use geo::{Area, Coord};
use http::StatusCode;
use serde_json::{Value, json};

use padus_tiles::builder::{BuildSummary, TileBuilder, building_path};
use padus_tiles::config::{EtlConfig, ServerConfig, TilesConfig};
use padus_tiles::error::BuildError;
use padus_tiles::etl::{self, EtlOutput};
use padus_tiles::mbtiles::TileStore;
use padus_tiles::model::{Layer, OwnerClass, TileCoord};
use padus_tiles::server::{StoreHandle, TileService};

/// Tile z10/163/353 spans lon -122.695..-122.344, lat 48.458..48.691.
const WHIDBEY: (f64, f64) = (-122.52, 48.57);

fn square(props: Value, lon: f64, lat: f64, half: f64) -> Value {
    json!({
        "type": "Feature",
        "geometry": {
            "type": "Polygon",
            "coordinates": [[
                [lon - half, lat - half],
                [lon + half, lat - half],
                [lon + half, lat + half],
                [lon - half, lat + half],
                [lon - half, lat - half]
            ]]
        },
        "properties": props,
    })
}

fn prepare(dir: &Path, features: Vec<Value>) -> EtlOutput {
    let input = dir.join("padus.geojson");
    fs::write(
        &input,
        json!({"type": "FeatureCollection", "features": features}).to_string(),
    )
    .unwrap();
    etl::run(&EtlConfig {
        input,
        export_path: dir.join("padus_clean.ndjson"),
        dissolved_path: None,
        ..EtlConfig::default()
    })
    .unwrap()
}

fn tiles_config(artifact: &Path) -> TilesConfig {
    TilesConfig {
        artifact_path: artifact.to_path_buf(),
        ..TilesConfig::default()
    }
}

fn build(output: &EtlOutput, artifact: &Path) -> Result<BuildSummary, BuildError> {
    TileBuilder::new(tiles_config(artifact)).build(&output.features, &output.dissolved)
}

fn federal_parcel() -> Vec<Value> {
    vec![square(
        json!({"Own_Type": "FED", "Mang_Name": "BLM", "Unit_Nm": "San Juan Islands"}),
        WHIDBEY.0,
        WHIDBEY.1,
        0.05,
    )]
}

#[test]
fn federal_parcel_produces_fine_tile_at_its_address() {
    let dir = tempfile::tempdir().unwrap();
    let output = prepare(dir.path(), federal_parcel());
    assert_eq!(output.features[0].owner_class, OwnerClass::Federal);
    let artifact = dir.path().join("ownership.mbtiles");
    build(&output, &artifact).unwrap();

    let store = TileStore::open(&artifact).unwrap();
    let tile = store
        .get_tile(Layer::PadusHi, TileCoord::new(10, 163, 353))
        .unwrap()
        .expect("tile 10/163/353 should exist");
    assert_eq!(&tile[..2], &[0x1f, 0x8b]);
    assert_eq!(
        store.get_tile(Layer::PadusHi, TileCoord::new(10, 0, 0)).unwrap(),
        None
    );
}

#[test]
fn adjacent_state_parcels_dissolve_without_shared_border() {
    let dir = tempfile::tempdir().unwrap();
    let output = prepare(
        dir.path(),
        vec![
            square(json!({"Own_Type": "STAT"}), -100.5, 40.0, 0.5),
            square(json!({"Mang_Type": "STAT"}), -99.5, 40.0, 0.5),
        ],
    );
    assert_eq!(output.dissolved.len(), 1);
    let unit = &output.dissolved[0];
    assert_eq!(unit.owner_class, OwnerClass::State);
    assert_eq!(unit.member_count, 2);
    assert_eq!(unit.geometry.0.len(), 1);
    assert!((unit.geometry.unsigned_area() - 2.0).abs() < 1e-9);

    let on_border = |c: Coord<f64>| (c.x + 100.0).abs() < 1e-9;
    let polygon = &unit.geometry.0[0];
    assert!(polygon.interiors().is_empty());
    assert!(
        !polygon
            .exterior()
            .lines()
            .any(|l| on_border(l.start) && on_border(l.end)),
        "shared border x = -100 survived the dissolve"
    );

    // The coarse tier is built from that single unit.
    let artifact = dir.path().join("ownership.mbtiles");
    let summary = build(&output, &artifact).unwrap();
    assert!(summary.tiles[&Layer::PadusLow] > 0);
}

#[test]
fn unmapped_code_is_classified_other_public_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    let output = prepare(
        dir.path(),
        vec![
            square(json!({"Own_Type": "ZZZ", "Mang_Type": "???"}), -110.0, 35.0, 0.1),
            square(json!({"Own_Type": "LOC"}), -111.0, 35.0, 0.1),
        ],
    );
    assert_eq!(output.features.len(), 2);
    assert_eq!(output.features[0].owner_class, OwnerClass::OtherPublic);
    assert_eq!(output.report.defaulted, 1);

    let export = fs::read_to_string(dir.path().join("padus_clean.ndjson")).unwrap();
    assert!(export.contains("\"owner_class\":\"other_public\""));
}

#[tokio::test]
async fn zoom_beyond_artifact_is_absent_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = prepare(dir.path(), federal_parcel());
    let artifact = dir.path().join("ownership.mbtiles");
    build(&output, &artifact).unwrap();

    let store = TileStore::open(&artifact).unwrap();
    assert_eq!(store.metadata().max_zoom, 14);
    assert_eq!(
        store.get_tile(Layer::PadusHi, TileCoord::new(20, 0, 0)).unwrap(),
        None
    );

    let service = TileService::new(
        Arc::new(StoreHandle::open(&artifact).unwrap()),
        &ServerConfig::default(),
    );
    let absent = service.handle("padus_hi", "20", "167000", "361000").await;
    assert_eq!(absent.status, StatusCode::NO_CONTENT);
    assert!(absent.body.is_empty());

    let present = service.handle("ownership", "10", "163", "353.pbf").await;
    assert_eq!(present.status, StatusCode::OK);
    assert_eq!(present.headers["content-encoding"], "gzip");
}

#[test]
fn every_written_tile_reads_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut features = federal_parcel();
    features.push(square(json!({"Own_Type": "TRIB"}), -108.0, 36.0, 0.2));
    features.push(square(json!({"Own_Type": "STAT"}), -122.40, 48.60, 0.04));
    let output = prepare(dir.path(), features);
    let artifact = dir.path().join("ownership.mbtiles");
    let summary = build(&output, &artifact).unwrap();

    let store = TileStore::open(&artifact).unwrap();
    let tiles = store.tiles().unwrap();
    assert_eq!(tiles.len(), summary.total_tiles());
    for (coord, data) in tiles {
        let layer = store.layer_for_zoom(coord.z).unwrap();
        assert_eq!(store.get_tile(layer, coord).unwrap(), Some(data), "{}", coord);
    }
}

#[test]
fn rebuilding_the_same_input_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let mut features = federal_parcel();
    features.push(square(json!({"Own_Type": "LOC"}), -122.45, 48.52, 0.03));
    let output = prepare(dir.path(), features);

    let first = dir.path().join("first.mbtiles");
    let second = dir.path().join("second.mbtiles");
    build(&output, &first).unwrap();
    build(&output, &second).unwrap();

    let a = TileStore::open(&first).unwrap();
    let b = TileStore::open(&second).unwrap();
    assert_eq!(a.tiles().unwrap(), b.tiles().unwrap());
    assert_eq!(a.metadata(), b.metadata());
}

#[tokio::test]
async fn failed_build_leaves_published_artifact_serving() {
    let dir = tempfile::tempdir().unwrap();
    let output = prepare(dir.path(), federal_parcel());
    let artifact = dir.path().join("ownership.mbtiles");
    build(&output, &artifact).unwrap();
    let published = fs::read(&artifact).unwrap();

    let handle = Arc::new(StoreHandle::open(&artifact).unwrap());
    let service = TileService::new(Arc::clone(&handle), &ServerConfig::default());

    let mut config = tiles_config(&artifact);
    config.hi.max_tile_bytes = 16;
    config.hi.drop_smallest_features = false;
    let err = TileBuilder::new(config)
        .build(&output.features, &output.dissolved)
        .unwrap_err();
    assert!(matches!(err, BuildError::TileTooLarge { .. }), "{:?}", err);

    assert_eq!(fs::read(&artifact).unwrap(), published);
    assert!(!building_path(&artifact).exists());
    assert!(!handle.reload_if_changed().unwrap());
    let resp = service.handle("padus_hi", "10", "163", "353").await;
    assert_eq!(resp.status, StatusCode::OK);
}
