use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde_json::{Map, Value};

use crate::classify::{ClassSource, classify};
use crate::config::EtlConfig;
use crate::dissolve::dissolve;
use crate::error::RejectReason;
use crate::io::geojson::SourceFeature;
use crate::io::{self, SourceRecord};
use crate::model::{DissolvedUnit, Feature, OwnerClass};
use crate::validate::validate_geometry;

const OWNER_TYPE_FIELD: &str = "Own_Type";
const MANAGER_TYPE_FIELD: &str = "Mang_Type";
const OWNER_NAME_FIELDS: [&str; 6] = [
    "Mang_Name",
    "Manager_Name",
    "Own_Name",
    "Owner_Name",
    "Mang_Type",
    "Owner_Type",
];
const UNIT_NAME_FIELDS: [&str; 4] = ["Unit_Nm", "Unit_Name", "Loc_Nm", "Location_Name"];

/// Counters gathered during one preparation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtlReport {
    pub records_read: usize,
    pub unreadable: usize,
    pub emitted: usize,
    pub repaired: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    /// Features that fell through to `other_public` because no code mapped
    pub defaulted: usize,
    pub unrecognized_codes: usize,
    pub per_class: BTreeMap<OwnerClass, usize>,
}

impl Default for EtlReport {
    /// Every reject reason starts at zero so reports always list all of them.
    fn default() -> Self {
        Self {
            records_read: 0,
            unreadable: 0,
            emitted: 0,
            repaired: 0,
            rejected: RejectReason::ALL.into_iter().map(|reason| (reason, 0)).collect(),
            defaulted: 0,
            unrecognized_codes: 0,
            per_class: BTreeMap::new(),
        }
    }
}

impl EtlReport {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    fn merge(&mut self, other: EtlReport) {
        self.records_read += other.records_read;
        self.unreadable += other.unreadable;
        self.emitted += other.emitted;
        self.repaired += other.repaired;
        self.defaulted += other.defaulted;
        self.unrecognized_codes += other.unrecognized_codes;
        for (reason, n) in other.rejected {
            *self.rejected.entry(reason).or_default() += n;
        }
        for (class, n) in other.per_class {
            *self.per_class.entry(class).or_default() += n;
        }
    }
}

impl fmt::Display for EtlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} records read, {} features emitted ({} repaired), {} rejected, {} unreadable",
            self.records_read,
            self.emitted,
            self.repaired,
            self.rejected_total(),
            self.unreadable
        )?;
        for (reason, n) in &self.rejected {
            writeln!(f, "  rejected {}: {}", reason, n)?;
        }
        writeln!(
            f,
            "  defaulted to other_public: {} ({} unrecognized codes)",
            self.defaulted, self.unrecognized_codes
        )?;
        for (class, n) in &self.per_class {
            writeln!(f, "  {}: {}", class, n)?;
        }
        Ok(())
    }
}

/// Output of the preparation stage, handed to the tile builder.
#[derive(Debug, Clone)]
pub struct EtlOutput {
    pub features: Vec<Feature>,
    pub dissolved: Vec<DissolvedUnit>,
    pub report: EtlReport,
}

/// Reference used to identify a feature in rejection logs.
#[derive(Debug, Clone)]
struct FeatureRef<'a> {
    index: usize,
    id: Option<&'a Value>,
    unit_name: Option<&'a str>,
}

impl fmt::Display for FeatureRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record #{}", self.index)?;
        if let Some(id) = self.id {
            write!(f, " id={}", id)?;
        }
        if let Some(unit) = self.unit_name {
            write!(f, " unit={:?}", unit)?;
        }
        Ok(())
    }
}

fn text_field<'a>(properties: Option<&'a Map<String, Value>>, key: &str) -> Option<&'a str> {
    match properties?.get(key)? {
        Value::String(s) => Some(s.as_str()).filter(|s| !s.trim().is_empty()),
        _ => None,
    }
}

/// First non-empty value among `keys`, numbers included.
fn first_field(properties: Option<&Map<String, Value>>, keys: &[&str]) -> Option<String> {
    let properties = properties?;
    keys.iter().find_map(|key| match properties.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn truncate_chars(s: String, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s,
    }
}

/// Validate and classify one source record.
fn prepare_feature(
    index: usize,
    source: &SourceFeature,
    config: &EtlConfig,
    report: &mut EtlReport,
) -> Option<Feature> {
    let properties = source.properties.as_ref();
    report.records_read += 1;

    let validated = match validate_geometry(source.geometry.as_ref()) {
        Ok(v) => v,
        Err(reason) => {
            let feature_ref = FeatureRef {
                index,
                id: source.id.as_ref(),
                unit_name: text_field(properties, "Unit_Nm"),
            };
            warn!("Rejected {}: {}", feature_ref, reason);
            *report.rejected.entry(reason).or_default() += 1;
            return None;
        }
    };
    if validated.repaired {
        report.repaired += 1;
    }

    let classification = classify(
        text_field(properties, OWNER_TYPE_FIELD),
        text_field(properties, MANAGER_TYPE_FIELD),
    );
    report.unrecognized_codes += classification.unrecognized_codes as usize;
    if classification.decided_by == ClassSource::Default {
        report.defaulted += 1;
    }
    let owner_class = classification.owner_class;

    let owner_name = first_field(properties, &OWNER_NAME_FIELDS)
        .map(|name| truncate_chars(name, config.max_name_chars))
        .unwrap_or_else(|| owner_class.label().to_string());
    let unit_name = first_field(properties, &UNIT_NAME_FIELDS)
        .map(|name| truncate_chars(name, config.max_name_chars))
        .unwrap_or_default();

    report.emitted += 1;
    *report.per_class.entry(owner_class).or_default() += 1;

    Some(Feature {
        id: index as u64,
        owner_class,
        owner_name,
        unit_name,
        source: config.source.clone(),
        asof: config.asof.clone(),
        geometry: validated.geometry,
    })
}

/// Run validation and classification over decoded records, in parallel
/// shards, then dissolve. Output order follows input order.
pub fn prepare_records(records: Vec<SourceRecord>, config: &EtlConfig) -> EtlOutput {
    let start_time = Instant::now();
    let pb = ProgressBar::new(records.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) - Validating features")
    {
        pb.set_style(style.progress_chars("##-"));
    }

    let shards: Vec<(Vec<Feature>, EtlReport)> = records
        .par_iter()
        .enumerate()
        .fold(
            || (Vec::new(), EtlReport::default()),
            |(mut features, mut report), (index, record)| {
                match record {
                    SourceRecord::Feature(source) => {
                        if let Some(feature) = prepare_feature(index, source, config, &mut report) {
                            features.push(feature);
                        }
                    }
                    SourceRecord::Unreadable { index, error } => {
                        warn!("Skipping unreadable record #{}: {}", index, error);
                        report.records_read += 1;
                        report.unreadable += 1;
                    }
                }
                pb.inc(1);
                (features, report)
            },
        )
        .collect();
    pb.finish_with_message("Features validated");

    let mut features = Vec::new();
    let mut report = EtlReport::default();
    for (shard_features, shard_report) in shards {
        features.extend(shard_features);
        report.merge(shard_report);
    }
    // Shards are contiguous but keep the ordering explicit.
    features.sort_by_key(|f| f.id);

    info!(
        "Prepared {} features from {} records in {:?}",
        features.len(),
        report.records_read,
        start_time.elapsed()
    );

    let dissolved = dissolve(&features);
    debug!("Dissolved into {} units", dissolved.len());

    EtlOutput {
        features,
        dissolved,
        report,
    }
}

/// Read the configured input, prepare it and write the bulk export (and the
/// dissolved GeoJSON when configured).
pub fn run(config: &EtlConfig) -> Result<EtlOutput> {
    info!("Reading source features from {:?}", config.input);
    let records = io::read_source(&config.input)?;
    let output = prepare_records(records, config);

    io::write_export(&config.export_path, &output.features)?;
    info!(
        "Wrote {} features to {:?}",
        output.features.len(),
        config.export_path
    );

    if let Some(path) = &config.dissolved_path {
        io::write_dissolved(path, &output.dissolved, &config.source, &config.asof)?;
        info!("Wrote {} dissolved units to {:?}", output.dissolved.len(), path);
    }

    info!("Preparation report:\n{}", output.report);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> SourceRecord {
        io::parse_features(vec![value]).remove(0)
    }

    fn square_feature(props: Value) -> Value {
        json!({
            "type": "Feature",
            "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]},
            "properties": props,
        })
    }

    #[test]
    fn classifies_and_names_features() {
        let out = prepare_records(
            vec![record(square_feature(json!({
                "Own_Type": "FED",
                "Mang_Name": "BLM",
                "Unit_Nm": "Red Rock Canyon",
            })))],
            &EtlConfig::default(),
        );
        assert_eq!(out.features.len(), 1);
        let f = &out.features[0];
        assert_eq!(f.owner_class, OwnerClass::Federal);
        assert_eq!(f.owner_name, "BLM");
        assert_eq!(f.unit_name, "Red Rock Canyon");
        assert_eq!(f.source, "PAD-US");
        assert_eq!(f.asof, "2023-09-01");
    }

    #[test]
    fn unmapped_code_is_kept_as_other_public() {
        let out = prepare_records(
            vec![record(square_feature(json!({"Own_Type": "MARTIAN"})))],
            &EtlConfig::default(),
        );
        assert_eq!(out.features.len(), 1);
        assert_eq!(out.features[0].owner_class, OwnerClass::OtherPublic);
        assert_eq!(out.features[0].owner_name, "Other Public");
        assert_eq!(out.report.defaulted, 1);
        assert_eq!(out.report.unrecognized_codes, 1);
    }

    #[test]
    fn rejections_are_counted_not_fatal() {
        let out = prepare_records(
            vec![
                record(json!({"type": "Feature", "geometry": null, "properties": {}})),
                record(json!({"type": "Feature", "geometry": {"type": "Point", "coordinates": [0, 0]}})),
                record(json!("not a feature")),
                record(square_feature(json!({"Own_Type": "STAT"}))),
            ],
            &EtlConfig::default(),
        );
        assert_eq!(out.report.records_read, 4);
        assert_eq!(out.report.emitted, 1);
        assert_eq!(out.report.unreadable, 1);
        assert_eq!(out.report.rejected[&RejectReason::EmptyGeometry], 1);
        assert_eq!(out.report.rejected[&RejectReason::UnsupportedType], 1);
        assert_eq!(out.report.rejected_total(), 2);
        assert_eq!(out.features[0].id, 3);
        assert_eq!(out.dissolved.len(), 1);
    }

    #[test]
    fn report_lists_every_reason_even_at_zero() {
        let out = prepare_records(
            vec![record(square_feature(json!({"Own_Type": "FED"})))],
            &EtlConfig::default(),
        );
        let reasons: Vec<RejectReason> = out.report.rejected.keys().copied().collect();
        assert_eq!(reasons, RejectReason::ALL.to_vec());
        assert_eq!(out.report.rejected_total(), 0);
        let text = out.report.to_string();
        for reason in RejectReason::ALL {
            assert!(text.contains(&format!("rejected {}: 0", reason)), "{}", text);
        }
    }

    #[test]
    fn names_are_truncated_by_characters() {
        let config = EtlConfig {
            max_name_chars: 3,
            ..EtlConfig::default()
        };
        let out = prepare_records(
            vec![record(square_feature(json!({"Own_Name": "Åland Trust", "Unit_Nm": 42})))],
            &config,
        );
        assert_eq!(out.features[0].owner_name, "Åla");
        assert_eq!(out.features[0].unit_name, "42");
    }

    #[test]
    fn run_writes_export_and_dissolved() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.geojson");
        std::fs::write(
            &input,
            json!({
                "type": "FeatureCollection",
                "features": [square_feature(json!({"Mang_Type": "LOC"}))],
            })
            .to_string(),
        )
        .unwrap();
        let config = EtlConfig {
            input,
            export_path: dir.path().join("clean.ndjson"),
            dissolved_path: Some(dir.path().join("dissolved.geojson")),
            ..EtlConfig::default()
        };
        let out = run(&config).unwrap();
        assert_eq!(out.features.len(), 1);
        let export = std::fs::read_to_string(&config.export_path).unwrap();
        assert_eq!(export.lines().count(), 1);
        assert!(export.contains("\"owner_class\":\"local\""));
        let dissolved: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("dissolved.geojson")).unwrap())
                .unwrap();
        assert_eq!(dissolved["features"][0]["properties"]["owner_name"], "Local");
    }
}
