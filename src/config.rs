// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::jobs::artifact_path;
use crate::osm::LocationIndexMode;
use crate::penalize::{PenaltyFactors, INSIDE_FACTOR, TOUCH_FACTOR};

pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_DATASET_NAME: &str = "region.osm";

/// Files written by the routing engine's multi-level Dijkstra preprocessing,
/// named after the processed dataset.
pub const OSRM_ARTIFACT_EXTENSIONS: [&str; 4] = ["osrm", "osrm.partition", "osrm.cells", "osrm.mldgr"];

/// Service settings, as supplied through the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub inside_factor: f64,
    pub touch_factor: f64,
    pub location_mode: LocationIndexMode,

    /// Number of newest versions kept by a cleanup; 0 keeps everything.
    pub keep_count: usize,

    pub data_dir: PathBuf,
    pub history_dir: PathBuf,

    /// Avoid zones consumed by the penalizer - a copy of the active version.
    pub latest_zones: PathBuf,

    pub input_dataset: PathBuf,
    pub output_dataset: PathBuf,
    pub zone_table_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_data_dir(DEFAULT_DATA_DIR, DEFAULT_DATASET_NAME)
    }
}

impl Settings {
    fn with_data_dir<P: Into<PathBuf>>(data_dir: P, dataset_name: &str) -> Self {
        let data_dir = data_dir.into();
        let input_dataset = data_dir.join(dataset_name);
        Self {
            inside_factor: INSIDE_FACTOR,
            touch_factor: TOUCH_FACTOR,
            location_mode: LocationIndexMode::default(),
            keep_count: 0,
            history_dir: data_dir.join("avoidzones_history"),
            latest_zones: data_dir.join("latest_avoidzones.geojson"),
            output_dataset: penalized_name(&input_dataset),
            zone_table_path: data_dir.join("avoid_zones_data.lua"),
            input_dataset,
            data_dir,
        }
    }

    /// Reads settings from environment variables, see [Settings::from_lookup].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from a variable lookup function:
    ///
    /// - `OSRM_DATA`: data directory (default `/data`),
    /// - `OSM_FILE_NAME`: input dataset inside the data directory (default `region.osm`),
    /// - `AVOIDZONES_INSIDE_FACTOR`, `AVOIDZONES_TOUCH_FACTOR`: penalty factors,
    /// - `AVOIDZONES_LOCATION_STORE`: `dense_mmap_array` or `flex_mem`,
    /// - `AVOIDZONES_KEEP_COUNT`: versions to keep on cleanup,
    /// - `AVOIDZONES_TABLE`: output path of the zone table.
    ///
    /// Empty variables are treated as unset. The result is [validated](Settings::validate).
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut s = Self::with_data_dir(
            var("OSRM_DATA").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            &var("OSM_FILE_NAME").unwrap_or_else(|| DEFAULT_DATASET_NAME.to_string()),
        );

        if let Some(v) = var("AVOIDZONES_INSIDE_FACTOR") {
            s.inside_factor = parse("AVOIDZONES_INSIDE_FACTOR", &v)?;
        }
        if let Some(v) = var("AVOIDZONES_TOUCH_FACTOR") {
            s.touch_factor = parse("AVOIDZONES_TOUCH_FACTOR", &v)?;
        }
        if let Some(v) = var("AVOIDZONES_LOCATION_STORE") {
            s.location_mode = v.trim().parse()?;
        }
        if let Some(v) = var("AVOIDZONES_KEEP_COUNT") {
            s.keep_count = parse("AVOIDZONES_KEEP_COUNT", &v)?;
        }
        if let Some(v) = var("AVOIDZONES_TABLE") {
            s.zone_table_path = PathBuf::from(v);
        }

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        self.factors().validate()?;
        if self.input_dataset.file_name().is_none() {
            return Err(Error::Validation(format!(
                "invalid dataset name: {}",
                self.input_dataset.display()
            )));
        }
        Ok(())
    }

    pub fn factors(&self) -> PenaltyFactors {
        PenaltyFactors {
            inside: self.inside_factor,
            touching: self.touch_factor,
        }
    }

    /// Files expected next to the penalized dataset after preprocessing it
    /// with the routing engine, see [OSRM_ARTIFACT_EXTENSIONS].
    pub fn osrm_artifacts(&self) -> Vec<PathBuf> {
        OSRM_ARTIFACT_EXTENSIONS
            .iter()
            .map(|ext| artifact_path(&self.output_dataset, ext))
            .collect()
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Validation(format!("{}={:?}: {}", key, value, e)))
}

/// Derives the name of a penalized dataset by appending `_avoidzones` to the file stem,
/// before all extensions: `region.osm.gz` becomes `region_avoidzones.osm.gz`.
pub fn penalized_name(input: &Path) -> PathBuf {
    let Some(name) = input.file_name().and_then(|n| n.to_str()) else {
        return input.with_file_name("avoidzones.osm");
    };

    let new_name = match name.split_once('.') {
        Some((stem, extensions)) => format!("{}_avoidzones.{}", stem, extensions),
        None => format!("{}_avoidzones", name),
    };
    input.with_file_name(new_name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.inside_factor, 0.02);
        assert_eq!(s.touch_factor, 0.10);
        assert_eq!(s.location_mode, LocationIndexMode::DenseFile);
        assert_eq!(s.keep_count, 0);
        assert_eq!(s.history_dir, Path::new("/data/avoidzones_history"));
        assert_eq!(s.input_dataset, Path::new("/data/region.osm"));
        assert_eq!(s.output_dataset, Path::new("/data/region_avoidzones.osm"));
        assert_eq!(s.osrm_artifacts()[0], Path::new("/data/region_avoidzones.osrm"));
    }

    #[test]
    fn overrides() {
        let s = Settings::from_lookup(lookup(&[
            ("OSRM_DATA", "/srv/osrm"),
            ("OSM_FILE_NAME", "poland.osm.bz2"),
            ("AVOIDZONES_INSIDE_FACTOR", "0.05"),
            ("AVOIDZONES_TOUCH_FACTOR", " 0.5 "),
            ("AVOIDZONES_LOCATION_STORE", "flex_mem"),
            ("AVOIDZONES_KEEP_COUNT", "10"),
            ("AVOIDZONES_TABLE", "/profiles/avoid_zones_data.lua"),
        ]))
        .unwrap();

        assert_eq!(s.factors(), PenaltyFactors { inside: 0.05, touching: 0.5 });
        assert_eq!(s.location_mode, LocationIndexMode::FlexMem);
        assert_eq!(s.keep_count, 10);
        assert_eq!(s.history_dir, Path::new("/srv/osrm/avoidzones_history"));
        assert_eq!(s.input_dataset, Path::new("/srv/osrm/poland.osm.bz2"));
        assert_eq!(s.output_dataset, Path::new("/srv/osrm/poland_avoidzones.osm.bz2"));
        assert_eq!(s.zone_table_path, Path::new("/profiles/avoid_zones_data.lua"));
        assert_eq!(
            s.osrm_artifacts(),
            vec![
                PathBuf::from("/srv/osrm/poland_avoidzones.osrm"),
                PathBuf::from("/srv/osrm/poland_avoidzones.osrm.partition"),
                PathBuf::from("/srv/osrm/poland_avoidzones.osrm.cells"),
                PathBuf::from("/srv/osrm/poland_avoidzones.osrm.mldgr"),
            ]
        );
    }

    #[test]
    fn empty_values_are_unset() {
        let s = Settings::from_lookup(lookup(&[("OSRM_DATA", ""), ("AVOIDZONES_KEEP_COUNT", " ")])).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn invalid_values() {
        for vars in [
            [("AVOIDZONES_INSIDE_FACTOR", "1.5")],
            [("AVOIDZONES_TOUCH_FACTOR", "0")],
            [("AVOIDZONES_INSIDE_FACTOR", "cheap")],
            [("AVOIDZONES_LOCATION_STORE", "sparse_file_array")],
            [("AVOIDZONES_KEEP_COUNT", "-1")],
            [("OSM_FILE_NAME", "..")],
        ] {
            let result = Settings::from_lookup(lookup(&vars));
            assert!(
                matches!(result, Err(Error::Validation(_))),
                "{:?} accepted",
                vars
            );
        }
    }

    #[test]
    fn penalized_names() {
        assert_eq!(
            penalized_name(Path::new("/data/region.osm")),
            Path::new("/data/region_avoidzones.osm")
        );
        assert_eq!(
            penalized_name(Path::new("region.osm.gz")),
            Path::new("region_avoidzones.osm.gz")
        );
        assert_eq!(penalized_name(Path::new("/data/region")), Path::new("/data/region_avoidzones"));
    }
}
