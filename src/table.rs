// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Flattened zone tables for routing profiles.
//!
//! A [ZoneTable] keeps only the outer ring of every polygon - holes are dropped,
//! as the consuming profile has no notion of them. The table is handed over
//! as a Lua chunk (see [ZoneTable]'s [Display](std::fmt::Display) implementation),
//! which the profile loads at startup.

use std::fmt;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::zones::{feature_geometry, features, parse_positions};

/// Single outer ring, as `(x, y)` (i.e. `(lon, lat)`) pairs.
pub type Ring = Vec<(f64, f64)>;

/// Flattened sequence of outer rings of all avoid zones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneTable(pub Vec<Ring>);

impl ZoneTable {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn rings(&self) -> &[Ring] {
        &self.0
    }
}

/// Projects a GeoJSON document (FeatureCollection, Feature or bare geometry)
/// into a [ZoneTable].
///
/// Polygons contribute their outer ring, MultiPolygons the outer ring of every member.
/// Rings with less than 3 positions and malformed geometries are skipped.
pub fn project(config: &Value) -> ZoneTable {
    let mut rings = Vec::new();

    for feature in features(config) {
        let Some(geometry) = feature_geometry(feature) else {
            continue;
        };
        let coordinates = geometry.get("coordinates");

        match geometry.get("type").and_then(Value::as_str) {
            Some("Polygon") => push_outer_ring(&mut rings, coordinates),
            Some("MultiPolygon") => {
                for polygon in coordinates.and_then(Value::as_array).into_iter().flatten() {
                    push_outer_ring(&mut rings, Some(polygon));
                }
            }
            _ => {}
        }
    }

    if rings.is_empty() {
        log::warn!("no polygons to project into the zone table");
    }
    ZoneTable(rings)
}

fn push_outer_ring(rings: &mut Vec<Ring>, polygon: Option<&Value>) {
    let Some(outer) = polygon.and_then(Value::as_array).and_then(|r| r.first()) else {
        return;
    };
    match parse_positions(outer) {
        Ok(coords) if coords.len() >= 3 => rings.push(coords.into_iter().map(|c| (c.x, c.y)).collect()),
        Ok(coords) => log::debug!("dropping ring with {} positions", coords.len()),
        Err(reason) => log::warn!("dropping malformed ring: {}", reason),
    }
}

/// Projects a GeoJSON text. Unparsable input results in an empty table, and an error log.
pub fn project_str(config: &str) -> ZoneTable {
    match serde_json::from_str(config) {
        Ok(value) => project(&value),
        Err(e) => {
            log::error!("failed to parse avoid zones configuration: {}", e);
            ZoneTable::default()
        }
    }
}

/// Projects a GeoJSON file. Unreadable or unparsable files result in an empty table,
/// and an error log.
pub fn project_file<P: AsRef<Path>>(path: P) -> ZoneTable {
    match fs::read_to_string(path.as_ref()) {
        Ok(text) => project_str(&text),
        Err(e) => {
            log::error!("failed to read {}: {}", path.as_ref().display(), e);
            ZoneTable::default()
        }
    }
}

/// Projects a GeoJSON file and writes the resulting Lua chunk to `output`,
/// creating parent directories as needed.
///
/// Never fails - returns `false` (after logging the reason) if the chunk couldn't be written.
pub fn write_table_file<P: AsRef<Path>, Q: AsRef<Path>>(config: P, output: Q) -> bool {
    let table = project_file(config);
    let output = output.as_ref();

    let result = output
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| fs::write(output, table.to_string()));

    match result {
        Ok(()) => {
            log::info!("wrote {} zone rings to {}", table.len(), output.display());
            true
        }
        Err(e) => {
            log::error!("failed to write zone table {}: {}", output.display(), e);
            false
        }
    }
}

impl fmt::Display for ZoneTable {
    /// Formats the table as a Lua chunk returning a list of zones:
    ///
    /// ```lua
    /// -- Auto-generated avoid zones data
    /// return {
    ///   {
    ///     coords = {
    ///       {0, 0},
    ///       ...
    ///     },
    ///     is_inside = true,
    ///     is_touching = true,
    ///   },
    /// }
    /// ```
    ///
    /// An empty table is formatted as `return {}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "return {{}}");
        }

        writeln!(f, "-- Auto-generated avoid zones data")?;
        writeln!(f, "return {{")?;
        for ring in &self.0 {
            writeln!(f, "  {{")?;
            writeln!(f, "    coords = {{")?;
            for (x, y) in ring {
                writeln!(f, "      {{{}, {}}},", x, y)?;
            }
            writeln!(f, "    }},")?;
            writeln!(f, "    is_inside = true,")?;
            writeln!(f, "    is_touching = true,")?;
            writeln!(f, "  }},")?;
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn polygon_keeps_outer_ring_only() {
        let table = project(&json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [
                        [[0, 0], [4, 0], [4, 4], [0, 4], [0, 0]],
                        [[1, 1], [2, 1], [2, 2], [1, 1]]
                    ]
                }
            }]
        }));
        assert_eq!(
            table,
            ZoneTable(vec![vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]])
        );
    }

    #[test]
    fn multi_polygon_is_flattened() {
        let table = project(&json!({
            "type": "Feature",
            "geometry": {
                "type": "MultiPolygon",
                "coordinates": [
                    [[[0, 0], [1, 0], [1, 1], [0, 0]]],
                    [[[5, 5], [6, 5]]],
                    [[[10, 10], [11, 10], [11, 11], [10, 10]], [[10.2, 10.1], [10.8, 10.1], [10.8, 10.7], [10.2, 10.1]]]
                ]
            }
        }));
        assert_eq!(table.len(), 2);
        assert_eq!(table.rings()[1][0], (10.0, 10.0));
        assert_eq!(table.rings()[1].len(), 4);
    }

    #[test]
    fn other_geometries_are_skipped() {
        let table = project(&json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}},
                {"type": "Feature", "geometry": null},
                {"type": "Feature", "geometry": {"type": "Polygon", "coordinates": [[["a", 0]]]}},
            ]
        }));
        assert!(table.is_empty());
    }

    #[test]
    fn unparsable_input_gives_empty_table() {
        assert!(project_str("{ definitely not json").is_empty());
        assert!(project_file("/nonexistent/avoid_zones.geojson").is_empty());
    }

    #[test]
    fn lua_format() {
        let table = ZoneTable(vec![vec![(0.0, 0.0), (1.5, 0.0), (1.5, 1.0), (0.0, 0.0)]]);
        assert_eq!(
            table.to_string(),
            "-- Auto-generated avoid zones data\n\
             return {\n  {\n    coords = {\n      {0, 0},\n      {1.5, 0},\n      {1.5, 1},\n      {0, 0},\n    },\n    is_inside = true,\n    is_touching = true,\n  },\n}\n"
        );
        assert_eq!(ZoneTable::default().to_string(), "return {}\n");
    }

    #[test]
    fn write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("zones.geojson");
        let output = dir.path().join("profiles").join("avoid_zones_data.lua");
        fs::write(
            &config,
            r#"{"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]}"#,
        )
        .unwrap();

        assert!(write_table_file(&config, &output));
        let chunk = fs::read_to_string(&output).unwrap();
        assert!(chunk.starts_with("-- Auto-generated avoid zones data\nreturn {\n"));
        assert_eq!(chunk.matches("coords = ").count(), 1);
    }

    #[test]
    fn write_from_missing_config_writes_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("avoid_zones_data.lua");
        assert!(write_table_file(dir.path().join("missing.geojson"), &output));
        assert_eq!(fs::read_to_string(&output).unwrap(), "return {}\n");
    }
}
