// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use geo::{Coord, LineString, Relate};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::osm::{
    features_from_file, Attributes, Feature, FileFormat, LocationIndex, LocationIndexMode, Sink,
    Tags, Way, Writer,
};
use crate::zones::ZoneIndex;

/// Default cost multiplier of ways lying entirely within an avoid zone.
pub const INSIDE_FACTOR: f64 = 0.02;

/// Default cost multiplier of ways crossing or touching an avoid zone.
pub const TOUCH_FACTOR: f64 = 0.10;

/// Tag marking penalized ways.
pub const AVOID_ZONE_TAG: &str = "avoid_zone";

/// Tag holding the cost multiplier of penalized ways.
pub const AVOID_FACTOR_TAG: &str = "avoid_factor";

/// Multiplicative cost penalties applied to ways in avoid zones,
/// for the routing profile to pick up. Smaller values discourage a way more.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyFactors {
    pub inside: f64,
    pub touching: f64,
}

impl Default for PenaltyFactors {
    fn default() -> Self {
        Self {
            inside: INSIDE_FACTOR,
            touching: TOUCH_FACTOR,
        }
    }
}

impl PenaltyFactors {
    /// Checks that both factors lie in the open interval (0, 1).
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("inside", self.inside), ("touching", self.touching)] {
            if !(value > 0.0 && value < 1.0) {
                return Err(Error::Validation(format!(
                    "{} penalty factor must be in (0, 1), got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Returns the factor for a given classification, or None if the way is not penalized.
    pub fn factor(&self, classification: Classification) -> Option<f64> {
        match classification {
            Classification::None => None,
            Classification::Touching => Some(self.touching),
            Classification::Inside => Some(self.inside),
        }
    }
}

/// Relation between a way and the avoid zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Classification {
    None,
    Touching,
    Inside,
}

/// Checks whether a way can be used for routing: any `highway=*` or `route=ferry`.
pub fn is_routable(tags: &Tags) -> bool {
    tags.contains_key("highway") || tags.get("route") == Some("ferry")
}

/// Classifies a way's geometry against the avoid zones.
///
/// [Classification::Inside] wins if any zone covers the whole line, regardless of
/// the order of zones; otherwise [Classification::Touching] is returned
/// if the line intersects any zone.
pub fn classify(line: &LineString<f64>, zones: &ZoneIndex) -> Classification {
    let mut result = Classification::None;
    for idx in zones.candidates(line) {
        let Some(zone) = zones.get(idx) else { continue };
        let matrix = zone.geometry.relate(line);
        if matrix.is_covers() {
            return Classification::Inside;
        } else if matrix.is_intersects() {
            result = Classification::Touching;
        }
    }
    result
}

/// Formats a factor as the value of the `avoid_factor` tag.
pub fn format_factor(factor: f64) -> String {
    format!("{:.4}", factor.clamp(0.01, 0.99))
}

/// Counters describing a single penalizer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PenalizeStats {
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
    pub routable_ways: u64,
    pub inside: u64,
    pub touching: u64,
    /// Routable ways whose geometry couldn't be built, passed through unmodified.
    pub unresolved: u64,
}

/// Additional controls for a [penalize] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Options {
    pub factors: PenaltyFactors,
    pub location_mode: LocationIndexMode,
    pub input_format: FileFormat,
    pub output_format: FileFormat,
}

/// Helper object holding the state of a single pass over an OSM file:
/// node locations seen so far and counters.
pub struct Penalizer<'a> {
    zones: &'a ZoneIndex,
    factors: PenaltyFactors,
    locations: Box<dyn LocationIndex>,
    stats: PenalizeStats,
}

impl<'a> Penalizer<'a> {
    pub fn new(
        zones: &'a ZoneIndex,
        factors: PenaltyFactors,
        locations: Box<dyn LocationIndex>,
    ) -> Self {
        Self {
            zones,
            factors,
            locations,
            stats: PenalizeStats::default(),
        }
    }

    pub fn stats(&self) -> PenalizeStats {
        self.stats
    }

    /// Processes a single feature, in file order. Nodes must come before the ways
    /// referencing them, as in any sorted OSM file.
    pub fn process(&mut self, f: &mut Feature) -> io::Result<()> {
        match f {
            Feature::Bounds(_) => Ok(()),
            Feature::Node(n) => {
                self.stats.nodes += 1;
                if n.has_location() {
                    self.locations.set(n.id, Coord { x: n.lon, y: n.lat })?;
                }
                Ok(())
            }
            Feature::Way(w) => {
                self.stats.ways += 1;
                self.penalize_way(w)
            }
            Feature::Relation(_) => {
                self.stats.relations += 1;
                Ok(())
            }
        }
    }

    fn penalize_way(&mut self, w: &mut Way) -> io::Result<()> {
        if !is_routable(&w.tags) {
            return Ok(());
        }
        self.stats.routable_ways += 1;

        let Some(line) = self.way_geometry(w)? else {
            log::debug!("way {}: missing node locations, leaving as-is", w.id);
            self.stats.unresolved += 1;
            return Ok(());
        };

        let classification = classify(&line, self.zones);
        match classification {
            Classification::None => {}
            Classification::Touching => self.stats.touching += 1,
            Classification::Inside => self.stats.inside += 1,
        }

        if let Some(factor) = self.factors.factor(classification) {
            w.tags.insert(AVOID_ZONE_TAG, "yes");
            w.tags.insert(AVOID_FACTOR_TAG, format_factor(factor));
        }
        Ok(())
    }

    fn way_geometry(&mut self, w: &Way) -> io::Result<Option<LineString<f64>>> {
        if w.nodes.len() < 2 {
            return Ok(None);
        }

        let mut coords = Vec::with_capacity(w.nodes.len());
        for &node_id in &w.nodes {
            match self.locations.get(node_id)? {
                Some(c) => coords.push(c),
                None => return Ok(None),
            }
        }
        Ok(Some(LineString::new(coords)))
    }
}

/// Streams features through a [Penalizer] into an OSM [Writer],
/// returning the underlying output stream and pass statistics.
pub fn penalize_stream<I, W>(
    features: I,
    root: &Attributes,
    mut penalizer: Penalizer<'_>,
    out: W,
) -> Result<(W, PenalizeStats)>
where
    I: Iterator<Item = Result<Feature, quick_xml::Error>>,
    W: Write,
{
    let mut writer = Writer::new(out);
    writer.write_header(root)?;
    for f in features {
        let mut f = f?;
        penalizer.process(&mut f)?;
        writer.write(&f)?;
    }
    Ok((writer.finish()?, penalizer.stats()))
}

/// Rewrites the OSM file at `input` into `output`, tagging routable ways
/// inside or touching the avoid zones from the GeoJSON file at `zone_config`
/// with `avoid_zone=yes` and `avoid_factor=<factor>`.
///
/// Nodes, relations and all other ways are copied unchanged, in their original order.
/// An existing file at `output` is replaced. A missing input, unreadable zone
/// configuration or invalid factors fail with [Error::Precheck] before anything is written.
/// If the pass fails midway, the partial output is removed.
pub fn penalize<P: AsRef<Path>, Q: AsRef<Path>, R: AsRef<Path>>(
    input: P,
    zone_config: Q,
    output: R,
    options: &Options,
) -> Result<PenalizeStats> {
    let (input, zone_config, output) = (input.as_ref(), zone_config.as_ref(), output.as_ref());

    if !input.is_file() {
        return Err(Error::Precheck(format!(
            "input dataset not found: {}",
            input.display()
        )));
    }
    let zones = ZoneIndex::from_file(zone_config).map_err(|e| {
        Error::Precheck(format!(
            "failed to read avoid zones from {}: {}",
            zone_config.display(),
            e
        ))
    })?;
    options
        .factors
        .validate()
        .map_err(|e| Error::Precheck(e.to_string()))?;

    let mut reader = features_from_file(input, options.input_format)?;
    let locations = options.location_mode.create()?;

    remove_if_exists(output)?;
    log::info!(
        "applying {} avoid zones to {} ({} node locations)",
        zones.len(),
        input.display(),
        options.location_mode
    );

    let result = Sink::create(output, options.output_format)
        .map_err(Error::from)
        .and_then(|sink| {
            let root = reader.root_attributes().clone();
            let penalizer = Penalizer::new(&zones, options.factors, locations);
            let (sink, stats) = penalize_stream(&mut reader, &root, penalizer, sink)?;
            sink.finish()?;
            if reader.skipped() > 0 {
                log::warn!(
                    "{} elements of {} couldn't be represented and were left out",
                    reader.skipped(),
                    input.display()
                );
            }
            Ok(stats)
        })
        .and_then(|stats| {
            if fs::metadata(output)?.len() == 0 {
                Err(Error::Precheck(format!(
                    "penalized dataset is empty: {}",
                    output.display()
                )))
            } else {
                Ok(stats)
            }
        });

    match result {
        Ok(stats) => {
            log::info!(
                "penalized {} ways inside and {} touching avoid zones ({} routable ways, {} unresolved)",
                stats.inside,
                stats.touching,
                stats.routable_ways,
                stats.unresolved
            );
            Ok(stats)
        }
        Err(e) => {
            if let Err(cleanup) = remove_if_exists(output) {
                log::warn!("failed to remove {}: {}", output.display(), cleanup);
            }
            Err(e)
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use geo::line_string;
    use serde_json::{json, Value};

    use super::*;
    use crate::osm::reader::xml::Reader;
    use crate::osm::{FlexMemIndex, Node, Relation};

    const GRID_XML: &[u8] = include_bytes!("osm/test_fixtures/grid.osm");

    fn zone(coords: Value) -> Value {
        json!({"type": "Feature", "properties": {}, "geometry": {"type": "Polygon", "coordinates": coords}})
    }

    fn unit_zone_config() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [zone(json!([[[0, 0], [2, 0], [2, 2], [0, 2], [0, 0]]]))]
        })
    }

    fn rewrite(zones: &ZoneIndex, mode: LocationIndexMode) -> (Vec<Feature>, PenalizeStats) {
        let reader = Reader::from_buffer(GRID_XML).unwrap();
        let root = reader.root_attributes().clone();
        let penalizer = Penalizer::new(zones, PenaltyFactors::default(), mode.create().unwrap());
        let (data, stats) = penalize_stream(reader, &root, penalizer, Vec::new()).unwrap();

        let features = Reader::from_buffer(&data)
            .unwrap()
            .map(|f| f.unwrap())
            .collect();
        (features, stats)
    }

    fn original() -> Vec<Feature> {
        Reader::from_buffer(GRID_XML)
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
    }

    fn ways(features: &[Feature]) -> Vec<&Way> {
        features
            .iter()
            .filter_map(|f| match f {
                Feature::Way(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn classify_scenarios() {
        let zones = ZoneIndex::build(&unit_zone_config());

        assert_eq!(
            classify(&line_string![(x: 0.5, y: 1.0), (x: 1.5, y: 1.0)], &zones),
            Classification::Inside
        );
        assert_eq!(
            classify(&line_string![(x: -1.0, y: 1.0), (x: 0.5, y: 1.0)], &zones),
            Classification::Touching
        );
        assert_eq!(
            classify(&line_string![(x: 5.0, y: 5.0), (x: 6.0, y: 6.0)], &zones),
            Classification::None
        );
        // bounding boxes overlap, geometries don't
        assert_eq!(
            classify(&line_string![(x: 2.5, y: -1.0), (x: 3.0, y: 2.5)], &zones),
            Classification::None
        );
    }

    #[test]
    fn classify_line_on_boundary_is_inside() {
        let zones = ZoneIndex::build(&unit_zone_config());
        assert_eq!(
            classify(&line_string![(x: 0.0, y: 0.0), (x: 0.0, y: 1.0), (x: 1.0, y: 1.0)], &zones),
            Classification::Inside
        );
    }

    #[test]
    fn inside_wins_regardless_of_order() {
        let enclosing = zone(json!([[[0, 0], [2, 0], [2, 2], [0, 2], [0, 0]]]));
        let crossing = zone(json!([[[1, -1], [1.2, -1], [1.2, 3], [1, 3], [1, -1]]]));
        let line = line_string![(x: 0.5, y: 1.0), (x: 1.5, y: 1.0)];

        for features in [
            vec![enclosing.clone(), crossing.clone()],
            vec![crossing, enclosing],
        ] {
            let zones = ZoneIndex::build(&json!({"type": "FeatureCollection", "features": features}));
            assert_eq!(classify(&line, &zones), Classification::Inside);
        }
    }

    #[test]
    fn factors() {
        assert!(PenaltyFactors::default().validate().is_ok());
        assert!(PenaltyFactors { inside: 0.0, touching: 0.1 }.validate().is_err());
        assert!(PenaltyFactors { inside: 0.1, touching: 1.0 }.validate().is_err());
        assert!(PenaltyFactors { inside: f64::NAN, touching: 0.1 }.validate().is_err());

        assert_eq!(format_factor(INSIDE_FACTOR), "0.0200");
        assert_eq!(format_factor(TOUCH_FACTOR), "0.1000");
        assert_eq!(format_factor(0.001), "0.0100");
    }

    #[test]
    fn routability() {
        assert!(is_routable(&Tags::from_iter([("highway", "residential")])));
        assert!(is_routable(&Tags::from_iter([("route", "ferry")])));
        assert!(!is_routable(&Tags::from_iter([("route", "bus")])));
        assert!(!is_routable(&Tags::from_iter([("building", "yes")])));
    }

    fn check_rewritten_grid(mode: LocationIndexMode) {
        let zones = ZoneIndex::build(&unit_zone_config());
        let (features, stats) = rewrite(&zones, mode);
        let before = original();

        assert_eq!(
            stats,
            PenalizeStats {
                nodes: 10,
                ways: 6,
                relations: 1,
                routable_ways: 5,
                inside: 2,
                touching: 1,
                unresolved: 1,
            }
        );
        assert_eq!(features.len(), before.len());

        let ways = ways(&features);
        let before_ways = self::ways(&before);

        // 100: inside - tags appended after the original ones
        assert_eq!(
            ways[0].tags,
            Tags::from_iter([
                ("highway", "primary"),
                ("name", "Inner Road"),
                ("avoid_zone", "yes"),
                ("avoid_factor", "0.0200"),
            ])
        );
        assert_eq!(ways[0].nodes, before_ways[0].nodes);
        assert_eq!(ways[0].attributes, before_ways[0].attributes);

        // 101: touching - existing avoid_factor replaced in place
        assert_eq!(
            ways[1].tags,
            Tags::from_iter([
                ("highway", "residential"),
                ("avoid_factor", "0.1000"),
                ("oneway", "yes"),
                ("avoid_zone", "yes"),
            ])
        );

        // 102: outside, 104: not routable, 105: missing node
        assert_eq!(ways[2], before_ways[2]);
        assert_eq!(ways[4], before_ways[4]);
        assert_eq!(ways[5], before_ways[5]);

        // 103: ferry inside
        assert_eq!(ways[3].tags.get("avoid_factor"), Some("0.0200"));

        // everything else is untouched and in order
        for (after, before) in features.iter().zip(before.iter()) {
            match (after, before) {
                (Feature::Way(_), Feature::Way(_)) => {}
                (a, b) => assert_eq!(a, b),
            }
        }
    }

    #[test]
    fn rewrite_grid_flex_mem() {
        check_rewritten_grid(LocationIndexMode::FlexMem);
    }

    #[test]
    fn rewrite_grid_dense_file() {
        check_rewritten_grid(LocationIndexMode::DenseFile);
    }

    #[test]
    fn empty_zones_change_nothing() {
        let zones = ZoneIndex::default();
        let (features, stats) = rewrite(&zones, LocationIndexMode::FlexMem);
        assert_eq!(features, original());
        assert_eq!(stats.inside + stats.touching, 0);
    }

    #[test]
    fn process_single_features() {
        let zones = ZoneIndex::build(&unit_zone_config());
        let mut p = Penalizer::new(&zones, PenaltyFactors::default(), Box::new(FlexMemIndex::default()));

        for (id, lon) in [(-1, 0.5), (-2, 1.5)] {
            p.process(&mut Feature::Node(Node {
                id,
                lat: 1.0,
                lon,
                attributes: Attributes::default(),
                tags: Tags::default(),
            }))
            .unwrap();
        }

        let mut way = Feature::Way(Way {
            id: -10,
            nodes: vec![-1, -2],
            attributes: Attributes::default(),
            tags: Tags::from_iter([("highway", "track")]),
        });
        p.process(&mut way).unwrap();
        match way {
            Feature::Way(w) => assert_eq!(w.tags.get("avoid_zone"), Some("yes")),
            _ => unreachable!(),
        }

        let mut relation = Feature::Relation(Relation {
            id: -20,
            members: Vec::new(),
            attributes: Attributes::default(),
            tags: Tags::from_iter([("highway", "pedestrian")]),
        });
        let before = relation.clone();
        p.process(&mut relation).unwrap();
        assert_eq!(relation, before);
    }

    fn write_files(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let input = dir.join("region.osm");
        let zones = dir.join("zones.geojson");
        fs::write(&input, GRID_XML).unwrap();
        fs::write(&zones, unit_zone_config().to_string()).unwrap();
        (input, zones)
    }

    #[test]
    fn penalize_files_replaces_output() {
        let dir = tempfile::tempdir().unwrap();
        let (input, zones) = write_files(dir.path());
        let output = dir.path().join("region_avoidzones.osm.gz");
        fs::write(&output, "stale content").unwrap();

        let stats = penalize(&input, &zones, &output, &Options::default()).unwrap();
        assert_eq!(stats.inside, 2);

        let reread = crate::osm::features_from_file(&output, FileFormat::Unknown)
            .unwrap()
            .map(|f| f.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(reread.len(), original().len());
        assert_eq!(ways(&reread)[0].tags.get("avoid_factor"), Some("0.0200"));
    }

    #[test]
    fn penalize_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let (_, zones) = write_files(dir.path());
        let output = dir.path().join("out.osm");

        let result = penalize(dir.path().join("missing.osm"), &zones, &output, &Options::default());
        assert!(matches!(result, Err(Error::Precheck(_))));
        assert!(!output.exists());
    }

    #[test]
    fn penalize_unreadable_zones() {
        let dir = tempfile::tempdir().unwrap();
        let (input, zones) = write_files(dir.path());
        fs::write(&zones, "{ broken").unwrap();
        let output = dir.path().join("out.osm");
        fs::write(&output, "stale content").unwrap();

        let result = penalize(&input, &zones, &output, &Options::default());
        assert!(matches!(result, Err(Error::Precheck(_))));
        assert_eq!(fs::read_to_string(&output).unwrap(), "stale content");
    }

    #[test]
    fn penalize_malformed_input_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let (input, zones) = write_files(dir.path());
        fs::write(&input, "<osm><node id='1' lat='0' lon='0'></way></osm>").unwrap();
        let output = dir.path().join("out.osm");

        assert!(penalize(&input, &zones, &output, &Options::default()).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn penalize_invalid_factors() {
        let dir = tempfile::tempdir().unwrap();
        let (input, zones) = write_files(dir.path());
        let output = dir.path().join("out.osm");
        fs::write(&output, "stale content").unwrap();

        for factors in [
            PenaltyFactors { inside: 0.0, touching: 0.1 },
            PenaltyFactors { inside: 0.02, touching: 1.0 },
            PenaltyFactors { inside: f64::NAN, touching: 0.1 },
        ] {
            let options = Options {
                factors,
                ..Default::default()
            };
            let result = penalize(&input, &zones, &output, &options);
            assert!(matches!(result, Err(Error::Precheck(_))), "{:?} accepted", factors);
            assert_eq!(fs::read_to_string(&output).unwrap(), "stale content");
        }
    }
}
