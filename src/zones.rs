// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs;
use std::path::Path;

use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use serde_json::Value;

use crate::error::Result;

/// Opaque metadata of a zone, taken verbatim from the feature's `properties`.
pub type Properties = serde_json::Map<String, Value>;

/// A single avoid zone - a validated (multi)polygon with its metadata.
///
/// Positions use `x = lon`, `y = lat`, as in GeoJSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub geometry: MultiPolygon<f64>,
    pub properties: Properties,
}

type ZoneEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Read-only spatial index over the zones of a polygon configuration.
///
/// An index built from a configuration without any usable polygons is empty:
/// all queries return no candidates.
#[derive(Debug, Clone, Default)]
pub struct ZoneIndex {
    zones: Vec<Zone>,
    tree: Option<RTree<ZoneEnvelope>>,
}

impl ZoneIndex {
    /// Builds an index from a GeoJSON document - a FeatureCollection,
    /// a single Feature, or a bare Polygon/MultiPolygon geometry.
    ///
    /// Features without a Polygon or MultiPolygon geometry, or with rings which are
    /// not closed or have less than 3 distinct positions, are skipped with a warning.
    pub fn build(config: &Value) -> Self {
        let zones = parse_zones(config);
        if zones.is_empty() {
            log::warn!("no usable polygons in avoid zones configuration");
            return Self::default();
        }

        let items = zones
            .iter()
            .enumerate()
            .filter_map(|(idx, zone)| {
                zone.geometry
                    .bounding_rect()
                    .map(|r| GeomWithData::new(rectangle(r), idx))
            })
            .collect::<Vec<_>>();

        log::debug!("indexed {} avoid zones", items.len());
        Self {
            zones,
            tree: Some(RTree::bulk_load(items)),
        }
    }

    /// Reads a GeoJSON document from a file and [builds](ZoneIndex::build) an index over it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Value = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Self::build(&config))
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn get(&self, idx: usize) -> Option<&Zone> {
        self.zones.get(idx)
    }

    /// Returns indices (in ascending order) of zones whose bounding boxes overlap
    /// the bounding box of the provided geometry.
    ///
    /// This is only a pre-filter - callers need to check the exact relation themselves.
    pub fn candidates<G: BoundingRect<f64>>(&self, geometry: &G) -> Vec<usize> {
        let rect: Option<Rect<f64>> = geometry.bounding_rect().into();
        let (Some(tree), Some(rect)) = (&self.tree, rect) else {
            return Vec::new();
        };
        let envelope = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);

        let mut found = tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|item| item.data)
            .collect::<Vec<_>>();
        found.sort_unstable();
        found
    }
}

fn rectangle(r: Rect<f64>) -> Rectangle<[f64; 2]> {
    Rectangle::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y])
}

/// Lists the candidate features of a GeoJSON document, in order.
pub(crate) fn features(config: &Value) -> Vec<&Value> {
    match config.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => config
            .get("features")
            .and_then(Value::as_array)
            .map(|f| f.iter().collect())
            .unwrap_or_default(),
        _ => vec![config],
    }
}

/// Returns the geometry object of a Feature, or the document itself if it's a bare geometry.
pub(crate) fn feature_geometry(feature: &Value) -> Option<&Value> {
    match feature.get("type").and_then(Value::as_str) {
        Some("Feature") => feature.get("geometry").filter(|g| !g.is_null()),
        _ => Some(feature),
    }
}

fn parse_zones(config: &Value) -> Vec<Zone> {
    features(config)
        .into_iter()
        .enumerate()
        .filter_map(|(idx, feature)| match parse_zone(feature) {
            Ok(zone) => Some(zone),
            Err(reason) => {
                log::warn!("skipping avoid zone feature {}: {}", idx, reason);
                None
            }
        })
        .collect()
}

fn parse_zone(feature: &Value) -> Result<Zone, String> {
    let geometry = feature_geometry(feature).ok_or("feature has no geometry")?;
    let coordinates = geometry.get("coordinates").ok_or("geometry has no coordinates")?;

    let polygons = match geometry.get("type").and_then(Value::as_str) {
        Some("Polygon") => vec![parse_polygon(coordinates)?],
        Some("MultiPolygon") => coordinates
            .as_array()
            .ok_or("MultiPolygon coordinates must be an array")?
            .iter()
            .map(parse_polygon)
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => return Err(format!("unsupported geometry type {:?}", other)),
        None => return Err("geometry has no type".to_string()),
    };
    if polygons.is_empty() {
        return Err("MultiPolygon has no polygons".to_string());
    }

    let properties = feature
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Ok(Zone {
        geometry: MultiPolygon::new(polygons),
        properties,
    })
}

fn parse_polygon(coordinates: &Value) -> Result<Polygon<f64>, String> {
    let mut rings = coordinates
        .as_array()
        .ok_or("polygon coordinates must be an array of rings")?
        .iter()
        .map(parse_ring);
    let exterior = rings.next().ok_or("polygon has no rings")??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Parses a GeoJSON position list into a ring, checking that it's closed
/// and has at least 3 distinct positions.
pub(crate) fn parse_ring(ring: &Value) -> Result<LineString<f64>, String> {
    let coords = parse_positions(ring)?;

    match (coords.first(), coords.last()) {
        (Some(first), Some(last)) if first == last => {}
        _ => return Err("ring is not closed".to_string()),
    }

    let open = &coords[..coords.len() - 1];
    let distinct = open
        .iter()
        .enumerate()
        .filter(|&(i, c)| !open[..i].contains(c))
        .count();
    if distinct < 3 {
        return Err(format!("ring has {} distinct positions, need at least 3", distinct));
    }

    Ok(LineString::new(coords))
}

/// Parses a GeoJSON array of positions (`[[x, y], ...]`), ignoring any extra dimensions.
pub(crate) fn parse_positions(positions: &Value) -> Result<Vec<Coord<f64>>, String> {
    positions
        .as_array()
        .ok_or("positions must be an array")?
        .iter()
        .map(|p| {
            let xy = p.as_array().ok_or("position must be an array")?;
            match (
                xy.first().and_then(Value::as_f64),
                xy.get(1).and_then(Value::as_f64),
            ) {
                (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok(Coord { x, y }),
                _ => Err(format!("invalid position: {}", p)),
            }
        })
        .collect()
}
