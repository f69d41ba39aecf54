// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use geo::{BooleanOps, Euclidean, Intersects, Length, LineString, MultiLineString};
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::zones::{feature_geometry, features, parse_positions, Properties, ZoneIndex};

/// Overlap of a route with the avoid zones. Lengths are planar,
/// in the units of the input coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RouteScore {
    pub intersecting_zone_count: usize,
    pub intersected_length: f64,
    /// `intersected_length / total_length`, clamped to `[0, 1]`.
    pub penalty_ratio: f64,
    pub total_length: f64,
}

/// Scores a route against the avoid zones.
///
/// A zone counts as intersecting even if it only touches the route at a single point;
/// such touches don't contribute to the intersected length. Overlapping zones
/// contribute their intersections separately, hence the clamped ratio.
pub fn score(route: &LineString<f64>, zones: &ZoneIndex) -> RouteScore {
    let total_length = Euclidean.length(route);
    let mut result = RouteScore {
        total_length,
        ..Default::default()
    };

    let candidates = zones.candidates(route);
    if candidates.is_empty() {
        return result;
    }
    let has_length = total_length > 0.0;

    let route_lines = MultiLineString::new(vec![route.clone()]);
    for idx in candidates {
        let Some(zone) = zones.get(idx) else { continue };
        if !zone.geometry.intersects(route) {
            continue;
        }

        result.intersecting_zone_count += 1;
        if has_length {
            let clipped = zone.geometry.clip(&route_lines, false);
            result.intersected_length += Euclidean.length(&clipped);
        }
    }

    if has_length {
        result.penalty_ratio = (result.intersected_length / total_length).min(1.0);
    }
    result
}

/// How scored routes are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMode {
    /// Drop every route intersecting any avoid zone.
    Filter,

    /// Keep all routes, ordered by ascending penalty ratio.
    #[default]
    Penalize,
}

impl ScoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Penalize => "penalize",
        }
    }

    /// Scores the routes and [filters](filter_routes) or [ranks](rank_routes) them.
    pub fn apply<R, F>(&self, routes: Vec<R>, zones: &ZoneIndex, line_of: F) -> Vec<ScoredRoute<R>>
    where
        F: Fn(&R) -> &LineString<f64>,
    {
        match self {
            Self::Filter => filter_routes(routes, zones, line_of),
            Self::Penalize => rank_routes(routes, zones, line_of),
        }
    }
}

impl std::fmt::Display for ScoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScoreMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filter" => Ok(Self::Filter),
            "penalize" => Ok(Self::Penalize),
            _ => Err(Error::Validation(format!("unknown score mode: {:?}", s))),
        }
    }
}

/// A route annotated with its [RouteScore].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRoute<R> {
    pub route: R,
    pub score: RouteScore,
}

/// Removes all routes intersecting any avoid zone, preserving the order of the rest.
pub fn filter_routes<R, F>(routes: Vec<R>, zones: &ZoneIndex, line_of: F) -> Vec<ScoredRoute<R>>
where
    F: Fn(&R) -> &LineString<f64>,
{
    routes
        .into_iter()
        .map(|route| {
            let score = score(line_of(&route), zones);
            ScoredRoute { route, score }
        })
        .filter(|r| r.score.intersecting_zone_count == 0)
        .collect()
}

/// Scores all routes and orders them by ascending penalty ratio.
/// Routes with equal ratios keep their relative order.
pub fn rank_routes<R, F>(routes: Vec<R>, zones: &ZoneIndex, line_of: F) -> Vec<ScoredRoute<R>>
where
    F: Fn(&R) -> &LineString<f64>,
{
    let mut scored = routes
        .into_iter()
        .map(|route| {
            let score = score(line_of(&route), zones);
            ScoredRoute { route, score }
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| a.score.penalty_ratio.total_cmp(&b.score.penalty_ratio));
    scored
}

/// A candidate route read from a GeoJSON document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    /// Position of the route in the input document.
    pub index: usize,
    pub properties: Properties,
    #[serde(skip)]
    pub line: LineString<f64>,
}

/// Reads candidate routes from a GeoJSON document: a FeatureCollection of LineStrings,
/// a single LineString Feature, or a bare LineString geometry.
/// Other features are skipped with a warning.
pub fn parse_routes(document: &Value) -> Vec<Route> {
    let mut routes = Vec::new();

    for (index, feature) in features(document).into_iter().enumerate() {
        let line = feature_geometry(feature)
            .ok_or_else(|| "feature has no geometry".to_string())
            .and_then(|g| match g.get("type").and_then(Value::as_str) {
                Some("LineString") => {
                    parse_positions(g.get("coordinates").unwrap_or(&Value::Null))
                }
                other => Err(format!("expected a LineString, got {:?}", other)),
            });

        match line {
            Ok(coords) if coords.len() >= 2 => routes.push(Route {
                index,
                properties: feature
                    .get("properties")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                line: LineString::new(coords),
            }),
            Ok(_) => log::warn!("skipping route {}: less than 2 positions", index),
            Err(reason) => log::warn!("skipping route {}: {}", index, reason),
        }
    }

    routes
}
