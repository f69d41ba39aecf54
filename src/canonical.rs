// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use serde_json::{Map, Value};

/// Computes the canonical form of a polygon configuration: compact JSON with object keys
/// sorted at every level and, for FeatureCollections, features sorted by their own
/// canonical text.
///
/// Two configurations are considered equal iff their canonical forms are equal.
/// Numbers keep their JSON representation, so `1` and `1.0` are different.
pub fn canonical_form(config: &Value) -> String {
    let mut normalized = sort_keys(config);

    if normalized.get("type").and_then(Value::as_str) == Some("FeatureCollection") {
        if let Some(features) = normalized.get_mut("features").and_then(Value::as_array_mut) {
            let mut keyed = features
                .drain(..)
                .map(|f| (f.to_string(), f))
                .collect::<Vec<_>>();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            features.extend(keyed.into_iter().map(|(_, f)| f));
        }
    }

    normalized.to_string()
}

/// Recursively rebuilds objects with keys inserted in sorted order,
/// so that serialization is independent of the map implementation.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
