// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

/// Ordered string-to-string mapping, used for OSM tags and element attributes.
///
/// Insertion order is preserved, so that elements can be written back
/// exactly as they were read. Inserting an existing key replaces its value
/// in place (last write wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(Vec<(String, String)>);

/// Attributes of an OSM element other than the ones modelled explicitly
/// (`version`, `timestamp`, `changeset`, `user`, `uid`, `visible`, ...).
pub type Attributes = Tags;

impl Tags {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (k, v) in iter {
            tags.insert(k, v);
        }
        tags
    }
}

/// Represents an [OSM node](https://wiki.openstreetmap.org/wiki/Node).
///
/// Nodes without a position (e.g. deleted nodes) have non-finite `lat` and `lon`.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub attributes: Attributes,
    pub tags: Tags,
}

impl Node {
    pub fn has_location(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }
}

/// Represents an [OSM way](https://wiki.openstreetmap.org/wiki/Way).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Way {
    pub id: i64,
    pub nodes: Vec<i64>,
    pub attributes: Attributes,
    pub tags: Tags,
}

/// Type of an [OSM feature/element](https://wiki.openstreetmap.org/wiki/Elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureType {
    Node,
    Way,
    Relation,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a member of an [OSM relation](https://wiki.openstreetmap.org/wiki/Relation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMember {
    pub type_: FeatureType,
    pub ref_: i64,
    pub role: String,
}

/// Represents an [OSM relation](https://wiki.openstreetmap.org/wiki/Relation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<RelationMember>,
    pub attributes: Attributes,
    pub tags: Tags,
}

/// Union over all elements found in the body of an OSM file.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    /// The `<bounds>` element, carried through verbatim.
    Bounds(Attributes),
    Node(Node),
    Way(Way),
    Relation(Relation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_keep_insertion_order() {
        let mut tags = Tags::new();
        tags.insert("name", "Main Street");
        tags.insert("highway", "primary");
        tags.insert("avoid_zone", "yes");

        let keys: Vec<_> = tags.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["name", "highway", "avoid_zone"]);
    }

    #[test]
    fn tags_last_write_wins_in_place() {
        let mut tags: Tags = [("highway", "primary"), ("avoid_factor", "0.5000"), ("ref", "7")]
            .into_iter()
            .collect();

        let previous = tags.insert("avoid_factor", "0.0200");

        assert_eq!(previous.as_deref(), Some("0.5000"));
        assert_eq!(tags.len(), 3);
        assert_eq!(tags.get("avoid_factor"), Some("0.0200"));
        let keys: Vec<_> = tags.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["highway", "avoid_factor", "ref"]);
    }

    #[test]
    fn tags_from_iter_deduplicates() {
        let tags: Tags = [("k", "1"), ("k", "2")].into_iter().collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get("k"), Some("2"));
    }
}
