// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Streaming access to [OpenStreetMap](https://www.openstreetmap.org/) XML files.

mod locations;
pub mod model;
pub mod reader;
mod writer;

pub use locations::{DenseFileIndex, FlexMemIndex, LocationIndex, LocationIndexMode};
pub use model::{Attributes, Feature, FeatureType, Node, Relation, RelationMember, Tags, Way};
pub use reader::{features_from_file, features_from_io, FeatureReader, FileFormat};
pub use writer::{Sink, Writer};
