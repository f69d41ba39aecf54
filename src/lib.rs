// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Avoid zones for routing over [OpenStreetMap](https://www.openstreetmap.org/) data.
//!
//! Avoid zones are user-supplied GeoJSON polygons, which routes should stay away from.
//! The crate keeps versioned snapshots of zone configurations ([store]),
//! flattens them into a table for routing profiles ([table]), tags ways of an OSM road
//! network inside or touching the zones with cost penalties ([penalize]),
//! and scores computed routes by their overlap with the zones ([scorer]).
//!
//! # Example
//!
//! ```no_run
//! use avoidzones::store::{VersionSelector, VersionStore};
//! use avoidzones::zones::ZoneIndex;
//! # use geo::line_string;
//!
//! # fn main() -> avoidzones::Result<()> {
//! let store = VersionStore::new("/data/avoidzones_history");
//! let config = store.load(VersionSelector::Latest)?;
//! let zones = ZoneIndex::build(&config);
//!
//! let route = geo::line_string![(x: 7.4246, y: 43.7384), (x: 7.4323, y: 43.7478)];
//! let score = avoidzones::scorer::score(&route, &zones);
//! println!("{:.1}% of the route is in avoid zones", score.penalty_ratio * 100.0);
//! # Ok(())
//! # }
//! ```

pub mod canonical;
pub mod config;
mod error;
pub mod jobs;
pub mod osm;
pub mod penalize;
pub mod scorer;
pub mod store;
pub mod table;
pub mod zones;

pub use error::{Error, Result};
pub use penalize::{penalize, PenaltyFactors};
pub use scorer::{score, RouteScore};
pub use zones::ZoneIndex;
