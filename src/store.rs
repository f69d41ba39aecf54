// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::canonical::canonical_form;
use crate::error::{Error, Result};
use crate::zones::ZoneIndex;

/// Sequential number of a stored polygon configuration, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Version(pub u32);

impl Version {
    /// Name of the file holding this version, e.g. `v5.geojson`.
    pub fn filename(&self) -> String {
        format!("{}.geojson", self)
    }

    fn from_filename(name: &str) -> Option<Self> {
        let digits = name.strip_prefix('v')?.strip_suffix(".geojson")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|&n| n > 0).map(Version)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Selects a stored version: either the newest one, or a specific number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Exact(Version),
}

impl std::str::FromStr for VersionSelector {
    type Err = Error;

    /// Accepts `latest`, `v5` and `5`.
    fn from_str(s: &str) -> Result<Self> {
        if s == "latest" {
            return Ok(Self::Latest);
        }
        if s.contains(['.', '/', '\\']) {
            return Err(Error::Validation(format!("invalid version: {:?}", s)));
        }
        let digits = s.strip_prefix('v').unwrap_or(s);
        match digits.parse::<u32>() {
            Ok(n) if n > 0 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self::Exact(Version(n)))
            }
            _ => Err(Error::Validation(format!("invalid version: {:?}", s))),
        }
    }
}

/// Summary of a stored version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: Version,
    pub filename: String,
    pub size_bytes: u64,
    pub feature_count: usize,
}

/// Directory of immutable, sequentially numbered polygon configurations
/// (`v1.geojson`, `v2.geojson`, ...).
///
/// The current version is the highest number present. Files not following
/// the naming pattern are ignored. A version file appears atomically, fully
/// written, and never overwrites another one, so concurrent saves (also from
/// separate processes sharing the directory) always get distinct numbers.
#[derive(Debug)]
pub struct VersionStore {
    dir: PathBuf,
    save_lock: Mutex<()>,
}

impl VersionStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding a specific version (which may not exist).
    pub fn path_of(&self, version: Version) -> PathBuf {
        self.dir.join(version.filename())
    }

    /// Returns all stored versions with their paths, in ascending order.
    fn versions(&self) -> Result<Vec<(Version, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(version) = entry.file_name().to_str().and_then(Version::from_filename) {
                versions.push((version, entry.path()));
            }
        }
        versions.sort_unstable_by_key(|&(v, _)| v);
        Ok(versions)
    }

    /// Returns the newest stored version, if any.
    pub fn latest(&self) -> Result<Option<Version>> {
        Ok(self.versions()?.last().map(|&(v, _)| v))
    }

    /// Returns the number which the next saved version will get - one more than
    /// the highest stored version, or 1 for an empty store.
    pub fn next_version_number(&self) -> Result<Version> {
        match self.latest()? {
            None => Ok(Version(1)),
            Some(v) => v.0.checked_add(1).map(Version).ok_or_else(|| {
                Error::Validation(format!("no version numbers left after {}", v))
            }),
        }
    }

    /// Looks for a stored version with the same [canonical form](canonical_form)
    /// as `config`, returning the lowest matching version.
    /// Unreadable version files are skipped with a warning.
    pub fn find_duplicate(&self, config: &Value) -> Result<Option<Version>> {
        let wanted = canonical_form(config);
        for (version, path) in self.versions()? {
            match read_json(&path) {
                Ok(existing) => {
                    if canonical_form(&existing) == wanted {
                        return Ok(Some(version));
                    }
                }
                Err(e) => log::warn!("failed to read {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }

    /// Stores a configuration as a new version.
    ///
    /// The configuration must be a FeatureCollection with at least one usable
    /// Polygon or MultiPolygon feature. With `dedupe`, an already stored
    /// identical configuration is returned instead (with `is_new = false`),
    /// and nothing is written.
    pub fn save(&self, config: &Value, dedupe: bool) -> Result<(Version, bool)> {
        validate(config)?;

        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if dedupe {
            if let Some(existing) = self.find_duplicate(config)? {
                log::info!("configuration already stored as {}", existing);
                return Ok((existing, false));
            }
        }

        fs::create_dir_all(&self.dir)?;
        let mut pending = tempfile::Builder::new()
            .prefix(".pending-")
            .suffix(".geojson")
            .tempfile_in(&self.dir)?;
        {
            let mut w = BufWriter::new(&mut pending);
            serde_json::to_writer_pretty(&mut w, config)?;
            w.flush()?;
        }

        // Another process may take the number between the scan and the rename
        loop {
            let version = self.next_version_number()?;
            match pending.persist_noclobber(self.path_of(version)) {
                Ok(_) => {
                    log::info!("saved avoid zones configuration as {}", version);
                    return Ok((version, true));
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    log::debug!("{} taken by a concurrent save, retrying", version);
                    pending = e.file;
                }
                Err(e) => return Err(e.error.into()),
            }
        }
    }

    /// Loads a stored configuration.
    pub fn load(&self, selector: VersionSelector) -> Result<Value> {
        let version = match selector {
            VersionSelector::Latest => self
                .latest()?
                .ok_or_else(|| Error::NotFound("no versions stored".to_string()))?,
            VersionSelector::Exact(v) => v,
        };

        let path = self.path_of(version);
        match read_json(&path) {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("version {}", version)))
            }
            other => other,
        }
    }

    /// Parses a textual version selector and [loads](VersionStore::load) it.
    pub fn load_str(&self, selector: &str) -> Result<Value> {
        self.load(selector.parse()?)
    }

    /// Lists all stored versions, newest first.
    /// Unreadable version files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<VersionInfo>> {
        let mut infos = Vec::new();
        for (version, path) in self.versions()?.into_iter().rev() {
            let info = fs::metadata(&path)
                .map_err(Error::from)
                .and_then(|m| Ok((m.len(), read_json(&path)?)));
            match info {
                Ok((size_bytes, config)) => infos.push(VersionInfo {
                    version,
                    filename: version.filename(),
                    size_bytes,
                    feature_count: config
                        .get("features")
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len),
                }),
                Err(e) => log::warn!("failed to read {}: {}", version, e),
            }
        }
        Ok(infos)
    }

    /// Deletes all but the `keep_count` newest versions, returning the number of deleted versions.
    /// `keep_count == 0` keeps everything.
    pub fn cleanup(&self, keep_count: usize) -> Result<usize> {
        if keep_count == 0 {
            return Ok(0);
        }

        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = self.versions()?;
        let to_delete = versions.len().saturating_sub(keep_count);

        let mut deleted = 0;
        for (version, path) in &versions[..to_delete] {
            match fs::remove_file(path) {
                Ok(()) => {
                    log::info!("deleted old version {}", version);
                    deleted += 1;
                }
                Err(e) => log::warn!("failed to delete {}: {}", version, e),
            }
        }
        Ok(deleted)
    }
}

fn read_json(path: &Path) -> Result<Value> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Checks that a configuration can be stored.
pub fn validate(config: &Value) -> Result<()> {
    if config.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(Error::Validation("expected a FeatureCollection".to_string()));
    }

    let features = config
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Validation("FeatureCollection has no features array".to_string()))?;
    if features.is_empty() {
        return Err(Error::Validation(
            "FeatureCollection must contain at least one feature".to_string(),
        ));
    }

    if ZoneIndex::build(config).is_empty() {
        return Err(Error::Validation(
            "FeatureCollection has no valid Polygon or MultiPolygon features".to_string(),
        ));
    }

    Ok(())
}
