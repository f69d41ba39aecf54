// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use geo::Coord;

/// Storage strategy of a [LocationIndex].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationIndexMode {
    /// Dense array of fixed-point positions, indexed by node id, kept in an
    /// anonymous temporary file. Suited for large extracts with dense, positive node ids.
    #[default]
    DenseFile,

    /// Hash map from node id to position, kept in memory.
    /// Faster for small extracts, and the only mode supporting negative ids.
    FlexMem,
}

impl LocationIndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DenseFile => "dense_mmap_array",
            Self::FlexMem => "flex_mem",
        }
    }

    /// Creates an empty index with this storage strategy.
    pub fn create(&self) -> io::Result<Box<dyn LocationIndex>> {
        Ok(match self {
            Self::DenseFile => Box::new(DenseFileIndex::new()?),
            Self::FlexMem => Box::new(FlexMemIndex::default()),
        })
    }
}

impl std::fmt::Display for LocationIndexMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LocationIndexMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dense_mmap_array" | "dense" | "mmap" => Ok(Self::DenseFile),
            "flex_mem" | "flex" | "memory" => Ok(Self::FlexMem),
            other => Err(crate::Error::Validation(format!(
                "unknown node location store: {:?} (expected dense_mmap_array or flex_mem)",
                other
            ))),
        }
    }
}

/// Maps OSM node ids onto their positions, so that way geometries can be built
/// while streaming through a file.
///
/// Positions are `x = lon`, `y = lat`, in degrees.
pub trait LocationIndex {
    fn set(&mut self, id: i64, location: Coord<f64>) -> io::Result<()>;
    fn get(&mut self, id: i64) -> io::Result<Option<Coord<f64>>>;
}

/// In-memory [LocationIndex].
#[derive(Debug, Default)]
pub struct FlexMemIndex(HashMap<i64, Coord<f64>>);

impl LocationIndex for FlexMemIndex {
    fn set(&mut self, id: i64, location: Coord<f64>) -> io::Result<()> {
        self.0.insert(id, location);
        Ok(())
    }

    fn get(&mut self, id: i64) -> io::Result<Option<Coord<f64>>> {
        Ok(self.0.get(&id).copied())
    }
}

/// Fixed-point scale of stored positions, matching the 7 decimal places of OSM data.
const SCALE: f64 = 1e7;

/// Offsets added to fixed-point longitudes and latitudes, so that
/// every valid position is stored as a non-zero unsigned value,
/// leaving zero (the content of never-written file regions) to mean "no location".
const LON_OFFSET: i64 = 1_800_000_001;
const LAT_OFFSET: i64 = 900_000_001;

/// Bytes per stored position - two u32 values.
const ENTRY_SIZE: u64 = 8;

/// Number of positions in a single cached page.
const PAGE_ENTRIES: u64 = 8192;

/// Upper bound (exclusive) of node ids storable in a [DenseFileIndex].
const MAX_DENSE_ID: i64 = 1 << 42;

/// Disk-backed dense [LocationIndex].
///
/// Node positions are kept at offset `id * 8` of an anonymous temporary file
/// (which is sparse on most filesystems). One page of the file is cached,
/// which works well with OSM files, where nodes are sorted by id and ways
/// tend to reference nearby nodes.
///
/// Negative (or absurdly large) node ids and positions outside of the valid lat-lon range are not storable;
/// such nodes are skipped.
pub struct DenseFileIndex {
    file: File,
    page: Vec<u8>,
    page_no: Option<u64>,
    dirty: bool,
    len: u64,
}

impl DenseFileIndex {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            page: vec![0; (PAGE_ENTRIES * ENTRY_SIZE) as usize],
            page_no: None,
            dirty: false,
            len: 0,
        })
    }

    fn encode(location: Coord<f64>) -> Option<[u8; 8]> {
        if !(-180.0..=180.0).contains(&location.x) || !(-90.0..=90.0).contains(&location.y) {
            return None;
        }
        let lon = ((location.x * SCALE).round() as i64 + LON_OFFSET) as u32;
        let lat = ((location.y * SCALE).round() as i64 + LAT_OFFSET) as u32;
        let mut buf = [0; 8];
        buf[..4].copy_from_slice(&lon.to_le_bytes());
        buf[4..].copy_from_slice(&lat.to_le_bytes());
        Some(buf)
    }

    fn decode(buf: &[u8]) -> Option<Coord<f64>> {
        let lon = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let lat = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if lon == 0 || lat == 0 {
            return None;
        }
        Some(Coord {
            x: (lon as i64 - LON_OFFSET) as f64 / SCALE,
            y: (lat as i64 - LAT_OFFSET) as f64 / SCALE,
        })
    }

    /// Makes sure `page_no` is the cached page, flushing the previous one if needed.
    fn load_page(&mut self, page_no: u64) -> io::Result<()> {
        if self.page_no == Some(page_no) {
            return Ok(());
        }
        self.flush_page()?;

        self.page.fill(0);
        let offset = page_no * PAGE_ENTRIES * ENTRY_SIZE;
        if offset < self.len {
            let available = ((self.len - offset) as usize).min(self.page.len());
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut self.page[..available])?;
        }
        self.page_no = Some(page_no);
        Ok(())
    }

    fn flush_page(&mut self) -> io::Result<()> {
        if let (true, Some(page_no)) = (self.dirty, self.page_no) {
            let offset = page_no * PAGE_ENTRIES * ENTRY_SIZE;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&self.page)?;
            self.len = self.len.max(offset + self.page.len() as u64);
            self.dirty = false;
        }
        Ok(())
    }

    fn slot(id: i64) -> Option<(u64, usize)> {
        if !(0..MAX_DENSE_ID).contains(&id) {
            return None;
        }
        let id = id as u64;
        Some((
            id / PAGE_ENTRIES,
            ((id % PAGE_ENTRIES) * ENTRY_SIZE) as usize,
        ))
    }
}

impl LocationIndex for DenseFileIndex {
    fn set(&mut self, id: i64, location: Coord<f64>) -> io::Result<()> {
        let (Some((page_no, offset)), Some(encoded)) = (Self::slot(id), Self::encode(location))
        else {
            log::debug!("node {} at {:?} can't be stored in a dense index", id, location);
            return Ok(());
        };

        self.load_page(page_no)?;
        self.page[offset..offset + ENTRY_SIZE as usize].copy_from_slice(&encoded);
        self.dirty = true;
        Ok(())
    }

    fn get(&mut self, id: i64) -> io::Result<Option<Coord<f64>>> {
        let Some((page_no, offset)) = Self::slot(id) else {
            return Ok(None);
        };
        self.load_page(page_no)?;
        Ok(Self::decode(&self.page[offset..offset + ENTRY_SIZE as usize]))
    }
}
