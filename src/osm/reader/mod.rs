// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{self, BufRead};
use std::path::Path;

use crate::error::Result;

pub mod xml;

/// Format of an OSM file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    /// Unknown format - guess the format based on the file name or content
    #[default]
    Unknown,

    /// Uncompressed [OSM XML](https://wiki.openstreetmap.org/wiki/OSM_XML)
    Xml,

    /// [OSM XML](https://wiki.openstreetmap.org/wiki/OSM_XML)
    /// with [gzip](https://en.wikipedia.org/wiki/Gzip) compression
    XmlGz,

    /// [OSM XML](https://wiki.openstreetmap.org/wiki/OSM_XML)
    /// with [bzip2](https://en.wikipedia.org/wiki/Bzip2) compression
    XmlBz2,
}

impl FileFormat {
    /// Guesses the format from the file extension, returning [FileFormat::Unknown]
    /// if the extension is not recognized.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("gz") => Self::XmlGz,
            Some("bz2") => Self::XmlBz2,
            Some("osm") | Some("xml") => Self::Xml,
            _ => Self::Unknown,
        }
    }

    /// Guesses the format from the first bytes of a file.
    /// Anything not starting with a gzip or bzip2 magic number is assumed to be plain XML.
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(&[0x1f, 0x8b]) {
            Self::XmlGz
        } else if head.starts_with(b"BZh") {
            Self::XmlBz2
        } else {
            Self::Xml
        }
    }

    /// Replaces [FileFormat::Unknown] by a guess based on the file name.
    pub fn or_from_path<P: AsRef<Path>>(self, path: P) -> Self {
        match self {
            Self::Unknown => Self::from_path(path),
            known => known,
        }
    }
}

impl std::str::FromStr for FileFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" | "unknown" => Ok(Self::Unknown),
            "xml" | "osm" => Ok(Self::Xml),
            "xml.gz" | "osm.gz" | "gz" => Ok(Self::XmlGz),
            "xml.bz2" | "osm.bz2" | "bz2" => Ok(Self::XmlBz2),
            other => Err(crate::Error::Validation(format!(
                "unknown file format: {:?} (expected auto, xml, xml.gz or xml.bz2)",
                other
            ))),
        }
    }
}

/// Streaming reader over OSM features from any IO source.
pub type FeatureReader<'a> = xml::Reader<xml::IoParser<Box<dyn BufRead + 'a>>>;

/// Opens a streaming reader over OSM features from an IO source.
///
/// The provided stream is automatically wrapped in a buffered reader and a decompressor,
/// as per `format`. [FileFormat::Unknown] is resolved by looking at the first bytes of the stream.
pub fn features_from_io<'a, R: io::Read + 'a>(
    reader: R,
    format: FileFormat,
) -> Result<FeatureReader<'a>> {
    let mut buffered = io::BufReader::new(reader);
    let format = match format {
        FileFormat::Unknown => FileFormat::detect(buffered.fill_buf()?),
        known => known,
    };

    let source: Box<dyn BufRead + 'a> = match format {
        FileFormat::XmlGz => Box::new(io::BufReader::new(flate2::read::MultiGzDecoder::new(
            buffered,
        ))),
        FileFormat::XmlBz2 => Box::new(io::BufReader::new(bzip2::read::MultiBzDecoder::new(
            buffered,
        ))),
        FileFormat::Xml | FileFormat::Unknown => Box::new(buffered),
    };

    Ok(xml::Reader::from_io(source)?)
}

/// Opens a streaming reader over OSM features from a file at the provided path.
pub fn features_from_file<P: AsRef<Path>>(
    path: P,
    format: FileFormat,
) -> Result<FeatureReader<'static>> {
    let format = format.or_from_path(&path);
    let f = File::open(path)?;
    features_from_io(f, format)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::osm::Feature;

    const GRID_XML: &[u8] = include_bytes!("../test_fixtures/grid.osm");

    fn count_ways(reader: FeatureReader<'_>) -> usize {
        reader
            .map(|f| f.unwrap())
            .filter(|f| matches!(f, Feature::Way(_)))
            .count()
    }

    #[test]
    fn format_from_path() {
        assert_eq!(FileFormat::from_path("a/region.osm"), FileFormat::Xml);
        assert_eq!(FileFormat::from_path("region.osm.gz"), FileFormat::XmlGz);
        assert_eq!(FileFormat::from_path("region.osm.bz2"), FileFormat::XmlBz2);
        assert_eq!(FileFormat::from_path("region.osm.pbf"), FileFormat::Unknown);
    }

    #[test]
    fn format_from_str() {
        assert_eq!("xml.gz".parse::<FileFormat>().unwrap(), FileFormat::XmlGz);
        assert!("pbf".parse::<FileFormat>().is_err());
    }

    #[test]
    fn read_plain() {
        let r = features_from_io(io::Cursor::new(GRID_XML), FileFormat::Unknown).unwrap();
        assert_eq!(count_ways(r), 6);
    }

    #[test]
    fn read_gz_detected() {
        let mut e = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        e.write_all(GRID_XML).unwrap();
        let data = e.finish().unwrap();

        let r = features_from_io(io::Cursor::new(data), FileFormat::Unknown).unwrap();
        assert_eq!(count_ways(r), 6);
    }

    #[test]
    fn read_bz2_detected() {
        let mut e = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        e.write_all(GRID_XML).unwrap();
        let data = e.finish().unwrap();

        let r = features_from_io(io::Cursor::new(data), FileFormat::Unknown).unwrap();
        assert_eq!(count_ways(r), 6);
    }
}
