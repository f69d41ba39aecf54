// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use super::model::{Attributes, Feature, Node, Relation, Tags, Way};
use super::FileFormat;
use crate::error::Result;

/// Destination of an OSM file, optionally compressed.
pub enum Sink {
    Plain(BufWriter<File>),
    Gz(flate2::write::GzEncoder<BufWriter<File>>),
    Bz2(bzip2::write::BzEncoder<BufWriter<File>>),
}

impl Sink {
    /// Creates (or truncates) a file at the given path.
    /// [FileFormat::Unknown] is resolved from the file extension, falling back to plain XML.
    pub fn create<P: AsRef<Path>>(path: P, format: FileFormat) -> io::Result<Self> {
        let format = format.or_from_path(&path);
        let f = BufWriter::new(File::create(path)?);
        Ok(match format {
            FileFormat::XmlGz => Self::Gz(flate2::write::GzEncoder::new(
                f,
                flate2::Compression::default(),
            )),
            FileFormat::XmlBz2 => Self::Bz2(bzip2::write::BzEncoder::new(
                f,
                bzip2::Compression::default(),
            )),
            FileFormat::Xml | FileFormat::Unknown => Self::Plain(f),
        })
    }

    /// Writes any compression trailers and flushes the file.
    pub fn finish(self) -> io::Result<()> {
        let mut f = match self {
            Self::Plain(f) => f,
            Self::Gz(e) => e.finish()?,
            Self::Bz2(e) => e.finish()?,
        };
        f.flush()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(f) => f.write(buf),
            Self::Gz(e) => e.write(buf),
            Self::Bz2(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(f) => f.flush(),
            Self::Gz(e) => e.flush(),
            Self::Bz2(e) => e.flush(),
        }
    }
}

/// Writer emits [Features](Feature) as [OSM XML](https://wiki.openstreetmap.org/wiki/OSM_XML).
///
/// Call [Writer::write_header] once before any feature and [Writer::finish] after the last one.
pub struct Writer<W: Write> {
    xml: quick_xml::Writer<W>,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            xml: quick_xml::Writer::new_with_indent(inner, b' ', 2),
        }
    }

    /// Writes the XML declaration and opens the `<osm>` root element.
    /// Without any root attributes, `version="0.6"` is used.
    pub fn write_header(&mut self, root: &Attributes) -> Result<()> {
        self.xml
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut osm = BytesStart::new("osm");
        if root.is_empty() {
            osm.push_attribute(("version", "0.6"));
            osm.push_attribute(("generator", env!("CARGO_PKG_NAME")));
        } else {
            osm.extend_attributes(root.iter());
        }
        self.xml.write_event(Event::Start(osm))?;
        Ok(())
    }

    pub fn write(&mut self, f: &Feature) -> Result<()> {
        match f {
            Feature::Bounds(attributes) => {
                let mut el = BytesStart::new("bounds");
                el.extend_attributes(attributes.iter());
                self.xml.write_event(Event::Empty(el))?;
                Ok(())
            }
            Feature::Node(n) => self.write_node(n),
            Feature::Way(w) => self.write_way(w),
            Feature::Relation(r) => self.write_relation(r),
        }
    }

    /// Closes the root element and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.xml.write_event(Event::End(BytesEnd::new("osm")))?;
        self.xml.get_mut().write_all(b"\n")?;
        Ok(self.xml.into_inner())
    }

    fn write_node(&mut self, n: &Node) -> Result<()> {
        let id = n.id.to_string();
        let mut el = BytesStart::new("node");
        el.push_attribute(("id", id.as_str()));
        el.extend_attributes(n.attributes.iter());
        if n.has_location() {
            let lat = n.lat.to_string();
            let lon = n.lon.to_string();
            el.push_attribute(("lat", lat.as_str()));
            el.push_attribute(("lon", lon.as_str()));
        }

        if n.tags.is_empty() {
            self.xml.write_event(Event::Empty(el))?;
        } else {
            self.xml.write_event(Event::Start(el))?;
            self.write_tags(&n.tags)?;
            self.xml.write_event(Event::End(BytesEnd::new("node")))?;
        }
        Ok(())
    }

    fn write_way(&mut self, w: &Way) -> Result<()> {
        let id = w.id.to_string();
        let mut el = BytesStart::new("way");
        el.push_attribute(("id", id.as_str()));
        el.extend_attributes(w.attributes.iter());

        if w.nodes.is_empty() && w.tags.is_empty() {
            self.xml.write_event(Event::Empty(el))?;
            return Ok(());
        }

        self.xml.write_event(Event::Start(el))?;
        for node_id in &w.nodes {
            let ref_ = node_id.to_string();
            let mut nd = BytesStart::new("nd");
            nd.push_attribute(("ref", ref_.as_str()));
            self.xml.write_event(Event::Empty(nd))?;
        }
        self.write_tags(&w.tags)?;
        self.xml.write_event(Event::End(BytesEnd::new("way")))?;
        Ok(())
    }

    fn write_relation(&mut self, r: &Relation) -> Result<()> {
        let id = r.id.to_string();
        let mut el = BytesStart::new("relation");
        el.push_attribute(("id", id.as_str()));
        el.extend_attributes(r.attributes.iter());

        if r.members.is_empty() && r.tags.is_empty() {
            self.xml.write_event(Event::Empty(el))?;
            return Ok(());
        }

        self.xml.write_event(Event::Start(el))?;
        for m in &r.members {
            let ref_ = m.ref_.to_string();
            let mut member = BytesStart::new("member");
            member.push_attribute(("type", m.type_.as_str()));
            member.push_attribute(("ref", ref_.as_str()));
            member.push_attribute(("role", m.role.as_str()));
            self.xml.write_event(Event::Empty(member))?;
        }
        self.write_tags(&r.tags)?;
        self.xml.write_event(Event::End(BytesEnd::new("relation")))?;
        Ok(())
    }

    fn write_tags(&mut self, tags: &Tags) -> Result<()> {
        for (k, v) in tags.iter() {
            let mut tag = BytesStart::new("tag");
            tag.push_attribute(("k", k));
            tag.push_attribute(("v", v));
            self.xml.write_event(Event::Empty(tag))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::reader::xml::Reader;

    const GRID_XML: &[u8] = include_bytes!("test_fixtures/grid.osm");

    #[test]
    fn rewrite_preserves_features() {
        let reader = Reader::from_buffer(GRID_XML).unwrap();
        let root = reader.root_attributes().clone();
        let original: Vec<Feature> = reader.map(|f| f.unwrap()).collect();

        let mut w = Writer::new(Vec::new());
        w.write_header(&root).unwrap();
        for f in &original {
            w.write(f).unwrap();
        }
        let data = w.finish().unwrap();

        let reread = Reader::from_buffer(&data).unwrap();
        assert_eq!(reread.root_attributes(), &root);
        let rewritten: Vec<Feature> = reread.map(|f| f.unwrap()).collect();
        assert_eq!(rewritten, original);
    }

    #[test]
    fn special_characters_are_escaped() {
        let mut w = Writer::new(Vec::new());
        w.write_header(&Attributes::default()).unwrap();
        w.write(&Feature::Way(Way {
            id: 7,
            nodes: vec![1, 2],
            attributes: Attributes::default(),
            tags: Tags::from_iter([("name", "<A & B>")]),
        }))
        .unwrap();
        let data = String::from_utf8(w.finish().unwrap()).unwrap();

        assert!(data.contains(r#"v="&lt;A &amp; B&gt;""#), "{}", data);
        assert!(data.contains(r#"<osm version="0.6""#), "{}", data);
    }
}
