// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::io;

use quick_xml::events::{BytesStart, Event};

use crate::osm::model::{Attributes, Feature, FeatureType, Node, Relation, RelationMember, Way};

/// Parser is a trait for objects which can parse XML.
///
/// This trait only exists to fix the mismatch of
/// [quick_xml::Reader::read_event] when working on buffered data
/// and [quick_xml::Reader::read_event_into] when working on IO.
pub trait Parser {
    fn read_event<'a>(&'a mut self) -> quick_xml::Result<Event<'a>>;
}

/// IoParser implements [Parser] over an [std::io::BufRead].
pub struct IoParser<R: io::BufRead>(quick_xml::Reader<R>, Vec<u8>);

impl<R: io::BufRead> IoParser<R> {
    #[inline]
    fn new(reader: R) -> Self {
        Self(quick_xml::Reader::from_reader(reader), Vec::default())
    }
}

impl<R: io::BufRead> Parser for IoParser<R> {
    #[inline]
    fn read_event<'a>(&'a mut self) -> quick_xml::Result<Event<'a>> {
        self.1.clear();
        self.0.read_event_into(&mut self.1)
    }
}

/// BufParser implements [Parser] over a slice of bytes (`&[u8]`).
pub struct BufParser<'a>(quick_xml::Reader<&'a [u8]>);

impl<'a> BufParser<'a> {
    #[inline]
    fn new(data: &'a [u8]) -> Self {
        Self(quick_xml::Reader::from_reader(data))
    }
}

impl<'a> Parser for BufParser<'a> {
    #[inline]
    fn read_event<'b>(&'b mut self) -> quick_xml::Result<Event<'b>> {
        self.0.read_event()
    }
}

/// Reader streams osm [Features](Feature) from an XML file, in file order.
///
/// The root element is consumed when the reader is created;
/// its attributes are available through [Reader::root_attributes].
/// Elements which can't be represented (no valid id or reference, unknown
/// member type) are dropped with a warning and counted in [Reader::skipped].
pub struct Reader<P: Parser> {
    parser: P,
    root: Attributes,
    eof: bool,
    skipped: u64,
}

impl<P: Parser> Reader<P> {
    fn new(parser: P) -> quick_xml::Result<Self> {
        let mut r = Self {
            parser,
            root: Attributes::default(),
            eof: false,
            skipped: 0,
        };
        r.read_root()?;
        Ok(r)
    }

    /// Attributes of the `<osm>` root element (`version`, `generator`, ...).
    pub fn root_attributes(&self) -> &Attributes {
        &self.root
    }

    /// Number of elements dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn read_root(&mut self) -> quick_xml::Result<()> {
        loop {
            match self.parser.read_event()? {
                Event::Start(start) => {
                    if start.local_name().as_ref() != b"osm" {
                        log::warn!(
                            "unexpected root element <{}>, reading it as <osm>",
                            String::from_utf8_lossy(start.local_name().as_ref())
                        );
                    }
                    self.root = collect_attributes(&start)?;
                    return Ok(());
                }
                Event::Empty(start) => {
                    self.root = collect_attributes(&start)?;
                    self.eof = true;
                    return Ok(());
                }
                Event::Eof => {
                    self.eof = true;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn next_feature(&mut self) -> quick_xml::Result<Option<Feature>> {
        let mut f: Option<Feature> = None;

        while !self.eof {
            match self.parser.read_event()? {
                Event::Empty(start) => match start.local_name().as_ref() {
                    b"node" => {
                        if let Some(n) = counted(&mut self.skipped, parse_node(&start)?) {
                            return Ok(Some(Feature::Node(n)));
                        }
                    }
                    b"bounds" => return Ok(Some(Feature::Bounds(collect_attributes(&start)?))),
                    b"way" => {
                        if let Some(w) = counted(&mut self.skipped, parse_way(&start)?) {
                            return Ok(Some(Feature::Way(w)));
                        }
                    }
                    b"relation" => {
                        if let Some(r) = counted(&mut self.skipped, parse_relation(&start)?) {
                            return Ok(Some(Feature::Relation(r)));
                        }
                    }
                    b"tag" => {
                        if let Some(tags) = feature_tags(&mut f) {
                            if let Some((k, v)) = parse_tag(&start)? {
                                tags.insert(k, v);
                            }
                        }
                    }
                    b"nd" => {
                        if let Some(nodes) = feature_nodes(&mut f) {
                            if let Some(ref_) = counted(&mut self.skipped, parse_nd(&start)?) {
                                nodes.push(ref_);
                            }
                        }
                    }
                    b"member" => {
                        if let Some(members) = feature_members(&mut f) {
                            if let Some(member) = counted(&mut self.skipped, parse_member(&start)?) {
                                members.push(member);
                            }
                        }
                    }
                    _ => {}
                },

                Event::Start(start) => match start.local_name().as_ref() {
                    b"node" => f = counted(&mut self.skipped, parse_node(&start)?).map(Feature::Node),
                    b"way" => f = counted(&mut self.skipped, parse_way(&start)?).map(Feature::Way),
                    b"relation" => f = counted(&mut self.skipped, parse_relation(&start)?).map(Feature::Relation),
                    _ => {}
                },

                Event::End(end) => match end.local_name().as_ref() {
                    b"node" | b"way" | b"relation" => {
                        if let Some(f) = f.take() {
                            return Ok(Some(f));
                        }
                    }
                    b"osm" => self.eof = true,
                    _ => {}
                },

                Event::Eof => self.eof = true,

                _ => {}
            }
        }

        Ok(f)
    }
}

impl<P: Parser> Iterator for Reader<P> {
    type Item = Result<Feature, quick_xml::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_feature() {
            Ok(f) => f.map(Ok),
            Err(e) => {
                self.eof = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a> Reader<BufParser<'a>> {
    #[inline]
    pub fn from_buffer(data: &'a [u8]) -> quick_xml::Result<Self> {
        Self::new(BufParser::new(data))
    }
}

impl<R: io::BufRead> Reader<IoParser<R>> {
    #[inline]
    pub fn from_io(reader: R) -> quick_xml::Result<Self> {
        Self::new(IoParser::new(reader))
    }
}

fn counted<T>(skipped: &mut u64, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        *skipped += 1;
    }
    parsed
}

fn collect_attributes(start: &BytesStart<'_>) -> quick_xml::Result<Attributes> {
    let mut attributes = Attributes::default();
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn take_id(attributes: &mut Attributes, element: &str) -> Option<i64> {
    match attributes.remove("id").and_then(|v| v.parse().ok()) {
        Some(0) | None => {
            log::warn!("skipping <{}> without a valid id", element);
            None
        }
        Some(id) => Some(id),
    }
}

fn take_coordinate(attributes: &mut Attributes, key: &str) -> f64 {
    attributes
        .remove(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(f64::NAN)
}

fn parse_node(start: &BytesStart<'_>) -> quick_xml::Result<Option<Node>> {
    let mut attributes = collect_attributes(start)?;
    let Some(id) = take_id(&mut attributes, "node") else {
        return Ok(None);
    };
    let lat = take_coordinate(&mut attributes, "lat");
    let lon = take_coordinate(&mut attributes, "lon");
    Ok(Some(Node {
        id,
        lat,
        lon,
        attributes,
        tags: Default::default(),
    }))
}

fn parse_way(start: &BytesStart<'_>) -> quick_xml::Result<Option<Way>> {
    let mut attributes = collect_attributes(start)?;
    Ok(take_id(&mut attributes, "way").map(|id| Way {
        id,
        nodes: Vec::default(),
        attributes,
        tags: Default::default(),
    }))
}

fn parse_relation(start: &BytesStart<'_>) -> quick_xml::Result<Option<Relation>> {
    let mut attributes = collect_attributes(start)?;
    Ok(take_id(&mut attributes, "relation").map(|id| Relation {
        id,
        members: Vec::default(),
        attributes,
        tags: Default::default(),
    }))
}

fn parse_tag(start: &BytesStart<'_>) -> quick_xml::Result<Option<(String, String)>> {
    let mut attributes = collect_attributes(start)?;
    Ok(attributes
        .remove("k")
        .map(|k| (k, attributes.remove("v").unwrap_or_default())))
}

fn parse_nd(start: &BytesStart<'_>) -> quick_xml::Result<Option<i64>> {
    let mut attributes = collect_attributes(start)?;
    let ref_ = attributes
        .remove("ref")
        .and_then(|v| v.parse().ok())
        .filter(|&ref_: &i64| ref_ != 0);
    if ref_.is_none() {
        log::warn!("skipping <nd> without a valid ref");
    }
    Ok(ref_)
}

fn parse_member(start: &BytesStart<'_>) -> quick_xml::Result<Option<RelationMember>> {
    let mut attributes = collect_attributes(start)?;
    let ref_: i64 = attributes
        .remove("ref")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let type_ = attributes.remove("type").and_then(|t| parse_feature_type(&t));
    let role = attributes.remove("role");

    match (ref_, type_) {
        (0, _) | (_, None) => {
            log::warn!("skipping <member> without a valid ref or type");
            Ok(None)
        }
        (ref_, Some(type_)) => Ok(Some(RelationMember {
            type_,
            ref_,
            role: role.unwrap_or_default(),
        })),
    }
}

fn parse_feature_type(s: &str) -> Option<FeatureType> {
    match s {
        "node" => Some(FeatureType::Node),
        "way" => Some(FeatureType::Way),
        "relation" => Some(FeatureType::Relation),
        _ => None,
    }
}

fn feature_tags(f: &mut Option<Feature>) -> Option<&mut crate::osm::Tags> {
    match f {
        Some(Feature::Node(ref mut n)) => Some(&mut n.tags),
        Some(Feature::Way(ref mut w)) => Some(&mut w.tags),
        Some(Feature::Relation(ref mut r)) => Some(&mut r.tags),
        _ => None,
    }
}

fn feature_nodes(f: &mut Option<Feature>) -> Option<&mut Vec<i64>> {
    match f {
        Some(Feature::Way(ref mut w)) => Some(&mut w.nodes),
        _ => None,
    }
}

fn feature_members(f: &mut Option<Feature>) -> Option<&mut Vec<RelationMember>> {
    match f {
        Some(Feature::Relation(ref mut r)) => Some(&mut r.members),
        _ => None,
    }
}
