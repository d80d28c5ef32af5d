//! Builds synthetic DM3/DM4 files for tests.
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use super::tags::{DMElementType, DMVersion};

const GROUP_TAG: u8 = 20;
const DATA_TAG: u8 = 21;

#[derive(Debug, Clone)]
pub(crate) enum DMWriteValue {
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
    Bool(bool),
    /// Stored as a `u16` array of UTF-16 code units
    Text(String),
    /// Stored with the 8-bit string type
    Str(String),
    /// A primitive array from its little-endian bytes
    Array(DMElementType, Vec<u8>),
    /// A primitive array whose bytes are not written. It must be the last tag of
    /// the file, and the file must be extended to cover it.
    Declared(DMElementType, u64),
}

#[derive(Debug, Clone)]
enum DMNode {
    Value(DMWriteValue),
    Group(DMGroup),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DMGroup {
    tags: Vec<(String, DMNode)>,
}

fn write_count(out: &mut Vec<u8>, version: DMVersion, n: u64) {
    match version {
        DMVersion::DM3 => out.write_u32::<BigEndian>(n as u32),
        DMVersion::DM4 => out.write_u64::<BigEndian>(n),
    }
    .unwrap();
}

impl DMWriteValue {
    fn info(&self) -> Vec<u64> {
        match self {
            Self::I32(_) => vec![3],
            Self::U32(_) => vec![5],
            Self::F32(_) => vec![6],
            Self::F64(_) => vec![7],
            Self::Bool(_) => vec![8],
            Self::Text(s) => vec![20, 4, s.encode_utf16().count() as u64],
            Self::Str(s) => vec![18, s.len() as u64],
            Self::Array(element, bytes) => {
                vec![20, element.code(), bytes.len() as u64 / element.size_of()]
            }
            Self::Declared(element, length) => vec![20, element.code(), *length],
        }
    }

    /// Write the value bytes, returning the number of bytes declared but not written
    fn write_data(&self, out: &mut Vec<u8>) -> u64 {
        match self {
            Self::I32(v) => out.write_i32::<LittleEndian>(*v).unwrap(),
            Self::U32(v) => out.write_u32::<LittleEndian>(*v).unwrap(),
            Self::F32(v) => out.write_f32::<LittleEndian>(*v).unwrap(),
            Self::F64(v) => out.write_f64::<LittleEndian>(*v).unwrap(),
            Self::Bool(v) => out.push(*v as u8),
            Self::Text(s) => {
                for unit in s.encode_utf16() {
                    out.write_u16::<LittleEndian>(unit).unwrap();
                }
            }
            Self::Str(s) => out.extend_from_slice(s.as_bytes()),
            Self::Array(_, bytes) => out.extend_from_slice(bytes),
            Self::Declared(element, length) => return element.size_of() * length,
        }
        0
    }
}

impl DMGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a value tag, an empty `name` makes it unnamed
    pub(crate) fn push(&mut self, name: &str, value: DMWriteValue) -> &mut Self {
        self.tags.push((name.to_string(), DMNode::Value(value)));
        self
    }

    pub(crate) fn push_group(&mut self, name: &str, group: DMGroup) -> &mut Self {
        self.tags.push((name.to_string(), DMNode::Group(group)));
        self
    }

    fn write_body(&self, version: DMVersion, out: &mut Vec<u8>) -> u64 {
        out.push(0);
        out.push(1);
        write_count(out, version, self.tags.len() as u64);
        let mut declared = 0;
        for (name, node) in self.tags.iter() {
            let mut body = Vec::new();
            let (kind, pending) = match node {
                DMNode::Group(group) => (GROUP_TAG, group.write_body(version, &mut body)),
                DMNode::Value(value) => {
                    body.extend_from_slice(b"%%%%");
                    let info = value.info();
                    write_count(&mut body, version, info.len() as u64);
                    for i in info {
                        write_count(&mut body, version, i);
                    }
                    (DATA_TAG, value.write_data(&mut body))
                }
            };
            out.push(kind);
            out.write_u16::<BigEndian>(name.len() as u16).unwrap();
            out.extend_from_slice(name.as_bytes());
            if version == DMVersion::DM4 {
                out.write_u64::<BigEndian>(body.len() as u64 + pending).unwrap();
            }
            out.extend_from_slice(&body);
            declared += pending;
        }
        declared
    }

    /// Serialize this group as the root of a little-endian file. Returns the bytes
    /// and the number of trailing bytes that were declared but not written.
    pub(crate) fn to_bytes(&self, version: DMVersion) -> (Vec<u8>, u64) {
        let mut body = Vec::new();
        let declared = self.write_body(version, &mut body);
        let mut out = Vec::with_capacity(body.len() + 16);
        match version {
            DMVersion::DM3 => out.write_i32::<BigEndian>(3).unwrap(),
            DMVersion::DM4 => out.write_i32::<BigEndian>(4).unwrap(),
        }
        write_count(&mut out, version, body.len() as u64 + declared);
        out.write_i32::<BigEndian>(1).unwrap();
        out.extend_from_slice(&body);
        (out, declared)
    }

    /// Write the file, extending it with zeros over any declared array
    pub(crate) fn write_to<P: AsRef<Path>>(&self, path: P, version: DMVersion) -> io::Result<()> {
        let (bytes, declared) = self.to_bytes(version);
        let mut handle = fs::File::create(path)?;
        handle.write_all(&bytes)?;
        if declared > 0 {
            handle.set_len(bytes.len() as u64 + declared)?;
        }
        Ok(())
    }
}

/// One entry of a synthetic `ImageList`
#[derive(Debug, Clone)]
pub(crate) struct DMImage {
    pub dims: Vec<u32>,
    pub data_type: i32,
    pub element: DMElementType,
    /// Little-endian pixel bytes, or `None` to leave them sparse
    pub data: Option<Vec<u8>>,
    /// `(scale, origin, units)` for x then y
    pub calibration: Vec<(f32, f32, String)>,
    pub tags: DMGroup,
}

impl DMImage {
    pub(crate) fn new(dims: Vec<u32>, data_type: i32, element: DMElementType) -> Self {
        Self {
            dims,
            data_type,
            element,
            data: None,
            calibration: Vec::new(),
            tags: DMGroup::new(),
        }
    }

    pub(crate) fn data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn calibrate(mut self, scale: f32, origin: f32, units: &str) -> Self {
        self.calibration.push((scale, origin, units.to_string()));
        self
    }

    pub(crate) fn tags(mut self, tags: DMGroup) -> Self {
        self.tags = tags;
        self
    }

    fn to_group(&self) -> DMGroup {
        let mut dimension = DMGroup::new();
        for (scale, origin, units) in self.calibration.iter() {
            let mut axis = DMGroup::new();
            axis.push("Origin", DMWriteValue::F32(*origin))
                .push("Scale", DMWriteValue::F32(*scale))
                .push("Units", DMWriteValue::Text(units.clone()));
            dimension.push_group("", axis);
        }
        let mut calibrations = DMGroup::new();
        calibrations.push_group("Dimension", dimension);

        let mut dims = DMGroup::new();
        for d in self.dims.iter() {
            dims.push("", DMWriteValue::U32(*d));
        }

        let length: u64 = self.dims.iter().map(|d| *d as u64).product();
        let data = match &self.data {
            Some(bytes) => DMWriteValue::Array(self.element, bytes.clone()),
            None => DMWriteValue::Declared(self.element, length),
        };

        let mut image_data = DMGroup::new();
        image_data
            .push_group("Calibrations", calibrations)
            .push("DataType", DMWriteValue::I32(self.data_type))
            .push_group("Dimensions", dims)
            .push("Data", data);

        let mut image = DMGroup::new();
        image
            .push_group("ImageTags", self.tags.clone())
            .push("Name", DMWriteValue::Text("synthetic".into()))
            .push_group("ImageData", image_data);
        image
    }
}

/// Write a DM file holding `images` in `ImageList` order. Only the last image may
/// leave its data sparse.
pub(crate) fn write_dm<P: AsRef<Path>>(
    path: P,
    version: DMVersion,
    images: &[DMImage],
) -> io::Result<()> {
    let mut list = DMGroup::new();
    for image in images {
        list.push_group("", image.to_group());
    }
    let mut root = DMGroup::new();
    root.push("ApplicationBounds", DMWriteValue::Array(DMElementType::I32, vec![0; 16]))
        .push_group("ImageList", list);
    root.write_to(path, version)
}
