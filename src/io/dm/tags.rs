use std::io::{self, prelude::*, SeekFrom};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use indexmap::IndexMap;
use log::trace;
use thiserror::Error;

use crate::frame::DType;
use crate::io::traits::IngestError;
use crate::io::utils::Endian;
use crate::params::Value;

const GROUP_TAG: u8 = 20;
const DATA_TAG: u8 = 21;
const END_TAG: u8 = 0;

const STRUCT_TYPE: u64 = 15;
const STRING_TYPE: u64 = 18;
const ARRAY_TYPE: u64 = 20;

const MAX_DEPTH: usize = 64;
const MAX_INFO_LEN: u64 = 1 << 16;
/// Arrays up to this many bytes are read into the tag tree, larger ones are only located
const INLINE_ARRAY_BYTES: u64 = 1024;
/// `u16` arrays up to this length are treated as UTF-16 text
const INLINE_TEXT_LEN: u64 = 4096;

#[derive(Debug, Error)]
pub enum DMError {
    #[error("Unrecognized DM version {0}")]
    NotDM(i32),
    #[error("Malformed tag structure: {0}")]
    Malformed(String),
    #[error("Unsupported DM image data type {0}")]
    UnsupportedDataType(i64),
    #[error("No image was found in the tag tree")]
    MissingImage,
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl From<DMError> for IngestError {
    fn from(value: DMError) -> Self {
        match value {
            DMError::IOError(e) => IngestError::IOError(e),
            DMError::UnsupportedDataType(_) => IngestError::Unsupported(value.to_string()),
            e => IngestError::MetadataParse(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DMVersion {
    DM3,
    DM4,
}

impl DMVersion {
    /// Counts and sizes are 32-bit in DM3 and 64-bit in DM4
    fn read_count<R: Read>(&self, reader: &mut R) -> io::Result<u64> {
        match self {
            DMVersion::DM3 => reader.read_u32::<BigEndian>().map(|v| v as u64),
            DMVersion::DM4 => reader.read_u64::<BigEndian>(),
        }
    }
}

/// The primitive value types of the tag format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DMElementType {
    I16,
    I32,
    U16,
    U32,
    F32,
    F64,
    Bool,
    I8,
    U8,
    I64,
    U64,
}

impl DMElementType {
    pub fn from_code(code: u64) -> Option<Self> {
        let t = match code {
            2 => Self::I16,
            3 => Self::I32,
            4 => Self::U16,
            5 => Self::U32,
            6 => Self::F32,
            7 => Self::F64,
            8 => Self::Bool,
            9 => Self::I8,
            10 => Self::U8,
            11 => Self::I64,
            12 => Self::U64,
            _ => return None,
        };
        Some(t)
    }

    pub fn code(&self) -> u64 {
        match self {
            Self::I16 => 2,
            Self::I32 => 3,
            Self::U16 => 4,
            Self::U32 => 5,
            Self::F32 => 6,
            Self::F64 => 7,
            Self::Bool => 8,
            Self::I8 => 9,
            Self::U8 => 10,
            Self::I64 => 11,
            Self::U64 => 12,
        }
    }

    pub fn size_of(&self) -> u64 {
        self.dtype().size_of() as u64
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::I16 => DType::I16,
            Self::I32 => DType::I32,
            Self::U16 => DType::U16,
            Self::U32 => DType::U32,
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
            Self::Bool | Self::U8 => DType::U8,
            Self::I8 => DType::I8,
            Self::I64 => DType::I64,
            Self::U64 => DType::U64,
        }
    }
}

/// The location of an array that was not read while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DMArrayRef {
    pub offset: u64,
    pub element: DMElementType,
    pub length: u64,
}

/// Test whether a buffer starting at the beginning of a file looks like a DM3 or DM4 header
pub fn is_dm(buf: &[u8]) -> bool {
    if buf.len() < 16 {
        return false;
    }
    let word = |at: usize| i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    match word(0) {
        3 => matches!(word(8), 0 | 1),
        4 => matches!(word(12), 0 | 1),
        _ => false,
    }
}

/// A flattened DM tag tree. Keys are dotted paths, and unnamed tags are named by
/// their 1-based position in their group, e.g. `ImageList.2.ImageData.Dimensions.1`.
#[derive(Debug, Clone)]
pub struct DMTagTree {
    pub version: DMVersion,
    pub endian: Endian,
    values: IndexMap<String, Value>,
    arrays: IndexMap<String, DMArrayRef>,
    groups: IndexMap<String, u64>,
}

impl DMTagTree {
    pub fn parse<R: Read + Seek>(reader: R) -> Result<Self, DMError> {
        TagParser::new(reader)?.parse()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Every tag value in file order
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn array(&self, key: &str) -> Option<&DMArrayRef> {
        self.arrays.get(key)
    }

    /// The number of tags directly inside the group at `key`
    pub fn group_len(&self, key: &str) -> Option<u64> {
        self.groups.get(key).copied()
    }
}

macro_rules! read_endian {
    ($reader:expr, $endian:expr, $method:ident) => {
        match $endian {
            Endian::Little => $reader.$method::<LittleEndian>(),
            Endian::Big => $reader.$method::<BigEndian>(),
        }
    };
}

struct TagParser<R: Read + Seek> {
    reader: R,
    version: DMVersion,
    endian: Endian,
    file_size: u64,
    values: IndexMap<String, Value>,
    arrays: IndexMap<String, DMArrayRef>,
    groups: IndexMap<String, u64>,
}

impl<R: Read + Seek> TagParser<R> {
    fn new(mut reader: R) -> Result<Self, DMError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let version = match reader.read_i32::<BigEndian>()? {
            3 => DMVersion::DM3,
            4 => DMVersion::DM4,
            v => return Err(DMError::NotDM(v)),
        };
        let _root_size = version.read_count(&mut reader)?;
        let endian = match reader.read_i32::<BigEndian>()? {
            1 => Endian::Little,
            0 => Endian::Big,
            v => return Err(DMError::Malformed(format!("invalid byte order flag {v}"))),
        };
        Ok(Self {
            reader,
            version,
            endian,
            file_size,
            values: IndexMap::new(),
            arrays: IndexMap::new(),
            groups: IndexMap::new(),
        })
    }

    fn parse(mut self) -> Result<DMTagTree, DMError> {
        self.parse_group("", 0)?;
        Ok(DMTagTree {
            version: self.version,
            endian: self.endian,
            values: self.values,
            arrays: self.arrays,
            groups: self.groups,
        })
    }

    fn malformed<T>(&self, message: String) -> Result<T, DMError> {
        Err(DMError::Malformed(message))
    }

    fn parse_group(&mut self, path: &str, depth: usize) -> Result<(), DMError> {
        if depth > MAX_DEPTH {
            return self.malformed(format!("tag groups nested deeper than {MAX_DEPTH} at {path}"));
        }
        let _sorted = self.reader.read_u8()?;
        let _open = self.reader.read_u8()?;
        let count = self.version.read_count(&mut self.reader)?;
        if count > self.file_size {
            return self.malformed(format!("group {path} claims {count} tags"));
        }
        self.groups.insert(path.to_string(), count);

        for position in 1..=count {
            let kind = self.reader.read_u8()?;
            if kind == END_TAG {
                break;
            }
            let name_len = self.reader.read_u16::<BigEndian>()? as usize;
            let mut name = vec![0u8; name_len];
            self.reader.read_exact(&mut name)?;
            let name = if name_len == 0 {
                position.to_string()
            } else {
                String::from_utf8_lossy(&name).into_owned()
            };
            let key = if path.is_empty() {
                name
            } else {
                format!("{path}.{name}")
            };
            if self.version == DMVersion::DM4 {
                let _tag_size = self.reader.read_u64::<BigEndian>()?;
            }
            match kind {
                GROUP_TAG => self.parse_group(&key, depth + 1)?,
                DATA_TAG => self.parse_data(key)?,
                _ => return self.malformed(format!("unknown tag kind {kind} at {key}")),
            }
        }
        Ok(())
    }

    fn element(&self, code: u64, key: &str) -> Result<DMElementType, DMError> {
        DMElementType::from_code(code)
            .ok_or_else(|| DMError::Malformed(format!("unknown value type {code} at {key}")))
    }

    fn read_simple(&mut self, element: DMElementType) -> io::Result<Value> {
        let value = match element {
            DMElementType::I16 => read_endian!(self.reader, self.endian, read_i16)?.into(),
            DMElementType::I32 => read_endian!(self.reader, self.endian, read_i32)?.into(),
            DMElementType::U16 => read_endian!(self.reader, self.endian, read_u16)?.into(),
            DMElementType::U32 => read_endian!(self.reader, self.endian, read_u32)?.into(),
            DMElementType::F32 => read_endian!(self.reader, self.endian, read_f32)?.into(),
            DMElementType::F64 => read_endian!(self.reader, self.endian, read_f64)?.into(),
            DMElementType::I64 => read_endian!(self.reader, self.endian, read_i64)?.into(),
            DMElementType::U64 => read_endian!(self.reader, self.endian, read_u64)?.into(),
            DMElementType::Bool => (self.reader.read_u8()? != 0).into(),
            DMElementType::I8 => self.reader.read_i8()?.into(),
            DMElementType::U8 => self.reader.read_u8()?.into(),
        };
        Ok(value)
    }

    /// Check that `n_bytes` can be read from the current position, returning that position
    fn ensure_available(&mut self, n_bytes: u64, key: &str) -> Result<u64, DMError> {
        let position = self.reader.stream_position()?;
        if position.saturating_add(n_bytes) > self.file_size {
            return self.malformed(format!(
                "{key} needs {n_bytes} bytes at offset {position}, past the end of the file"
            ));
        }
        Ok(position)
    }

    fn skip(&mut self, n_bytes: u64, key: &str) -> Result<u64, DMError> {
        let position = self.ensure_available(n_bytes, key)?;
        self.reader.seek(SeekFrom::Start(position + n_bytes))?;
        Ok(position)
    }

    fn parse_data(&mut self, key: String) -> Result<(), DMError> {
        let mut marker = [0u8; 4];
        self.reader.read_exact(&mut marker)?;
        if &marker != b"%%%%" {
            return self.malformed(format!("missing data marker at {key}"));
        }
        let n_info = self.version.read_count(&mut self.reader)?;
        if n_info == 0 || n_info > MAX_INFO_LEN {
            return self.malformed(format!("invalid type description length {n_info} at {key}"));
        }
        let info = (0..n_info)
            .map(|_| self.version.read_count(&mut self.reader))
            .collect::<io::Result<Vec<u64>>>()?;

        match info.as_slice() {
            [code] => {
                let element = self.element(*code, &key)?;
                let value = self.read_simple(element)?;
                self.values.insert(key, value);
            }
            [STRING_TYPE, length] => {
                self.ensure_available(*length, &key)?;
                let mut buf = vec![0u8; *length as usize];
                self.reader.read_exact(&mut buf)?;
                self.values
                    .insert(key, String::from_utf8_lossy(&buf).into_owned().into());
            }
            [STRUCT_TYPE, _, n_fields, fields @ ..]
                if n_fields.checked_mul(2) == Some(fields.len() as u64) =>
            {
                let elements = fields
                    .chunks(2)
                    .map(|pair| self.element(pair[1], &key))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.read_simple(element)?);
                }
                self.values.insert(key, Value::Array(values));
            }
            [ARRAY_TYPE, code, length] if *code != STRUCT_TYPE => {
                let element = self.element(*code, &key)?;
                self.parse_array(key, element, *length)?;
            }
            [ARRAY_TYPE, STRUCT_TYPE, _, n_fields, rest @ ..]
                if n_fields.checked_mul(2).map(|n| n + 1) == Some(rest.len() as u64) =>
            {
                let mut struct_size = 0;
                for pair in rest[..rest.len() - 1].chunks(2) {
                    struct_size += self.element(pair[1], &key)?.size_of();
                }
                let length = rest[rest.len() - 1];
                trace!("Skipping array of {length} structs at {key}");
                self.skip(struct_size.saturating_mul(length), &key)?;
            }
            _ => return self.malformed(format!("unsupported type description {info:?} at {key}")),
        }
        Ok(())
    }

    fn parse_array(&mut self, key: String, element: DMElementType, length: u64) -> Result<(), DMError> {
        let n_bytes = length.saturating_mul(element.size_of());
        let is_image_data = key.ends_with(".Data");
        if !is_image_data && element == DMElementType::U16 && length <= INLINE_TEXT_LEN {
            let mut units = Vec::with_capacity(length as usize);
            for _ in 0..length {
                units.push(read_endian!(self.reader, self.endian, read_u16)?);
            }
            let text: String = char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();
            self.values.insert(key, text.into());
        } else if !is_image_data && n_bytes <= INLINE_ARRAY_BYTES {
            let mut values = Vec::with_capacity(length as usize);
            for _ in 0..length {
                values.push(self.read_simple(element)?);
            }
            self.values.insert(key, Value::Array(values));
        } else {
            let offset = self.skip(n_bytes, &key)?;
            self.arrays.insert(
                key,
                DMArrayRef {
                    offset,
                    element,
                    length,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::dm::writer::{DMGroup, DMWriteValue};

    fn sample(version: DMVersion) -> Vec<u8> {
        let mut dimensions = DMGroup::new();
        dimensions.push("", DMWriteValue::U32(16));
        dimensions.push("", DMWriteValue::U32(8));
        let mut inner = DMGroup::new();
        inner.push("Scale", DMWriteValue::F32(0.5));
        inner.push("Units", DMWriteValue::Text("nm".into()));
        inner.push_group("Dimensions", dimensions);
        let mut root = DMGroup::new();
        root.push_group("Root", inner);
        root.to_bytes(version).0
    }

    #[test]
    fn test_parse_dm3_and_dm4() -> Result<(), DMError> {
        for version in [DMVersion::DM3, DMVersion::DM4] {
            let bytes = sample(version);
            assert!(is_dm(&bytes));
            let tree = DMTagTree::parse(io::Cursor::new(bytes))?;
            assert_eq!(tree.version, version);
            assert_eq!(tree.get("Root.Scale"), Some(&Value::Float(0.5)));
            assert_eq!(tree.get("Root.Units"), Some(&Value::from("nm")));
            assert_eq!(tree.get("Root.Dimensions.1"), Some(&Value::Int(16)));
            assert_eq!(tree.get("Root.Dimensions.2"), Some(&Value::Int(8)));
            assert_eq!(tree.group_len("Root.Dimensions"), Some(2));
        }
        Ok(())
    }

    #[test]
    fn test_truncated() {
        let mut bytes = sample(DMVersion::DM3);
        bytes.truncate(bytes.len() - 3);
        assert!(DMTagTree::parse(io::Cursor::new(bytes)).is_err());
        assert!(matches!(
            DMTagTree::parse(io::Cursor::new(vec![0u8, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 1])),
            Err(DMError::NotDM(7))
        ));
        assert!(!is_dm(b"MAP "));
    }
}
