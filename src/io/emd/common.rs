use std::io;

use hdf5::types::{FixedAscii, FixedUnicode, FloatSize, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, Container, Dataset, Group, Selection};
use thiserror::Error;

use crate::frame::{DType, Frame};
use crate::io::traits::IngestError;
use crate::params::{Value, ValueMap};

/// The longest fixed-length string read from an attribute
const MAX_FIXED_STRING: usize = 1024;

#[derive(Debug, Error)]
pub enum EMDError {
    #[error("HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("The file holds no EMD datasets")]
    NoDatasets,
    #[error("Unsupported EMD element type {0}")]
    UnsupportedType(String),
    #[error("Malformed EMD structure: {0}")]
    Malformed(String),
    #[error("Invalid Velox metadata JSON: {0}")]
    JSONError(#[from] serde_json::Error),
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl From<EMDError> for IngestError {
    fn from(value: EMDError) -> Self {
        match value {
            EMDError::IOError(e) => IngestError::IOError(e),
            EMDError::UnsupportedType(_) => IngestError::Unsupported(value.to_string()),
            e => IngestError::MetadataParse(e.to_string()),
        }
    }
}

pub(crate) fn dtype_from_descriptor(descriptor: &TypeDescriptor) -> Result<DType, EMDError> {
    let dtype = match descriptor {
        TypeDescriptor::Integer(IntSize::U1) => DType::I8,
        TypeDescriptor::Integer(IntSize::U2) => DType::I16,
        TypeDescriptor::Integer(IntSize::U4) => DType::I32,
        TypeDescriptor::Integer(IntSize::U8) => DType::I64,
        TypeDescriptor::Unsigned(IntSize::U1) => DType::U8,
        TypeDescriptor::Unsigned(IntSize::U2) => DType::U16,
        TypeDescriptor::Unsigned(IntSize::U4) => DType::U32,
        TypeDescriptor::Unsigned(IntSize::U8) => DType::U64,
        TypeDescriptor::Float(FloatSize::U4) => DType::F32,
        TypeDescriptor::Float(FloatSize::U8) => DType::F64,
        other => return Err(EMDError::UnsupportedType(format!("{other:?}"))),
    };
    Ok(dtype)
}

pub(crate) fn dataset_dtype(dataset: &Dataset) -> Result<DType, EMDError> {
    dtype_from_descriptor(&dataset.dtype()?.to_descriptor()?)
}

/// Read one 2-D plane of `dataset` selected by `selection`, converting to `dtype`
pub(crate) fn read_plane<S>(dataset: &Dataset, dtype: DType, selection: S) -> hdf5::Result<Frame>
where
    S: TryInto<Selection>,
    hdf5::Error: From<S::Error>,
{
    let frame = match dtype {
        DType::U8 => dataset.read_slice_2d::<u8, _>(selection)?.into(),
        DType::I8 => dataset.read_slice_2d::<i8, _>(selection)?.into(),
        DType::U16 => dataset.read_slice_2d::<u16, _>(selection)?.into(),
        DType::I16 => dataset.read_slice_2d::<i16, _>(selection)?.into(),
        DType::U32 => dataset.read_slice_2d::<u32, _>(selection)?.into(),
        DType::I32 => dataset.read_slice_2d::<i32, _>(selection)?.into(),
        DType::U64 => dataset.read_slice_2d::<u64, _>(selection)?.into(),
        DType::I64 => dataset.read_slice_2d::<i64, _>(selection)?.into(),
        DType::F32 => dataset.read_slice_2d::<f32, _>(selection)?.into(),
        DType::F64 => dataset.read_slice_2d::<f64, _>(selection)?.into(),
    };
    Ok(frame)
}

/// Read every string held by a string-typed dataset or attribute
pub(crate) fn read_strings(container: &Container) -> Result<Vec<String>, EMDError> {
    let strings = match container.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenUnicode => container
            .read_raw::<VarLenUnicode>()?
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        TypeDescriptor::VarLenAscii => container
            .read_raw::<VarLenAscii>()?
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        TypeDescriptor::FixedAscii(_) => container
            .read_raw::<FixedAscii<MAX_FIXED_STRING>>()?
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        TypeDescriptor::FixedUnicode(_) => container
            .read_raw::<FixedUnicode<MAX_FIXED_STRING>>()?
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        other => {
            return Err(EMDError::Malformed(format!(
                "expected a string, found {other:?}"
            )))
        }
    };
    Ok(strings)
}

fn collapse<T: Into<Value>>(values: Vec<T>, scalar: bool) -> Value {
    if scalar && values.len() == 1 {
        values.into_iter().next().map(Into::into).unwrap_or_default()
    } else {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

/// Decode an attribute into a [`Value`]. Compound and reference types become [`Value::Empty`].
pub(crate) fn attr_value(attr: &Attribute) -> Result<Value, EMDError> {
    let scalar = attr.is_scalar() || attr.size() == 1;
    let value = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) => collapse(attr.read_raw::<i64>()?, scalar),
        TypeDescriptor::Unsigned(_) => collapse(attr.read_raw::<u64>()?, scalar),
        TypeDescriptor::Float(_) => collapse(attr.read_raw::<f64>()?, scalar),
        TypeDescriptor::Boolean => collapse(attr.read_raw::<bool>()?, scalar),
        TypeDescriptor::VarLenUnicode
        | TypeDescriptor::VarLenAscii
        | TypeDescriptor::FixedAscii(_)
        | TypeDescriptor::FixedUnicode(_) => collapse(read_strings(attr)?, scalar),
        _ => Value::Empty,
    };
    Ok(value)
}

/// All attributes of `group` as a map. Attributes that cannot be decoded are skipped.
pub(crate) fn group_attrs(group: &Group) -> Result<ValueMap, EMDError> {
    let mut attrs = ValueMap::new();
    for name in group.attr_names()? {
        match group.attr(&name).map_err(EMDError::from).and_then(|a| attr_value(&a)) {
            Ok(value) => {
                attrs.insert(name, value);
            }
            Err(e) => log::debug!("Skipping attribute {name} of {}: {e}", group.name()),
        }
    }
    Ok(attrs)
}
