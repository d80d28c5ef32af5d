use std::path::Path;

use hdf5::types::VarLenUnicode;
use hdf5::{File, Group, H5Type, Location};
use ndarray::{Array1, ArrayViewD};

use super::common::EMDError;

const EMD_VERSION: (i32, i32) = (0, 2);
const METADATA_GROUPS: &[&str] = &["user", "microscope", "sample", "comments"];

fn to_unicode(text: &str) -> Result<VarLenUnicode, EMDError> {
    text.parse::<VarLenUnicode>()
        .map_err(|e| EMDError::Malformed(e.to_string()))
}

fn write_text_attr(location: &Location, name: &str, text: &str) -> Result<(), EMDError> {
    let value = to_unicode(text)?;
    location
        .new_attr::<VarLenUnicode>()
        .shape(())
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn write_scalar_attr<T: H5Type>(location: &Location, name: &str, value: &T) -> Result<(), EMDError> {
    location
        .new_attr::<T>()
        .shape(())
        .create(name)?
        .write_scalar(value)?;
    Ok(())
}

/// Writes Berkeley EMD files: each call to [`EMDWriter::put_group`] adds a tagged
/// group under `/data` holding the array and one coordinate vector per axis.
///
/// The file is closed when the writer is dropped.
#[derive(Debug)]
pub struct EMDWriter {
    handle: File,
}

impl EMDWriter {
    /// Create a new file at `path`, replacing any existing one
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, EMDError> {
        let handle = File::create(path.as_ref())?;
        write_scalar_attr(&handle, "version_major", &EMD_VERSION.0)?;
        write_scalar_attr(&handle, "version_minor", &EMD_VERSION.1)?;
        handle.create_group("data")?;
        for name in METADATA_GROUPS {
            handle.create_group(name)?;
        }
        Ok(Self { handle })
    }

    fn metadata_group(&self, name: &str) -> Result<Group, EMDError> {
        Ok(self.handle.group(name)?)
    }

    /// Record a text attribute under `/user`
    pub fn user_attr(&self, name: &str, value: &str) -> Result<&Self, EMDError> {
        write_text_attr(&self.metadata_group("user")?, name, value)?;
        Ok(self)
    }

    /// Record a numeric attribute under `/microscope`
    pub fn microscope_attr(&self, name: &str, value: f64) -> Result<&Self, EMDError> {
        write_scalar_attr(&self.metadata_group("microscope")?, name, &value)?;
        Ok(self)
    }

    /// Record a text attribute under `/sample`
    pub fn sample_attr(&self, name: &str, value: &str) -> Result<&Self, EMDError> {
        write_text_attr(&self.metadata_group("sample")?, name, value)?;
        Ok(self)
    }

    /// Add a free-form comment to `/comments`, keyed by the current time
    pub fn comment(&self, text: &str) -> Result<&Self, EMDError> {
        let key = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.f").to_string();
        write_text_attr(&self.metadata_group("comments")?, &key, text)?;
        Ok(self)
    }

    /// Write `data` as the group `/data/<name>`.
    ///
    /// `steps` gives the coordinate spacing of each axis, defaulting to 1. `units`
    /// labels the last two (spatial) axes.
    pub fn put_group<T: H5Type>(
        &self,
        name: &str,
        data: ArrayViewD<T>,
        steps: Option<&[f64]>,
        units: &str,
    ) -> Result<&Self, EMDError> {
        let ndim = data.ndim();
        if let Some(steps) = steps {
            if steps.len() != ndim {
                return Err(EMDError::Malformed(format!(
                    "{} axis steps given for a {ndim}-D array",
                    steps.len()
                )));
            }
        }
        let group = self.handle.group("data")?.create_group(name)?;
        write_scalar_attr(&group, "emd_group_type", &1i32)?;
        let data = data.as_standard_layout();
        group.new_dataset_builder().with_data(&data).create("data")?;

        for (axis, size) in data.shape().iter().enumerate() {
            let step = steps.map(|s| s[axis]).unwrap_or(1.0);
            let coordinates = Array1::from_shape_fn(*size, |i| i as f64 * step);
            let dim = group
                .new_dataset_builder()
                .with_data(&coordinates)
                .create(format!("dim{}", axis + 1).as_str())?;
            write_text_attr(&dim, "name", &format!("dim{}", axis + 1))?;
            let axis_units = if axis + 2 >= ndim { units } else { "" };
            write_text_attr(&dim, "units", axis_units)?;
        }
        Ok(self)
    }
}

/// Write a minimal Velox-style file: a `Version` string, one image group holding
/// `data` as `(rows, columns, frames)` and the JSON `metadata` as a zero-padded
/// byte column.
#[cfg(test)]
pub(crate) fn write_velox<P: AsRef<Path>, T: H5Type>(
    path: P,
    data: ndarray::ArrayView3<T>,
    metadata: &str,
) -> Result<(), EMDError> {
    let handle = File::create(path.as_ref())?;
    let version = [to_unicode(r#"{"format": "Velox", "version": 2}"#)?];
    handle
        .new_dataset_builder()
        .with_data(&version[..])
        .create("Version")?;
    let group = handle
        .create_group("Data")?
        .create_group("Image")?
        .create_group("6fdbde41eecc4c2b9d37dd1f2c1e4dd0")?;
    let data = data.as_standard_layout();
    group.new_dataset_builder().with_data(&data).create("Data")?;

    let mut bytes = metadata.as_bytes().to_vec();
    bytes.resize(bytes.len() + 32, 0);
    let column = ndarray::Array2::from_shape_vec((bytes.len(), 1), bytes)
        .map_err(|e| EMDError::Malformed(e.to_string()))?;
    group
        .new_dataset_builder()
        .with_data(&column)
        .create("Metadata")?;
    Ok(())
}
