use std::path::{Path, PathBuf};

use hdf5::{Dataset, File};
use log::{debug, warn};
use ndarray::s;

use crate::frame::{DType, Frame};
use crate::io::infer_format::ElectronMicroscopyFormat;
use crate::io::traits::{EMFileReader, IngestError};
use crate::meta::{MetadataRecord, PhysicalCalibration};
use crate::params::Value;

use super::common::{dataset_dtype, read_plane, read_strings, EMDError};

const IMAGE_GROUP: &str = "Data/Image";

/// Whether the HDF5 file at `path` carries a Velox `Version` string. Any failure to
/// open or read the file means it is not Velox.
pub fn is_velox<P: AsRef<Path>>(path: P) -> bool {
    let Ok(handle) = File::open(path.as_ref()) else {
        return false;
    };
    handle
        .dataset("Version")
        .ok()
        .and_then(|d| read_strings(&d).ok())
        .is_some_and(|versions| versions.iter().any(|v| v.contains("Velox")))
}

/// Decode the JSON blob held in the first column of a Velox `Metadata` array
fn decode_metadata(raw: &[u8]) -> Result<Value, EMDError> {
    let bytes: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
    let text = String::from_utf8_lossy(&bytes);
    let parsed: serde_json::Value = serde_json::from_str(&text)?;
    Ok(parsed.into())
}

fn velox_calibration(metadata: &Value, axis: &str) -> PhysicalCalibration {
    let (size_key, offset_key, unit_key) = match axis {
        "x" => ("width", "x", "PixelUnitX"),
        _ => ("height", "y", "PixelUnitY"),
    };
    let size = metadata
        .lookup(["BinaryResult", "PixelSize", size_key])
        .and_then(|v| v.as_f64());
    let origin = metadata
        .lookup(["BinaryResult", "Offset", offset_key])
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let unit = metadata
        .lookup(["BinaryResult", unit_key])
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    match size {
        Some(size) => PhysicalCalibration::new(size, origin, unit),
        None => PhysicalCalibration::unscaled(),
    }
}

/// A reader for Thermo Fisher Velox EMD files.
///
/// Velox stores image stacks with the frame axis last, `(rows, columns, frames)`.
/// Only the first group under `/Data/Image` is read.
#[derive(Debug)]
pub struct VeloxEMDReader {
    path: PathBuf,
    group: String,
    shape: Vec<usize>,
    dtype: DType,
}

impl VeloxEMDReader {
    /// The name of the image group being read
    pub fn group(&self) -> &str {
        &self.group
    }

    fn open_group(path: &Path) -> Result<(String, Vec<usize>, DType), EMDError> {
        let handle = File::open(path)?;
        let images = handle.group(IMAGE_GROUP)?;
        let mut names = images.member_names()?;
        names.sort();
        let group = names.into_iter().next().ok_or(EMDError::NoDatasets)?;
        let data = images.group(&group)?.dataset("Data")?;
        let shape = data.shape();
        if !(2..=3).contains(&shape.len()) {
            return Err(EMDError::Malformed(format!(
                "Velox image {group} holds a {}-D dataset",
                shape.len()
            )));
        }
        let dtype = dataset_dtype(&data)?;
        Ok((group, shape, dtype))
    }

    fn with_group<T, F: FnOnce(&hdf5::Group) -> Result<T, EMDError>>(
        &self,
        f: F,
    ) -> Result<T, EMDError> {
        let handle = File::open(&self.path)?;
        let group = handle.group(IMAGE_GROUP)?.group(&self.group)?;
        f(&group)
    }

    fn read_plane_of(&self, index: usize) -> Result<Frame, EMDError> {
        self.with_group(|group| {
            let data: Dataset = group.dataset("Data")?;
            let frame = if self.shape.len() == 2 {
                read_plane(&data, self.dtype, s![.., ..])?
            } else {
                read_plane(&data, self.dtype, s![.., .., index])?
            };
            Ok(frame)
        })
    }

    fn read_embedded_metadata(&self) -> Result<Option<Value>, EMDError> {
        self.with_group(|group| {
            let Ok(metadata) = group.dataset("Metadata") else {
                return Ok(None);
            };
            let raw = match metadata.ndim() {
                1 => metadata.read_raw::<u8>()?,
                _ => metadata.read_slice_1d::<u8, _>(s![.., 0])?.to_vec(),
            };
            decode_metadata(&raw).map(Some)
        })
    }
}

impl EMFileReader for VeloxEMDReader {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IngestError::IOError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
        let (group, shape, dtype) = Self::open_group(path).map_err(|e| match e {
            EMDError::NoDatasets => IngestError::DatasetNotFound(path.to_path_buf()),
            e => IngestError::file_format(path, ElectronMicroscopyFormat::EMDVelox, e),
        })?;
        debug!(
            "Opened Velox EMD {} image {group} of {shape:?} {dtype}",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            group,
            shape,
            dtype,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        ElectronMicroscopyFormat::EMDVelox
    }

    fn dataset_name(&self, dataset: usize) -> Option<String> {
        (dataset == 0).then(|| "primary".to_string())
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        self.check_dataset(dataset)?;
        Ok(vec![self.shape.get(2).copied().unwrap_or(1)])
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        self.check_dataset(dataset)?;
        self.check_frame(dataset, index)?;
        self.read_plane_of(index)
            .map_err(|e| IngestError::frame_read(index, e))
    }

    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        self.read_frame(dataset, index)?;
        Ok(((self.shape[0], self.shape[1]), self.dtype))
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        let mut record = MetadataRecord::new();
        let embedded = match self.read_embedded_metadata() {
            Ok(embedded) => embedded,
            Err(EMDError::JSONError(e)) => {
                warn!("Ignoring unreadable Velox metadata in {}: {e}", self.path.display());
                None
            }
            Err(e) => return Err(e.into()),
        };
        let (x, y) = match &embedded {
            Some(metadata) => (
                velox_calibration(metadata, "x"),
                velox_calibration(metadata, "y"),
            ),
            None => (PhysicalCalibration::unscaled(), PhysicalCalibration::unscaled()),
        };
        if let Some(Value::Map(entries)) = embedded {
            record.extend(entries);
        }
        record.insert("veloxFlag", true);
        record.insert(
            "shape",
            self.shape.iter().map(|s| Value::from(*s)).collect::<Vec<_>>(),
        );
        record.set_calibration(&x, &y);
        record.set_file_name(&self.path);
        Ok(record)
    }

    fn read_dataset_metadata(&self, dataset: usize) -> Result<MetadataRecord, IngestError> {
        self.check_dataset(dataset)?;
        let mut record = MetadataRecord::new();
        record.insert("veloxFlag", true);
        record.insert(
            "shape",
            self.shape.iter().map(|s| Value::from(*s)).collect::<Vec<_>>(),
        );
        Ok(record)
    }
}
