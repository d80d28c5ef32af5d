use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::frame::{DType, Frame};
use crate::io::infer_format::ElectronMicroscopyFormat;
use crate::io::traits::{EMFileReader, IngestError};
use crate::io::utils::{plane_offset, read_plane_at};
use crate::meta::{MetadataRecord, PhysicalCalibration};
use crate::params::Value;

use super::tags::{DMArrayRef, DMError, DMTagTree};

/// Tags whose key contains any of these are never reported as metadata
const METADATA_DENYLIST: &[&str] = &[
    "frame sequence",
    "Private",
    "Reference Images",
    "Frame.Intensity",
    "Area.Transform",
    "Parameters.Objects",
    "Device.Parameters",
];

/// Map the `ImageData.DataType` code to an element type
fn dtype_from_code(code: i64) -> Result<DType, DMError> {
    let dtype = match code {
        1 => DType::I16,
        2 => DType::F32,
        6 => DType::U8,
        7 => DType::I32,
        9 => DType::I8,
        10 => DType::U16,
        11 => DType::U32,
        12 => DType::F64,
        14 => DType::U8,
        39 => DType::I64,
        40 => DType::U64,
        _ => return Err(DMError::UnsupportedDataType(code)),
    };
    Ok(dtype)
}

/// The layout of the image that gets ingested from a DM file
#[derive(Debug, Clone, PartialEq)]
pub struct DMImageInfo {
    /// The 1-based position of the image in `ImageList`
    pub image_index: usize,
    /// Dimension sizes in file order, fastest first
    pub dims: Vec<usize>,
    pub dtype: DType,
    pub data: DMArrayRef,
}

impl DMImageInfo {
    fn from_tags(tags: &DMTagTree) -> Result<Self, DMError> {
        let n_images = tags.group_len("ImageList").unwrap_or(0) as usize;
        if n_images == 0 {
            return Err(DMError::MissingImage);
        }
        // The first image of a multi-image file is the thumbnail
        let image_index = n_images;
        let prefix = format!("ImageList.{image_index}.ImageData");

        let n_dims = tags.group_len(&format!("{prefix}.Dimensions")).unwrap_or(0);
        let dims = (1..=n_dims)
            .map(|i| {
                tags.get(&format!("{prefix}.Dimensions.{i}"))
                    .and_then(|v| v.as_i64())
                    .filter(|v| *v > 0)
                    .map(|v| v as usize)
                    .ok_or_else(|| DMError::Malformed(format!("invalid dimension {i} of image {image_index}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if !(2..=4).contains(&dims.len()) {
            return Err(DMError::Malformed(format!(
                "image {image_index} has {} dimensions",
                dims.len()
            )));
        }

        let code = tags
            .get(&format!("{prefix}.DataType"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DMError::Malformed(format!("image {image_index} has no data type")))?;
        let dtype = dtype_from_code(code)?;

        let data = *tags.array(&format!("{prefix}.Data")).ok_or(DMError::MissingImage)?;
        let info = Self {
            image_index,
            dims,
            dtype,
            data,
        };
        let available = data.length.saturating_mul(data.element.size_of());
        let needed = info.byte_len().ok_or_else(|| {
            DMError::Malformed(format!("image dimensions {:?} overflow", info.dims))
        })?;
        if available < needed {
            return Err(DMError::Malformed(format!(
                "image data holds {available} bytes but {:?} {} needs {needed}",
                info.dims, info.dtype
            )));
        }
        Ok(info)
    }

    pub fn rows(&self) -> usize {
        self.dims[1]
    }

    pub fn columns(&self) -> usize {
        self.dims[0]
    }

    /// The number of planes along the first non-spatial dimension
    pub fn t_count(&self) -> usize {
        self.dims.get(2).copied().unwrap_or(1)
    }

    /// The number of planes along the second non-spatial dimension
    pub fn z_count(&self) -> usize {
        self.dims.get(3).copied().unwrap_or(1)
    }

    pub fn plane_bytes(&self) -> u64 {
        self.rows() as u64 * self.columns() as u64 * self.dtype.size_of() as u64
    }

    /// The byte length of all planes, or `None` if the dimensions overflow
    fn byte_len(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(self.dtype.size_of() as u64, |acc, d| acc.checked_mul(*d as u64))
    }

    /// The on-disk plane for flat frame `index` of the `(t, z)` leading axes
    pub fn plane_of(&self, index: usize) -> usize {
        let (t, z) = (index / self.z_count(), index % self.z_count());
        z * self.t_count() + t
    }
}

/// A reader for DM3 and DM4 files.
///
/// The tag tree is parsed once when the reader is opened. The main image (the last
/// entry of `ImageList`) is exposed with leading axes `(t, z)`.
#[derive(Debug)]
pub struct DMReader {
    path: PathBuf,
    tags: DMTagTree,
    image: DMImageInfo,
}

impl DMReader {
    pub fn tags(&self) -> &DMTagTree {
        &self.tags
    }

    pub fn image(&self) -> &DMImageInfo {
        &self.image
    }

    fn open_tags(path: &Path) -> Result<(DMTagTree, DMImageInfo), DMError> {
        let handle = BufReader::new(fs::File::open(path)?);
        let tags = DMTagTree::parse(handle)?;
        let image = DMImageInfo::from_tags(&tags)?;
        Ok((tags, image))
    }

    fn calibration_axis(&self, metadata: &MetadataRecord, axis: usize) -> PhysicalCalibration {
        let field = |name: &str| metadata.get(&format!("Calibrations.Dimension.{axis}.{name}"));
        match (field("Scale").and_then(Value::as_f64), field("Units")) {
            (Some(scale), Some(units)) => PhysicalCalibration::new(
                scale,
                field("Origin").and_then(Value::as_f64).unwrap_or(0.0),
                units.as_str().unwrap_or_default(),
            ),
            _ => PhysicalCalibration::unscaled(),
        }
    }
}

impl EMFileReader for DMReader {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let (tags, image) = Self::open_tags(path).map_err(|e| match e {
            DMError::IOError(e) if e.kind() == io::ErrorKind::NotFound => IngestError::IOError(e),
            DMError::UnsupportedDataType(_) => e.into(),
            e => IngestError::file_format(path, ElectronMicroscopyFormat::DM, e),
        })?;
        debug!(
            "Opened {:?} {} with image {} of {:?} {}",
            tags.version,
            path.display(),
            image.image_index,
            image.dims,
            image.dtype
        );
        Ok(Self {
            path: path.to_path_buf(),
            tags,
            image,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        ElectronMicroscopyFormat::DM
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        self.check_dataset(dataset)?;
        Ok(vec![self.image.t_count(), self.image.z_count()])
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        self.check_dataset(dataset)?;
        self.check_frame(dataset, index)?;
        let plane = self.image.plane_of(index);
        trace!("Reading frame {index} from plane {plane} of {}", self.path.display());
        let offset = plane_offset(self.image.data.offset, plane, self.image.plane_bytes())
            .ok_or_else(|| IngestError::frame_read(index, "plane offset overflows"))?;
        read_plane_at(
            &self.path,
            offset,
            self.image.dtype,
            (self.image.rows(), self.image.columns()),
            self.tags.endian,
        )
        .map_err(|e| IngestError::frame_read(index, e))
    }

    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        self.read_frame(dataset, index)?;
        Ok(((self.image.rows(), self.image.columns()), self.image.dtype))
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        let prefixes = [
            format!("ImageList.{}.ImageTags.", self.image.image_index),
            format!("ImageList.{}.ImageData.", self.image.image_index),
        ];
        let mut record: MetadataRecord = self
            .tags
            .values()
            .filter_map(|(key, value)| {
                prefixes
                    .iter()
                    .find_map(|prefix| key.strip_prefix(prefix.as_str()))
                    .map(|sub| (sub, value))
            })
            .filter(|(sub, _)| !METADATA_DENYLIST.iter().any(|deny| sub.contains(deny)))
            .map(|(sub, value)| (sub.to_string(), value.clone()))
            .collect();

        let x = self.calibration_axis(&record, 1);
        let y = self.calibration_axis(&record, 2);
        record.set_calibration(&x, &y);
        record.set_file_name(&self.path);
        Ok(record)
    }
}
