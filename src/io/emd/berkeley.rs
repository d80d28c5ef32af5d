use std::path::{Path, PathBuf};

use hdf5::File;
use log::{debug, warn};
use ndarray::s;

use crate::frame::{DType, Frame};
use crate::io::infer_format::ElectronMicroscopyFormat;
use crate::io::traits::{EMFileReader, IngestError};
use crate::meta::{MetadataRecord, PhysicalCalibration};
use crate::params::{Value, ValueMap};

use super::common::{attr_value, dataset_dtype, group_attrs, read_plane, read_strings, EMDError};

/// The top-level groups whose attributes are reported as file metadata
const FILE_METADATA_GROUPS: &[&str] = &["user", "microscope", "sample", "comments", "stage"];

/// One `dimN` vector of a Berkeley dataset
#[derive(Debug, Clone, PartialEq)]
pub struct EMDDimension {
    pub name: String,
    pub units: String,
    /// The first two coordinates, when the axis has at least two
    pub leading: Option<(f64, f64)>,
}

impl EMDDimension {
    pub fn calibration(&self) -> PhysicalCalibration {
        match self.leading {
            Some((first, second)) => PhysicalCalibration::new(second - first, first, &self.units),
            None => PhysicalCalibration::unscaled(),
        }
    }
}

/// The layout of one `emd_group_type = 1` group
#[derive(Debug, Clone, PartialEq)]
pub struct BerkeleyDataset {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub dims: Vec<EMDDimension>,
}

impl BerkeleyDataset {
    fn read(group: &hdf5::Group, name: &str) -> Result<Self, EMDError> {
        let data = group.dataset("data")?;
        let shape = data.shape();
        if !(2..=4).contains(&shape.len()) {
            return Err(EMDError::Malformed(format!(
                "{name} holds a {}-D dataset",
                shape.len()
            )));
        }
        let dtype = dataset_dtype(&data)?;
        let dims = (1..=shape.len())
            .map(|i| Self::read_dimension(group, i))
            .collect();
        Ok(Self {
            name: name.to_string(),
            shape,
            dtype,
            dims,
        })
    }

    fn read_dimension(group: &hdf5::Group, index: usize) -> EMDDimension {
        let key = format!("dim{index}");
        let Ok(dim) = group.dataset(&key) else {
            return EMDDimension {
                name: key,
                units: String::new(),
                leading: None,
            };
        };
        let text_attr = |attr: &str| {
            dim.attr(attr)
                .ok()
                .and_then(|a| read_strings(&a).ok())
                .and_then(|s| s.into_iter().next())
                .unwrap_or_default()
        };
        let leading = if dim.size() >= 2 {
            dim.read_slice_1d::<f64, _>(s![0..2])
                .ok()
                .map(|v| (v[0], v[1]))
        } else {
            None
        };
        EMDDimension {
            name: text_attr("name"),
            units: text_attr("units"),
            leading,
        }
    }

    /// Leading frame axes: nothing for 2-D data, the first axis otherwise. The second
    /// axis of 4-D data is pinned to index 0.
    pub fn frame_axes(&self) -> Vec<usize> {
        match self.shape.len() {
            2 => vec![1],
            _ => vec![self.shape[0]],
        }
    }

    pub fn frame_shape(&self) -> (usize, usize) {
        let n = self.shape.len();
        (self.shape[n - 2], self.shape[n - 1])
    }

    /// The `(x, y)` calibration from the last two dimension vectors
    pub fn calibration(&self) -> (PhysicalCalibration, PhysicalCalibration) {
        let n = self.dims.len();
        (self.dims[n - 1].calibration(), self.dims[n - 2].calibration())
    }
}

/// The `emd_group_type = 1` groups under `/data`, in name order
fn list_datasets(handle: &File) -> Result<Vec<BerkeleyDataset>, EMDError> {
    let Ok(data) = handle.group("data") else {
        return Ok(Vec::new());
    };
    let mut datasets = Vec::new();
    for name in data.member_names()? {
        let Ok(group) = data.group(&name) else {
            continue;
        };
        let is_emd = group
            .attr("emd_group_type")
            .ok()
            .and_then(|a| attr_value(&a).ok())
            .and_then(|v| v.as_i64())
            == Some(1);
        if !is_emd {
            continue;
        }
        match BerkeleyDataset::read(&group, &name) {
            Ok(dataset) => datasets.push(dataset),
            Err(e) => warn!("Skipping EMD group {name}: {e}"),
        }
    }
    Ok(datasets)
}

/// The number of Berkeley datasets in the HDF5 file at `path`
pub fn count_berkeley_datasets<P: AsRef<Path>>(path: P) -> Result<usize, EMDError> {
    let handle = File::open(path.as_ref())?;
    Ok(list_datasets(&handle)?.len())
}

/// A reader for Berkeley EMD files. Every tagged group is an independent dataset.
#[derive(Debug)]
pub struct BerkeleyEMDReader {
    path: PathBuf,
    datasets: Vec<BerkeleyDataset>,
}

impl BerkeleyEMDReader {
    pub fn datasets(&self) -> &[BerkeleyDataset] {
        &self.datasets
    }

    fn dataset(&self, dataset: usize) -> Result<&BerkeleyDataset, IngestError> {
        self.check_dataset(dataset)?;
        Ok(&self.datasets[dataset])
    }

    fn open_datasets(path: &Path) -> Result<Vec<BerkeleyDataset>, EMDError> {
        let handle = File::open(path)?;
        list_datasets(&handle)
    }

    fn read_plane_of(&self, info: &BerkeleyDataset, index: usize) -> Result<Frame, EMDError> {
        let handle = File::open(&self.path)?;
        let data = handle.group("data")?.group(&info.name)?.dataset("data")?;
        let frame = match info.shape.len() {
            2 => read_plane(&data, info.dtype, s![.., ..])?,
            3 => read_plane(&data, info.dtype, s![index, .., ..])?,
            _ => read_plane(&data, info.dtype, s![index, 0, .., ..])?,
        };
        Ok(frame)
    }
}

impl EMFileReader for BerkeleyEMDReader {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IngestError::IOError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
        let datasets = Self::open_datasets(path)
            .map_err(|e| IngestError::file_format(path, ElectronMicroscopyFormat::EMD, e))?;
        if datasets.is_empty() {
            return Err(IngestError::DatasetNotFound(path.to_path_buf()));
        }
        debug!(
            "Opened Berkeley EMD {} with datasets {:?}",
            path.display(),
            datasets.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
        );
        Ok(Self {
            path: path.to_path_buf(),
            datasets,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        ElectronMicroscopyFormat::EMD
    }

    fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    fn dataset_name(&self, dataset: usize) -> Option<String> {
        self.datasets.get(dataset).map(|d| d.name.clone())
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        Ok(self.dataset(dataset)?.frame_axes())
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        let info = self.dataset(dataset)?;
        self.check_frame(dataset, index)?;
        self.read_plane_of(info, index)
            .map_err(|e| IngestError::frame_read(index, e))
    }

    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        self.read_frame(dataset, index)?;
        let info = self.dataset(dataset)?;
        Ok((info.frame_shape(), info.dtype))
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        let handle = File::open(&self.path).map_err(EMDError::from)?;
        let mut record = MetadataRecord::new();
        record.insert("veloxFlag", false);
        record.set_file_name(&self.path);
        for name in FILE_METADATA_GROUPS {
            let attrs = match handle.group(name) {
                Ok(group) => group_attrs(&group)?,
                Err(_) => ValueMap::new(),
            };
            record.insert(*name, attrs);
        }
        let (x, y) = self.datasets[0].calibration();
        record.set_calibration(&x, &y);
        Ok(record)
    }

    fn read_dataset_metadata(&self, dataset: usize) -> Result<MetadataRecord, IngestError> {
        let info = self.dataset(dataset)?;
        let handle = File::open(&self.path).map_err(EMDError::from)?;
        let group = handle
            .group("data")
            .and_then(|g| g.group(&info.name))
            .map_err(EMDError::from)?;
        let mut record = MetadataRecord::new();
        record.insert("veloxFlag", false);
        record.insert(info.name.as_str(), group_attrs(&group)?);
        let (x, y) = info.calibration();
        record.set_calibration(&x, &y);
        record.insert(
            "shape",
            info.shape.iter().map(|s| Value::from(*s)).collect::<Vec<_>>(),
        );
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::emd::EMDWriter;
    use crate::meta::{PHYSICAL_SIZE_X, PHYSICAL_SIZE_X_UNIT, PHYSICAL_SIZE_Y_ORIGIN};
    use ndarray::{Array2, Array3, Array4, Axis};

    #[test_log::test]
    fn test_round_trip() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stack.emd");
        let data = Array3::from_shape_fn((10, 11, 12), |(t, y, x)| (t * 1000 + y * 12 + x) as u16);
        EMDWriter::create(&path)?
            .user_attr("operator", "someone")?
            .put_group("stack", data.view().into_dyn(), Some(&[1.0, 0.5, 0.25]), "n_m")?;

        let reader = BerkeleyEMDReader::open_path(&path)?;
        assert_eq!(reader.dataset_count(), 1);
        assert_eq!(reader.dataset_name(0).as_deref(), Some("stack"));
        assert_eq!(reader.frame_axes(0)?, vec![10]);
        assert_eq!(reader.probe_frame(0, 0)?, ((11, 12), DType::U16));
        let frame = reader.read_frame(0, 4)?;
        assert_eq!(frame.as_array::<u16>().unwrap(), data.index_axis(Axis(0), 4));

        let meta = reader.read_metadata()?;
        assert_eq!(meta.get("veloxFlag"), Some(&Value::Bool(false)));
        assert_eq!(
            meta.get("user").and_then(|u| u.as_map()).and_then(|u| u.get("operator")),
            Some(&Value::from("someone"))
        );
        assert_eq!(meta.get("stage"), Some(&Value::Map(ValueMap::new())));

        let dataset_meta = reader.read_dataset_metadata(0)?;
        assert_eq!(dataset_meta.get(PHYSICAL_SIZE_X), Some(&Value::Float(0.25)));
        assert_eq!(dataset_meta.get(PHYSICAL_SIZE_X_UNIT), Some(&Value::from("nm")));
        assert_eq!(dataset_meta.get(PHYSICAL_SIZE_Y_ORIGIN), Some(&Value::Float(0.0)));
        assert_eq!(
            dataset_meta.get("shape"),
            Some(&Value::from(vec![10usize, 11, 12]))
        );
        assert!(dataset_meta.get("stack").and_then(|v| v.as_map()).is_some());
        Ok(())
    }

    #[test_log::test]
    fn test_multiple_groups_and_ranks() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("multi.emd");
        let plane = Array2::from_shape_fn((4, 5), |(y, x)| (y * 5 + x) as f32);
        let hyper = Array4::from_shape_fn((3, 2, 4, 5), |(a, b, _, _)| (a * 10 + b) as i32);
        EMDWriter::create(&path)?
            .put_group("a_plane", plane.view().into_dyn(), None, "")?
            .put_group("b_hyper", hyper.view().into_dyn(), None, "")?;

        let reader = BerkeleyEMDReader::open_path(&path)?;
        assert_eq!(reader.dataset_count(), 2);
        assert_eq!(reader.frame_axes(0)?, vec![1]);
        assert_eq!(reader.read_frame(0, 0)?.as_array::<f32>().unwrap(), plane);
        assert_eq!(reader.frame_axes(1)?, vec![3]);
        let frame = reader.read_frame(1, 2)?;
        assert!(frame.as_array::<i32>().unwrap().iter().all(|v| *v == 20));
        assert!(matches!(
            reader.read_frame(2, 0),
            Err(IngestError::DatasetIndexOutOfRange { dataset: 2, count: 2 })
        ));
        Ok(())
    }

    #[test_log::test]
    fn test_no_datasets() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.emd");
        EMDWriter::create(&path)?;
        assert!(matches!(
            BerkeleyEMDReader::open_path(&path),
            Err(IngestError::DatasetNotFound(_))
        ));
        assert_eq!(count_berkeley_datasets(&path).unwrap(), 0);

        std::fs::write(&path, b"not hdf5")?;
        assert!(matches!(
            BerkeleyEMDReader::open_path(&path),
            Err(IngestError::FileFormat { .. })
        ));
        Ok(())
    }
}
