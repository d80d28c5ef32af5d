use std::{io, path::Path};

use crate::frame::{DType, Frame};
use crate::io::dm::DMReader;
use crate::io::mrc::MRCReader;
use crate::io::ser::SERReader;
use crate::io::traits::{EMFileReader, IngestError};
use crate::meta::MetadataRecord;

#[cfg(feature = "tiff")]
use crate::io::tiff::TIFFReader;

#[cfg(feature = "emd")]
use crate::io::emd::{is_velox, BerkeleyEMDReader, VeloxEMDReader};

use super::{infer_format, ElectronMicroscopyFormat};

/// An explicit file format dispatching ADT that provides the complete [`EMFileReader`]
/// API over every supported format. The preferred means of creating an instance is
/// through [`EMReaderType::open_path`] or [`EMReaderType::builder`].
///
/// Formats that require a feature to be enabled have no variant without it.
#[non_exhaustive]
#[derive(Debug)]
pub enum EMReaderType {
    DM(DMReader),
    MRC(MRCReader),
    SER(SERReader),
    #[cfg(feature = "tiff")]
    TIFF(TIFFReader),
    #[cfg(feature = "emd")]
    EMD(BerkeleyEMDReader),
    #[cfg(feature = "emd")]
    EMDVelox(VeloxEMDReader),
}

macro_rules! emfmt_dispatch {
    ($d:ident, $r:ident, $e:expr) => {
        match $d {
            EMReaderType::DM($r) => $e,
            EMReaderType::MRC($r) => $e,
            EMReaderType::SER($r) => $e,
            #[cfg(feature = "tiff")]
            EMReaderType::TIFF($r) => $e,
            #[cfg(feature = "emd")]
            EMReaderType::EMD($r) => $e,
            #[cfg(feature = "emd")]
            EMReaderType::EMDVelox($r) => $e,
        }
    };
}

/// A builder type for [`EMReaderType`].
///
/// To create an instance, see [`EMReaderType::builder`]
#[derive(Debug, Clone)]
pub struct EMReaderBuilder {
    read_sidecars: bool,
    format: Option<ElectronMicroscopyFormat>,
}

impl Default for EMReaderBuilder {
    fn default() -> Self {
        Self {
            read_sidecars: true,
            format: None,
        }
    }
}

impl EMReaderBuilder {
    /// Whether to merge metadata from sidecar files (`.rawtlt`, `.txt`, `.emi`)
    pub fn read_sidecars(mut self, read_sidecars: bool) -> Self {
        self.read_sidecars = read_sidecars;
        self
    }

    /// Skip format inference and open the file as `format`
    pub fn format(mut self, format: ElectronMicroscopyFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Create a reader for the file on the local file system denoted by `path`.
    pub fn from_path<P: AsRef<Path>>(self, path: P) -> Result<EMReaderType, IngestError> {
        let path = path.as_ref();
        let mut reader = match self.format {
            Some(format) => EMReaderType::open_with_format(path, format)?,
            None => EMReaderType::open_path(path)?,
        };
        reader.set_read_sidecars(self.read_sidecars);
        Ok(reader)
    }
}

#[cfg(any(not(feature = "tiff"), not(feature = "emd")))]
fn format_unavailable(format: ElectronMicroscopyFormat, feature: &str) -> IngestError {
    IngestError::Unsupported(format!(
        "{format} files require the `{feature}` feature"
    ))
}

impl EMReaderType {
    /// Create an [`EMReaderBuilder`] which can be used to configure the created reader
    pub fn builder() -> EMReaderBuilder {
        EMReaderBuilder::default()
    }

    /// Get the file format for this reader
    pub fn as_format(&self) -> ElectronMicroscopyFormat {
        emfmt_dispatch!(self, reader, reader.format())
    }

    /// Open `path` with the adapter for `format`, without inspecting the file first.
    ///
    /// A Berkeley EMD file that turns out to hold no datasets is retried as Velox.
    pub fn open_with_format<P: AsRef<Path>>(
        path: P,
        format: ElectronMicroscopyFormat,
    ) -> Result<Self, IngestError> {
        let path = path.as_ref();
        match format {
            ElectronMicroscopyFormat::DM => Ok(Self::DM(DMReader::open_path(path)?)),
            ElectronMicroscopyFormat::MRC => Ok(Self::MRC(MRCReader::open_path(path)?)),
            ElectronMicroscopyFormat::SER => Ok(Self::SER(SERReader::open_path(path)?)),
            #[cfg(feature = "tiff")]
            ElectronMicroscopyFormat::TIFF => Ok(Self::TIFF(TIFFReader::open_path(path)?)),
            #[cfg(not(feature = "tiff"))]
            ElectronMicroscopyFormat::TIFF => Err(format_unavailable(format, "tiff")),
            #[cfg(feature = "emd")]
            ElectronMicroscopyFormat::EMD => match BerkeleyEMDReader::open_path(path) {
                Ok(reader) => Ok(Self::EMD(reader)),
                Err(e) if e.is_dataset_not_found() && is_velox(path) => {
                    Ok(Self::EMDVelox(VeloxEMDReader::open_path(path)?))
                }
                Err(e) => Err(e),
            },
            #[cfg(feature = "emd")]
            ElectronMicroscopyFormat::EMDVelox => {
                Ok(Self::EMDVelox(VeloxEMDReader::open_path(path)?))
            }
            #[cfg(not(feature = "emd"))]
            ElectronMicroscopyFormat::EMD | ElectronMicroscopyFormat::EMDVelox => {
                Err(format_unavailable(format, "emd"))
            }
            ElectronMicroscopyFormat::Unknown => Err(IngestError::UnknownFormat(path.to_path_buf())),
        }
    }
}

impl EMFileReader for EMReaderType {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let format = infer_format(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => IngestError::IOError(e),
            _ => IngestError::UnknownFormat(path.to_path_buf()),
        })?;
        Self::open_with_format(path, format)
    }

    fn path(&self) -> &Path {
        emfmt_dispatch!(self, reader, reader.path())
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        emfmt_dispatch!(self, reader, reader.format())
    }

    fn set_read_sidecars(&mut self, read_sidecars: bool) {
        emfmt_dispatch!(self, reader, reader.set_read_sidecars(read_sidecars))
    }

    fn dataset_count(&self) -> usize {
        emfmt_dispatch!(self, reader, reader.dataset_count())
    }

    fn dataset_name(&self, dataset: usize) -> Option<String> {
        emfmt_dispatch!(self, reader, reader.dataset_name(dataset))
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        emfmt_dispatch!(self, reader, reader.frame_axes(dataset))
    }

    fn frame_count(&self, dataset: usize) -> Result<usize, IngestError> {
        emfmt_dispatch!(self, reader, reader.frame_count(dataset))
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        emfmt_dispatch!(self, reader, reader.read_frame(dataset, index))
    }

    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        emfmt_dispatch!(self, reader, reader.probe_frame(dataset, index))
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        emfmt_dispatch!(self, reader, reader.read_metadata())
    }

    fn read_dataset_metadata(&self, dataset: usize) -> Result<MetadataRecord, IngestError> {
        emfmt_dispatch!(self, reader, reader.read_dataset_metadata(dataset))
    }
}
