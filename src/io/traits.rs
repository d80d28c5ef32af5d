use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::frame::{DType, Frame, FrameSource, LazyArrayError, LazyFrameArray};
use crate::meta::MetadataRecord;

use super::infer_format::ElectronMicroscopyFormat;

/// The errors that can occur while ingesting a file.
///
/// Header-level failures ([`IngestError::FileFormat`], [`IngestError::DatasetNotFound`],
/// [`IngestError::MetadataParse`]) happen before any document is produced. Frame-level
/// failures only surface when a particular deferred frame is forced.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{} is not a readable {format} file: {reason}", .path.display())]
    FileFormat {
        path: PathBuf,
        format: ElectronMicroscopyFormat,
        reason: String,
    },
    #[error("No usable datasets were found in {}", .0.display())]
    DatasetNotFound(PathBuf),
    #[error("Failed to parse metadata: {0}")]
    MetadataParse(String),
    #[error("Failed to read frame {index}: {reason}")]
    FrameRead { index: usize, reason: String },
    #[error("Frame {index} is out of range, there are {count} frames")]
    FrameIndexOutOfRange { index: usize, count: usize },
    #[error("Dataset {dataset} is out of range, there are {count} datasets")]
    DatasetIndexOutOfRange { dataset: usize, count: usize },
    #[error("Unsupported content: {0}")]
    Unsupported(String),
    #[error("Could not determine the format of {}", .0.display())]
    UnknownFormat(PathBuf),
    #[error(transparent)]
    LazyArray(#[from] LazyArrayError),
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl IngestError {
    pub fn file_format<P: Into<PathBuf>, E: ToString>(
        path: P,
        format: ElectronMicroscopyFormat,
        reason: E,
    ) -> Self {
        Self::FileFormat {
            path: path.into(),
            format,
            reason: reason.to_string(),
        }
    }

    pub fn frame_read<E: ToString>(index: usize, reason: E) -> Self {
        Self::FrameRead {
            index,
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the container opened but held nothing to ingest
    pub fn is_dataset_not_found(&self) -> bool {
        matches!(self, Self::DatasetNotFound(_))
    }
}

/// The uniform capability every format adapter provides.
///
/// Opening a reader parses headers only. Readers hold no open file handle between
/// calls; every frame or metadata read opens the file, reads and closes it again,
/// so a reader may be shared between threads and abandoned at any point.
pub trait EMFileReader: Debug + Send + Sync + Sized {
    /// Parse the headers of the file at `path`
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError>;

    /// The path this reader was opened from
    fn path(&self) -> &Path;

    fn format(&self) -> ElectronMicroscopyFormat;

    /// Toggle reading optional sidecar files that sit next to the source file
    fn set_read_sidecars(&mut self, _read_sidecars: bool) {}

    /// The number of independent datasets in the file
    fn dataset_count(&self) -> usize {
        1
    }

    /// A short name for `dataset`, when the container names them
    fn dataset_name(&self, _dataset: usize) -> Option<String> {
        None
    }

    /// The sizes of the leading non-spatial axes of `dataset`. Their product is
    /// [`EMFileReader::frame_count`]; data without a frame axis reports `[1]`.
    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError>;

    /// The number of addressable 2-D frames in `dataset`
    fn frame_count(&self, dataset: usize) -> Result<usize, IngestError> {
        Ok(self.frame_axes(dataset)?.iter().product())
    }

    /// Read the frame at the flat `index` of `dataset`
    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError>;

    /// Read exactly one frame and report its `(rows, columns)` and element type
    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        let frame = self.read_frame(dataset, index)?;
        Ok((frame.shape(), frame.dtype()))
    }

    /// File-level metadata, including the normalized physical size keys
    fn read_metadata(&self) -> Result<MetadataRecord, IngestError>;

    /// Metadata specific to one dataset
    fn read_dataset_metadata(&self, dataset: usize) -> Result<MetadataRecord, IngestError> {
        self.check_dataset(dataset)?;
        Ok(MetadataRecord::new())
    }

    #[doc(hidden)]
    fn check_dataset(&self, dataset: usize) -> Result<(), IngestError> {
        let count = self.dataset_count();
        if dataset >= count {
            Err(IngestError::DatasetIndexOutOfRange { dataset, count })
        } else {
            Ok(())
        }
    }

    #[doc(hidden)]
    fn check_frame(&self, dataset: usize, index: usize) -> Result<(), IngestError> {
        let count = self.frame_count(dataset)?;
        if index >= count {
            Err(IngestError::FrameIndexOutOfRange { index, count })
        } else {
            Ok(())
        }
    }
}

/// Adapts one dataset of a shared [`EMFileReader`] to a [`FrameSource`]
#[derive(Debug)]
pub struct ReaderFrameSource<R: EMFileReader> {
    reader: Arc<R>,
    dataset: usize,
    frame_count: usize,
}

impl<R: EMFileReader> ReaderFrameSource<R> {
    pub fn new(reader: Arc<R>, dataset: usize) -> Result<Self, IngestError> {
        let frame_count = reader.frame_count(dataset)?;
        Ok(Self {
            reader,
            dataset,
            frame_count,
        })
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }
}

impl<R: EMFileReader> FrameSource for ReaderFrameSource<R> {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn read_frame(&self, index: usize) -> Result<Frame, IngestError> {
        self.reader.read_frame(self.dataset, index)
    }

    fn describe(&self) -> String {
        format!("{}[{}]", self.reader.path().display(), self.dataset)
    }
}

/// Build the lazy array for `dataset`, probing frame 0 for the plane shape and type
pub fn lazy_frames<R: EMFileReader + 'static>(
    reader: &Arc<R>,
    dataset: usize,
) -> Result<LazyFrameArray, IngestError> {
    let leading = reader.frame_axes(dataset)?;
    let (shape, dtype) = reader.probe_frame(dataset, 0)?;
    debug!(
        "{} dataset {dataset}: {leading:?} frames of {shape:?} {dtype}",
        reader.path().display()
    );
    let source = Arc::new(ReaderFrameSource::new(reader.clone(), dataset)?);
    Ok(LazyFrameArray::from_source(source, leading, shape, dtype)?)
}
