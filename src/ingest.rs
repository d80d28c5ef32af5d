//! Turning a file into a run: format inference, header probing, lazy arrays and the
//! document stream.
//!
//! ```no_run
//! use emdata::ingest;
//!
//! for (kind, doc) in ingest("scan.dm4")? {
//!     println!("{kind}: {}", doc.uid());
//! }
//! # Ok::<(), emdata::IngestError>(())
//! ```
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace, warn};
use uuid::Uuid;

use crate::document::{
    configuration_from_metadata, describe_value, frame_data_keys, ComposerError,
    DescriptorDocument, Document, DocumentKind, RunComposer,
};
use crate::frame::{DType, LazyFrameArray};
use crate::io::{lazy_frames, EMFileReader, EMReaderType, ElectronMicroscopyFormat, IngestError};
use crate::meta::{CacheKey, MetadataCache, MetadataRecord, PhysicalCalibration, PHYSICAL_SIZE_X};

/// The default `source` label of the frame data key
pub const DEFAULT_SOURCE: &str = "NCEM";

const PRIMARY_STREAM: &str = "primary";

/// One logical array inside a source file, probed and ready to read lazily
#[derive(Debug, Clone)]
pub struct Dataset {
    /// The position of the dataset in its file
    pub index: usize,
    /// The stream name the dataset is described under
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// The sizes of the leading non-spatial axes
    pub frame_axis_sizes: Vec<usize>,
    /// `(x, y)` pixel calibration
    pub calibration: (PhysicalCalibration, PhysicalCalibration),
    pub source_path: PathBuf,
    pub metadata: Arc<MetadataRecord>,
    pub frames: LazyFrameArray,
}

impl Dataset {
    pub fn frame_count(&self) -> usize {
        self.frames.frame_count()
    }
}

/// Where metadata records are cached
#[derive(Debug, Clone, Default)]
enum CacheChoice {
    #[default]
    Global,
    Shared(Arc<MetadataCache>),
    Disabled,
}

impl CacheChoice {
    fn load<F: FnOnce() -> Result<MetadataRecord, IngestError>>(
        &self,
        key: CacheKey,
        load: F,
    ) -> Result<Arc<MetadataRecord>, IngestError> {
        match self {
            Self::Global => MetadataCache::global().get_or_try_insert_with(key, load),
            Self::Shared(cache) => cache.get_or_try_insert_with(key, load),
            Self::Disabled => load().map(Arc::new),
        }
    }
}

/// Configures how a file is ingested.
///
/// ```no_run
/// use std::sync::Arc;
/// use emdata::{IngestBuilder, MetadataCache};
///
/// let cache = Arc::new(MetadataCache::new(4));
/// let run = IngestBuilder::default()
///     .cache(cache.clone())
///     .source("microscope-3")
///     .read_sidecars(false)
///     .open("tomogram.mrc")?;
/// println!("{} frames", run.datasets()[0].frame_count());
/// # Ok::<(), emdata::IngestError>(())
/// ```
#[derive(Debug, Clone)]
pub struct IngestBuilder {
    cache: CacheChoice,
    source: String,
    read_sidecars: bool,
    format: Option<ElectronMicroscopyFormat>,
}

impl Default for IngestBuilder {
    fn default() -> Self {
        Self {
            cache: CacheChoice::Global,
            source: DEFAULT_SOURCE.to_string(),
            read_sidecars: true,
            format: None,
        }
    }
}

impl IngestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache metadata in `cache` instead of the process-wide cache
    pub fn cache(mut self, cache: Arc<MetadataCache>) -> Self {
        self.cache = CacheChoice::Shared(cache);
        self
    }

    /// Always read metadata from the file
    pub fn without_cache(mut self) -> Self {
        self.cache = CacheChoice::Disabled;
        self
    }

    /// Set the `source` label written in each frame data key
    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = source.into();
        self
    }

    /// Whether to merge metadata from sidecar files next to the source file
    pub fn read_sidecars(mut self, read_sidecars: bool) -> Self {
        self.read_sidecars = read_sidecars;
        self
    }

    /// Skip format inference
    pub fn format(mut self, format: ElectronMicroscopyFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Open `path` and probe every dataset in it. All header-level failures happen here.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Run, IngestError> {
        let path = path.as_ref();
        let mut builder = EMReaderType::builder().read_sidecars(self.read_sidecars);
        if let Some(format) = self.format {
            builder = builder.format(format);
        }
        let reader = Arc::new(builder.from_path(path)?);
        Run::from_reader(reader, self)
    }

    /// Records read with and without sidecars are cached apart
    fn cache_key(&self, key: CacheKey) -> CacheKey {
        key.with_sidecars(self.read_sidecars)
    }

    /// Open `path` and return its documents
    pub fn ingest<P: AsRef<Path>>(&self, path: P) -> Result<DocumentStream, IngestError> {
        Ok(self.open(path)?.into_documents())
    }
}

/// One ingestion of one file
#[derive(Debug)]
pub struct Run {
    path: PathBuf,
    format: ElectronMicroscopyFormat,
    sample_name: String,
    source: String,
    metadata: Arc<MetadataRecord>,
    datasets: Vec<Dataset>,
    reader: Arc<EMReaderType>,
}

impl Run {
    fn stream_name(reader: &EMReaderType, dataset: usize) -> String {
        match (reader.format(), reader.dataset_name(dataset)) {
            (ElectronMicroscopyFormat::EMD, Some(name)) => format!("{PRIMARY_STREAM}_{name}"),
            _ => PRIMARY_STREAM.to_string(),
        }
    }

    fn from_reader(reader: Arc<EMReaderType>, options: &IngestBuilder) -> Result<Self, IngestError> {
        let path = reader.path().to_path_buf();
        let metadata = options
            .cache
            .load(options.cache_key(CacheKey::file(&path)), || reader.read_metadata())?;

        let n_datasets = reader.dataset_count();
        if n_datasets == 0 {
            return Err(IngestError::DatasetNotFound(path));
        }
        let mut datasets = Vec::with_capacity(n_datasets);
        for index in 0..n_datasets {
            let frames = lazy_frames(&reader, index)?;
            let key = options.cache_key(CacheKey::dataset(&path, index));
            let dataset_metadata = options
                .cache
                .load(key, || reader.read_dataset_metadata(index))?;
            let calibration = if dataset_metadata.contains_key(PHYSICAL_SIZE_X) {
                dataset_metadata.calibration()
            } else {
                metadata.calibration()
            };
            let dataset = Dataset {
                index,
                name: Self::stream_name(&reader, index),
                shape: frames.shape(),
                dtype: frames.dtype(),
                frame_axis_sizes: frames.leading_shape().to_vec(),
                calibration,
                source_path: path.clone(),
                metadata: dataset_metadata,
                frames,
            };
            debug!(
                "{} dataset {index} \"{}\": {:?} {}",
                path.display(),
                dataset.name,
                dataset.shape,
                dataset.dtype
            );
            datasets.push(dataset);
        }

        let sample_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            format: reader.format(),
            path,
            sample_name,
            source: options.source.clone(),
            metadata,
            datasets,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ElectronMicroscopyFormat {
        self.format
    }

    pub fn sample_name(&self) -> &str {
        &self.sample_name
    }

    pub fn metadata(&self) -> &MetadataRecord {
        &self.metadata
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    /// The reader the run's frames are read through
    pub fn reader(&self) -> &EMReaderType {
        &self.reader
    }

    pub fn into_documents(self) -> DocumentStream {
        DocumentStream::new(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    Descriptor(usize),
    Event(usize),
    Stop,
    Done,
}

/// The documents of a [`Run`], produced on demand.
///
/// Dropping the stream early is always safe: no file is held open between documents.
#[derive(Debug)]
pub struct DocumentStream {
    run: Run,
    composer: RunComposer,
    step: Step,
    descriptor: Option<DescriptorDocument>,
}

impl DocumentStream {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            composer: RunComposer::new(),
            step: Step::Start,
            descriptor: None,
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    /// The uid shared by every document of this run
    pub fn run_uid(&self) -> Uuid {
        self.composer.run_uid()
    }

    fn advance(&mut self) -> Result<Option<Document>, ComposerError> {
        let doc: Document = match self.step {
            Step::Start => {
                let metadata = (*self.run.metadata).clone();
                for (key, value) in metadata.iter() {
                    trace!("{key} = {}", describe_value(value));
                }
                let doc = self.composer.compose_start(metadata, &self.run.sample_name)?;
                self.step = Step::Descriptor(0);
                doc.into()
            }
            Step::Descriptor(i) => {
                let dataset = &self.run.datasets[i];
                let source_path = dataset.source_path.to_string_lossy();
                let doc = self.composer.compose_descriptor(
                    &dataset.name,
                    frame_data_keys(&self.run.source, dataset.shape.clone()),
                    configuration_from_metadata(&dataset.metadata, &source_path),
                )?;
                self.descriptor = Some(doc.clone());
                self.step = Step::Event(i);
                doc.into()
            }
            Step::Event(i) => {
                let Some(descriptor) = self.descriptor.take() else {
                    self.step = Step::Stop;
                    return Ok(None);
                };
                let frames = self.run.datasets[i].frames.clone();
                let doc = self.composer.compose_event(&descriptor, frames)?;
                self.step = if i + 1 < self.run.datasets.len() {
                    Step::Descriptor(i + 1)
                } else {
                    Step::Stop
                };
                doc.into()
            }
            Step::Stop => {
                let doc = self.composer.compose_stop()?;
                self.step = Step::Done;
                doc.into()
            }
            Step::Done => return Ok(None),
        };
        Ok(Some(doc))
    }
}

impl Iterator for DocumentStream {
    type Item = (DocumentKind, Document);

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(doc) => doc.map(|d| (d.kind(), d)),
            Err(e) => {
                warn!("Ending the documents of {}: {e}", self.run.path.display());
                self.step = Step::Done;
                None
            }
        }
    }
}

/// Ingest the file at `path` with the default options
pub fn ingest<P: AsRef<Path>>(path: P) -> Result<DocumentStream, IngestError> {
    IngestBuilder::default().ingest(path)
}
