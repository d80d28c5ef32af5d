//! `emdata` provides lazy, uniform access to electron microscopy data files.
//!
//! A file is sniffed to pick a format adapter, its headers are parsed, and its
//! datasets are exposed as [`LazyFrameArray`]s: stacks of 2-D frames that are only
//! read from disk when forced. The result is delivered either as a [`Run`] or as an
//! ordered stream of start, descriptor, event and stop [`Document`]s.
//!
//! Supported formats are Gatan DigitalMicrograph (DM3/DM4), MRC, FEI/TIA SER, TIFF
//! stacks, and, with the `emd` feature, Berkeley and Velox EMD.
//!
//! ```no_run
//! use emdata::prelude::*;
//!
//! let run = emdata::IngestBuilder::new().open("micrograph.dm4")?;
//! for dataset in run.datasets() {
//!     let first = dataset.frames.frame(0)?.compute()?;
//!     println!("{}: {:?} {}", dataset.name, first.shape(), dataset.dtype);
//! }
//! # Ok::<(), emdata::IngestError>(())
//! ```
pub mod document;
pub mod frame;
pub mod ingest;
pub mod io;
pub mod meta;
pub mod params;
pub mod prelude;

pub use crate::document::{Document, DocumentKind, RunComposer};
pub use crate::frame::{DType, Frame, LazyFrameArray};
pub use crate::ingest::{ingest, Dataset, DocumentStream, IngestBuilder, Run};
pub use crate::io::{EMFileReader, EMReaderType, ElectronMicroscopyFormat, IngestError};
pub use crate::meta::{MetadataCache, MetadataRecord, PhysicalCalibration};
pub use crate::params::Value;
