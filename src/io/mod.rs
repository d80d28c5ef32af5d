//! Reading electron microscopy file formats and abstractions over them.
//!
//! Each format adapter implements [`EMFileReader`]. Opening an adapter parses headers
//! only; frames are read one at a time, on demand, by flat index. [`EMReaderType`]
//! dispatches over every adapter and picks one with [`sniff`]/[`infer_format`].
//!

pub mod dm;
#[cfg(feature = "emd")]
pub mod emd;
mod infer_format;
pub mod mrc;
pub mod ser;
#[cfg(feature = "tiff")]
pub mod tiff;
pub(crate) mod traits;
mod utils;

pub use crate::io::infer_format::{
    classify_emd, infer_format, infer_from_bytes, infer_from_path, infer_from_stream, is_hdf5,
    probe_emd, sniff, EMReaderBuilder, EMReaderType, ElectronMicroscopyFormat, EmdProbe,
    FormatRegistry, SNIFF_PREFIX_LENGTH,
};

pub use crate::io::traits::{lazy_frames, EMFileReader, IngestError, ReaderFrameSource};

pub use crate::io::dm::{DMError, DMReader};
pub use crate::io::mrc::{MRCError, MRCReader, MRCWriter};
pub use crate::io::ser::{SERError, SERReader};

#[cfg(feature = "tiff")]
pub use crate::io::tiff::{TIFFError, TIFFReader, TIFFWriter};

#[cfg(feature = "emd")]
pub use crate::io::emd::{BerkeleyEMDReader, EMDError, EMDWriter, VeloxEMDReader};
