//! Reading and writing MRC volumes and image stacks, including the IMOD and FEI
//! dialects (`.mrc`, `.rec`, `.ali`, `.st`).
//!
//! The header is the MRC2014 layout: 1024 bytes, followed by `nsymbt` bytes of
//! extended header, followed by `nz` planes of `ny × nx` values.

mod reader;
mod writer;

pub use reader::{is_mrc, MRCError, MRCHeader, MRCReader, MRC_HEADER_SIZE};
pub use writer::MRCWriter;
