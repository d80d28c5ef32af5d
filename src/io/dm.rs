//! Reading Gatan DigitalMicrograph DM3 and DM4 files.
//!
//! A DM file is a tree of named tag groups and typed tag values. Tag structure
//! is always big-endian; values follow the byte order flag in the file header.
//! Image arrays are located while parsing but never read until a frame is
//! requested.

mod reader;
mod tags;
#[cfg(test)]
pub(crate) mod writer;

pub use reader::{DMImageInfo, DMReader};
pub use tags::{is_dm, DMArrayRef, DMElementType, DMError, DMTagTree, DMVersion};
