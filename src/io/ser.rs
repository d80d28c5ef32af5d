//! Reading FEI TIA series (SER) files and their EMI sidecars.
//!
//! A SER file is a little-endian header, a table of element offsets and a series
//! of data elements. Only 2-D image elements can be read as frames.

mod emi;
mod reader;
#[cfg(test)]
pub(crate) mod writer;

pub use emi::{emi_sidecar, parse_emi, EMIError};
pub use reader::{is_ser, SERDimension, SERError, SERHeader, SERReader};
