//! Reading Berkeley and Velox EMD files, both of which are HDF5 containers.
//!
//! Berkeley files keep each dataset in a group under `/data` tagged with
//! `emd_group_type = 1`, with one `dimN` vector per axis. Velox files keep images
//! under `/Data/Image` with the frame axis last and a JSON metadata blob.

mod berkeley;
mod common;
mod velox;
mod writer;

pub use berkeley::{count_berkeley_datasets, BerkeleyDataset, BerkeleyEMDReader, EMDDimension};
pub use common::EMDError;
pub use velox::{is_velox, VeloxEMDReader};
pub use writer::EMDWriter;

#[cfg(test)]
pub(crate) use writer::write_velox;
