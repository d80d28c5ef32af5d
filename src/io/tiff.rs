//! Reading and writing grayscale TIFF stacks, one frame per page.
//!
//! Decoding is delegated to the `tiff` crate. ImageJ stacks additionally carry a
//! pixel size through their resolution tags and `unit` description entry.

mod reader;
mod writer;

pub use reader::{is_tiff, parse_imagej_description, TIFFError, TIFFReader};
pub use writer::TIFFWriter;
