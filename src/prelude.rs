//! A set of foundational traits used throughout the library.
pub use crate::frame::{FrameElement, FrameSource};
pub use crate::io::EMFileReader;
pub use std::io::prelude::*;
