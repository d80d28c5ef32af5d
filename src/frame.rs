//! Materialized frames, their element types, and the lazy arrays that defer
//! reading them.
mod data;
mod dtype;
mod lazy;

pub use data::{Frame, FrameElement};
pub use dtype::DType;
pub use lazy::{DeferredFrame, FrameSource, LazyArrayError, LazyFrameArray};
