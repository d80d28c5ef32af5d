//! A deferred-evaluation stack of 2-D frames.
//!
//! A [`LazyFrameArray`] never holds pixel data. Each position along its leading
//! axes is a [`DeferredFrame`], a handle that knows which [`FrameSource`] to ask
//! and which flat index to ask for. Forcing a [`DeferredFrame`] performs exactly
//! one read, and nothing is retained afterwards; caching materialized frames is
//! left to the consumer.
use std::fmt::{self, Debug};
use std::ops::Range;
use std::sync::Arc;

use log::trace;
use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

use crate::io::IngestError;

use super::{DType, Frame, FrameElement};

/// Anything that can produce a frame by flat index.
///
/// Implementations must tolerate repeated and concurrent calls for the same
/// index and must not keep per-call state.
pub trait FrameSource: Send + Sync {
    /// The number of frames addressable through [`FrameSource::read_frame`]
    fn frame_count(&self) -> usize;

    /// Decode the frame at `index`
    fn read_frame(&self, index: usize) -> Result<Frame, IngestError>;

    /// A short human-readable label used in debug output
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

/// Failures to construct or address a [`LazyFrameArray`]. These never involve I/O.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LazyArrayError {
    #[error("Index {index} is out of bounds for an axis of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Expected {expected} indices, one per leading axis, but got {found}")]
    WrongIndexCount { expected: usize, found: usize },
    #[error("Expected frames of shape {expected:?} but found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Expected frames of type {expected} but found {found}")]
    DTypeMismatch { expected: DType, found: DType },
    #[error("The leading axes {leading:?} do not describe {frame_count} frames")]
    FrameCountMismatch {
        leading: Vec<usize>,
        frame_count: usize,
    },
    #[error("Cannot stack an empty collection of frames")]
    Empty,
    #[error("The array is a single 2-D plane and has no leading axis to index")]
    NoLeadingAxis,
}

/// A single not-yet-read 2-D plane.
#[derive(Clone)]
pub struct DeferredFrame {
    source: Arc<dyn FrameSource>,
    index: usize,
    shape: (usize, usize),
    dtype: DType,
}

impl Debug for DeferredFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredFrame")
            .field("source", &self.source.describe())
            .field("index", &self.index)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl DeferredFrame {
    pub fn new(
        source: Arc<dyn FrameSource>,
        index: usize,
        shape: (usize, usize),
        dtype: DType,
    ) -> Self {
        Self {
            source,
            index,
            shape,
            dtype,
        }
    }

    /// The flat frame index this plane will be read from
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Read the plane from its source.
    ///
    /// Every call reads again. A frame whose decoded shape or type disagrees with
    /// what was declared is reported as a [`IngestError::FrameRead`].
    pub fn compute(&self) -> Result<Frame, IngestError> {
        trace!("Materializing frame {} from {}", self.index, self.source.describe());
        let frame = self.source.read_frame(self.index)?;
        if frame.shape() != self.shape || frame.dtype() != self.dtype {
            return Err(IngestError::FrameRead {
                index: self.index,
                reason: format!(
                    "expected a {} frame of shape {:?}, decoded a {} frame of shape {:?}",
                    self.dtype,
                    self.shape,
                    frame.dtype(),
                    frame.shape()
                ),
            });
        }
        Ok(frame)
    }
}

/// An N-dimensional array of shape `(leading axes..., rows, columns)` whose
/// planes are read on demand.
///
/// Cloning, indexing and slicing share the underlying list of deferred planes and
/// never touch the source.
#[derive(Clone)]
pub struct LazyFrameArray {
    frames: Arc<[DeferredFrame]>,
    start: usize,
    leading: Vec<usize>,
    frame_shape: (usize, usize),
    dtype: DType,
}

impl Debug for LazyFrameArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyFrameArray")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl PartialEq for LazyFrameArray {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.frames, &other.frames)
            && self.start == other.start
            && self.leading == other.leading
    }
}

impl LazyFrameArray {
    /// Build an array over every frame of `source`, arranged on `leading` axes.
    ///
    /// The product of `leading` must equal `source.frame_count()`.
    pub fn from_source(
        source: Arc<dyn FrameSource>,
        leading: Vec<usize>,
        frame_shape: (usize, usize),
        dtype: DType,
    ) -> Result<Self, LazyArrayError> {
        let frame_count = source.frame_count();
        if leading.iter().product::<usize>() != frame_count || frame_count == 0 {
            return Err(LazyArrayError::FrameCountMismatch {
                leading,
                frame_count,
            });
        }
        let frames: Vec<DeferredFrame> = (0..frame_count)
            .map(|i| DeferredFrame::new(source.clone(), i, frame_shape, dtype))
            .collect();
        Ok(Self {
            frames: frames.into(),
            start: 0,
            leading,
            frame_shape,
            dtype,
        })
    }

    /// Stack deferred planes along a new leading axis.
    pub fn from_deferred(frames: Vec<DeferredFrame>) -> Result<Self, LazyArrayError> {
        let first = frames.first().ok_or(LazyArrayError::Empty)?;
        let frame_shape = first.shape();
        let dtype = first.dtype();
        for frame in frames.iter() {
            if frame.shape() != frame_shape {
                return Err(LazyArrayError::ShapeMismatch {
                    expected: vec![frame_shape.0, frame_shape.1],
                    found: vec![frame.shape().0, frame.shape().1],
                });
            }
            if frame.dtype() != dtype {
                return Err(LazyArrayError::DTypeMismatch {
                    expected: dtype,
                    found: frame.dtype(),
                });
            }
        }
        let leading = vec![frames.len()];
        Ok(Self {
            frames: frames.into(),
            start: 0,
            leading,
            frame_shape,
            dtype,
        })
    }

    /// Stack equally shaped arrays along a new leading axis without reading anything.
    pub fn stack(parts: &[LazyFrameArray]) -> Result<Self, LazyArrayError> {
        let first = parts.first().ok_or(LazyArrayError::Empty)?;
        let expected = first.shape();
        let mut frames = Vec::with_capacity(first.frame_count() * parts.len());
        for part in parts {
            if part.shape() != expected {
                return Err(LazyArrayError::ShapeMismatch {
                    expected,
                    found: part.shape(),
                });
            }
            if part.dtype != first.dtype {
                return Err(LazyArrayError::DTypeMismatch {
                    expected: first.dtype,
                    found: part.dtype,
                });
            }
            frames.extend_from_slice(part.frames());
        }
        let mut leading = Vec::with_capacity(first.leading.len() + 1);
        leading.push(parts.len());
        leading.extend_from_slice(&first.leading);
        Ok(Self {
            frames: frames.into(),
            start: 0,
            leading,
            frame_shape: first.frame_shape,
            dtype: first.dtype,
        })
    }

    /// Rearrange the leading axes without changing the frame order
    pub fn reshape_leading(&self, leading: Vec<usize>) -> Result<Self, LazyArrayError> {
        if leading.iter().product::<usize>() != self.frame_count() {
            return Err(LazyArrayError::FrameCountMismatch {
                leading,
                frame_count: self.frame_count(),
            });
        }
        let mut view = self.clone();
        view.leading = leading;
        Ok(view)
    }

    /// The full shape, leading axes followed by `(rows, columns)`
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = self.leading.clone();
        shape.push(self.frame_shape.0);
        shape.push(self.frame_shape.1);
        shape
    }

    pub fn ndim(&self) -> usize {
        self.leading.len() + 2
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The sizes of the non-spatial axes
    pub fn leading_shape(&self) -> &[usize] {
        &self.leading
    }

    /// The `(rows, columns)` of every plane
    pub fn frame_shape(&self) -> (usize, usize) {
        self.frame_shape
    }

    /// The length of the first axis
    pub fn len(&self) -> usize {
        self.leading.first().copied().unwrap_or(self.frame_shape.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this array is a single 2-D plane
    pub fn is_plane(&self) -> bool {
        self.leading.is_empty()
    }

    /// The number of planes in this view
    pub fn frame_count(&self) -> usize {
        self.leading.iter().product()
    }

    /// The deferred planes of this view in row-major order of the leading axes
    pub fn frames(&self) -> &[DeferredFrame] {
        &self.frames[self.start..self.start + self.frame_count()]
    }

    /// The deferred plane at a flat index into this view
    pub fn frame(&self, index: usize) -> Result<&DeferredFrame, LazyArrayError> {
        self.frames().get(index).ok_or(LazyArrayError::IndexOutOfBounds {
            index,
            len: self.frame_count(),
        })
    }

    /// The deferred plane at one index per leading axis
    pub fn at(&self, indices: &[usize]) -> Result<&DeferredFrame, LazyArrayError> {
        if indices.len() != self.leading.len() {
            return Err(LazyArrayError::WrongIndexCount {
                expected: self.leading.len(),
                found: indices.len(),
            });
        }
        let mut flat = 0;
        for (i, (index, len)) in indices.iter().zip(self.leading.iter()).enumerate() {
            if index >= len {
                return Err(LazyArrayError::IndexOutOfBounds {
                    index: *index,
                    len: *len,
                });
            }
            let stride: usize = self.leading[i + 1..].iter().product();
            flat += index * stride;
        }
        self.frame(flat)
    }

    fn stride(&self) -> usize {
        self.leading[1..].iter().product()
    }

    /// Integer indexing on the first axis. The result has one fewer axis and is
    /// still lazy; indexing the last leading axis yields a 2-D plane view.
    pub fn index(&self, index: usize) -> Result<Self, LazyArrayError> {
        let len = *self.leading.first().ok_or(LazyArrayError::NoLeadingAxis)?;
        if index >= len {
            return Err(LazyArrayError::IndexOutOfBounds { index, len });
        }
        let stride = self.stride();
        Ok(Self {
            frames: self.frames.clone(),
            start: self.start + index * stride,
            leading: self.leading[1..].to_vec(),
            frame_shape: self.frame_shape,
            dtype: self.dtype,
        })
    }

    /// Integer indexing on the first axis of an array with exactly one leading axis
    pub fn plane(&self, index: usize) -> Result<&DeferredFrame, LazyArrayError> {
        self.at(&[index])
    }

    /// A lazy sub-array covering `range` of the first axis
    pub fn slice(&self, range: Range<usize>) -> Result<Self, LazyArrayError> {
        let len = *self.leading.first().ok_or(LazyArrayError::NoLeadingAxis)?;
        if range.end > len || range.start > range.end {
            return Err(LazyArrayError::IndexOutOfBounds {
                index: range.end,
                len,
            });
        }
        let stride = self.stride();
        let mut leading = self.leading.clone();
        leading[0] = range.end - range.start;
        Ok(Self {
            frames: self.frames.clone(),
            start: self.start + range.start * stride,
            leading,
            frame_shape: self.frame_shape,
            dtype: self.dtype,
        })
    }

    /// Read every plane in this view
    pub fn compute_frames(&self) -> Result<Vec<Frame>, IngestError> {
        self.frames().iter().map(|f| f.compute()).collect()
    }

    /// Read every plane in this view into a single array of `T`.
    ///
    /// `T` must be the stored element type, see [`LazyFrameArray::dtype`].
    pub fn compute<T: FrameElement>(&self) -> Result<ArrayD<T>, IngestError> {
        if T::DTYPE != self.dtype {
            return Err(LazyArrayError::DTypeMismatch {
                expected: self.dtype,
                found: T::DTYPE,
            }
            .into());
        }
        let mut values = Vec::with_capacity(
            self.frame_count() * self.frame_shape.0 * self.frame_shape.1,
        );
        for deferred in self.frames() {
            let frame = deferred.compute()?;
            match frame.as_array::<T>() {
                Some(view) => values.extend(view.iter().copied()),
                None => {
                    return Err(LazyArrayError::DTypeMismatch {
                        expected: T::DTYPE,
                        found: frame.dtype(),
                    }
                    .into())
                }
            }
        }
        ArrayD::from_shape_vec(IxDyn(&self.shape()), values).map_err(|e| {
            IngestError::FrameRead {
                index: self.start,
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for LazyFrameArray {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("LazyFrameArray", 2)?;
        state.serialize_field("shape", &self.shape())?;
        state.serialize_field("dtype", &self.dtype)?;
        state.end()
    }
}
