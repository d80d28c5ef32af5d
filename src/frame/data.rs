use std::fmt::Debug;

use ndarray::{Array2, ArrayView2};
use num_traits::{NumCast, ToPrimitive};

use super::DType;

/// A pixel type that a [`Frame`] can hold.
pub trait FrameElement:
    Copy + Default + Debug + PartialEq + ToPrimitive + NumCast + Send + Sync + 'static
{
    const DTYPE: DType;

    fn wrap(array: Array2<Self>) -> Frame;

    fn view(frame: &Frame) -> Option<ArrayView2<'_, Self>>;

    fn unwrap(frame: Frame) -> Result<Array2<Self>, Frame>;
}

macro_rules! impl_frame_element {
    ($t:ty, $variant:ident) => {
        impl FrameElement for $t {
            const DTYPE: DType = DType::$variant;

            fn wrap(array: Array2<Self>) -> Frame {
                Frame::$variant(array)
            }

            fn view(frame: &Frame) -> Option<ArrayView2<'_, Self>> {
                match frame {
                    Frame::$variant(a) => Some(a.view()),
                    _ => None,
                }
            }

            fn unwrap(frame: Frame) -> Result<Array2<Self>, Frame> {
                match frame {
                    Frame::$variant(a) => Ok(a),
                    other => Err(other),
                }
            }
        }
    };
}

impl_frame_element!(u8, U8);
impl_frame_element!(i8, I8);
impl_frame_element!(u16, U16);
impl_frame_element!(i16, I16);
impl_frame_element!(u32, U32);
impl_frame_element!(i32, I32);
impl_frame_element!(u64, U64);
impl_frame_element!(i64, I64);
impl_frame_element!(f32, F32);
impl_frame_element!(f64, F64);

/// A single materialized 2-D `(rows, columns)` plane.
///
/// The element type is whatever the source file stores; use [`Frame::as_array`]
/// for a typed view or [`Frame::to_f64`] for a uniform representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    U8(Array2<u8>),
    I8(Array2<i8>),
    U16(Array2<u16>),
    I16(Array2<i16>),
    U32(Array2<u32>),
    I32(Array2<i32>),
    U64(Array2<u64>),
    I64(Array2<i64>),
    F32(Array2<f32>),
    F64(Array2<f64>),
}

macro_rules! frame_dispatch {
    ($f:expr, $a:ident, $e:expr) => {
        match $f {
            Frame::U8($a) => $e,
            Frame::I8($a) => $e,
            Frame::U16($a) => $e,
            Frame::I16($a) => $e,
            Frame::U32($a) => $e,
            Frame::I32($a) => $e,
            Frame::U64($a) => $e,
            Frame::I64($a) => $e,
            Frame::F32($a) => $e,
            Frame::F64($a) => $e,
        }
    };
}

impl Frame {
    pub fn dtype(&self) -> DType {
        match self {
            Frame::U8(_) => DType::U8,
            Frame::I8(_) => DType::I8,
            Frame::U16(_) => DType::U16,
            Frame::I16(_) => DType::I16,
            Frame::U32(_) => DType::U32,
            Frame::I32(_) => DType::I32,
            Frame::U64(_) => DType::U64,
            Frame::I64(_) => DType::I64,
            Frame::F32(_) => DType::F32,
            Frame::F64(_) => DType::F64,
        }
    }

    /// The `(rows, columns)` of the plane
    pub fn shape(&self) -> (usize, usize) {
        frame_dispatch!(self, a, a.dim())
    }

    pub fn len(&self) -> usize {
        frame_dispatch!(self, a, a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the plane as an array of `T` if `T` is the stored element type
    pub fn as_array<T: FrameElement>(&self) -> Option<ArrayView2<'_, T>> {
        T::view(self)
    }

    /// Take the plane as an array of `T`, returning `self` if the element type
    /// does not match
    pub fn into_array<T: FrameElement>(self) -> Result<Array2<T>, Frame> {
        T::unwrap(self)
    }

    /// Convert every pixel to `f64`. Integers wider than 53 bits may lose precision.
    pub fn to_f64(&self) -> Array2<f64> {
        frame_dispatch!(self, a, a.mapv(|v| v.to_f64().unwrap_or(f64::NAN)))
    }

    /// Convert every pixel to `T`, failing if any value is not representable
    pub fn cast<T: FrameElement>(&self) -> Option<Array2<T>> {
        frame_dispatch!(self, a, {
            let values: Option<Vec<T>> = a.iter().map(|v| <T as NumCast>::from(*v)).collect();
            values.and_then(|v| Array2::from_shape_vec(a.dim(), v).ok())
        })
    }

    /// Build a plane from row-major values
    pub fn from_shape_vec<T: FrameElement>(
        shape: (usize, usize),
        values: Vec<T>,
    ) -> Result<Self, ndarray::ShapeError> {
        Ok(T::wrap(Array2::from_shape_vec(shape, values)?))
    }
}

impl<T: FrameElement> From<Array2<T>> for Frame {
    fn from(value: Array2<T>) -> Self {
        T::wrap(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_typed_access() {
        let frame: Frame = array![[1u16, 2, 3], [4, 5, 6]].into();
        assert_eq!(frame.dtype(), DType::U16);
        assert_eq!(frame.shape(), (2, 3));
        assert!(frame.as_array::<f32>().is_none());
        let view = frame.as_array::<u16>().unwrap();
        assert_eq!(view[[1, 2]], 6);

        let as_float = frame.to_f64();
        assert_eq!(as_float[[0, 1]], 2.0);

        let narrowed = frame.cast::<u8>().unwrap();
        assert_eq!(narrowed[[1, 0]], 4);

        let frame = frame.into_array::<i32>().unwrap_err();
        assert_eq!(frame.into_array::<u16>().unwrap().sum(), 21);
    }

    #[test]
    fn test_cast_out_of_range() {
        let frame: Frame = array![[-1i16, 300]].into();
        assert!(frame.cast::<u8>().is_none());
        assert_eq!(frame.cast::<i32>().unwrap()[[0, 1]], 300);
    }
}
