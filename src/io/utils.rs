use std::fs;
use std::io::{self, prelude::*, BufReader, BufWriter, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::frame::{DType, Frame};

/// The byte order of multi-byte values in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// The path of a file next to `path` sharing its stem, e.g. `<stem>.rawtlt`
pub fn sidecar_path<P: AsRef<Path>>(path: P, extension: &str) -> PathBuf {
    path.as_ref().with_extension(extension)
}

/// The existing sidecar file with `extension`, if any
pub fn find_sidecar<P: AsRef<Path>>(path: P, extension: &str) -> Option<PathBuf> {
    let candidate = sidecar_path(path, extension);
    candidate.is_file().then_some(candidate)
}

/// Decode a fixed-width text field, dropping NUL padding
pub fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

macro_rules! read_typed {
    ($reader:expr, $order:expr, $n:expr, $t:ty, $method:ident) => {{
        let mut buf = vec![<$t>::default(); $n];
        match $order {
            Endian::Little => $reader.$method::<LittleEndian>(&mut buf)?,
            Endian::Big => $reader.$method::<BigEndian>(&mut buf)?,
        }
        buf
    }};
}

/// The byte size of a `(rows, columns)` plane of `dtype`, or `None` if it overflows a `u64`
pub fn plane_size(shape: (usize, usize), dtype: DType) -> Option<u64> {
    (shape.0 as u64)
        .checked_mul(shape.1 as u64)?
        .checked_mul(dtype.size_of() as u64)
}

/// The offset of plane `index` of `stride` bytes after `base`, or `None` on overflow
pub fn plane_offset(base: u64, index: usize, stride: u64) -> Option<u64> {
    (index as u64).checked_mul(stride)?.checked_add(base)
}

fn oversized(shape: (usize, usize)) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("a plane of {shape:?} is too large to address"),
    )
}

fn shape_error(e: ndarray::ShapeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Read one row-major `(rows, columns)` plane of `dtype` values from `reader`
pub fn read_plane<R: Read>(
    reader: &mut R,
    dtype: DType,
    shape: (usize, usize),
    order: Endian,
) -> io::Result<Frame> {
    let n = shape
        .0
        .checked_mul(shape.1)
        .ok_or_else(|| oversized(shape))?;
    let frame = match dtype {
        DType::U8 => {
            let mut buf = vec![0u8; n];
            reader.read_exact(&mut buf)?;
            Frame::from_shape_vec(shape, buf)
        }
        DType::I8 => {
            let mut buf = vec![0i8; n];
            reader.read_i8_into(&mut buf)?;
            Frame::from_shape_vec(shape, buf)
        }
        DType::U16 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, u16, read_u16_into)),
        DType::I16 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, i16, read_i16_into)),
        DType::U32 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, u32, read_u32_into)),
        DType::I32 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, i32, read_i32_into)),
        DType::U64 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, u64, read_u64_into)),
        DType::I64 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, i64, read_i64_into)),
        DType::F32 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, f32, read_f32_into)),
        DType::F64 => Frame::from_shape_vec(shape, read_typed!(reader, order, n, f64, read_f64_into)),
    };
    frame.map_err(shape_error)
}

/// Open `path`, read one plane starting at `offset` and close the file again
pub fn read_plane_at<P: AsRef<Path>>(
    path: P,
    offset: u64,
    dtype: DType,
    shape: (usize, usize),
    order: Endian,
) -> io::Result<Frame> {
    let handle = fs::File::open(path)?;
    let plane_bytes = plane_size(shape, dtype).ok_or_else(|| oversized(shape))?;
    let file_size = handle.metadata()?.len();
    if offset.checked_add(plane_bytes).map_or(true, |end| end > file_size) {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("a plane of {plane_bytes} bytes at offset {offset} runs past the end of a {file_size} byte file"),
        ));
    }
    let mut reader = BufReader::new(handle);
    reader.seek(SeekFrom::Start(offset))?;
    read_plane(&mut reader, dtype, shape, order)
}

macro_rules! write_typed {
    ($writer:expr, $order:expr, $a:expr, $method:ident) => {
        for v in $a.iter() {
            match $order {
                Endian::Little => $writer.$method::<LittleEndian>(*v)?,
                Endian::Big => $writer.$method::<BigEndian>(*v)?,
            }
        }
    };
}

/// Write `frame` in row-major order
pub fn write_plane<W: Write>(writer: &mut W, frame: &Frame, order: Endian) -> io::Result<()> {
    match frame {
        Frame::U8(a) => {
            for v in a.iter() {
                writer.write_u8(*v)?;
            }
        }
        Frame::I8(a) => {
            for v in a.iter() {
                writer.write_i8(*v)?;
            }
        }
        Frame::U16(a) => write_typed!(writer, order, a, write_u16),
        Frame::I16(a) => write_typed!(writer, order, a, write_i16),
        Frame::U32(a) => write_typed!(writer, order, a, write_u32),
        Frame::I32(a) => write_typed!(writer, order, a, write_i32),
        Frame::U64(a) => write_typed!(writer, order, a, write_u64),
        Frame::I64(a) => write_typed!(writer, order, a, write_i64),
        Frame::F32(a) => write_typed!(writer, order, a, write_f32),
        Frame::F64(a) => write_typed!(writer, order, a, write_f64),
    }
    Ok(())
}

/// Create a buffered file for writing
pub(crate) fn create_file<P: AsRef<Path>>(path: P) -> io::Result<BufWriter<fs::File>> {
    Ok(BufWriter::new(fs::File::create(path)?))
}
