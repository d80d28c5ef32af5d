use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use ndarray::{ArrayView3, Axis};
use num_traits::ToPrimitive;

use crate::frame::{Frame, FrameElement};
use crate::io::utils::{create_file, write_plane, Endian};

use super::reader::{mode_from_dtype, MRCError, MRC_HEADER_SIZE};

/// Writes a `(frames, rows, columns)` stack as a little-endian MRC2014 file.
///
/// Supported element types are `i8`, `i16`, `f32` and `u16`.
#[derive(Debug, Clone)]
pub struct MRCWriter {
    path: PathBuf,
    voxel_size: [f32; 3],
    extended_header: Option<(String, Vec<u8>)>,
    labels: Vec<String>,
}

impl MRCWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            voxel_size: [1.0; 3],
            extended_header: None,
            labels: Vec::new(),
        }
    }

    /// Set the `[z, y, x]` voxel size in Ångström
    pub fn voxel_size(mut self, voxel_size: [f32; 3]) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    /// Attach an extended header block tagged with a four character type such as `FEI1`
    pub fn extended_header(mut self, kind: &str, block: Vec<u8>) -> Self {
        self.extended_header = Some((kind.to_string(), block));
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        if self.labels.len() < 10 {
            self.labels.push(label.to_string());
        }
        self
    }

    fn write_header<W: Write, T: FrameElement>(
        &self,
        writer: &mut W,
        data: &ArrayView3<T>,
    ) -> Result<(), MRCError> {
        let mode = mode_from_dtype(T::DTYPE)?;
        let (nz, ny, nx) = data.dim();
        let (mut dmin, mut dmax, mut total) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in data.iter().filter_map(|v| v.to_f64()) {
            dmin = dmin.min(v);
            dmax = dmax.max(v);
            total += v;
        }
        let dmean = if data.is_empty() {
            0.0
        } else {
            total / data.len() as f64
        };

        let mut header = io::Cursor::new(vec![0u8; MRC_HEADER_SIZE]);
        for n in [nx, ny, nz] {
            header.write_i32::<LittleEndian>(n as i32)?;
        }
        header.write_i32::<LittleEndian>(mode)?;
        for _ in 0..3 {
            header.write_i32::<LittleEndian>(0)?;
        }
        for n in [nx, ny, nz] {
            header.write_i32::<LittleEndian>(n as i32)?;
        }
        let [vz, vy, vx] = self.voxel_size;
        for (size, n) in [(vx, nx), (vy, ny), (vz, nz)] {
            header.write_f32::<LittleEndian>(size * n as f32)?;
        }
        for _ in 0..3 {
            header.write_f32::<LittleEndian>(90.0)?;
        }
        for axis in [1, 2, 3] {
            header.write_i32::<LittleEndian>(axis)?;
        }
        for v in [dmin, dmax, dmean] {
            header.write_f32::<LittleEndian>(if v.is_finite() { v as f32 } else { 0.0 })?;
        }
        header.write_i32::<LittleEndian>(0)?;
        let (kind, block_len) = match &self.extended_header {
            Some((kind, block)) => (kind.as_bytes(), block.len()),
            None => (&b""[..], 0),
        };
        header.write_i32::<LittleEndian>(block_len as i32)?;

        let buf = header.get_mut();
        let n = kind.len().min(4);
        buf[104..104 + n].copy_from_slice(&kind[..n]);
        buf[108..112].copy_from_slice(&20140i32.to_le_bytes());
        buf[208..212].copy_from_slice(b"MAP ");
        buf[212..216].copy_from_slice(&[0x44, 0x44, 0, 0]);
        buf[220..224].copy_from_slice(&(self.labels.len() as i32).to_le_bytes());
        for (i, label) in self.labels.iter().enumerate() {
            let bytes = label.as_bytes();
            let n = bytes.len().min(80);
            buf[224 + i * 80..224 + i * 80 + n].copy_from_slice(&bytes[..n]);
        }
        writer.write_all(buf)?;
        if let Some((_, block)) = &self.extended_header {
            writer.write_all(block)?;
        }
        Ok(())
    }

    /// Write `data`, replacing any existing file
    pub fn write<T: FrameElement>(&self, data: ArrayView3<T>) -> Result<(), MRCError> {
        let mut writer = create_file(&self.path)?;
        self.write_header(&mut writer, &data)?;
        for plane in data.axis_iter(Axis(0)) {
            let frame: Frame = plane.to_owned().into();
            write_plane(&mut writer, &frame, Endian::Little)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::mrc::MRCHeader;
    use ndarray::Array3;

    #[test]
    fn test_header_layout() -> Result<(), MRCError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("h.mrc");
        let data = Array3::<f32>::from_elem((2, 3, 4), 2.5);
        MRCWriter::new(&path)
            .voxel_size([1.0, 2.0, 3.0])
            .label("written by a test")
            .write(data.view())?;
        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), MRC_HEADER_SIZE + 2 * 3 * 4 * 4);
        let header = MRCHeader::parse(&bytes)?;
        assert_eq!((header.nx, header.ny, header.nz), (4, 3, 2));
        assert_eq!(header.voxel_size(), [1.0, 2.0, 3.0]);
        assert_eq!(header.dmean, 2.5);
        assert_eq!(header.labels, vec!["written by a test".to_string()]);
        assert!(super::super::is_mrc(&bytes));

        let unsupported = Array3::<u64>::zeros((1, 1, 1));
        assert!(matches!(
            MRCWriter::new(&path).write(unsupported.view()),
            Err(MRCError::UnsupportedDType(_))
        ));
        Ok(())
    }
}
