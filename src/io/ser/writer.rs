//! Builds synthetic SER files for tests.
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use ndarray::{ArrayView3, Axis};

use crate::frame::{Frame, FrameElement};
use crate::io::utils::{write_plane, Endian};

use super::reader::{
    code_from_dtype, SER_BYTE_ORDER, SER_IMAGE, SER_LARGE_OFFSETS, SER_SERIES_ID, SER_SPECTRUM,
};

const TIME_TAG: u16 = 0x4152;

#[derive(Debug, Clone)]
pub(crate) struct SERWriter {
    path: PathBuf,
    version: u16,
    calibration: [(f64, f64); 2],
    valid_elements: Option<usize>,
    spectra: bool,
}

impl SERWriter {
    pub(crate) fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            version: SER_LARGE_OFFSETS,
            calibration: [(1.0, 0.0), (1.0, 0.0)],
            valid_elements: None,
            spectra: false,
        }
    }

    pub(crate) fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// `(delta, offset)` for x then y
    pub(crate) fn calibration(mut self, calibration: [(f64, f64); 2]) -> Self {
        self.calibration = calibration;
        self
    }

    pub(crate) fn valid_elements(mut self, n: usize) -> Self {
        self.valid_elements = Some(n);
        self
    }

    /// Write each `(1, n)` plane as a 1-D spectrum element
    pub(crate) fn spectra(mut self, spectra: bool) -> Self {
        self.spectra = spectra;
        self
    }

    fn write_offset(&self, out: &mut Vec<u8>, offset: u64) -> io::Result<()> {
        if self.version >= SER_LARGE_OFFSETS {
            out.write_u64::<LittleEndian>(offset)
        } else {
            out.write_u32::<LittleEndian>(offset as u32)
        }
    }

    pub(crate) fn write<T: FrameElement>(&self, data: ArrayView3<T>) -> io::Result<()> {
        let code = code_from_dtype(T::DTYPE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unsupported element type"))?;
        let (total, rows, columns) = data.dim();
        let valid = self.valid_elements.unwrap_or(total);

        let mut out = Vec::new();
        out.write_u16::<LittleEndian>(SER_BYTE_ORDER)?;
        out.write_u16::<LittleEndian>(SER_SERIES_ID)?;
        out.write_u16::<LittleEndian>(self.version)?;
        out.write_u32::<LittleEndian>(if self.spectra { SER_SPECTRUM } else { SER_IMAGE })?;
        out.write_u32::<LittleEndian>(TIME_TAG as u32)?;
        out.write_u32::<LittleEndian>(total as u32)?;
        out.write_u32::<LittleEndian>(valid as u32)?;
        let offset_position = out.len();
        self.write_offset(&mut out, 0)?;

        out.write_u32::<LittleEndian>(1)?;
        out.write_u32::<LittleEndian>(total as u32)?;
        out.write_f64::<LittleEndian>(0.0)?;
        out.write_f64::<LittleEndian>(1.0)?;
        out.write_u32::<LittleEndian>(0)?;
        for text in ["Number", ""] {
            out.write_u32::<LittleEndian>(text.len() as u32)?;
            out.write_all(text.as_bytes())?;
        }

        let mut data_offsets = Vec::with_capacity(total);
        for plane in data.axis_iter(Axis(0)) {
            data_offsets.push(out.len() as u64);
            if self.spectra {
                let (delta, offset) = self.calibration[0];
                out.write_f64::<LittleEndian>(offset)?;
                out.write_f64::<LittleEndian>(delta)?;
                out.write_u32::<LittleEndian>(0)?;
                out.write_u16::<LittleEndian>(code)?;
                out.write_u32::<LittleEndian>((rows * columns) as u32)?;
            } else {
                for (delta, offset) in self.calibration {
                    out.write_f64::<LittleEndian>(offset)?;
                    out.write_f64::<LittleEndian>(delta)?;
                    out.write_u32::<LittleEndian>(0)?;
                }
                out.write_u16::<LittleEndian>(code)?;
                out.write_u32::<LittleEndian>(columns as u32)?;
                out.write_u32::<LittleEndian>(rows as u32)?;
            }
            let frame: Frame = plane.to_owned().into();
            write_plane(&mut out, &frame, Endian::Little)?;
        }

        let mut tag_offsets = Vec::with_capacity(total);
        for i in 0..total {
            tag_offsets.push(out.len() as u64);
            out.write_u16::<LittleEndian>(TIME_TAG)?;
            out.write_i32::<LittleEndian>(i as i32 * 10)?;
        }

        let table_offset = out.len() as u64;
        for offset in data_offsets.into_iter().chain(tag_offsets) {
            self.write_offset(&mut out, offset)?;
        }
        let mut patch = Vec::new();
        self.write_offset(&mut patch, table_offset)?;
        out[offset_position..offset_position + patch.len()].copy_from_slice(&patch);

        fs::write(&self.path, out)
    }
}
