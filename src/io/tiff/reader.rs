use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::{ColorType, TiffError};

use crate::frame::{DType, Frame};
use crate::io::infer_format::ElectronMicroscopyFormat;
use crate::io::traits::{EMFileReader, IngestError};
use crate::meta::{MetadataRecord, PhysicalCalibration};
use crate::params::{Value, ValueMap};

#[derive(Debug, Error)]
pub enum TIFFError {
    #[error("TIFF decoding failed: {0}")]
    Decoding(#[from] TiffError),
    #[error("Only single-channel images can be read as frames, found {0:?}")]
    UnsupportedColor(ColorType),
    #[error("Page {index} is not present in a file of {count} pages")]
    MissingPage { index: usize, count: usize },
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl From<TIFFError> for IngestError {
    fn from(value: TIFFError) -> Self {
        match value {
            TIFFError::IOError(e) | TIFFError::Decoding(TiffError::IoError(e)) => {
                IngestError::IOError(e)
            }
            TIFFError::UnsupportedColor(_) | TIFFError::Decoding(TiffError::UnsupportedError(_)) => {
                IngestError::Unsupported(value.to_string())
            }
            e => IngestError::MetadataParse(e.to_string()),
        }
    }
}

/// Test whether a buffer starting at the beginning of a file looks like a TIFF or BigTIFF header
pub fn is_tiff(buf: &[u8]) -> bool {
    buf.len() >= 4
        && matches!(
            &buf[..4],
            [b'I', b'I', 42, 0] | [b'M', b'M', 0, 42] | [b'I', b'I', 43, 0] | [b'M', b'M', 0, 43]
        )
}

/// Parse the `key=value` lines of an ImageJ `ImageDescription`, or `None` when the
/// description was not written by ImageJ
pub fn parse_imagej_description(description: &str) -> Option<ValueMap> {
    if !description.starts_with("ImageJ=") {
        return None;
    }
    let entries = description
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), Value::infer(value)))
        .collect();
    Some(entries)
}

fn decoding_to_frame(result: DecodingResult, shape: (usize, usize)) -> io::Result<Frame> {
    let frame = match result {
        DecodingResult::U8(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::U16(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::U32(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::U64(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::I8(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::I16(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::I32(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::I64(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::F32(v) => Frame::from_shape_vec(shape, v),
        DecodingResult::F64(v) => Frame::from_shape_vec(shape, v),
    };
    frame.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A reader for TIFF files that treats every page as one frame.
///
/// All pages are expected to share the shape and type of the first one; a page that
/// does not fails when that frame is forced.
#[derive(Debug)]
pub struct TIFFReader {
    path: PathBuf,
    page_count: usize,
    /// `(rows, columns)` of the first page
    shape: (usize, usize),
}

impl TIFFReader {
    fn decoder(path: &Path) -> Result<Decoder<BufReader<fs::File>>, TIFFError> {
        let handle = BufReader::new(fs::File::open(path)?);
        Ok(Decoder::new(handle)?.with_limits(Limits::unlimited()))
    }

    fn open_pages(path: &Path) -> Result<(usize, (usize, usize)), TIFFError> {
        let mut decoder = Self::decoder(path)?;
        let (width, height) = decoder.dimensions()?;
        let mut page_count = 1;
        while decoder.more_images() {
            decoder.next_image()?;
            page_count += 1;
        }
        Ok((page_count, (height as usize, width as usize)))
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    fn read_page(&self, index: usize) -> Result<Frame, TIFFError> {
        if index >= self.page_count {
            return Err(TIFFError::MissingPage {
                index,
                count: self.page_count,
            });
        }
        let mut decoder = Self::decoder(&self.path)?;
        for _ in 0..index {
            decoder.next_image()?;
        }
        let color = decoder.colortype()?;
        if !matches!(color, ColorType::Gray(_)) {
            return Err(TIFFError::UnsupportedColor(color));
        }
        let (width, height) = decoder.dimensions()?;
        let result = decoder.read_image()?;
        Ok(decoding_to_frame(result, (height as usize, width as usize))?)
    }

    fn read_first_page_tags(&self) -> Result<(MetadataRecord, PhysicalCalibration, PhysicalCalibration), TIFFError> {
        let mut decoder = Self::decoder(&self.path)?;
        let mut record = MetadataRecord::new();
        let (width, height) = decoder.dimensions()?;
        record.insert("ImageWidth", width);
        record.insert("ImageLength", height);
        record.insert("pages", self.page_count);

        let description = match decoder.find_tag(Tag::ImageDescription)? {
            Some(tiff::decoder::ifd::Value::Ascii(s)) => Some(s),
            _ => None,
        };
        let imagej = description.as_deref().and_then(parse_imagej_description);
        let Some(imagej) = imagej else {
            if let Some(description) = description {
                record.insert("ImageDescription", description);
            }
            return Ok((record, PhysicalCalibration::unscaled(), PhysicalCalibration::unscaled()));
        };

        let unit = imagej
            .get("unit")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut axis = |tag: Tag| -> Result<PhysicalCalibration, TIFFError> {
            let calibration = match decoder.find_tag(tag)? {
                Some(tiff::decoder::ifd::Value::Rational(n, d)) if n > 0 => {
                    PhysicalCalibration::new(d as f64 / n as f64, 0.0, &unit)
                }
                _ => PhysicalCalibration::unscaled(),
            };
            Ok(calibration)
        };
        let x = axis(Tag::XResolution)?;
        let y = axis(Tag::YResolution)?;
        for (key, value) in imagej {
            record.insert(format!("ImageJ.{key}"), value);
        }
        Ok((record, x, y))
    }
}

impl EMFileReader for TIFFReader {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let (page_count, shape) = Self::open_pages(path).map_err(|e| match e {
            TIFFError::IOError(e) if e.kind() == io::ErrorKind::NotFound => IngestError::IOError(e),
            e => IngestError::file_format(path, ElectronMicroscopyFormat::TIFF, e),
        })?;
        debug!(
            "Opened TIFF {} with {page_count} pages of {shape:?}",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            page_count,
            shape,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        ElectronMicroscopyFormat::TIFF
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        self.check_dataset(dataset)?;
        Ok(vec![self.page_count])
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        self.check_dataset(dataset)?;
        self.check_frame(dataset, index)?;
        self.read_page(index).map_err(|e| match e {
            TIFFError::UnsupportedColor(_) => e.into(),
            e => IngestError::frame_read(index, e),
        })
    }

    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        let frame = self.read_frame(dataset, index)?;
        if index == 0 && frame.shape() != self.shape {
            return Err(IngestError::frame_read(
                index,
                format!("decoded {:?} but the header declares {:?}", frame.shape(), self.shape),
            ));
        }
        Ok((frame.shape(), frame.dtype()))
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        let (mut record, x, y) = self.read_first_page_tags()?;
        record.set_calibration(&x, &y);
        record.set_file_name(&self.path);
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::tiff::TIFFWriter;
    use crate::meta::{PHYSICAL_SIZE_X, PHYSICAL_SIZE_Y, PHYSICAL_SIZE_Y_UNIT};
    use ndarray::{Array3, Axis};

    #[test_log::test]
    fn test_imagej_stack() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stack.tif");
        let data = Array3::from_shape_fn((10, 11, 12), |(t, _, _)| t as u16);
        TIFFWriter::new(&path)
            .pixel_size(0.25, 0.5)
            .unit("um")
            .write(data.view())?;

        let reader = TIFFReader::open_path(&path)?;
        assert_eq!(reader.frame_axes(0)?, vec![10]);
        assert_eq!(reader.probe_frame(0, 0)?, ((11, 12), DType::U16));
        let frame = reader.read_frame(0, 7)?;
        assert_eq!(frame.as_array::<u16>().unwrap(), data.index_axis(Axis(0), 7));

        let meta = reader.read_metadata()?;
        assert_eq!(meta.get(PHYSICAL_SIZE_X), Some(&Value::Float(0.25)));
        assert_eq!(meta.get(PHYSICAL_SIZE_Y), Some(&Value::Float(0.5)));
        assert_eq!(meta.get(PHYSICAL_SIZE_Y_UNIT), Some(&Value::from("um")));
        assert_eq!(meta.get("ImageJ.images"), Some(&Value::Int(10)));
        Ok(())
    }

    #[test_log::test]
    fn test_plain_single_page() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plain.tiff");
        let data = Array3::from_shape_fn((1, 4, 3), |(_, y, x)| (y * 3 + x) as f32);
        TIFFWriter::new(&path).write(data.view())?;

        let reader = TIFFReader::open_path(&path)?;
        assert_eq!(reader.frame_count(0)?, 1);
        assert_eq!(reader.read_frame(0, 0)?.dtype(), DType::F32);
        let meta = reader.read_metadata()?;
        assert_eq!(meta.calibration().0, PhysicalCalibration::unscaled());
        assert!(matches!(
            reader.read_frame(0, 1),
            Err(IngestError::FrameIndexOutOfRange { index: 1, count: 1 })
        ));

        fs::write(&path, b"II*\x00garbage")?;
        assert!(matches!(
            TIFFReader::open_path(&path),
            Err(IngestError::FileFormat { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_imagej_description() {
        let entries = parse_imagej_description("ImageJ=1.11a\nimages=30\nspacing=0.1\nunit=um\n").unwrap();
        assert_eq!(entries.get("spacing"), Some(&Value::Float(0.1)));
        assert_eq!(entries.get("unit"), Some(&Value::from("um")));
        assert!(parse_imagej_description("a scanned page").is_none());
        assert!(is_tiff(b"II*\x00"));
        assert!(!is_tiff(b"MAP "));
    }
}
