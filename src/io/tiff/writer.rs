use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use ndarray::{ArrayView3, Axis};
use tiff::encoder::{colortype, Rational, TiffEncoder};
use tiff::tags::{ResolutionUnit, Tag};
use tiff::TiffResult;

use crate::frame::{Frame, FrameElement};
use crate::io::utils::create_file;

use super::reader::TIFFError;

const RESOLUTION_DENOMINATOR: u32 = 1000;

/// Writes a `(frames, rows, columns)` stack as a multi-page grayscale TIFF.
///
/// When a pixel size is given the file is written as an ImageJ stack so the size and
/// unit can be read back.
#[derive(Debug, Clone)]
pub struct TIFFWriter {
    path: PathBuf,
    pixel_size: Option<(f64, f64)>,
    unit: String,
}

struct PageOptions<'a> {
    description: Option<&'a str>,
    pixel_size: Option<(f64, f64)>,
}

fn to_resolution(pixel_size: f64) -> Rational {
    let n = (RESOLUTION_DENOMINATOR as f64 / pixel_size).round();
    Rational {
        n: n.clamp(1.0, u32::MAX as f64) as u32,
        d: RESOLUTION_DENOMINATOR,
    }
}

fn write_page<W: Write + Seek>(
    encoder: &mut TiffEncoder<W>,
    frame: &Frame,
    options: &PageOptions,
) -> TiffResult<()> {
    macro_rules! page {
        ($color:ty, $a:expr) => {{
            let (rows, columns) = $a.dim();
            let mut image = encoder.new_image::<$color>(columns as u32, rows as u32)?;
            if let Some(description) = options.description {
                image.encoder().write_tag(Tag::ImageDescription, description)?;
            }
            if let Some((x, y)) = options.pixel_size {
                image.resolution_unit(ResolutionUnit::None);
                image.x_resolution(to_resolution(x));
                image.y_resolution(to_resolution(y));
            }
            let data: Vec<_> = $a.iter().copied().collect();
            image.write_data(&data)
        }};
    }
    match frame {
        Frame::U8(a) => page!(colortype::Gray8, a),
        Frame::I8(a) => page!(colortype::GrayI8, a),
        Frame::U16(a) => page!(colortype::Gray16, a),
        Frame::I16(a) => page!(colortype::GrayI16, a),
        Frame::U32(a) => page!(colortype::Gray32, a),
        Frame::I32(a) => page!(colortype::GrayI32, a),
        Frame::U64(a) => page!(colortype::Gray64, a),
        Frame::I64(a) => page!(colortype::GrayI64, a),
        Frame::F32(a) => page!(colortype::Gray32Float, a),
        Frame::F64(a) => page!(colortype::Gray64Float, a),
    }
}

impl TIFFWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pixel_size: None,
            unit: String::new(),
        }
    }

    /// Set the `(x, y)` pixel size, written as the inverse resolution
    pub fn pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = Some((x, y));
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    fn imagej_description(&self, n_frames: usize) -> String {
        let mut description = format!("ImageJ=1.11a\nimages={n_frames}\n");
        if n_frames > 1 {
            description.push_str(&format!("slices={n_frames}\n"));
        }
        if !self.unit.is_empty() {
            description.push_str(&format!("unit={}\n", self.unit));
        }
        description
    }

    /// Write `data`, replacing any existing file
    pub fn write<T: FrameElement>(&self, data: ArrayView3<T>) -> Result<(), TIFFError> {
        let mut handle = create_file(&self.path)?;
        let description = self
            .pixel_size
            .map(|_| self.imagej_description(data.len_of(Axis(0))));
        {
            let mut encoder = TiffEncoder::new(&mut handle)?;
            for (i, plane) in data.axis_iter(Axis(0)).enumerate() {
                let frame: Frame = plane.to_owned().into();
                let options = PageOptions {
                    description: if i == 0 { description.as_deref() } else { None },
                    pixel_size: self.pixel_size,
                };
                write_page(&mut encoder, &frame, &options)?;
            }
        }
        handle.flush()?;
        Ok(())
    }
}
