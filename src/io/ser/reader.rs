use std::fs;
use std::io::{self, prelude::*, BufReader, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use thiserror::Error;

use crate::frame::{DType, Frame};
use crate::io::infer_format::ElectronMicroscopyFormat;
use crate::io::traits::{EMFileReader, IngestError};
use crate::io::utils::{plane_size, read_plane, Endian};
use crate::meta::{MetadataRecord, PhysicalCalibration};
use crate::params::{Value, ValueMap};

use super::emi::{emi_sidecar, parse_emi};

pub(crate) const SER_BYTE_ORDER: u16 = 0x4949;
pub(crate) const SER_SERIES_ID: u16 = 0x0197;
/// Series versions from this one on store 64-bit offsets
pub(crate) const SER_LARGE_OFFSETS: u16 = 0x0220;
pub(crate) const SER_SPECTRUM: u32 = 0x4120;
pub(crate) const SER_IMAGE: u32 = 0x4122;

/// The size of the per-element image header preceding the pixel data
const IMAGE_ELEMENT_HEADER: u64 = 2 * (8 + 8 + 4) + 2 + 4 + 4;

#[derive(Debug, Error)]
pub enum SERError {
    #[error("Not a SER file, found byte order {byte_order:#06x} and series id {series_id:#06x}")]
    NotSER { byte_order: u16, series_id: u16 },
    #[error("Unknown SER data type {0:#06x}")]
    UnknownDataType(u32),
    #[error("Series elements hold 1-D spectra, which cannot be read as frames")]
    SpectrumSeries,
    #[error("Unsupported SER element data type {0}")]
    UnsupportedElementType(u16),
    #[error("Element {index} is not present in the series of {count}")]
    MissingElement { index: usize, count: usize },
    #[error("Malformed SER header: {0}")]
    Malformed(String),
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl From<SERError> for IngestError {
    fn from(value: SERError) -> Self {
        match value {
            SERError::IOError(e) => IngestError::IOError(e),
            SERError::SpectrumSeries | SERError::UnsupportedElementType(_) => {
                IngestError::Unsupported(value.to_string())
            }
            e => IngestError::MetadataParse(e.to_string()),
        }
    }
}

/// Test whether a buffer starting at the beginning of a file looks like a SER header
pub fn is_ser(buf: &[u8]) -> bool {
    buf.len() >= 6
        && u16::from_le_bytes([buf[0], buf[1]]) == SER_BYTE_ORDER
        && u16::from_le_bytes([buf[2], buf[3]]) == SER_SERIES_ID
}

fn dtype_from_code(code: u16) -> Result<DType, SERError> {
    let dtype = match code {
        1 => DType::U8,
        2 => DType::U16,
        3 => DType::U32,
        4 => DType::I8,
        5 => DType::I16,
        6 => DType::I32,
        7 => DType::F32,
        8 => DType::F64,
        _ => return Err(SERError::UnsupportedElementType(code)),
    };
    Ok(dtype)
}

pub(crate) fn code_from_dtype(dtype: DType) -> Option<u16> {
    let code = match dtype {
        DType::U8 => 1,
        DType::U16 => 2,
        DType::U32 => 3,
        DType::I8 => 4,
        DType::I16 => 5,
        DType::I32 => 6,
        DType::F32 => 7,
        DType::F64 => 8,
        _ => return None,
    };
    Some(code)
}

fn read_text<R: Read>(reader: &mut R) -> Result<String, SERError> {
    let len = reader.read_u32::<LittleEndian>()?;
    if len > 1 << 16 {
        return Err(SERError::Malformed(format!("text field of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// The description of one axis of the series, e.g. the scan positions of a map
#[derive(Debug, Clone, PartialEq)]
pub struct SERDimension {
    pub size: u32,
    pub calibration_offset: f64,
    pub calibration_delta: f64,
    pub calibration_element: u32,
    pub description: String,
    pub units: String,
}

impl SERDimension {
    fn read<R: Read>(reader: &mut R) -> Result<Self, SERError> {
        Ok(Self {
            size: reader.read_u32::<LittleEndian>()?,
            calibration_offset: reader.read_f64::<LittleEndian>()?,
            calibration_delta: reader.read_f64::<LittleEndian>()?,
            calibration_element: reader.read_u32::<LittleEndian>()?,
            description: read_text(reader)?,
            units: read_text(reader)?,
        })
    }

    fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert("DimensionSize".into(), self.size.into());
        map.insert("CalibrationOffset".into(), self.calibration_offset.into());
        map.insert("CalibrationDelta".into(), self.calibration_delta.into());
        map.insert("CalibrationElement".into(), self.calibration_element.into());
        map.insert("Description".into(), self.description.as_str().into());
        map.insert("Units".into(), self.units.as_str().into());
        Value::Map(map)
    }
}

/// The series header and element offset table of a SER file
#[derive(Debug, Clone, PartialEq)]
pub struct SERHeader {
    pub series_version: u16,
    pub data_type_id: u32,
    pub tag_type_id: u32,
    pub total_number_elements: u32,
    pub valid_number_elements: u32,
    pub offset_array_offset: u64,
    pub dimensions: Vec<SERDimension>,
    pub data_offsets: Vec<u64>,
    pub tag_offsets: Vec<u64>,
}

impl SERHeader {
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self, SERError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let byte_order = reader.read_u16::<LittleEndian>()?;
        let series_id = reader.read_u16::<LittleEndian>()?;
        if byte_order != SER_BYTE_ORDER || series_id != SER_SERIES_ID {
            return Err(SERError::NotSER {
                byte_order,
                series_id,
            });
        }
        let series_version = reader.read_u16::<LittleEndian>()?;
        let data_type_id = reader.read_u32::<LittleEndian>()?;
        if data_type_id != SER_IMAGE && data_type_id != SER_SPECTRUM {
            return Err(SERError::UnknownDataType(data_type_id));
        }
        let tag_type_id = reader.read_u32::<LittleEndian>()?;
        let total_number_elements = reader.read_u32::<LittleEndian>()?;
        let valid_number_elements = reader.read_u32::<LittleEndian>()?;
        if valid_number_elements > total_number_elements {
            return Err(SERError::Malformed(format!(
                "{valid_number_elements} valid elements out of {total_number_elements}"
            )));
        }
        let large_offsets = series_version >= SER_LARGE_OFFSETS;
        let read_offset = |reader: &mut R| -> io::Result<u64> {
            if large_offsets {
                reader.read_u64::<LittleEndian>()
            } else {
                reader.read_u32::<LittleEndian>().map(|v| v as u64)
            }
        };
        let offset_array_offset = read_offset(reader)?;
        let n_dimensions = reader.read_u32::<LittleEndian>()?;
        if n_dimensions > 16 {
            return Err(SERError::Malformed(format!("{n_dimensions} series dimensions")));
        }
        let dimensions = (0..n_dimensions)
            .map(|_| SERDimension::read(reader))
            .collect::<Result<Vec<_>, _>>()?;

        let offset_width = if large_offsets { 8 } else { 4 };
        let table_size = 2 * total_number_elements as u64 * offset_width;
        if offset_array_offset.saturating_add(table_size) > file_size {
            return Err(SERError::Malformed(format!(
                "the offset table at {offset_array_offset} runs past the end of the file"
            )));
        }
        reader.seek(SeekFrom::Start(offset_array_offset))?;
        let data_offsets = (0..total_number_elements)
            .map(|_| read_offset(reader))
            .collect::<io::Result<Vec<_>>>()?;
        let tag_offsets = (0..total_number_elements)
            .map(|_| read_offset(reader))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            series_version,
            data_type_id,
            tag_type_id,
            total_number_elements,
            valid_number_elements,
            offset_array_offset,
            dimensions,
            data_offsets,
            tag_offsets,
        })
    }

    pub fn is_image_series(&self) -> bool {
        self.data_type_id == SER_IMAGE
    }

    pub fn frame_count(&self) -> usize {
        self.valid_number_elements as usize
    }

    fn metadata(&self) -> MetadataRecord {
        let mut record = MetadataRecord::new();
        record.insert("ByteOrder", SER_BYTE_ORDER);
        record.insert("SeriesID", SER_SERIES_ID);
        record.insert("SeriesVersion", self.series_version);
        record.insert("DataTypeID", self.data_type_id);
        record.insert("TagTypeID", self.tag_type_id);
        record.insert("TotalNumberElements", self.total_number_elements);
        record.insert("ValidNumberElements", self.valid_number_elements);
        record.insert("OffsetArrayOffset", self.offset_array_offset);
        record.insert("NumberDimensions", self.dimensions.len());
        record.insert(
            "Dimensions",
            self.dimensions.iter().map(SERDimension::to_value).collect::<Vec<_>>(),
        );
        record
    }
}

/// The calibration of one axis of an image element
#[derive(Debug, Clone, Copy, PartialEq)]
struct ElementCalibration {
    offset: f64,
    delta: f64,
    element: u32,
}

impl ElementCalibration {
    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            offset: reader.read_f64::<LittleEndian>()?,
            delta: reader.read_f64::<LittleEndian>()?,
            element: reader.read_u32::<LittleEndian>()?,
        })
    }

    fn to_value(self) -> Value {
        let mut map = ValueMap::new();
        map.insert("CalibrationOffset".into(), self.offset.into());
        map.insert("CalibrationDelta".into(), self.delta.into());
        map.insert("CalibrationElement".into(), self.element.into());
        Value::Map(map)
    }
}

/// The header of one 2-D image element
#[derive(Debug, Clone, PartialEq)]
struct ImageElement {
    calibration: [ElementCalibration; 2],
    dtype: DType,
    data_type: u16,
    /// `(columns, rows)`
    array_size: (u32, u32),
}

impl ImageElement {
    fn read<R: Read>(reader: &mut R) -> Result<Self, SERError> {
        let calibration = [ElementCalibration::read(reader)?, ElementCalibration::read(reader)?];
        let data_type = reader.read_u16::<LittleEndian>()?;
        let dtype = dtype_from_code(data_type)?;
        let array_size = (
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
        );
        Ok(Self {
            calibration,
            dtype,
            data_type,
            array_size,
        })
    }

    fn shape(&self) -> (usize, usize) {
        (self.array_size.1 as usize, self.array_size.0 as usize)
    }
}

/// A reader for SER image series.
///
/// Spectrum series open so that their header metadata is available, but their
/// frames are unsupported.
#[derive(Debug)]
pub struct SERReader {
    path: PathBuf,
    header: SERHeader,
    read_sidecars: bool,
}

impl SERReader {
    pub fn header(&self) -> &SERHeader {
        &self.header
    }

    fn open_header(path: &Path) -> Result<SERHeader, SERError> {
        let mut handle = BufReader::new(fs::File::open(path)?);
        SERHeader::parse(&mut handle)
    }

    fn element_offset(&self, index: usize) -> Result<u64, SERError> {
        if !self.header.is_image_series() {
            return Err(SERError::SpectrumSeries);
        }
        self.header
            .data_offsets
            .get(index)
            .copied()
            .filter(|_| index < self.header.frame_count())
            .ok_or(SERError::MissingElement {
                index,
                count: self.header.frame_count(),
            })
    }

    fn read_element(&self, index: usize) -> Result<(ImageElement, Frame), SERError> {
        let offset = self.element_offset(index)?;
        let mut handle = BufReader::new(fs::File::open(&self.path)?);
        let file_size = handle.get_ref().metadata()?.len();
        handle.seek(SeekFrom::Start(offset))?;
        let element = ImageElement::read(&mut handle)?;
        let end = plane_size(element.shape(), element.dtype)
            .and_then(|size| size.checked_add(IMAGE_ELEMENT_HEADER))
            .and_then(|size| size.checked_add(offset));
        if end.map_or(true, |end| end > file_size) {
            return Err(SERError::Malformed(format!(
                "element {index} at {offset} runs past the end of the file"
            )));
        }
        let frame = read_plane(&mut handle, element.dtype, element.shape(), Endian::Little)?;
        Ok((element, frame))
    }

    fn read_element_header(&self, index: usize) -> Result<ImageElement, SERError> {
        let offset = self.element_offset(index)?;
        let mut handle = BufReader::new(fs::File::open(&self.path)?);
        handle.seek(SeekFrom::Start(offset))?;
        ImageElement::read(&mut handle)
    }

    /// The acquisition time stored in the tag of the first element
    fn read_first_tag(&self) -> Result<Option<i32>, SERError> {
        let Some(offset) = self.header.tag_offsets.first().copied() else {
            return Ok(None);
        };
        if offset == 0 {
            return Ok(None);
        }
        let mut handle = BufReader::new(fs::File::open(&self.path)?);
        handle.seek(SeekFrom::Start(offset))?;
        let _tag_type = handle.read_u16::<LittleEndian>()?;
        Ok(Some(handle.read_i32::<LittleEndian>()?))
    }

    fn read_sidecar_metadata(&self, record: &mut MetadataRecord) {
        let Some(emi_path) = emi_sidecar(&self.path) else {
            return;
        };
        match fs::read(&emi_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| parse_emi(&bytes).map_err(|e| e.to_string()))
        {
            Ok(entries) => {
                debug!("Read {} entries from {}", entries.len(), emi_path.display());
                record.extend(entries);
            }
            Err(e) => warn!("Skipping malformed EMI sidecar {}: {e}", emi_path.display()),
        }
    }
}

impl EMFileReader for SERReader {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let header = Self::open_header(path).map_err(|e| match e {
            SERError::IOError(e) if e.kind() == io::ErrorKind::NotFound => IngestError::IOError(e),
            e => IngestError::file_format(path, ElectronMicroscopyFormat::SER, e),
        })?;
        debug!(
            "Opened SER {} version {:#06x} with {} of {} elements",
            path.display(),
            header.series_version,
            header.valid_number_elements,
            header.total_number_elements
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            read_sidecars: true,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        ElectronMicroscopyFormat::SER
    }

    fn set_read_sidecars(&mut self, read_sidecars: bool) {
        self.read_sidecars = read_sidecars;
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        self.check_dataset(dataset)?;
        Ok(vec![self.header.frame_count()])
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        self.check_dataset(dataset)?;
        self.check_frame(dataset, index)?;
        match self.read_element(index) {
            Ok((_, frame)) => Ok(frame),
            Err(SERError::SpectrumSeries) => Err(SERError::SpectrumSeries.into()),
            Err(e) => Err(IngestError::frame_read(index, e)),
        }
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        let mut record = self.header.metadata();
        let (mut x, mut y) = (PhysicalCalibration::unscaled(), PhysicalCalibration::unscaled());
        if self.header.is_image_series() && self.header.frame_count() > 0 {
            match self.read_element_header(0) {
                Ok(element) => {
                    record.insert(
                        "Calibration",
                        element
                            .calibration
                            .iter()
                            .map(|c| c.to_value())
                            .collect::<Vec<_>>(),
                    );
                    record.insert("DataType", element.data_type);
                    record.insert(
                        "ArrayShape",
                        vec![element.array_size.0, element.array_size.1],
                    );
                    let [cx, cy] = element.calibration;
                    x = PhysicalCalibration::new(cx.delta, cx.offset, "m");
                    y = PhysicalCalibration::new(cy.delta, cy.offset, "m");
                }
                Err(e) => warn!("Could not read the first element of {}: {e}", self.path.display()),
            }
        }
        match self.read_first_tag() {
            Ok(Some(time)) => {
                record.insert("Time", time);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read the first tag of {}: {e}", self.path.display()),
        }
        if self.read_sidecars {
            self.read_sidecar_metadata(&mut record);
        }
        record.set_calibration(&x, &y);
        record.set_file_name(&self.path);
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::ser::writer::SERWriter;
    use crate::meta::{PHYSICAL_SIZE_X, PHYSICAL_SIZE_X_UNIT, PHYSICAL_SIZE_Y_ORIGIN};
    use ndarray::Array3;

    #[test_log::test]
    fn test_image_series() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        for version in [0x0210, 0x0220] {
            let path = dir.path().join(format!("series_{version}.ser"));
            let data = Array3::from_shape_fn((4, 5, 6), |(t, y, x)| (t * 100 + y * 6 + x) as u16);
            SERWriter::new(&path)
                .version(version)
                .calibration([(1.5e-10, -2e-10), (2.5e-10, 0.0)])
                .write(data.view())?;

            let reader = SERReader::open_path(&path)?;
            assert_eq!(reader.header().series_version, version);
            assert_eq!(reader.frame_axes(0)?, vec![4]);
            for t in 0..4 {
                let frame = reader.read_frame(0, t)?;
                assert_eq!(frame.shape(), (5, 6));
                assert_eq!(
                    frame.as_array::<u16>().unwrap(),
                    data.index_axis(ndarray::Axis(0), t)
                );
            }
            assert!(matches!(
                reader.read_frame(0, 4),
                Err(IngestError::FrameIndexOutOfRange { .. })
            ));

            let meta = reader.read_metadata()?;
            assert_eq!(meta.get(PHYSICAL_SIZE_X), Some(&Value::Float(1.5e-10)));
            assert_eq!(meta.get(PHYSICAL_SIZE_X_UNIT), Some(&Value::from("m")));
            assert_eq!(meta.get(PHYSICAL_SIZE_Y_ORIGIN), Some(&Value::Float(0.0)));
            assert_eq!(meta.get("ValidNumberElements"), Some(&Value::Int(4)));
            assert_eq!(meta.get("ArrayShape"), Some(&Value::from(vec![6u32, 5])));
            assert_eq!(meta.get("Time"), Some(&Value::Int(0)));
        }
        Ok(())
    }

    #[test]
    fn test_oversized_element_is_a_frame_error() -> Result<(), IngestError> {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("corrupt.ser");
        SERWriter::new(&path).write(Array3::<u16>::zeros((2, 3, 3)).view())?;
        let offset = SERReader::open_path(&path)?.header().data_offsets[0];
        {
            let mut handle = fs::OpenOptions::new().write(true).open(&path)?;
            handle.seek(SeekFrom::Start(offset + 42))?;
            handle.write_all(&u32::MAX.to_le_bytes())?;
            handle.write_all(&u32::MAX.to_le_bytes())?;
        }
        let reader = SERReader::open_path(&path)?;
        assert!(matches!(
            reader.read_frame(0, 0),
            Err(IngestError::FrameRead { index: 0, .. })
        ));
        assert!(reader.read_frame(0, 1).is_ok());
        Ok(())
    }

    #[test_log::test]
    fn test_emi_sidecar_and_partial_series() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scan_1.ser");
        let data = Array3::<f32>::zeros((3, 2, 2));
        SERWriter::new(&path).valid_elements(2).write(data.view())?;
        fs::write(
            dir.path().join("scan.emi"),
            b"\x00<ObjectInfo><Mode>STEM</Mode></ObjectInfo>",
        )?;

        let mut reader = SERReader::open_path(&path)?;
        assert_eq!(reader.frame_count(0)?, 2);
        let meta = reader.read_metadata()?;
        assert_eq!(meta.get("Mode"), Some(&Value::from("STEM")));
        assert_eq!(meta.get("TotalNumberElements"), Some(&Value::Int(3)));

        reader.set_read_sidecars(false);
        assert!(!reader.read_metadata()?.contains_key("Mode"));

        fs::write(dir.path().join("scan.emi"), b"garbage")?;
        reader.set_read_sidecars(true);
        assert!(!reader.read_metadata()?.contains_key("Mode"));
        Ok(())
    }

    #[test_log::test]
    fn test_spectrum_series() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spectra.ser");
        SERWriter::new(&path)
            .spectra(true)
            .write(Array3::<f32>::zeros((2, 1, 8)).view())?;
        let reader = SERReader::open_path(&path)?;
        assert!(!reader.header().is_image_series());
        assert_eq!(reader.frame_count(0)?, 2);
        assert!(matches!(reader.read_frame(0, 0), Err(IngestError::Unsupported(_))));
        let meta = reader.read_metadata()?;
        assert_eq!(meta.get("DataTypeID"), Some(&Value::Int(SER_SPECTRUM as i64)));
        assert_eq!(meta.calibration().0, PhysicalCalibration::unscaled());

        fs::write(&path, b"II\x00\x00 not a series")?;
        assert!(matches!(
            SERReader::open_path(&path),
            Err(IngestError::FileFormat { .. })
        ));
        Ok(())
    }
}
