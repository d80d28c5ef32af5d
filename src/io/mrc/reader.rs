use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, warn};
use thiserror::Error;

use crate::frame::{DType, Frame};
use crate::io::infer_format::ElectronMicroscopyFormat;
use crate::io::traits::{EMFileReader, IngestError};
use crate::io::utils::{
    find_sidecar, fixed_str, plane_offset, plane_size, read_plane_at, Endian,
};
use crate::meta::{MetadataRecord, PhysicalCalibration};
use crate::params::{Value, ValueMap};

pub const MRC_HEADER_SIZE: usize = 1024;

const ANGSTROM: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum MRCError {
    #[error("The file is {0} bytes long, shorter than an MRC header")]
    TooShort(u64),
    #[error("Invalid dimensions nx={nx}, ny={ny}, nz={nz}")]
    BadDimensions { nx: i32, ny: i32, nz: i32 },
    #[error("Invalid extended header size {0}")]
    BadExtendedHeader(i32),
    #[error("Unsupported MRC data mode {0}")]
    UnsupportedMode(i32),
    #[error("Cannot store {0} values in an MRC file")]
    UnsupportedDType(DType),
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl From<MRCError> for IngestError {
    fn from(value: MRCError) -> Self {
        match value {
            MRCError::IOError(e) => IngestError::IOError(e),
            MRCError::UnsupportedMode(_) | MRCError::UnsupportedDType(_) => {
                IngestError::Unsupported(value.to_string())
            }
            e => IngestError::MetadataParse(e.to_string()),
        }
    }
}

/// Map an MRC data mode to the element type it stores
pub(crate) fn dtype_from_mode(mode: i32) -> Result<DType, MRCError> {
    match mode {
        0 => Ok(DType::I8),
        1 => Ok(DType::I16),
        2 => Ok(DType::F32),
        6 => Ok(DType::U16),
        _ => Err(MRCError::UnsupportedMode(mode)),
    }
}

pub(crate) fn mode_from_dtype(dtype: DType) -> Result<i32, MRCError> {
    match dtype {
        DType::I8 => Ok(0),
        DType::I16 => Ok(1),
        DType::F32 => Ok(2),
        DType::U16 => Ok(6),
        _ => Err(MRCError::UnsupportedDType(dtype)),
    }
}

/// Test whether a buffer starting at the beginning of a file looks like an MRC header
pub fn is_mrc(buf: &[u8]) -> bool {
    buf.len() >= 212 && &buf[208..212] == b"MAP "
}

/// The fixed part of an MRC header
#[derive(Debug, Clone, PartialEq)]
pub struct MRCHeader {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub mode: i32,
    pub dtype: DType,
    pub start: [i32; 3],
    pub grid_size: [i32; 3],
    pub cell_lengths: [f32; 3],
    pub cell_angles: [f32; 3],
    pub axis_orientations: [i32; 3],
    pub dmin: f32,
    pub dmax: f32,
    pub dmean: f32,
    pub space_group: i32,
    pub extended_header_size: usize,
    pub extended_header_type: String,
    pub version: i32,
    pub origin: [f32; 3],
    pub endian: Endian,
    pub rms: f32,
    pub labels: Vec<String>,
}

fn read_i32x3<B: ByteOrder>(buf: &[u8], offset: usize) -> [i32; 3] {
    [
        B::read_i32(&buf[offset..]),
        B::read_i32(&buf[offset + 4..]),
        B::read_i32(&buf[offset + 8..]),
    ]
}

fn read_f32x3<B: ByteOrder>(buf: &[u8], offset: usize) -> [f32; 3] {
    [
        B::read_f32(&buf[offset..]),
        B::read_f32(&buf[offset + 4..]),
        B::read_f32(&buf[offset + 8..]),
    ]
}

impl MRCHeader {
    /// Decide the byte order from the machine stamp, falling back on whether the
    /// mode word is plausible when the stamp is blank
    fn detect_endian(buf: &[u8]) -> Endian {
        match buf[212] {
            0x11 => Endian::Big,
            0x44 | 0x41 => Endian::Little,
            _ => {
                if (0..=16).contains(&LittleEndian::read_i32(&buf[12..])) {
                    Endian::Little
                } else {
                    Endian::Big
                }
            }
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MRCError> {
        if buf.len() < MRC_HEADER_SIZE {
            return Err(MRCError::TooShort(buf.len() as u64));
        }
        match Self::detect_endian(buf) {
            Endian::Little => Self::parse_with::<LittleEndian>(buf, Endian::Little),
            Endian::Big => Self::parse_with::<BigEndian>(buf, Endian::Big),
        }
    }

    fn parse_with<B: ByteOrder>(buf: &[u8], endian: Endian) -> Result<Self, MRCError> {
        let [nx, ny, nz] = read_i32x3::<B>(buf, 0);
        if nx <= 0 || ny <= 0 || nz <= 0 {
            return Err(MRCError::BadDimensions { nx, ny, nz });
        }
        let mode = B::read_i32(&buf[12..]);
        let dtype = dtype_from_mode(mode)?;
        let nsymbt = B::read_i32(&buf[92..]);
        if nsymbt < 0 {
            return Err(MRCError::BadExtendedHeader(nsymbt));
        }
        let data_end = plane_size((ny as usize, nx as usize), dtype)
            .and_then(|plane| plane.checked_mul(nz as u64))
            .and_then(|len| len.checked_add((MRC_HEADER_SIZE as u64) + nsymbt as u64));
        if data_end.is_none() {
            return Err(MRCError::BadDimensions { nx, ny, nz });
        }
        let nlabl = B::read_i32(&buf[220..]).clamp(0, 10) as usize;
        let labels = (0..nlabl)
            .map(|i| fixed_str(&buf[224 + i * 80..224 + (i + 1) * 80]))
            .collect();
        Ok(Self {
            nx: nx as usize,
            ny: ny as usize,
            nz: nz as usize,
            mode,
            dtype,
            start: read_i32x3::<B>(buf, 16),
            grid_size: read_i32x3::<B>(buf, 28),
            cell_lengths: read_f32x3::<B>(buf, 40),
            cell_angles: read_f32x3::<B>(buf, 52),
            axis_orientations: read_i32x3::<B>(buf, 64),
            dmin: B::read_f32(&buf[76..]),
            dmax: B::read_f32(&buf[80..]),
            dmean: B::read_f32(&buf[84..]),
            space_group: B::read_i32(&buf[88..]),
            extended_header_size: nsymbt as usize,
            extended_header_type: fixed_str(&buf[104..108]),
            version: B::read_i32(&buf[108..]),
            origin: read_f32x3::<B>(buf, 196),
            endian,
            rms: B::read_f32(&buf[216..]),
            labels,
        })
    }

    /// The offset of the first data plane
    pub fn data_offset(&self) -> u64 {
        (MRC_HEADER_SIZE + self.extended_header_size) as u64
    }

    pub fn plane_bytes(&self) -> u64 {
        self.nx as u64 * self.ny as u64 * self.dtype.size_of() as u64
    }

    /// The `[z, y, x]` voxel size in Ångström, `cella / mxyz`. Axes without a
    /// sampling grid report zero.
    pub fn voxel_size(&self) -> [f64; 3] {
        let axis = |i: usize| {
            if self.grid_size[i] > 0 {
                self.cell_lengths[i] as f64 / self.grid_size[i] as f64
            } else {
                0.0
            }
        };
        [axis(2), axis(1), axis(0)]
    }
}

#[derive(Debug, Clone, Copy)]
enum FEIField {
    I32,
    U32,
    F64,
    Bool,
    Text16,
}

/// The leading fields of an FEI1/FEI2 extended header block: name, offset, type
const FEI_FIELDS: &[(&str, usize, FEIField)] = &[
    ("Metadata size", 0, FEIField::I32),
    ("Metadata version", 4, FEIField::I32),
    ("Bitmask 1", 8, FEIField::U32),
    ("Timestamp", 12, FEIField::F64),
    ("Microscope type", 20, FEIField::Text16),
    ("D-Number", 36, FEIField::Text16),
    ("Application", 52, FEIField::Text16),
    ("Application version", 68, FEIField::Text16),
    ("HT", 84, FEIField::F64),
    ("Dose", 92, FEIField::F64),
    ("Alpha tilt", 100, FEIField::F64),
    ("Beta tilt", 108, FEIField::F64),
    ("X-Stage", 116, FEIField::F64),
    ("Y-Stage", 124, FEIField::F64),
    ("Z-Stage", 132, FEIField::F64),
    ("Tilt axis angle", 140, FEIField::F64),
    ("Dual axis rotation", 148, FEIField::F64),
    ("Pixel size X", 156, FEIField::F64),
    ("Pixel size Y", 164, FEIField::F64),
    ("Defocus", 220, FEIField::F64),
    ("STEM Defocus", 228, FEIField::F64),
    ("Applied defocus", 236, FEIField::F64),
    ("Instrument mode", 244, FEIField::I32),
    ("Projection mode", 248, FEIField::I32),
    ("Objective lens mode", 252, FEIField::Text16),
    ("High magnification mode", 268, FEIField::Text16),
    ("Probe mode", 284, FEIField::I32),
    ("EFTEM On", 288, FEIField::Bool),
    ("Magnification", 289, FEIField::F64),
];

/// Decode the first frame's block of an FEI extended header. Fields beyond the
/// block's declared size are left out.
pub(crate) fn parse_fei_block<B: ByteOrder>(block: &[u8]) -> ValueMap {
    let mut fields = ValueMap::new();
    let declared = if block.len() >= 4 {
        (B::read_i32(block).max(0) as usize).min(block.len())
    } else {
        0
    };
    let block = &block[..declared];
    for (name, offset, kind) in FEI_FIELDS.iter().copied() {
        let width = match kind {
            FEIField::I32 | FEIField::U32 => 4,
            FEIField::F64 => 8,
            FEIField::Bool => 1,
            FEIField::Text16 => 16,
        };
        if offset + width > block.len() {
            break;
        }
        let raw = &block[offset..offset + width];
        let value: Value = match kind {
            FEIField::I32 => B::read_i32(raw).into(),
            FEIField::U32 => B::read_u32(raw).into(),
            FEIField::F64 => B::read_f64(raw).into(),
            FEIField::Bool => (raw[0] != 0).into(),
            FEIField::Text16 => fixed_str(raw).into(),
        };
        fields.insert(name.to_string(), value);
    }
    fields
}

/// Parse a `.rawtlt` sidecar: one tilt angle per line
pub(crate) fn parse_rawtlt(text: &str) -> Result<Vec<f64>, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse::<f64>().map_err(|e| format!("{l:?}: {e}")))
        .collect()
}

/// Parse the FEI acquisition `.txt` sidecar. The first three lines and the last
/// line are framing; each remaining line holds `key: value` from column 18 on.
/// Only values that parse as numbers are kept.
pub(crate) fn parse_fei_parameters(text: &str) -> ValueMap {
    let lines: Vec<&str> = text.lines().collect();
    let mut params = ValueMap::new();
    if lines.len() < 4 {
        return params;
    }
    for line in &lines[3..lines.len() - 1] {
        let field: String = line.chars().skip(18).collect();
        let mut parts = field.trim().split(':');
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(v) = value.trim().parse::<f64>() {
                params.insert(key.trim().to_string(), v.into());
            }
        }
    }
    params
}

/// An MRC file opened for lazy frame access
#[derive(Debug, Clone)]
pub struct MRCReader {
    path: PathBuf,
    header: MRCHeader,
    extended_metadata: ValueMap,
    read_sidecars: bool,
}

impl MRCReader {
    pub fn header(&self) -> &MRCHeader {
        &self.header
    }

    /// Fields decoded from an FEI extended header, empty for other files
    pub fn extended_metadata(&self) -> &ValueMap {
        &self.extended_metadata
    }

    fn open_header(path: &Path) -> Result<(MRCHeader, ValueMap), MRCError> {
        let mut handle = fs::File::open(path)?;
        let size = handle.metadata()?.len();
        if size < MRC_HEADER_SIZE as u64 {
            return Err(MRCError::TooShort(size));
        }
        let mut buf = vec![0u8; MRC_HEADER_SIZE];
        handle.read_exact(&mut buf)?;
        let header = MRCHeader::parse(&buf)?;

        let mut extended = ValueMap::new();
        if header.extended_header_type.starts_with("FEI") && header.extended_header_size >= 4 {
            let available = size.saturating_sub(MRC_HEADER_SIZE as u64) as usize;
            let mut block = vec![0u8; header.extended_header_size.min(available)];
            handle.read_exact(&mut block)?;
            extended = match header.endian {
                Endian::Little => parse_fei_block::<LittleEndian>(&block),
                Endian::Big => parse_fei_block::<BigEndian>(&block),
            };
        }
        Ok((header, extended))
    }

    fn read_sidecar_metadata(&self, record: &mut MetadataRecord) {
        if let Some(tilt_path) = find_sidecar(&self.path, "rawtlt") {
            match fs::read_to_string(&tilt_path).map_err(|e| e.to_string()).and_then(|t| parse_rawtlt(&t)) {
                Ok(tilts) => {
                    record.insert("tilt angles", tilts);
                }
                Err(e) => warn!("Skipping malformed tilt angles in {}: {e}", tilt_path.display()),
            }
        }
        if let Some(param_path) = find_sidecar(&self.path, "txt") {
            match fs::read_to_string(&param_path) {
                Ok(text) => record.extend(parse_fei_parameters(&text)),
                Err(e) => warn!("Skipping unreadable parameters in {}: {e}", param_path.display()),
            }
        }
    }
}

impl EMFileReader for MRCReader {
    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let (header, extended_metadata) = Self::open_header(path).map_err(|e| match e {
            MRCError::IOError(e) if e.kind() == io::ErrorKind::NotFound => IngestError::IOError(e),
            e => IngestError::file_format(path, ElectronMicroscopyFormat::MRC, e),
        })?;
        debug!(
            "Opened MRC {} with {} frames of {}x{} {}",
            path.display(),
            header.nz,
            header.ny,
            header.nx,
            header.dtype
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            extended_metadata,
            read_sidecars: true,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ElectronMicroscopyFormat {
        ElectronMicroscopyFormat::MRC
    }

    fn set_read_sidecars(&mut self, read_sidecars: bool) {
        self.read_sidecars = read_sidecars;
    }

    fn frame_axes(&self, dataset: usize) -> Result<Vec<usize>, IngestError> {
        self.check_dataset(dataset)?;
        Ok(vec![self.header.nz])
    }

    fn read_frame(&self, dataset: usize, index: usize) -> Result<Frame, IngestError> {
        self.check_dataset(dataset)?;
        self.check_frame(dataset, index)?;
        let offset = plane_offset(self.header.data_offset(), index, self.header.plane_bytes())
            .ok_or_else(|| IngestError::frame_read(index, "plane offset overflows"))?;
        read_plane_at(
            &self.path,
            offset,
            self.header.dtype,
            (self.header.ny, self.header.nx),
            self.header.endian,
        )
        .map_err(|e| IngestError::frame_read(index, e))
    }

    fn probe_frame(
        &self,
        dataset: usize,
        index: usize,
    ) -> Result<((usize, usize), DType), IngestError> {
        self.read_frame(dataset, index)?;
        Ok(((self.header.ny, self.header.nx), self.header.dtype))
    }

    fn read_metadata(&self) -> Result<MetadataRecord, IngestError> {
        let mut record = MetadataRecord::new();
        record.insert("axisOrientations", self.header.axis_orientations.to_vec());
        record.insert("cellAngles", self.header.cell_angles.to_vec());
        record.extend(self.extended_metadata.clone());

        let [_, size_y, size_x] = self.header.voxel_size();
        let axis = |size: f64| {
            if size > 0.0 {
                PhysicalCalibration::new(size * ANGSTROM, 0.0, "m")
            } else {
                PhysicalCalibration::unscaled()
            }
        };
        record.set_calibration(&axis(size_x), &axis(size_y));
        record.set_file_name(&self.path);

        if self.read_sidecars {
            self.read_sidecar_metadata(&mut record);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::mrc::MRCWriter;
    use crate::meta::{PHYSICAL_SIZE_X, PHYSICAL_SIZE_X_UNIT, PHYSICAL_SIZE_Y};
    use ndarray::Array3;

    fn write_stack(path: &Path, nz: usize) -> Array3<i16> {
        let data = Array3::from_shape_fn((nz, 11, 12), |(z, y, x)| (z * 1000 + y * 12 + x) as i16);
        MRCWriter::new(path)
            .voxel_size([2.0, 1.5, 1.5])
            .write(data.view())
            .unwrap();
        data
    }

    #[test_log::test]
    fn test_round_trip() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stack.mrc");
        let data = write_stack(&path, 10);

        let reader = MRCReader::open_path(&path)?;
        assert_eq!(reader.frame_count(0)?, 10);
        assert_eq!(reader.header().dtype, DType::I16);
        let frame = reader.read_frame(0, 3)?;
        assert_eq!(frame.shape(), (11, 12));
        assert_eq!(frame.as_array::<i16>().unwrap(), data.index_axis(ndarray::Axis(0), 3));
        assert!(matches!(
            reader.read_frame(0, 10),
            Err(IngestError::FrameIndexOutOfRange { index: 10, count: 10 })
        ));
        assert!(matches!(
            reader.read_frame(1, 0),
            Err(IngestError::DatasetIndexOutOfRange { .. })
        ));

        let meta = reader.read_metadata()?;
        let size_x = meta[PHYSICAL_SIZE_X].as_f64().unwrap();
        assert!((size_x - 1.5e-10).abs() < 1e-20);
        assert_eq!(meta[PHYSICAL_SIZE_X_UNIT], Value::from("m"));
        assert_eq!(meta["cellAngles"], Value::from(vec![90.0f32, 90.0, 90.0]));
        Ok(())
    }

    #[test]
    fn test_zero_pixel_size_is_unscaled() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("flat.mrc");
        let data = Array3::<f32>::zeros((1, 4, 4));
        MRCWriter::new(&path).voxel_size([0.0, 0.0, 0.0]).write(data.view())?;
        let meta = MRCReader::open_path(&path)?.read_metadata()?;
        assert_eq!(meta[PHYSICAL_SIZE_Y], Value::Float(1.0));
        assert_eq!(meta[PHYSICAL_SIZE_X_UNIT], Value::from(""));
        Ok(())
    }

    #[test]
    fn test_not_mrc() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("junk.mrc");
        fs::write(&path, b"not an mrc file")?;
        assert!(matches!(
            MRCReader::open_path(&path),
            Err(IngestError::FileFormat { .. })
        ));
        let mut header = vec![0u8; MRC_HEADER_SIZE];
        header[0] = 4;
        header[4] = 4;
        header[8] = 1;
        header[12] = 4;
        fs::write(&path, &header)?;
        assert!(MRCReader::open_path(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_oversized_dimensions() {
        let mut header = vec![0u8; MRC_HEADER_SIZE];
        header[..4].copy_from_slice(&i32::MAX.to_le_bytes());
        header[4..8].copy_from_slice(&i32::MAX.to_le_bytes());
        header[8..12].copy_from_slice(&i32::MAX.to_le_bytes());
        header[12..16].copy_from_slice(&2i32.to_le_bytes());
        header[212] = 0x44;
        assert!(matches!(
            MRCHeader::parse(&header),
            Err(MRCError::BadDimensions { .. })
        ));
        header[8..12].copy_from_slice(&1i32.to_le_bytes());
        header[..4].copy_from_slice(&4i32.to_le_bytes());
        header[4..8].copy_from_slice(&4i32.to_le_bytes());
        assert!(MRCHeader::parse(&header).is_ok());
    }

    #[test_log::test]
    fn test_sidecars() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tilt.mrc");
        write_stack(&path, 3);
        fs::write(dir.path().join("tilt.rawtlt"), "-60.0\n0.0\n60.0\n")?;
        let params = [
            "header line one",
            "header line two",
            "header line three",
            "0123456789abcdefghDefocus: -2.5",
            "0123456789abcdefghOperator: somebody",
            "0123456789abcdefghshort",
            "footer",
        ]
        .join("\n");
        fs::write(dir.path().join("tilt.txt"), params)?;

        let mut reader = MRCReader::open_path(&path)?;
        let meta = reader.read_metadata()?;
        assert_eq!(meta["tilt angles"], Value::from(vec![-60.0, 0.0, 60.0]));
        assert_eq!(meta["Defocus"], Value::Float(-2.5));
        assert!(!meta.contains_key("Operator"));

        fs::write(dir.path().join("tilt.rawtlt"), "-60.0\nbanana\n")?;
        let meta = reader.read_metadata()?;
        assert!(!meta.contains_key("tilt angles"));

        reader.set_read_sidecars(false);
        assert!(!reader.read_metadata()?.contains_key("Defocus"));
        Ok(())
    }

    #[test]
    fn test_fei_extended_header() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fei.mrc");
        let mut block = vec![0u8; 297];
        LittleEndian::write_i32(&mut block[0..], 297);
        block[20..24].copy_from_slice(b"Krio");
        LittleEndian::write_f64(&mut block[84..], 300000.0);
        block[288] = 1;
        LittleEndian::write_f64(&mut block[289..], 29000.0);
        let data = Array3::<u16>::ones((2, 3, 3));
        MRCWriter::new(&path)
            .extended_header("FEI1", block)
            .write(data.view())?;

        let reader = MRCReader::open_path(&path)?;
        assert_eq!(reader.header().extended_header_size, 297);
        assert_eq!(reader.read_frame(0, 1)?.as_array::<u16>().unwrap()[[2, 2]], 1);
        let meta = reader.read_metadata()?;
        assert_eq!(meta["Microscope type"], Value::from("Krio"));
        assert_eq!(meta["HT"], Value::Float(300000.0));
        assert_eq!(meta["EFTEM On"], Value::Bool(true));
        assert_eq!(meta["Magnification"], Value::Float(29000.0));
        Ok(())
    }

    #[test]
    fn test_parse_fei_parameters_short() {
        assert!(parse_fei_parameters("a\nb\n").is_empty());
    }
}
