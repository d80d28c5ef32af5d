use std::{
    fmt::Display,
    fs,
    io::{self, prelude::*, BufReader},
    path::{self, Path},
    sync::OnceLock,
};

use indexmap::IndexMap;
use log::{debug, trace};

use crate::io::dm::is_dm;
use crate::io::mrc::is_mrc;
use crate::io::ser::is_ser;
#[cfg(feature = "tiff")]
use crate::io::tiff::is_tiff;

#[cfg(feature = "emd")]
use crate::io::emd::{count_berkeley_datasets, is_velox};

/// The number of leading bytes the byte-level sniffers look at
pub const SNIFF_PREFIX_LENGTH: usize = 1024;

const HDF5_SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// Electron microscopy file formats that [`emdata`](crate) recognizes
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElectronMicroscopyFormat {
    /// Gatan DigitalMicrograph, DM3 or DM4
    DM,
    /// Berkeley EMD
    EMD,
    /// Thermo Fisher Velox EMD
    EMDVelox,
    MRC,
    /// FEI/TIA series
    SER,
    TIFF,
    Unknown,
}

impl ElectronMicroscopyFormat {
    /// The canonical type tag for the format
    pub const fn mime_type(&self) -> Option<&'static str> {
        let tag = match self {
            Self::DM => "application/x-DM",
            Self::EMD => "application/x-EMD",
            Self::EMDVelox => "application/x-EMD-VELOX",
            Self::MRC => "application/x-MRC",
            Self::SER => "application/x-SER",
            Self::TIFF => "image/tiff",
            Self::Unknown => return None,
        };
        Some(tag)
    }

    /// The file extensions associated with the format
    pub const fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::DM => &["dm3", "dm4"],
            Self::EMD | Self::EMDVelox => &["emd"],
            Self::MRC => &["mrc", "rec", "ali", "st"],
            Self::SER => &["ser"],
            Self::TIFF => &["tif", "tiff"],
            Self::Unknown => &[],
        }
    }

    pub fn from_mime_type(tag: &str) -> Self {
        Self::all()
            .iter()
            .copied()
            .find(|f| f.mime_type() == Some(tag))
            .unwrap_or(Self::Unknown)
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::DM,
            Self::EMD,
            Self::EMDVelox,
            Self::MRC,
            Self::SER,
            Self::TIFF,
        ]
    }

    /// Whether the format needs container probing to be told apart from another
    pub const fn is_emd(&self) -> bool {
        matches!(self, Self::EMD | Self::EMDVelox)
    }
}

impl Display for ElectronMicroscopyFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The extension-to-format associations, registered once per process
#[derive(Debug)]
pub struct FormatRegistry {
    by_extension: IndexMap<&'static str, Vec<ElectronMicroscopyFormat>>,
}

impl FormatRegistry {
    fn new() -> Self {
        let mut by_extension: IndexMap<&'static str, Vec<ElectronMicroscopyFormat>> =
            IndexMap::new();
        for format in ElectronMicroscopyFormat::all() {
            for ext in format.extensions() {
                by_extension.entry(*ext).or_default().push(*format);
            }
        }
        Self { by_extension }
    }

    /// The process-wide registry
    pub fn global() -> &'static FormatRegistry {
        static REGISTRY: OnceLock<FormatRegistry> = OnceLock::new();
        REGISTRY.get_or_init(FormatRegistry::new)
    }

    /// The candidate formats for a (case-insensitive) file extension
    pub fn formats_for_extension(&self, ext: &str) -> &[ElectronMicroscopyFormat] {
        self.by_extension
            .get(ext.to_ascii_lowercase().as_str())
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    /// The candidate type tags for a file extension
    pub fn mime_types_for_extension(&self, ext: &str) -> Vec<&'static str> {
        self.formats_for_extension(ext)
            .iter()
            .filter_map(|f| f.mime_type())
            .collect()
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.by_extension.keys().copied()
    }
}

/// The outcome of probing an HDF5 container for the two EMD layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmdProbe {
    /// A Berkeley file with this many tagged datasets
    Berkeley(usize),
    Velox,
    NotRecognized,
}

impl EmdProbe {
    pub fn format(&self) -> Option<ElectronMicroscopyFormat> {
        match self {
            Self::Berkeley(_) => Some(ElectronMicroscopyFormat::EMD),
            Self::Velox => Some(ElectronMicroscopyFormat::EMDVelox),
            Self::NotRecognized => None,
        }
    }
}

/// Decide between the EMD layouts. A Berkeley count of zero, or a failure to read one,
/// falls through to the Velox check, which is only run in that case.
pub fn classify_emd<F: FnOnce() -> bool>(berkeley_count: Option<usize>, has_velox_version: F) -> EmdProbe {
    match berkeley_count {
        Some(n) if n > 0 => EmdProbe::Berkeley(n),
        _ if has_velox_version() => EmdProbe::Velox,
        _ => EmdProbe::NotRecognized,
    }
}

/// Probe the file at `path` as a Berkeley EMD container and then as a Velox one.
/// Failing to open or parse the file at all is [`EmdProbe::NotRecognized`].
#[cfg(feature = "emd")]
pub fn probe_emd<P: AsRef<Path>>(path: P) -> EmdProbe {
    let path = path.as_ref();
    let berkeley = match count_berkeley_datasets(path) {
        Ok(n) => Some(n),
        Err(e) => {
            debug!("{} is not a Berkeley EMD file: {e}", path.display());
            None
        }
    };
    classify_emd(berkeley, || is_velox(path))
}

/// Without HDF5 support no container can be probed
#[cfg(not(feature = "emd"))]
pub fn probe_emd<P: AsRef<Path>>(path: P) -> EmdProbe {
    debug!(
        "Cannot probe {} without the `emd` feature",
        path.as_ref().display()
    );
    EmdProbe::NotRecognized
}

/// Given a path, list the formats its extension could denote. `.emd` is ambiguous and
/// yields both EMD layouts.
pub fn infer_from_path<P: Into<path::PathBuf>>(path: P) -> Vec<ElectronMicroscopyFormat> {
    let path: path::PathBuf = path.into();
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| FormatRegistry::global().formats_for_extension(ext).to_vec())
        .unwrap_or_default()
}

/// Test whether a buffer starts with the HDF5 superblock signature
pub fn is_hdf5(buf: &[u8]) -> bool {
    buf.starts_with(HDF5_SIGNATURE)
        || (buf.len() >= 520 && &buf[512..520] == HDF5_SIGNATURE)
}

/// Classify a buffer holding the first bytes of a file. HDF5 containers are reported
/// as [`ElectronMicroscopyFormat::EMD`] since the layout cannot be told from the prefix.
pub fn infer_from_bytes(buf: &[u8]) -> ElectronMicroscopyFormat {
    match buf {
        _ if is_ser(buf) => ElectronMicroscopyFormat::SER,
        #[cfg(feature = "tiff")]
        _ if is_tiff(buf) => ElectronMicroscopyFormat::TIFF,
        _ if is_hdf5(buf) => ElectronMicroscopyFormat::EMD,
        _ if is_dm(buf) => ElectronMicroscopyFormat::DM,
        _ if is_mrc(buf) => ElectronMicroscopyFormat::MRC,
        _ => ElectronMicroscopyFormat::Unknown,
    }
}

/// Given a stream of bytes, infer the file format from its magic bytes. This assumes
/// the stream is seekable, and restores its position.
pub fn infer_from_stream<R: Read + Seek>(stream: &mut R) -> io::Result<ElectronMicroscopyFormat> {
    let mut buf = vec![0u8; SNIFF_PREFIX_LENGTH];
    let current_pos = stream.stream_position()?;
    let mut bytes_read = 0;
    while bytes_read < buf.len() {
        match stream.read(&mut buf[bytes_read..])? {
            0 => break,
            n => bytes_read += n,
        }
    }
    buf.truncate(bytes_read);
    stream.seek(io::SeekFrom::Start(current_pos))?;
    Ok(infer_from_bytes(&buf))
}

/// Decide which adapter applies to `path`, optionally using the file's leading bytes.
///
/// The extension is the primary signal. `.emd` files, and HDF5 containers without a
/// known extension, are probed for their layout. Returns `None` rather than failing
/// when nothing matches.
pub fn sniff<P: AsRef<Path>>(path: P, first_bytes: &[u8]) -> Option<ElectronMicroscopyFormat> {
    let path = path.as_ref();
    let candidates = infer_from_path(path);
    trace!("Extension candidates for {}: {candidates:?}", path.display());
    let format = match candidates.as_slice() {
        [] => infer_from_bytes(first_bytes),
        [single] => *single,
        _ if candidates.iter().all(|f| f.is_emd()) => ElectronMicroscopyFormat::EMD,
        _ => candidates[0],
    };
    match format {
        ElectronMicroscopyFormat::Unknown => None,
        f if f.is_emd() => probe_emd(path).format(),
        f => Some(f),
    }
}

/// Given a path, infer the file format using the file name first, then the file's
/// leading bytes, then for HDF5 containers the EMD probe.
pub fn infer_format<P: Into<path::PathBuf>>(path: P) -> io::Result<ElectronMicroscopyFormat> {
    let path: path::PathBuf = path.into();
    let candidates = infer_from_path(&path);
    let format = match candidates.as_slice() {
        [single] => *single,
        [] => {
            let handle = fs::File::open(&path)?;
            let mut stream = BufReader::new(handle);
            infer_from_stream(&mut stream)?
        }
        _ => ElectronMicroscopyFormat::EMD,
    };
    if format.is_emd() {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        return Ok(probe_emd(&path)
            .format()
            .unwrap_or(ElectronMicroscopyFormat::Unknown));
    }
    Ok(format)
}
