mod dispatch;
mod inference;

pub use dispatch::{EMReaderBuilder, EMReaderType};

pub use inference::{
    classify_emd, infer_format, infer_from_bytes, infer_from_path, infer_from_stream, is_hdf5,
    probe_emd, sniff, ElectronMicroscopyFormat, EmdProbe, FormatRegistry, SNIFF_PREFIX_LENGTH,
};

#[cfg(test)]
mod test {
    use std::{fs, io};

    use ndarray::Array3;

    use crate::io::dm::writer::{write_dm, DMImage};
    use crate::io::dm::{DMElementType, DMVersion};
    use crate::io::mrc::MRCWriter;
    use crate::io::ser::writer::SERWriter;
    use crate::io::traits::{EMFileReader, IngestError};

    use super::*;

    #[test]
    fn infer_paths() {
        assert_eq!(infer_from_path("a/b/image.DM4"), vec![ElectronMicroscopyFormat::DM]);
        assert_eq!(infer_from_path("tomo.ali"), vec![ElectronMicroscopyFormat::MRC]);
        assert_eq!(infer_from_path("stack.tiff"), vec![ElectronMicroscopyFormat::TIFF]);
        assert_eq!(
            infer_from_path("scan.emd"),
            vec![ElectronMicroscopyFormat::EMD, ElectronMicroscopyFormat::EMDVelox]
        );
        assert!(infer_from_path("notes.txt").is_empty());
        assert!(infer_from_path("no_extension").is_empty());
    }

    #[test]
    fn registry_tags() {
        let registry = FormatRegistry::global();
        assert_eq!(
            registry.mime_types_for_extension("emd"),
            vec!["application/x-EMD", "application/x-EMD-VELOX"]
        );
        assert_eq!(registry.mime_types_for_extension("SER"), vec!["application/x-SER"]);
        assert_eq!(registry.mime_types_for_extension("st"), vec!["application/x-MRC"]);
        assert!(registry.extensions().any(|e| e == "dm3"));
        assert_eq!(
            ElectronMicroscopyFormat::from_mime_type("image/tiff"),
            ElectronMicroscopyFormat::TIFF
        );
        assert_eq!(ElectronMicroscopyFormat::Unknown.mime_type(), None);
        assert!(std::ptr::eq(registry, FormatRegistry::global()));
    }

    #[test]
    fn classify_emd_layouts() {
        assert_eq!(classify_emd(Some(2), || panic!("not probed")), EmdProbe::Berkeley(2));
        assert_eq!(classify_emd(Some(0), || true), EmdProbe::Velox);
        assert_eq!(classify_emd(None, || true), EmdProbe::Velox);
        assert_eq!(classify_emd(None, || false), EmdProbe::NotRecognized);
        assert_eq!(EmdProbe::Velox.format(), Some(ElectronMicroscopyFormat::EMDVelox));
        assert_eq!(EmdProbe::NotRecognized.format(), None);
    }

    #[test]
    fn infer_magic_bytes() -> io::Result<()> {
        let dir = tempfile::tempdir()?;

        let mrc = dir.path().join("volume");
        MRCWriter::new(&mrc)
            .write(Array3::<f32>::zeros((2, 3, 3)).view())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut handle = fs::File::open(&mrc)?;
        assert_eq!(infer_from_stream(&mut handle)?, ElectronMicroscopyFormat::MRC);
        assert_eq!(infer_format(&mrc)?, ElectronMicroscopyFormat::MRC);

        let ser = dir.path().join("series.bin");
        SERWriter::new(&ser).write(Array3::<u16>::zeros((2, 4, 4)).view())?;
        assert_eq!(infer_format(&ser)?, ElectronMicroscopyFormat::SER);

        let dm = dir.path().join("micrograph");
        let image = DMImage::new(vec![2, 2], 6, DMElementType::U8).data(vec![1; 4]);
        write_dm(&dm, DMVersion::DM4, &[image])?;
        assert_eq!(infer_format(&dm)?, ElectronMicroscopyFormat::DM);

        assert!(is_hdf5(b"\x89HDF\r\n\x1a\n\x00\x00"));
        if cfg!(feature = "tiff") {
            assert_eq!(infer_from_bytes(b"II*\x00"), ElectronMicroscopyFormat::TIFF);
        }
        assert_eq!(infer_from_bytes(b"hello"), ElectronMicroscopyFormat::Unknown);
        Ok(())
    }

    #[test]
    fn sniff_never_fails() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.emd");
        fs::write(&path, b"not a container")?;
        assert_eq!(sniff(&path, b"not a container"), None);
        assert_eq!(probe_emd(&path), EmdProbe::NotRecognized);
        assert_eq!(sniff(dir.path().join("missing.emd"), &[]), None);
        assert_eq!(sniff("any.dm3", &[]), Some(ElectronMicroscopyFormat::DM));
        if cfg!(feature = "tiff") {
            assert_eq!(sniff("unnamed", b"MM\x00*"), Some(ElectronMicroscopyFormat::TIFF));
        }
        assert_eq!(sniff("unnamed", b""), None);
        Ok(())
    }

    #[test_log::test]
    fn dispatch_by_content() -> Result<(), IngestError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stack.st");
        let data = Array3::from_shape_fn((3, 4, 5), |(z, _, _)| z as i16);
        MRCWriter::new(&path).write(data.view())?;

        let reader = EMReaderType::builder().read_sidecars(false).from_path(&path)?;
        assert_eq!(reader.as_format(), ElectronMicroscopyFormat::MRC);
        assert!(matches!(reader, EMReaderType::MRC(_)));
        assert_eq!(reader.frame_count(0)?, 3);
        let frame = reader.read_frame(0, 2)?;
        assert!(frame.as_array::<i16>().unwrap().iter().all(|v| *v == 2));

        let unknown = dir.path().join("notes.txt");
        fs::write(&unknown, b"nothing to see")?;
        assert!(matches!(
            EMReaderType::open_path(&unknown),
            Err(IngestError::UnknownFormat(_))
        ));
        assert!(matches!(
            EMReaderType::open_path(dir.path().join("missing.dm3")),
            Err(IngestError::IOError(_))
        ));
        let forced = EMReaderType::builder()
            .format(ElectronMicroscopyFormat::DM)
            .from_path(&path);
        assert!(matches!(forced, Err(IngestError::FileFormat { .. })));
        Ok(())
    }

    #[cfg(feature = "emd")]
    #[test_log::test]
    fn sniff_emd_layouts() -> Result<(), IngestError> {
        use crate::io::emd::{write_velox, EMDWriter};

        let dir = tempfile::tempdir()?;
        let berkeley = dir.path().join("berkeley.emd");
        EMDWriter::create(&berkeley)?
            .put_group("a", Array3::<f32>::zeros((2, 3, 4)).view().into_dyn(), None, "")?
            .put_group("b", Array3::<f32>::zeros((2, 3, 4)).view().into_dyn(), None, "")?;
        assert_eq!(probe_emd(&berkeley), EmdProbe::Berkeley(2));
        assert_eq!(sniff(&berkeley, &[]), Some(ElectronMicroscopyFormat::EMD));

        let velox = dir.path().join("velox.emd");
        write_velox(&velox, Array3::<u16>::zeros((3, 4, 2)).view(), "{}")?;
        assert_eq!(probe_emd(&velox), EmdProbe::Velox);
        assert_eq!(sniff(&velox, &[]), Some(ElectronMicroscopyFormat::EMDVelox));
        assert_eq!(infer_format(&velox)?, ElectronMicroscopyFormat::EMDVelox);

        let reader = EMReaderType::builder()
            .format(ElectronMicroscopyFormat::EMD)
            .from_path(&velox)?;
        assert!(matches!(reader, EMReaderType::EMDVelox(_)));
        assert_eq!(reader.frame_count(0)?, 2);
        Ok(())
    }
}
