use std::io;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::params::{Value, ValueMap};

const OPEN_TAG: &[u8] = b"<ObjectInfo>";
const CLOSE_TAG: &[u8] = b"</ObjectInfo>";

#[derive(Debug, Error)]
pub enum EMIError {
    #[error("No <ObjectInfo> block was found")]
    MissingObjectInfo,
    #[error("Malformed ObjectInfo XML: {0}")]
    XMLError(#[from] quick_xml::Error),
    #[error("An I/O error occurred: {0}")]
    IOError(#[from] io::Error),
}

/// Find the EMI file that describes the SER file at `path`.
///
/// TIA names series `<name>_<n>.ser` next to a single `<name>.emi`, so a trailing
/// `_<n>` is dropped from the stem first before trying the plain stem.
pub fn emi_sidecar<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    let stem = path.file_stem()?.to_str()?;
    let mut candidates = Vec::with_capacity(2);
    if let Some((base, n)) = stem.rsplit_once('_') {
        if !base.is_empty() && !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) {
            candidates.push(path.with_file_name(format!("{base}.emi")));
        }
    }
    candidates.push(path.with_extension("emi"));
    candidates.into_iter().find(|p| p.is_file())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug, Default)]
struct LabeledEntry {
    label: Option<String>,
    value: Option<String>,
    unit: Option<String>,
}

/// Flatten the `<ObjectInfo>` XML block embedded in an EMI file into dotted keys.
///
/// Leaf elements map their path below `ObjectInfo` to their text. `<Data>` entries
/// made of `Label`, `Value` and `Unit` children are keyed by their label instead.
pub fn parse_emi(bytes: &[u8]) -> Result<ValueMap, EMIError> {
    let start = find(bytes, OPEN_TAG).ok_or(EMIError::MissingObjectInfo)?;
    let end = find(&bytes[start..], CLOSE_TAG).ok_or(EMIError::MissingObjectInfo)?
        + start
        + CLOSE_TAG.len();

    let mut reader = Reader::from_reader(&bytes[start..end]);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut entries = ValueMap::new();
    let mut path: Vec<String> = Vec::new();
    let mut text: Option<String> = None;
    let mut labeled = LabeledEntry::default();

    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Start(ref e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                text = None;
            }
            Event::Text(ref e) => {
                text = Some(e.unescape()?.into_owned());
            }
            Event::End(_) => {
                let Some(name) = path.pop() else {
                    break;
                };
                let parent = path.iter().skip(1).cloned().collect::<Vec<_>>().join(".");
                let in_data = path.last().is_some_and(|p| p == "Data");
                match (name.as_str(), text.take()) {
                    ("Label", t) if in_data => labeled.label = t,
                    ("Value", t) if in_data => labeled.value = t,
                    ("Unit", t) if in_data => labeled.unit = t,
                    ("Data", _) => {
                        let entry = std::mem::take(&mut labeled);
                        if let Some(label) = entry.label {
                            let key = if parent.is_empty() {
                                label
                            } else {
                                format!("{parent}.{label}")
                            };
                            if let Some(unit) = entry.unit.filter(|u| !u.is_empty()) {
                                entries.insert(format!("{key}.Unit"), unit.into());
                            }
                            let value = entry.value.map(|v| Value::infer(&v)).unwrap_or_default();
                            entries.insert(key, value);
                        }
                    }
                    (_, Some(t)) if !path.is_empty() => {
                        let key = if parent.is_empty() {
                            name
                        } else {
                            format!("{parent}.{name}")
                        };
                        entries.insert(key, Value::infer(&t));
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buffer.clear();
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;

    const EMI: &[u8] = b"\x00\x01binary prefix<ObjectInfo><DatasetType>Series</DatasetType>\
<ExperimentalConditions><MicroscopeConditions><Tilt1>0.5</Tilt1>\
<Mode>STEM nP</Mode></MicroscopeConditions></ExperimentalConditions>\
<ExperimentalDescription><Root><Data><Label>High tension</Label><Value>300</Value>\
<Unit>kV</Unit></Data><Data><Label>Microscope</Label><Value>Titan &amp; Co</Value>\
<Unit></Unit></Data></Root></ExperimentalDescription></ObjectInfo>\x00\x00trailer";

    #[test]
    fn test_parse_object_info() -> Result<(), EMIError> {
        let entries = parse_emi(EMI)?;
        assert_eq!(entries.get("DatasetType"), Some(&Value::from("Series")));
        assert_eq!(
            entries.get("ExperimentalConditions.MicroscopeConditions.Tilt1"),
            Some(&Value::Float(0.5))
        );
        assert_eq!(
            entries.get("ExperimentalDescription.Root.High tension"),
            Some(&Value::Int(300))
        );
        assert_eq!(
            entries.get("ExperimentalDescription.Root.High tension.Unit"),
            Some(&Value::from("kV"))
        );
        assert_eq!(
            entries.get("ExperimentalDescription.Root.Microscope"),
            Some(&Value::from("Titan & Co"))
        );
        assert!(!entries.contains_key("ExperimentalDescription.Root.Microscope.Unit"));
        assert!(matches!(parse_emi(b"no xml here"), Err(EMIError::MissingObjectInfo)));
        Ok(())
    }

    #[test]
    fn test_sidecar_lookup() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let ser = dir.path().join("series_1.ser");
        assert_eq!(emi_sidecar(&ser), None);
        std::fs::write(dir.path().join("series_1.emi"), b"")?;
        assert_eq!(emi_sidecar(&ser), Some(dir.path().join("series_1.emi")));
        std::fs::write(dir.path().join("series.emi"), b"")?;
        assert_eq!(emi_sidecar(&ser), Some(dir.path().join("series.emi")));
        Ok(())
    }
}
