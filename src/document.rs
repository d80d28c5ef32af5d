//! The run documents an ingestion produces, and the composer that keeps them in order.
//!
//! A run is always `start → (descriptor → event)+ → stop`. Each descriptor names one
//! stream and declares the shape of its `raw` data key; the event that follows carries
//! the lazy frame array itself.
use std::fmt::Display;

use chrono::Utc;
use indexmap::IndexMap;
use log::trace;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::LazyFrameArray;
use crate::meta::MetadataRecord;
use crate::params::{guess_type, Value, ValueMap};

/// The key the frame array is stored under in descriptors and events
pub const RAW_DATA_KEY: &str = "raw";

/// The current wall-clock time in fractional unix seconds
pub fn unix_time() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// The description of one data key in a descriptor
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataKey {
    pub source: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub units: Option<String>,
}

impl DataKey {
    pub fn new<S: Into<String>, D: Into<String>>(source: S, dtype: D, shape: Vec<usize>) -> Self {
        Self {
            source: source.into(),
            dtype: dtype.into(),
            shape,
            units: None,
        }
    }

    pub fn with_units<U: Into<String>>(mut self, units: U) -> Self {
        self.units = Some(units.into());
        self
    }
}

pub type DataKeys = IndexMap<String, DataKey>;

/// One configuration block of a descriptor: a single reading with its timestamp and
/// data key description
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigurationEntry {
    pub data: ValueMap,
    pub timestamps: IndexMap<String, f64>,
    pub data_keys: DataKeys,
}

pub type Configuration = IndexMap<String, ConfigurationEntry>;

/// Build a descriptor configuration with one entry per scalar metadata value.
/// Arrays, maps and empty values are not configuration and are skipped.
pub fn configuration_from_metadata(metadata: &MetadataRecord, source: &str) -> Configuration {
    let time = unix_time();
    metadata
        .iter()
        .filter_map(|(key, value)| {
            let kind = guess_type(value)?;
            let mut entry = ConfigurationEntry::default();
            entry.data.insert(key.clone(), value.clone());
            entry.timestamps.insert(key.clone(), time);
            entry.data_keys.insert(
                key.clone(),
                DataKey::new(source, kind.to_string(), Vec::new()).with_units(""),
            );
            Some((key.clone(), entry))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StartDocument {
    pub uid: Uuid,
    pub time: f64,
    pub sample_name: String,
    /// The file-level metadata, flattened into the document
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub metadata: MetadataRecord,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DescriptorDocument {
    pub uid: Uuid,
    pub run_start: Uuid,
    pub time: f64,
    pub name: String,
    pub data_keys: DataKeys,
    pub configuration: Configuration,
}

impl DescriptorDocument {
    /// The declared shape of the frame array
    pub fn raw_shape(&self) -> Option<&[usize]> {
        self.data_keys.get(RAW_DATA_KEY).map(|k| k.shape.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EventDocument {
    pub uid: Uuid,
    pub descriptor: Uuid,
    pub seq_num: u64,
    pub time: f64,
    pub data: IndexMap<String, LazyFrameArray>,
    pub timestamps: IndexMap<String, f64>,
}

impl EventDocument {
    /// The frame array of the event
    pub fn raw(&self) -> Option<&LazyFrameArray> {
        self.data.get(RAW_DATA_KEY)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StopDocument {
    pub uid: Uuid,
    pub run_start: Uuid,
    pub time: f64,
    pub exit_status: String,
    /// The number of events emitted per stream
    pub num_events: IndexMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DocumentKind {
    Start,
    Descriptor,
    Event,
    Stop,
}

impl DocumentKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Descriptor => "descriptor",
            Self::Event => "event",
            Self::Stop => "stop",
        }
    }
}

impl Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Document {
    Start(StartDocument),
    Descriptor(DescriptorDocument),
    Event(EventDocument),
    Stop(StopDocument),
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Self::Start(_) => DocumentKind::Start,
            Self::Descriptor(_) => DocumentKind::Descriptor,
            Self::Event(_) => DocumentKind::Event,
            Self::Stop(_) => DocumentKind::Stop,
        }
    }

    pub fn uid(&self) -> Uuid {
        match self {
            Self::Start(d) => d.uid,
            Self::Descriptor(d) => d.uid,
            Self::Event(d) => d.uid,
            Self::Stop(d) => d.uid,
        }
    }

    pub fn as_start(&self) -> Option<&StartDocument> {
        match self {
            Self::Start(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_descriptor(&self) -> Option<&DescriptorDocument> {
        match self {
            Self::Descriptor(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventDocument> {
        match self {
            Self::Event(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_stop(&self) -> Option<&StopDocument> {
        match self {
            Self::Stop(d) => Some(d),
            _ => None,
        }
    }
}

macro_rules! document_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Document {
            fn from(value: $t) -> Self {
                Self::$variant(value)
            }
        }
    };
}

document_from!(StartDocument, Start);
document_from!(DescriptorDocument, Descriptor);
document_from!(EventDocument, Event);
document_from!(StopDocument, Stop);

/// The position of a [`RunComposer`] in its document sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComposerState {
    New,
    Started,
    Described,
    Evented,
    Stopped,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComposerError {
    #[error("Cannot move from {from:?} to {to:?}")]
    StateTransition {
        from: ComposerState,
        to: ComposerState,
    },
    #[error("The run has been stopped")]
    RunClosed,
    #[error("Descriptor {0} does not belong to the open stream of this run")]
    UnknownDescriptor(Uuid),
    #[error("A stream named {0} was already described")]
    DuplicateStream(String),
}

/// Emits the documents of one run in their required order.
///
/// Any call out of order fails with a [`ComposerError`] and leaves the composer's
/// state unchanged. Once [`RunComposer::compose_stop`] succeeds every further call
/// fails with [`ComposerError::RunClosed`].
#[derive(Debug, Clone)]
pub struct RunComposer {
    run_uid: Uuid,
    state: ComposerState,
    /// The open stream's descriptor uid and name
    current: Option<(Uuid, String)>,
    num_events: IndexMap<String, u64>,
}

impl Default for RunComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl RunComposer {
    pub fn new() -> Self {
        Self {
            run_uid: Uuid::new_v4(),
            state: ComposerState::New,
            current: None,
            num_events: IndexMap::new(),
        }
    }

    pub fn run_uid(&self) -> Uuid {
        self.run_uid
    }

    pub fn state(&self) -> ComposerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ComposerState::Stopped
    }

    fn transition(&self, allowed: &[ComposerState], to: ComposerState) -> Result<(), ComposerError> {
        if self.is_closed() {
            Err(ComposerError::RunClosed)
        } else if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ComposerError::StateTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Open the run. `sample_name` and the run fields take precedence over metadata
    /// keys of the same name.
    pub fn compose_start(
        &mut self,
        metadata: MetadataRecord,
        sample_name: &str,
    ) -> Result<StartDocument, ComposerError> {
        self.transition(&[ComposerState::New], ComposerState::Started)?;
        let mut metadata = metadata;
        for reserved in ["uid", "time", "sample_name"] {
            metadata.remove(reserved);
        }
        let doc = StartDocument {
            uid: self.run_uid,
            time: unix_time(),
            sample_name: sample_name.to_string(),
            metadata,
        };
        trace!("Started run {}", self.run_uid);
        self.state = ComposerState::Started;
        Ok(doc)
    }

    /// Describe the next stream. Its `raw` data key is `{source, "number", shape}`.
    pub fn compose_descriptor(
        &mut self,
        name: &str,
        data_keys: DataKeys,
        configuration: Configuration,
    ) -> Result<DescriptorDocument, ComposerError> {
        self.transition(
            &[ComposerState::Started, ComposerState::Evented],
            ComposerState::Described,
        )?;
        if self.num_events.contains_key(name) {
            return Err(ComposerError::DuplicateStream(name.to_string()));
        }
        let doc = DescriptorDocument {
            uid: Uuid::new_v4(),
            run_start: self.run_uid,
            time: unix_time(),
            name: name.to_string(),
            data_keys,
            configuration,
        };
        self.current = Some((doc.uid, doc.name.clone()));
        self.num_events.insert(doc.name.clone(), 0);
        self.state = ComposerState::Described;
        Ok(doc)
    }

    /// Emit the single event of the open stream, holding `data` under the `raw` key
    pub fn compose_event(
        &mut self,
        descriptor: &DescriptorDocument,
        data: LazyFrameArray,
    ) -> Result<EventDocument, ComposerError> {
        self.transition(&[ComposerState::Described], ComposerState::Evented)?;
        let Some((current, name)) = self.current.as_ref() else {
            return Err(ComposerError::UnknownDescriptor(descriptor.uid));
        };
        if *current != descriptor.uid {
            return Err(ComposerError::UnknownDescriptor(descriptor.uid));
        }
        let time = unix_time();
        let mut values = IndexMap::new();
        values.insert(RAW_DATA_KEY.to_string(), data);
        let mut timestamps = IndexMap::new();
        timestamps.insert(RAW_DATA_KEY.to_string(), time);
        let doc = EventDocument {
            uid: Uuid::new_v4(),
            descriptor: descriptor.uid,
            seq_num: 1,
            time,
            data: values,
            timestamps,
        };
        if let Some(count) = self.num_events.get_mut(name) {
            *count += 1;
        }
        self.state = ComposerState::Evented;
        Ok(doc)
    }

    /// Close the run. A run may be stopped from any open state.
    pub fn compose_stop(&mut self) -> Result<StopDocument, ComposerError> {
        self.transition(
            &[
                ComposerState::Started,
                ComposerState::Described,
                ComposerState::Evented,
            ],
            ComposerState::Stopped,
        )?;
        let doc = StopDocument {
            uid: Uuid::new_v4(),
            run_start: self.run_uid,
            time: unix_time(),
            exit_status: "success".to_string(),
            num_events: self.num_events.clone(),
        };
        trace!("Stopped run {} with {:?}", self.run_uid, self.num_events);
        self.current = None;
        self.state = ComposerState::Stopped;
        Ok(doc)
    }
}

/// The `raw` data key of a frame stream
pub fn frame_data_keys(source: &str, shape: Vec<usize>) -> DataKeys {
    let mut keys = DataKeys::new();
    keys.insert(RAW_DATA_KEY.to_string(), DataKey::new(source, "number", shape));
    keys
}

/// Render metadata values for logging
pub(crate) fn describe_value(value: &Value) -> String {
    match value {
        Value::Array(a) => format!("[{} values]", a.len()),
        Value::Map(m) => format!("{{{} keys}}", m.len()),
        v => v.to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::frame::{DType, Frame, FrameSource};
    use crate::io::IngestError;

    #[derive(Debug)]
    struct Zeros;

    impl FrameSource for Zeros {
        fn frame_count(&self) -> usize {
            3
        }

        fn read_frame(&self, _index: usize) -> Result<Frame, IngestError> {
            Ok(ndarray::Array2::<u8>::zeros((2, 2)).into())
        }

        fn describe(&self) -> String {
            "zeros".into()
        }
    }

    fn frames() -> LazyFrameArray {
        LazyFrameArray::from_source(Arc::new(Zeros), vec![3], (2, 2), DType::U8).unwrap()
    }

    #[test]
    fn test_run_order() {
        let mut composer = RunComposer::new();
        let mut metadata = MetadataRecord::new();
        metadata.insert("Voltage", 300.0);
        metadata.insert("sample_name", "shadowed");
        let start = composer.compose_start(metadata, "grid_3").unwrap();
        assert_eq!(start.uid, composer.run_uid());
        assert_eq!(start.sample_name, "grid_3");
        assert!(!start.metadata.contains_key("sample_name"));

        let descriptor = composer
            .compose_descriptor("primary", frame_data_keys("NCEM", vec![3, 2, 2]), Configuration::new())
            .unwrap();
        assert_eq!(descriptor.run_start, start.uid);
        assert_eq!(descriptor.raw_shape(), Some(&[3usize, 2, 2][..]));

        let event = composer.compose_event(&descriptor, frames()).unwrap();
        assert_eq!(event.descriptor, descriptor.uid);
        assert_eq!(event.seq_num, 1);
        assert_eq!(event.raw().unwrap().shape(), vec![3, 2, 2]);
        assert!(event.timestamps[RAW_DATA_KEY] > 0.0);

        let stop = composer.compose_stop().unwrap();
        assert_eq!(stop.exit_status, "success");
        assert_eq!(stop.num_events["primary"], 1);
        assert!(composer.is_closed());
        assert_eq!(composer.compose_stop(), Err(ComposerError::RunClosed));
        assert_eq!(
            composer.compose_descriptor("late", DataKeys::new(), Configuration::new()),
            Err(ComposerError::RunClosed)
        );
    }

    #[test]
    fn test_out_of_order() {
        let mut composer = RunComposer::new();
        assert!(matches!(
            composer.compose_descriptor("primary", DataKeys::new(), Configuration::new()),
            Err(ComposerError::StateTransition {
                from: ComposerState::New,
                ..
            })
        ));
        composer.compose_start(MetadataRecord::new(), "s").unwrap();
        assert!(composer.compose_start(MetadataRecord::new(), "s").is_err());

        let first = composer
            .compose_descriptor("a", DataKeys::new(), Configuration::new())
            .unwrap();
        // a second descriptor before the first stream's event
        assert!(composer
            .compose_descriptor("b", DataKeys::new(), Configuration::new())
            .is_err());
        composer.compose_event(&first, frames()).unwrap();
        assert!(composer.compose_event(&first, frames()).is_err());
        assert_eq!(
            composer.compose_descriptor("a", DataKeys::new(), Configuration::new()),
            Err(ComposerError::DuplicateStream("a".into()))
        );
        let second = composer
            .compose_descriptor("b", DataKeys::new(), Configuration::new())
            .unwrap();
        assert_eq!(
            composer.compose_event(&first, frames()),
            Err(ComposerError::UnknownDescriptor(first.uid))
        );
        composer.compose_event(&second, frames()).unwrap();
        assert_eq!(composer.state(), ComposerState::Evented);
    }

    #[test]
    fn test_configuration() {
        let mut metadata = MetadataRecord::new();
        metadata.insert("PhysicalSizeX", 0.25);
        metadata.insert("PhysicalSizeXUnit", "nm");
        metadata.insert("veloxFlag", false);
        metadata.insert("shape", vec![10usize, 11, 12]);
        metadata.insert("user", ValueMap::new());
        let configuration = configuration_from_metadata(&metadata, "/data/scan.emd");
        assert_eq!(configuration.len(), 3);
        let entry = &configuration["PhysicalSizeX"];
        assert_eq!(entry.data["PhysicalSizeX"], Value::Float(0.25));
        let key = &entry.data_keys["PhysicalSizeX"];
        assert_eq!(key.dtype, "number");
        assert_eq!(key.source, "/data/scan.emd");
        assert!(key.shape.is_empty());
        assert_eq!(configuration["veloxFlag"].data_keys["veloxFlag"].dtype, "boolean");
        assert_eq!(configuration["PhysicalSizeXUnit"].data_keys["PhysicalSizeXUnit"].dtype, "string");
        assert_eq!(describe_value(&Value::from(vec![1, 2])), "[2 values]");
    }
}
