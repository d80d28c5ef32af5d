use std::ops::Index;
use std::path::Path;

use indexmap::map::{IntoIter, Iter};

use crate::params::{Value, ValueMap};

pub const PHYSICAL_SIZE_X: &str = "PhysicalSizeX";
pub const PHYSICAL_SIZE_X_ORIGIN: &str = "PhysicalSizeXOrigin";
pub const PHYSICAL_SIZE_X_UNIT: &str = "PhysicalSizeXUnit";
pub const PHYSICAL_SIZE_Y: &str = "PhysicalSizeY";
pub const PHYSICAL_SIZE_Y_ORIGIN: &str = "PhysicalSizeYOrigin";
pub const PHYSICAL_SIZE_Y_UNIT: &str = "PhysicalSizeYUnit";
pub const FILE_NAME: &str = "FileName";

/// Canonicalize a unit string read from a file.
///
/// NUL padding and surrounding whitespace are removed, and so are underscores,
/// which Berkeley EMD writers use as padding (`n_m` for `nm`). No other
/// translation is done, so `µm` and `um` stay distinct.
pub fn normalize_unit(unit: &str) -> String {
    unit.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .chars()
        .filter(|c| *c != '_' && *c != '\0')
        .collect()
}

/// The size, origin and unit of one pixel along one spatial axis
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhysicalCalibration {
    pub size: f64,
    pub origin: f64,
    pub unit: String,
}

impl Default for PhysicalCalibration {
    fn default() -> Self {
        Self::unscaled()
    }
}

impl PhysicalCalibration {
    /// Build a calibration, falling back to [`PhysicalCalibration::unscaled`] when
    /// `size` is zero, negative or not finite.
    pub fn new(size: f64, origin: f64, unit: &str) -> Self {
        if size.is_finite() && size > 0.0 {
            Self {
                size,
                origin: if origin.is_finite() { origin } else { 0.0 },
                unit: normalize_unit(unit),
            }
        } else {
            Self::unscaled()
        }
    }

    /// One unit-less pixel per pixel
    pub fn unscaled() -> Self {
        Self {
            size: 1.0,
            origin: 0.0,
            unit: String::new(),
        }
    }

    pub fn is_unscaled(&self) -> bool {
        *self == Self::unscaled()
    }
}

/// An ordered mapping from metadata keys to [`Value`]s.
///
/// Every adapter guarantees the presence of the physical size keys
/// ([`PHYSICAL_SIZE_X`] and friends) through [`MetadataRecord::set_calibration`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct MetadataRecord {
    entries: ValueMap,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `value` under `key`, replacing any existing value but keeping its position
    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    /// Drop every key for which `keep` returns `false`
    pub fn retain<F: FnMut(&str, &Value) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|k, v| keep(k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// Merge `other` into `self`, with `other` winning on key collisions
    pub fn merge(&mut self, other: MetadataRecord) {
        self.entries.extend(other.entries);
    }

    pub fn as_map(&self) -> &ValueMap {
        &self.entries
    }

    pub fn into_map(self) -> ValueMap {
        self.entries
    }

    /// Write the six normalized physical size keys
    pub fn set_calibration(&mut self, x: &PhysicalCalibration, y: &PhysicalCalibration) {
        self.insert(PHYSICAL_SIZE_X, x.size);
        self.insert(PHYSICAL_SIZE_X_ORIGIN, x.origin);
        self.insert(PHYSICAL_SIZE_X_UNIT, x.unit.as_str());
        self.insert(PHYSICAL_SIZE_Y, y.size);
        self.insert(PHYSICAL_SIZE_Y_ORIGIN, y.origin);
        self.insert(PHYSICAL_SIZE_Y_UNIT, y.unit.as_str());
    }

    /// Read back the normalized calibration, or the unscaled default for any axis
    /// whose keys are missing or malformed.
    pub fn calibration(&self) -> (PhysicalCalibration, PhysicalCalibration) {
        let axis = |size: &str, origin: &str, unit: &str| {
            match (
                self.get(size).and_then(Value::as_f64),
                self.get(origin).and_then(Value::as_f64),
            ) {
                (Some(s), Some(o)) => PhysicalCalibration::new(
                    s,
                    o,
                    self.get(unit).and_then(Value::as_str).unwrap_or_default(),
                ),
                _ => PhysicalCalibration::unscaled(),
            }
        };
        (
            axis(PHYSICAL_SIZE_X, PHYSICAL_SIZE_X_ORIGIN, PHYSICAL_SIZE_X_UNIT),
            axis(PHYSICAL_SIZE_Y, PHYSICAL_SIZE_Y_ORIGIN, PHYSICAL_SIZE_Y_UNIT),
        )
    }

    pub fn set_file_name(&mut self, path: &Path) {
        self.insert(FILE_NAME, path.to_string_lossy().into_owned());
    }

    pub fn file_name(&self) -> Option<&str> {
        self.get(FILE_NAME).and_then(Value::as_str)
    }
}

impl Index<&str> for MetadataRecord {
    type Output = Value;

    fn index(&self, index: &str) -> &Self::Output {
        &self.entries[index]
    }
}

impl From<ValueMap> for MetadataRecord {
    fn from(entries: ValueMap) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MetadataRecord {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> Extend<(K, V)> for MetadataRecord {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        self.entries
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())))
    }
}

impl IntoIterator for MetadataRecord {
    type Item = (String, Value);
    type IntoIter = IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a MetadataRecord {
    type Item = (&'a String, &'a Value);
    type IntoIter = Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_unit() {
        assert_eq!(normalize_unit("n_m"), "nm");
        assert_eq!(normalize_unit(" m\0\0"), "m");
        assert_eq!(normalize_unit("µm"), "µm");
        assert_eq!(normalize_unit(""), "");
    }

    #[test]
    fn test_calibration_defaults() {
        assert!(PhysicalCalibration::new(0.0, 5.0, "nm").is_unscaled());
        assert!(PhysicalCalibration::new(f64::NAN, 0.0, "nm").is_unscaled());
        assert!(PhysicalCalibration::new(-1.0, 0.0, "nm").is_unscaled());
        let cal = PhysicalCalibration::new(0.25, 1.0, "n_m");
        assert_eq!(cal.unit, "nm");

        let mut record = MetadataRecord::new();
        assert!(record.calibration().0.is_unscaled());
        record.set_calibration(&cal, &PhysicalCalibration::unscaled());
        assert_eq!(record[PHYSICAL_SIZE_X], Value::Float(0.25));
        assert_eq!(record[PHYSICAL_SIZE_Y_UNIT], Value::String(String::new()));
        let (x, y) = record.calibration();
        assert_eq!(x, cal);
        assert!(y.is_unscaled());
    }

    #[test]
    fn test_merge_order() {
        let mut a: MetadataRecord = [("a", 1), ("b", 2)].into_iter().collect();
        let b: MetadataRecord = [("c", 3), ("a", 4)].into_iter().collect();
        a.merge(b);
        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(a["a"], Value::Int(4));
        a.retain(|k, _| k != "b");
        assert_eq!(a.len(), 2);
    }
}
