//! Selectors over the non-spatial dimensions of a dataset and the bands they
//! fan out into.

use crate::prelude::FxHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

/// A coordinate value along a non-spatial dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for CoordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Integral values print without a fractional part so that band
            // names read `month_1` rather than `month_1.0`.
            CoordValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            CoordValue::Number(n) => write!(f, "{}", n),
            CoordValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for CoordValue {
    fn from(value: f64) -> Self {
        CoordValue::Number(value)
    }
}

impl From<i32> for CoordValue {
    fn from(value: i32) -> Self {
        CoordValue::Number(value as f64)
    }
}

impl From<&str> for CoordValue {
    fn from(value: &str) -> Self {
        CoordValue::Text(value.to_string())
    }
}

impl From<String> for CoordValue {
    fn from(value: String) -> Self {
        CoordValue::Text(value)
    }
}

/// Selection along one dimension: a single value, or several values that fan
/// out into one band each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectorValue {
    Values(Vec<CoordValue>),
    Scalar(CoordValue),
}

impl SelectorValue {
    pub fn values(&self) -> &[CoordValue] {
        match self {
            SelectorValue::Values(values) => values,
            SelectorValue::Scalar(value) => std::slice::from_ref(value),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, SelectorValue::Values(_))
    }
}

macro_rules! selector_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for SelectorValue {
                fn from(value: $ty) -> Self {
                    SelectorValue::Scalar(value.into())
                }
            }

            impl From<Vec<$ty>> for SelectorValue {
                fn from(values: Vec<$ty>) -> Self {
                    SelectorValue::Values(values.into_iter().map(Into::into).collect())
                }
            }
        )*
    };
}

selector_value_from!(f64, i32, &str, String);

impl From<CoordValue> for SelectorValue {
    fn from(value: CoordValue) -> Self {
        SelectorValue::Scalar(value)
    }
}

impl From<Vec<CoordValue>> for SelectorValue {
    fn from(values: Vec<CoordValue>) -> Self {
        SelectorValue::Values(values)
    }
}

/// Mapping from non-spatial dimension name to the selected coordinate value(s).
///
/// Entries are kept in dimension-name order, which fixes both the hash and
/// the order in which bands are generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(BTreeMap<String, SelectorValue>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, dimension: impl Into<String>, value: impl Into<SelectorValue>) -> Self {
        self.insert(dimension, value);
        self
    }

    pub fn insert(&mut self, dimension: impl Into<String>, value: impl Into<SelectorValue>) {
        self.0.insert(dimension.into(), value.into());
    }

    pub fn get(&self, dimension: &str) -> Option<&SelectorValue> {
        self.0.get(dimension)
    }

    pub fn contains(&self, dimension: &str) -> bool {
        self.0.contains_key(dimension)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SelectorValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable hash of the selector contents. Buffers populated for one hash are
    /// current exactly when the active selector hashes to the same value.
    pub fn hash_key(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (dimension, value) in &self.0 {
            hasher.write(dimension.as_bytes());
            hasher.write_u8(0xff);
            hasher.write_u8(value.is_array() as u8);
            for v in value.values() {
                match v {
                    CoordValue::Number(n) => {
                        hasher.write_u8(0);
                        hasher.write_u64(n.to_bits());
                    }
                    CoordValue::Text(s) => {
                        hasher.write_u8(1);
                        hasher.write(s.as_bytes());
                    }
                }
            }
            hasher.write_u8(0xfe);
        }
        hasher.finish()
    }
}

impl<K: Into<String>, V: Into<SelectorValue>> FromIterator<(K, V)> for Selector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One named 2-D slice of the dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub name: String,
    pub selector: Selector,
}

/// Expands the array-valued entries of `selector` into bands.
///
/// String values name their band directly, numeric values become
/// `<dimension>_<value>`, and several array entries combine as
/// `<earlier>_<later>`. Scalar entries are copied into every band. Returns an
/// empty list when the selector holds no arrays.
pub fn band_information(selector: &Selector) -> Vec<Band> {
    let mut bands: Vec<Band> = Vec::new();

    for (dimension, value) in selector.iter() {
        let SelectorValue::Values(values) = value else {
            continue;
        };
        let keys: Vec<String> = values
            .iter()
            .map(|v| match v {
                CoordValue::Text(s) => s.clone(),
                CoordValue::Number(_) => format!("{}_{}", dimension, v),
            })
            .collect();

        let mut updated = Vec::with_capacity(keys.len() * bands.len().max(1));
        for (key, v) in keys.iter().zip(values) {
            if bands.is_empty() {
                updated.push(Band {
                    name: key.clone(),
                    selector: Selector::new().with(dimension.clone(), v.clone()),
                });
            } else {
                for band in &bands {
                    updated.push(Band {
                        name: format!("{}_{}", band.name, key),
                        selector: band.selector.clone().with(dimension.clone(), v.clone()),
                    });
                }
            }
        }
        bands = updated;
    }

    for band in &mut bands {
        for (dimension, value) in selector.iter().filter(|(_, v)| !v.is_array()) {
            band.selector.insert(dimension.clone(), value.clone());
        }
    }

    bands
}

/// Bands drawn for `variable` under `selector`. Without array entries the sole
/// band is the variable itself, addressed by the full selector.
pub fn bands_for(variable: &str, selector: &Selector) -> Vec<Band> {
    let bands = band_information(selector);
    if bands.is_empty() {
        vec![Band {
            name: variable.to_string(),
            selector: selector.clone(),
        }]
    } else {
        bands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_information_strings() {
        let selector = Selector::new()
            .with("time", vec!["jan", "feb"])
            .with("variable", "pr");

        let bands = band_information(&selector);
        let names: Vec<_> = bands.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["jan", "feb"]);
        assert_eq!(
            bands[0].selector,
            Selector::new().with("time", "jan").with("variable", "pr")
        );
        assert_eq!(
            bands[1].selector,
            Selector::new().with("time", "feb").with("variable", "pr")
        );
    }

    #[test]
    fn test_band_information_numbers_and_cross_product() {
        let selector = Selector::new()
            .with("band", vec!["tavg", "prec"])
            .with("month", vec![1, 2]);

        let names: Vec<_> = band_information(&selector)
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(
            names,
            vec!["tavg_month_1", "prec_month_1", "tavg_month_2", "prec_month_2"]
        );
    }

    #[test]
    fn test_bands_for_scalar_selector() {
        let selector = Selector::new().with("month", 3);
        let bands = bands_for("tavg", &selector);
        assert_eq!(bands.len(), 1);
        assert_eq!(bands[0].name, "tavg");
        assert_eq!(bands[0].selector, selector);
    }

    #[test]
    fn test_selector_hash_tracks_contents() {
        let a = Selector::new().with("month", 1);
        let b = Selector::new().with("month", 1);
        let c = Selector::new().with("month", 2);
        let d = Selector::new().with("month", vec![1]);

        assert_eq!(a.hash_key(), b.hash_key());
        assert_ne!(a.hash_key(), c.hash_key());
        assert_ne!(a.hash_key(), d.hash_key());
    }

    #[test]
    fn test_selector_deserializes_scalars_and_arrays() {
        let selector: Selector =
            serde_json::from_str(r#"{"month": [1, 2], "band": "tavg"}"#).unwrap();
        assert_eq!(
            selector,
            Selector::new().with("month", vec![1, 2]).with("band", "tavg")
        );
    }
}
