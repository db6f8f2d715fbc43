//! Serialized job data.
//!
//! `Data` is the opaque payload a job produces when it is persisted and that
//! its factory consumes when the job is reconstructed. The store only ever
//! sees the encoded form, so it never needs to know concrete job types.
//!
//! ## Typed access
//!
//! Every accessor is typed and strict:
//!
//! - a missing key yields [`DataError::MissingKey`]
//! - a value of another type yields [`DataError::TypeMismatch`]
//! - defaults only apply through the explicit `*_or` accessors, and only when
//!   the key is absent (a present value of the wrong type is still an error)
//!
//! ```ignore
//! let data = Data::builder()
//!     .put_string("thread_id", "t-42")
//!     .put_long("message_id", 9001)
//!     .build();
//!
//! let thread = data.get_string("thread_id")?;
//! let retries = data.get_int_or("retries", 0)?;
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// A single value stored in [`Data`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Data(Data),
    StringArray(Vec<String>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    BoolArray(Vec<bool>),
}

impl DataValue {
    /// Human-readable type name used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::Int(_) => "int",
            DataValue::Long(_) => "long",
            DataValue::Bool(_) => "bool",
            DataValue::Bytes(_) => "bytes",
            DataValue::Data(_) => "data",
            DataValue::StringArray(_) => "string_array",
            DataValue::IntArray(_) => "int_array",
            DataValue::LongArray(_) => "long_array",
            DataValue::BoolArray(_) => "bool_array",
        }
    }
}

/// Immutable, string-keyed bag of typed values.
///
/// Keys are kept sorted so the JSON encoding of equal values is identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data {
    values: BTreeMap<String, DataValue>,
}

macro_rules! accessors {
    ($( $get:ident, $get_or:ident, $variant:ident, $name:literal => $out:ty, |$v:ident| $conv:expr; )*) => {
        $(
            #[doc = concat!("Read a `", $name, "` value.")]
            pub fn $get<'a>(&'a self, key: &str) -> Result<$out, DataError> {
                self.lookup(key, $name, |value| match value {
                    DataValue::$variant($v) => Some($conv),
                    _ => None,
                })
            }

            #[doc = concat!("Read a `", $name, "` value, or `default` when the key is absent.")]
            pub fn $get_or<'a>(&'a self, key: &str, default: $out) -> Result<$out, DataError> {
                if self.values.contains_key(key) {
                    self.$get(key)
                } else {
                    Ok(default)
                }
            }
        )*
    };
}

impl Data {
    /// An empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> DataBuilder {
        DataBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Raw access to a value regardless of its type.
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.values.get(key)
    }

    accessors! {
        get_string, get_string_or, String, "string" => &'a str, |v| v.as_str();
        get_int, get_int_or, Int, "int" => i32, |v| *v;
        get_long, get_long_or, Long, "long" => i64, |v| *v;
        get_bool, get_bool_or, Bool, "bool" => bool, |v| *v;
        get_bytes, get_bytes_or, Bytes, "bytes" => &'a [u8], |v| v.as_slice();
        get_data, get_data_or, Data, "data" => &'a Data, |v| v;
        get_string_array, get_string_array_or, StringArray, "string_array" => &'a [String], |v| v.as_slice();
        get_int_array, get_int_array_or, IntArray, "int_array" => &'a [i32], |v| v.as_slice();
        get_long_array, get_long_array_or, LongArray, "long_array" => &'a [i64], |v| v.as_slice();
        get_bool_array, get_bool_array_or, BoolArray, "bool_array" => &'a [bool], |v| v.as_slice();
    }

    fn lookup<'a, T>(
        &'a self,
        key: &str,
        expected: &'static str,
        pick: impl FnOnce(&'a DataValue) -> Option<T>,
    ) -> Result<T, DataError> {
        let value = self.values.get(key).ok_or_else(|| DataError::missing(key))?;
        pick(value).ok_or_else(|| DataError::TypeMismatch {
            key: key.to_string(),
            expected,
            found: value.type_name(),
        })
    }

    /// Encode as JSON text (the persisted form).
    pub fn to_json(&self) -> Result<String, DataError> {
        serde_json::to_string(self).map_err(|e| DataError::encoding(e.to_string()))
    }

    /// Decode from the JSON text produced by [`Data::to_json`].
    pub fn from_json(s: &str) -> Result<Self, DataError> {
        serde_json::from_str(s).map_err(|e| DataError::encoding(e.to_string()))
    }
}

/// Builder for [`Data`]. Later puts overwrite earlier ones for the same key.
#[derive(Debug, Clone, Default)]
pub struct DataBuilder {
    values: BTreeMap<String, DataValue>,
}

impl DataBuilder {
    pub fn put(mut self, key: impl Into<String>, value: DataValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn put_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, DataValue::String(value.into()))
    }

    pub fn put_int(self, key: impl Into<String>, value: i32) -> Self {
        self.put(key, DataValue::Int(value))
    }

    pub fn put_long(self, key: impl Into<String>, value: i64) -> Self {
        self.put(key, DataValue::Long(value))
    }

    pub fn put_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.put(key, DataValue::Bool(value))
    }

    pub fn put_bytes(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.put(key, DataValue::Bytes(value.into()))
    }

    pub fn put_data(self, key: impl Into<String>, value: Data) -> Self {
        self.put(key, DataValue::Data(value))
    }

    pub fn put_string_array<I, S>(self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.put(key, DataValue::StringArray(values))
    }

    pub fn put_int_array(self, key: impl Into<String>, values: impl Into<Vec<i32>>) -> Self {
        self.put(key, DataValue::IntArray(values.into()))
    }

    pub fn put_long_array(self, key: impl Into<String>, values: impl Into<Vec<i64>>) -> Self {
        self.put(key, DataValue::LongArray(values.into()))
    }

    pub fn put_bool_array(self, key: impl Into<String>, values: impl Into<Vec<bool>>) -> Self {
        self.put(key, DataValue::BoolArray(values.into()))
    }

    pub fn build(self) -> Data {
        Data {
            values: self.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn attachment_payload() -> Data {
        Data::builder()
            .put_string("thread_id", "t-42")
            .put_long("attachment_id", 1_700_000_000_123)
            .put_int("part", 3)
            .put_bool("is_voice_note", false)
            .put_bytes("digest", vec![0xde, 0xad, 0xbe, 0xef])
            .put_string_array("recipients", ["05aa", "05bb"])
            .put_data(
                "dimensions",
                Data::builder().put_int("width", 640).put_int("height", 480).build(),
            )
            .build()
    }

    #[test]
    fn typed_accessors_return_stored_values() {
        let data = attachment_payload();

        assert_eq!(data.get_string("thread_id").unwrap(), "t-42");
        assert_eq!(data.get_long("attachment_id").unwrap(), 1_700_000_000_123);
        assert_eq!(data.get_int("part").unwrap(), 3);
        assert!(!data.get_bool("is_voice_note").unwrap());
        assert_eq!(data.get_bytes("digest").unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(data.get_string_array("recipients").unwrap().len(), 2);
        assert_eq!(data.get_data("dimensions").unwrap().get_int("width").unwrap(), 640);
    }

    #[test]
    fn missing_key_is_an_error() {
        let data = attachment_payload();
        assert_eq!(
            data.get_string("nope"),
            Err(DataError::MissingKey("nope".to_string()))
        );
    }

    #[test]
    fn wrong_type_is_an_error_even_with_default() {
        let data = attachment_payload();

        let err = data.get_int("attachment_id").unwrap_err();
        assert_eq!(
            err,
            DataError::TypeMismatch {
                key: "attachment_id".to_string(),
                expected: "int",
                found: "long",
            }
        );

        assert!(data.get_int_or("attachment_id", 7).is_err());
    }

    #[test]
    fn default_applies_only_to_absent_keys() {
        let data = attachment_payload();
        assert_eq!(data.get_int_or("retries", 7).unwrap(), 7);
        assert_eq!(data.get_int_or("part", 7).unwrap(), 3);
        assert_eq!(data.get_string_or("caption", "").unwrap(), "");
    }

    #[test]
    fn json_round_trip_preserves_nested_payload() {
        let data = attachment_payload();
        let json = data.to_json().unwrap();
        assert_eq!(Data::from_json(&json).unwrap(), data);
    }

    #[test]
    fn equal_payloads_encode_identically() {
        let a = Data::builder().put_int("a", 1).put_int("b", 2).build();
        let b = Data::builder().put_int("b", 2).put_int("a", 1).build();
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn malformed_json_is_an_encoding_error() {
        assert!(matches!(
            Data::from_json("{\"x\": {\"float\": 1.5}}"),
            Err(DataError::Encoding(_))
        ));
    }

    fn value_strategy() -> impl Strategy<Value = DataValue> {
        let leaf = prop_oneof![
            ".*".prop_map(DataValue::String),
            any::<i32>().prop_map(DataValue::Int),
            any::<i64>().prop_map(DataValue::Long),
            any::<bool>().prop_map(DataValue::Bool),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(DataValue::Bytes),
            proptest::collection::vec(any::<i64>(), 0..8).prop_map(DataValue::LongArray),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            proptest::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|values| DataValue::Data(Data { values }))
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: any payload survives its persisted JSON form unchanged.
        #[test]
        fn encoding_is_lossless(values in proptest::collection::btree_map("[a-z_]{1,8}", value_strategy(), 0..8)) {
            let data = Data { values };
            let json = data.to_json().unwrap();
            prop_assert_eq!(Data::from_json(&json).unwrap(), data);
        }
    }
}
