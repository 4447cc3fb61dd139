//! `PipelineValue`: the tagged, heterogeneous tree a decoded pipeline
//! document is held in before and after interpolation.
//!
//! YAML 1.1 timestamp-shaped scalars are decoded as plain strings, same as
//! every other unquoted scalar that isn't a bool/int/float/null — `serde_yaml`
//! resolves scalars against the YAML 1.2 core schema, which has no timestamp
//! type, so there is no tag information left by the time we see the value to
//! distinguish "this string looks like a timestamp" from "this is just a
//! string". Since timestamp text never contains `$`, round-tripping it as
//! `PipelineValue::String` already satisfies "timestamps serialize as
//! strings, unchanged" without special-casing — see DESIGN.md.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A node in a decoded pipeline document.
///
/// Scalars are never widened into one another: a YAML `true` stays
/// `Bool(true)`, never becomes the string `"true"`; `10` stays `Int(10)`,
/// never becomes `Float(10.0)`.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<PipelineValue>),
    Mapping(IndexMap<String, PipelineValue>),
}

impl PipelineValue {
    pub fn as_mapping(&self) -> Option<&IndexMap<String, PipelineValue>> {
        match self {
            PipelineValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut IndexMap<String, PipelineValue>> {
        match self {
            PipelineValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[PipelineValue]> {
        match self {
            PipelineValue::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PipelineValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PipelineValue::Null)
    }
}

impl<'de> Deserialize<'de> for PipelineValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PipelineValueVisitor)
    }
}

struct PipelineValueVisitor;

impl<'de> Visitor<'de> for PipelineValueVisitor {
    type Value = PipelineValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a pipeline scalar, sequence, or mapping")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
        Ok(PipelineValue::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(PipelineValue::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        match i64::try_from(v) {
            Ok(i) => Ok(PipelineValue::Int(i)),
            Err(_) => Ok(PipelineValue::Float(v as f64)),
        }
    }

    fn visit_i128<E>(self, v: i128) -> Result<Self::Value, E> {
        match i64::try_from(v) {
            Ok(i) => Ok(PipelineValue::Int(i)),
            Err(_) => Ok(PipelineValue::Float(v as f64)),
        }
    }

    fn visit_u128<E>(self, v: u128) -> Result<Self::Value, E> {
        match i64::try_from(v) {
            Ok(i) => Ok(PipelineValue::Int(i)),
            Err(_) => Ok(PipelineValue::Float(v as f64)),
        }
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(PipelineValue::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
        Ok(PipelineValue::String(v.to_owned()))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
        Ok(PipelineValue::String(v))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(PipelineValue::Null)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(PipelineValue::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element::<PipelineValue>()? {
            out.push(elem);
        }
        Ok(PipelineValue::Sequence(out))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut out = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry::<String, PipelineValue>()? {
            out.insert(k, v);
        }
        Ok(PipelineValue::Mapping(out))
    }
}

impl Serialize for PipelineValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PipelineValue::Null => serializer.serialize_unit(),
            PipelineValue::Bool(b) => serializer.serialize_bool(*b),
            PipelineValue::Int(i) => serializer.serialize_i64(*i),
            PipelineValue::Float(f) => serializer.serialize_f64(*f),
            PipelineValue::String(s) => serializer.serialize_str(s),
            PipelineValue::Sequence(seq) => {
                let mut s = serializer.serialize_seq(Some(seq.len()))?;
                for item in seq {
                    s.serialize_element(item)?;
                }
                s.end()
            }
            PipelineValue::Mapping(map) => {
                let mut s = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    s.serialize_entry(k, v)?;
                }
                s.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_scalars_do_not_widen() {
        let doc = "a: true\nb: 10\nc: 10.5\nd: ~\ne: hello\n";
        let value: PipelineValue = serde_yaml::from_str(doc).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.get("a"), Some(&PipelineValue::Bool(true)));
        assert_eq!(map.get("b"), Some(&PipelineValue::Int(10)));
        assert_eq!(map.get("c"), Some(&PipelineValue::Float(10.5)));
        assert_eq!(map.get("d"), Some(&PipelineValue::Null));
        assert_eq!(map.get("e"), Some(&PipelineValue::String("hello".into())));
    }

    #[test]
    fn mapping_preserves_insertion_order() {
        let doc = "z: 1\na: 2\nm: 3\n";
        let value: PipelineValue = serde_yaml::from_str(doc).unwrap();
        let map = value.as_mapping().unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn json_numbers_keep_int_vs_float_distinction() {
        let value: PipelineValue = serde_json::from_str(r#"{"a": 10, "b": 10.0}"#).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.get("a"), Some(&PipelineValue::Int(10)));
        assert_eq!(map.get("b"), Some(&PipelineValue::Float(10.0)));
    }

    #[test]
    fn round_trips_through_json_serialize() {
        let value: PipelineValue = serde_yaml::from_str("a:\n  - 1\n  - two\n  - true\n").unwrap();
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"a":[1,"two",true]}"#);
    }
}
