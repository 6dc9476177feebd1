//! Serialized values that are passed as arguments and results.

use serde::{
    de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor},
    Deserializer,
};
use serde_derive::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Keyword options of an operation.
pub type Options = BTreeMap<String, Value>;

/// Maximum nesting of lists and maps in a decoded value.
pub const MAX_DEPTH: usize = 64;

/// A self-describing value.
///
/// This is an explicit enum instead of `serde_json::Value` because
/// `bincode` cannot decode self-describing formats.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl Value {
    /// Convert into JSON for external helpers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Str(s) => Json::String(s.clone()),
            Self::List(list) => Json::Array(list.iter().map(Self::to_json).collect()),
            Self::Map(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Values are decoded from untrusted peers, so the nesting is bounded
/// before it can exhaust the stack.
impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Nested(0).deserialize(deserializer)
    }
}

const VARIANTS: &[&str] = &["Null", "Bool", "Int", "Str", "List", "Map"];

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum Kind {
    Null,
    Bool,
    Int,
    Str,
    List,
    Map,
}

/// A value at the given nesting depth.
#[derive(Clone, Copy)]
struct Nested(usize);

impl<'de> DeserializeSeed<'de> for Nested {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        if self.0 > MAX_DEPTH {
            return Err(de::Error::custom("value nested too deeply"));
        }
        deserializer.deserialize_enum("Value", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for Nested {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Value, A::Error> {
        let (kind, variant) = data.variant::<Kind>()?;
        match kind {
            Kind::Null => variant.unit_variant().map(|()| Value::Null),
            Kind::Bool => variant.newtype_variant().map(Value::Bool),
            Kind::Int => variant.newtype_variant().map(Value::Int),
            Kind::Str => variant.newtype_variant().map(Value::Str),
            Kind::List => variant.newtype_variant_seed(List(self.0 + 1)),
            Kind::Map => variant.newtype_variant_seed(Map(self.0 + 1)),
        }
    }
}

struct List(usize);

impl<'de> DeserializeSeed<'de> for List {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for List {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        // The length is peer-supplied, don't trust it for allocation.
        let mut list = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(value) = seq.next_element_seed(Nested(self.0))? {
            list.push(value);
        }
        Ok(Value::List(list))
    }
}

struct Map(usize);

impl<'de> DeserializeSeed<'de> for Map {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for Map {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some(key) = access.next_key::<String>()? {
            let value = access.next_value_seed(Nested(self.0))?;
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(list: Vec<T>) -> Self {
        Self::List(list.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(map: BTreeMap<String, T>) -> Self {
        Self::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{Options, Value, MAX_DEPTH};
    use serde_json::json;

    #[test]
    fn test_to_json() {
        let mut options = Options::new();
        options.insert("vlan".into(), 100i64.into());
        options.insert("nics".into(), vec!["eth0", "eth1"].into());
        options.insert("bridged".into(), true.into());
        options.insert("bonding".into(), Value::Null);

        assert_eq!(
            Value::from(options).to_json(),
            json!({
                "vlan": 100,
                "nics": ["eth0", "eth1"],
                "bridged": true,
                "bonding": null,
            })
        );
    }

    #[test]
    fn test_bincode() {
        let value = Value::from(vec![Value::from("sdb"), Value::Int(-1)]);
        let data = bincode::serialize(&value).unwrap();
        assert_eq!(bincode::deserialize::<Value>(&data).unwrap(), value);
    }

    fn nested(depth: usize) -> Value {
        (0..depth).fold(Value::Null, |value, _| Value::List(vec![value]))
    }

    #[test]
    fn test_nesting_limit() {
        let data = bincode::serialize(&nested(MAX_DEPTH)).unwrap();
        assert_eq!(bincode::deserialize::<Value>(&data).unwrap(), nested(MAX_DEPTH));

        let data = bincode::serialize(&nested(MAX_DEPTH + 1)).unwrap();
        assert!(bincode::deserialize::<Value>(&data).is_err());

        let mut options = Options::new();
        options.insert("nics".into(), nested(MAX_DEPTH + 1));
        let data = bincode::serialize(&options).unwrap();
        assert!(bincode::deserialize::<Options>(&data).is_err());
    }
}
