//! Cluster metadata model
//!
//! Metadata is partitioned into namespaces. Every entry in a namespace is an
//! attribute map keyed by entity (a server node name or a process key), and
//! each namespace has a schema listing the attribute keys it accepts.

use crate::common::{Error, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Recognized attribute keys. These strings are an external contract.
pub mod keys {
    pub const NODE_NAME: &str = "node_name";
    pub const SERVER_HOST: &str = "server_host";
    pub const SERVER_PORT: &str = "server_port";
    pub const SERVER_START_TIME: &str = "server_start_time";
    pub const INTP_PROCESS_NAME: &str = "intp_process_name";
    pub const INTP_TSERVER_HOST: &str = "intp_tserver_host";
    pub const INTP_TSERVER_PORT: &str = "intp_tserver_port";
    pub const INTP_START_TIME: &str = "intp_start_time";
    pub const CPU_CAPACITY: &str = "cpu_capacity";
    pub const CPU_USED: &str = "cpu_used";
    pub const MEMORY_CAPACITY: &str = "memory_capacity";
    pub const MEMORY_USED: &str = "memory_used";
    pub const LATEST_HEARTBEAT: &str = "latest_heartbeat";
    pub const STATUS: &str = "status";

    pub const ONLINE_STATUS: &str = "ONLINE";
    pub const OFFLINE_STATUS: &str = "OFFLINE";
}

/// Metadata namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaNamespace {
    /// Server nodes (consensus voters and other coordinating servers)
    ServerMeta,
    /// Interpreter / worker processes
    ProcessMeta,
}

impl MetaNamespace {
    pub const ALL: [MetaNamespace; 2] = [MetaNamespace::ServerMeta, MetaNamespace::ProcessMeta];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetaNamespace::ServerMeta => "SERVER_META",
            MetaNamespace::ProcessMeta => "PROCESS_META",
        }
    }

    /// Attribute keys accepted in this namespace and their value kinds
    pub fn schema(&self) -> &'static [(&'static str, ValueKind)] {
        use keys::*;
        match self {
            MetaNamespace::ServerMeta => &[
                (NODE_NAME, ValueKind::Text),
                (SERVER_HOST, ValueKind::Text),
                (SERVER_PORT, ValueKind::Integer),
                (SERVER_START_TIME, ValueKind::Integer),
                (CPU_CAPACITY, ValueKind::Number),
                (CPU_USED, ValueKind::Number),
                (MEMORY_CAPACITY, ValueKind::Integer),
                (MEMORY_USED, ValueKind::Integer),
                (LATEST_HEARTBEAT, ValueKind::Integer),
                (STATUS, ValueKind::Text),
            ],
            MetaNamespace::ProcessMeta => &[
                (SERVER_HOST, ValueKind::Text),
                (SERVER_PORT, ValueKind::Integer),
                (INTP_PROCESS_NAME, ValueKind::Text),
                (INTP_TSERVER_HOST, ValueKind::Text),
                (INTP_TSERVER_PORT, ValueKind::Integer),
                (INTP_START_TIME, ValueKind::Integer),
                (CPU_CAPACITY, ValueKind::Number),
                (CPU_USED, ValueKind::Number),
                (MEMORY_CAPACITY, ValueKind::Integer),
                (MEMORY_USED, ValueKind::Integer),
                (LATEST_HEARTBEAT, ValueKind::Integer),
                (STATUS, ValueKind::Text),
            ],
        }
    }

    /// Check an attribute map against this namespace's schema
    pub fn validate(&self, attrs: &AttrMap) -> Result<()> {
        let schema = self.schema();
        for (name, value) in attrs {
            let kind = schema
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, kind)| *kind)
                .ok_or_else(|| {
                    Error::Schema(format!("unknown attribute '{}' in {}", name, self))
                })?;
            if !kind.accepts(value) {
                return Err(Error::Schema(format!(
                    "attribute '{}' in {} expects {}, got {}",
                    name,
                    self,
                    kind,
                    value.kind_name()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for MetaNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetaNamespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "SERVER_META" | "SERVER" => Ok(MetaNamespace::ServerMeta),
            "PROCESS_META" | "INTP_PROCESS_META" | "PROCESS" => Ok(MetaNamespace::ProcessMeta),
            _ => Err(Error::InvalidConfig(format!("unknown namespace: {}", s))),
        }
    }
}

/// Expected type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    /// Integer or float
    Number,
}

impl ValueKind {
    pub fn accepts(&self, value: &MetaValue) -> bool {
        matches!(
            (self, value),
            (ValueKind::Text, MetaValue::Text(_))
                | (ValueKind::Integer, MetaValue::Int(_))
                | (ValueKind::Number, MetaValue::Int(_))
                | (ValueKind::Number, MetaValue::Float(_))
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Text => write!(f, "text"),
            ValueKind::Integer => write!(f, "integer"),
            ValueKind::Number => write!(f, "number"),
        }
    }
}

/// A single attribute value
///
/// Human-readable formats (JSON) carry plain scalars; binary formats carry
/// an explicit tag.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(v) => Some(*v as f64),
            MetaValue::Float(v) => Some(*v),
            MetaValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(v) => Some(v),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            MetaValue::Int(_) => "integer",
            MetaValue::Float(_) => "float",
            MetaValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(v) => write!(f, "{}", v),
            MetaValue::Float(v) => write!(f, "{}", v),
            MetaValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<u16> for MetaValue {
    fn from(v: u16) -> Self {
        MetaValue::Int(v as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Text(v)
    }
}

/// Parse a CLI-style value: integers first, then floats, else text
impl FromStr for MetaValue {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(v) = s.parse::<i64>() {
            return Ok(MetaValue::Int(v));
        }
        if let Ok(v) = s.parse::<f64>() {
            return Ok(MetaValue::Float(v));
        }
        Ok(MetaValue::Text(s.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
enum TaggedValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Serialize for MetaValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            return match self {
                MetaValue::Int(v) => serializer.serialize_i64(*v),
                MetaValue::Float(v) => serializer.serialize_f64(*v),
                MetaValue::Text(v) => serializer.serialize_str(v),
            };
        }
        let tagged = match self {
            MetaValue::Int(v) => TaggedValue::Int(*v),
            MetaValue::Float(v) => TaggedValue::Float(*v),
            MetaValue::Text(v) => TaggedValue::Text(v.clone()),
        };
        tagged.serialize(serializer)
    }
}

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = MetaValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, integer or float")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<MetaValue, E> {
        Ok(MetaValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<MetaValue, E> {
        i64::try_from(v)
            .map(MetaValue::Int)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<MetaValue, E> {
        Ok(MetaValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<MetaValue, E> {
        Ok(MetaValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<MetaValue, E> {
        Ok(MetaValue::Text(v))
    }
}

impl<'de> Deserialize<'de> for MetaValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            return deserializer.deserialize_any(ScalarVisitor);
        }
        Ok(match TaggedValue::deserialize(deserializer)? {
            TaggedValue::Int(v) => MetaValue::Int(v),
            TaggedValue::Float(v) => MetaValue::Float(v),
            TaggedValue::Text(v) => MetaValue::Text(v),
        })
    }
}

/// Attribute name → value
pub type AttrMap = BTreeMap<String, MetaValue>;

/// Entity key → attributes, as returned by queries
pub type MetaEntries = BTreeMap<String, AttrMap>;

/// Build an attribute map from pairs
pub fn attrs<K, V, I>(pairs: I) -> AttrMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<MetaValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Entries whose status attribute is ONLINE
pub fn online_entries(entries: &MetaEntries) -> MetaEntries {
    entries
        .iter()
        .filter(|(_, attrs)| {
            attrs.get(keys::STATUS).and_then(MetaValue::as_str) == Some(keys::ONLINE_STATUS)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The online entry with the lowest memory used / capacity ratio
pub fn idle_entry(entries: &MetaEntries) -> Option<(String, AttrMap)> {
    let online = online_entries(entries);
    online
        .into_iter()
        .filter_map(|(key, attrs)| {
            let used = attrs.get(keys::MEMORY_USED)?.as_f64()?;
            let capacity = attrs.get(keys::MEMORY_CAPACITY)?.as_f64()?;
            if capacity <= 0.0 {
                return None;
            }
            Some((used / capacity, key, attrs))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, key, attrs)| (key, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_accepts_known_keys() {
        let meta = attrs([
            (keys::SERVER_HOST, MetaValue::from("10.0.0.1")),
            (keys::SERVER_PORT, MetaValue::from(6000i64)),
            (keys::CPU_USED, MetaValue::from(12.5)),
            (keys::CPU_CAPACITY, MetaValue::from(8i64)),
        ]);
        assert!(MetaNamespace::ProcessMeta.validate(&meta).is_ok());
        assert!(MetaNamespace::ServerMeta.validate(&meta).is_ok());
    }

    #[test]
    fn test_schema_rejects_unknown_and_mistyped() {
        let unknown = attrs([("favourite_colour", "blue")]);
        assert!(matches!(
            MetaNamespace::ProcessMeta.validate(&unknown),
            Err(Error::Schema(_))
        ));

        let mistyped = attrs([(keys::SERVER_PORT, "six thousand")]);
        assert!(MetaNamespace::ServerMeta.validate(&mistyped).is_err());

        // node_name is a server-only attribute
        let server_only = attrs([(keys::NODE_NAME, "n1")]);
        assert!(MetaNamespace::ProcessMeta.validate(&server_only).is_err());
    }

    #[test]
    fn test_json_values_are_plain_scalars() {
        let meta = attrs([
            (keys::CPU_USED, MetaValue::from(10i64)),
            (keys::MEMORY_USED, MetaValue::from(2048i64)),
            (keys::STATUS, MetaValue::from("ONLINE")),
        ]);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["cpu_used"], serde_json::json!(10));
        assert_eq!(json["status"], serde_json::json!("ONLINE"));

        let back: AttrMap =
            serde_json::from_str(r#"{"cpu_used": 1.5, "server_port": 80, "server_host": "h"}"#)
                .unwrap();
        assert_eq!(back["cpu_used"], MetaValue::Float(1.5));
        assert_eq!(back["server_port"], MetaValue::Int(80));
        assert_eq!(back["server_host"], MetaValue::Text("h".into()));
    }

    #[test]
    fn test_bincode_keeps_value_types() {
        let meta = attrs([
            (keys::CPU_USED, MetaValue::from(3i64)),
            (keys::CPU_CAPACITY, MetaValue::from(3.0)),
        ]);
        let bytes = bincode::serialize(&meta).unwrap();
        let back: AttrMap = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_namespace_parse() {
        assert_eq!(
            "server_meta".parse::<MetaNamespace>().unwrap(),
            MetaNamespace::ServerMeta
        );
        assert_eq!(
            "INTP_PROCESS_META".parse::<MetaNamespace>().unwrap(),
            MetaNamespace::ProcessMeta
        );
        assert!("nope".parse::<MetaNamespace>().is_err());
    }

    #[test]
    fn test_value_from_str() {
        assert_eq!("42".parse::<MetaValue>().unwrap(), MetaValue::Int(42));
        assert_eq!("0.5".parse::<MetaValue>().unwrap(), MetaValue::Float(0.5));
        assert_eq!(
            "host-a".parse::<MetaValue>().unwrap(),
            MetaValue::Text("host-a".into())
        );
    }

    #[test]
    fn test_idle_entry_prefers_lowest_memory_ratio() {
        let mut entries = MetaEntries::new();
        entries.insert(
            "a".into(),
            attrs([
                (keys::STATUS, MetaValue::from(keys::ONLINE_STATUS)),
                (keys::MEMORY_USED, MetaValue::from(80i64)),
                (keys::MEMORY_CAPACITY, MetaValue::from(100i64)),
            ]),
        );
        entries.insert(
            "b".into(),
            attrs([
                (keys::STATUS, MetaValue::from(keys::ONLINE_STATUS)),
                (keys::MEMORY_USED, MetaValue::from(10i64)),
                (keys::MEMORY_CAPACITY, MetaValue::from(100i64)),
            ]),
        );
        entries.insert(
            "c".into(),
            attrs([
                (keys::STATUS, MetaValue::from(keys::OFFLINE_STATUS)),
                (keys::MEMORY_USED, MetaValue::from(0i64)),
                (keys::MEMORY_CAPACITY, MetaValue::from(100i64)),
            ]),
        );
        assert_eq!(online_entries(&entries).len(), 2);
        assert_eq!(idle_entry(&entries).unwrap().0, "b");
    }
}
