//! The codec's universal value model.
//!
//! Graph entities and spatial/temporal types are represented as dedicated
//! variants rather than raw structures so that the rest of the system never
//! handles an unvalidated signature byte.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;

/// A value that can travel over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(ValueMap),

    // Graph structures
    Node(Node),
    Relationship(Relationship),
    UnboundRelationship(UnboundRelationship),
    Path(Path),

    // Spatial structures (v2+)
    Point2D(Point2D),
    Point3D(Point3D),

    // Temporal structures (v2+)
    Date(NaiveDate),
    Time(Time),
    LocalTime(NaiveTime),
    LocalDateTime(NaiveDateTime),
    DateTime(DateTime<FixedOffset>),
    DateTimeZoneId(ZonedDateTime),
    Duration(Duration),
}

impl Value {
    /// Returns a short name for the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Node(_) => "Node",
            Value::Relationship(_) => "Relationship",
            Value::UnboundRelationship(_) => "UnboundRelationship",
            Value::Path(_) => "Path",
            Value::Point2D(_) => "Point2D",
            Value::Point3D(_) => "Point3D",
            Value::Date(_) => "Date",
            Value::Time(_) => "Time",
            Value::LocalTime(_) => "LocalTime",
            Value::LocalDateTime(_) => "LocalDateTime",
            Value::DateTime(_) => "DateTime",
            Value::DateTimeZoneId(_) => "DateTimeZoneId",
            Value::Duration(_) => "Duration",
        }
    }

    /// Returns whether the value is built only from null, booleans, numbers,
    /// strings, and lists/maps of those.
    ///
    /// Auth tokens and transaction metadata may only carry primitive values.
    pub fn is_primitive(&self) -> bool {
        match self {
            Value::Null
            | Value::Boolean(_)
            | Value::Integer(_)
            | Value::Float(_)
            | Value::String(_) => true,
            Value::List(items) => items.iter().all(Value::is_primitive),
            Value::Map(map) => map.values().all(Value::is_primitive),
            _ => false,
        }
    }

    /// Returns whether the value needs the spatial/temporal structures that
    /// only exist from protocol version 2 onward.
    pub fn requires_extended_types(&self) -> bool {
        match self {
            Value::Bytes(_)
            | Value::Point2D(_)
            | Value::Point3D(_)
            | Value::Date(_)
            | Value::Time(_)
            | Value::LocalTime(_)
            | Value::LocalDateTime(_)
            | Value::DateTime(_)
            | Value::DateTimeZoneId(_)
            | Value::Duration(_) => true,
            Value::List(items) => items.iter().any(Value::requires_extended_types),
            Value::Map(map) => map.values().any(Value::requires_extended_types),
            Value::Node(node) => node.properties.values().any(Value::requires_extended_types),
            Value::Relationship(rel) => {
                rel.properties.values().any(Value::requires_extended_types)
            }
            Value::UnboundRelationship(rel) => {
                rel.properties.values().any(Value::requires_extended_types)
            }
            Value::Path(path) => {
                path.nodes
                    .iter()
                    .any(|n| n.properties.values().any(Value::requires_extended_types))
                    || path
                        .relationships
                        .iter()
                        .any(|r| r.properties.values().any(Value::requires_extended_types))
            }
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        Value::Node(node)
    }
}

impl From<NaiveDate> for Value {
    fn from(date: NaiveDate) -> Self {
        Value::Date(date)
    }
}

impl From<Duration> for Value {
    fn from(duration: Duration) -> Self {
        Value::Duration(duration)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A string-keyed map.
///
/// Entries keep insertion order so encoding is deterministic, but equality
/// ignores order: two maps holding the same entries are equal.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: Vec<(String, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts an entry, replacing (in place) any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Builds a map from entries whose keys are already known to be unique.
    pub(crate) fn from_unique_entries(entries: Vec<(String, Value)>) -> Self {
        Self { entries }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ValueMap {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: ValueMap,
}

/// A relationship with both endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub id: i64,
    pub start_node_id: i64,
    pub end_node_id: i64,
    pub rel_type: String,
    pub properties: ValueMap,
}

/// A relationship as it appears inside a path, without endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct UnboundRelationship {
    pub id: i64,
    pub rel_type: String,
    pub properties: ValueMap,
}

/// An alternating sequence of nodes and relationships.
///
/// `indices` walks the path: each pair is (relationship index, node index),
/// where a negative relationship index means the relationship is traversed
/// against its direction. Relationship indices are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<UnboundRelationship>,
    pub indices: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A time of day with a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub time: NaiveTime,
    pub offset: FixedOffset,
}

/// A local date-time in a named time zone.
///
/// The zone id is carried opaquely; resolving it is the query engine's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZonedDateTime {
    pub local: NaiveDateTime,
    pub zone_id: String,
}

/// A calendar-aware duration. Components are kept separate because months
/// and days have no fixed length in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Duration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanoseconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_equality_ignores_order() {
        let a = ValueMap::new().with("a", 1).with("b", "two");
        let b = ValueMap::new().with("b", "two").with("a", 1);
        assert_eq!(a, b);

        let c = ValueMap::new().with("a", 1);
        assert_ne!(a, c);
    }

    #[test]
    fn test_map_insert_replaces_in_place() {
        let mut map = ValueMap::new().with("x", 1).with("y", 2);
        let previous = map.insert("x", 10);
        assert_eq!(previous, Some(Value::Integer(1)));
        assert_eq!(map.len(), 2);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(map.get("x"), Some(&Value::Integer(10)));
    }

    #[test]
    fn test_map_remove() {
        let mut map = ValueMap::new().with("x", 1);
        assert_eq!(map.remove("x"), Some(Value::Integer(1)));
        assert!(map.is_empty());
        assert_eq!(map.remove("x"), None);
    }

    #[test]
    fn test_primitive_check() {
        assert!(Value::Null.is_primitive());
        assert!(Value::from(vec![Value::from(1), Value::from("a")]).is_primitive());
        assert!(Value::Map(ValueMap::new().with("k", 1.5)).is_primitive());

        assert!(!Value::Bytes(Bytes::from_static(b"x")).is_primitive());
        let node = Node {
            id: 1,
            labels: vec![],
            properties: ValueMap::new(),
        };
        assert!(!Value::Node(node.clone()).is_primitive());
        assert!(!Value::Map(ValueMap::new().with("n", node)).is_primitive());

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(!Value::List(vec![Value::Date(date)]).is_primitive());
    }

    #[test]
    fn test_requires_extended_types() {
        assert!(!Value::from("plain").requires_extended_types());
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(Value::List(vec![Value::Date(date)]).requires_extended_types());

        let node = Node {
            id: 1,
            labels: vec!["Person".into()],
            properties: ValueMap::new().with("born", Value::Date(date)),
        };
        assert!(Value::Node(node).requires_extended_types());
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".into()));
    }

    #[test]
    fn test_display() {
        let value = Value::List(vec![Value::from(1), Value::from("a"), Value::Null]);
        assert_eq!(value.to_string(), "[1, \"a\", null]");
    }
}
