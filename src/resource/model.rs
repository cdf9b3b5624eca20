//! Resource Model
//!
//! A resource is an immutable JSON document plus a stable id, its resource
//! type, the scope it was fetched from and its normalized tags. Attributes
//! are addressed with dot/bracket paths:
//!
//! - `State.Name` - nested keys
//! - `Tags[0].Key` - sequence index
//! - `SecurityGroups[].GroupId` - flatten a sequence and project a key
//! - `tag:Environment` - normalized tag lookup
//!
//! Path resolution returns [`Lookup`], an explicit present/absent value.
//! An explicit JSON `null` counts as absent.

use super::registry::{TagSpec, TagStyle};
use crate::provider::Scope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A normalized cloud resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    /// Qualified resource type, e.g. `aws.ec2`
    pub resource_type: String,
    pub scope: Scope,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub data: Value,
}

impl Resource {
    pub fn new(id: &str, resource_type: &str, scope: Scope, data: Value) -> Self {
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            scope,
            tags: BTreeMap::new(),
            data,
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Resolve an attribute path given as text. Unparseable paths are absent.
    pub fn get(&self, path: &str) -> Lookup<'_> {
        match AttrPath::parse(path) {
            Ok(path) => self.lookup(&path),
            Err(_) => Lookup::Absent,
        }
    }

    /// Resolve a parsed attribute path
    pub fn lookup(&self, path: &AttrPath) -> Lookup<'_> {
        match path {
            AttrPath::Tag(key) => match self.tags.get(key) {
                Some(value) => Lookup::Present(Cow::Owned(Value::String(value.clone()))),
                None => Lookup::Absent,
            },
            AttrPath::Attr(_) => path.resolve(&self.data),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }
}

/// Result of resolving an attribute path
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    Present(Cow<'a, Value>),
    Absent,
}

impl<'a> Lookup<'a> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Present(v) => Some(v.as_ref()),
            Self::Absent => None,
        }
    }

    pub fn into_owned(self) -> Option<Value> {
        match self {
            Self::Present(v) => Some(v.into_owned()),
            Self::Absent => None,
        }
    }

    fn from_ref(value: Option<&'a Value>) -> Self {
        match value {
            Some(Value::Null) | None => Self::Absent,
            Some(v) => Self::Present(Cow::Borrowed(v)),
        }
    }
}

/// One step of an attribute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// `[]` or `[*]`: apply the rest of the path to every element
    Flatten,
}

/// Parsed attribute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrPath {
    Tag(String),
    Attr(Vec<Segment>),
}

impl AttrPath {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty attribute path".to_string());
        }
        if let Some(key) = text.strip_prefix("tag:") {
            if key.is_empty() {
                return Err("empty tag key".to_string());
            }
            return Ok(Self::Tag(key.to_string()));
        }

        let mut segments = Vec::new();
        for part in text.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };
            if name.is_empty() && rest.is_empty() {
                return Err(format!("empty segment in path '{}'", text));
            }
            if !name.is_empty() {
                segments.push(Segment::Key(name.to_string()));
            }
            while !rest.is_empty() {
                let Some(close) = rest.find(']') else {
                    return Err(format!("unclosed '[' in path '{}'", text));
                };
                let inner = &rest[1..close];
                match inner {
                    "" | "*" => segments.push(Segment::Flatten),
                    n => {
                        let idx = n
                            .parse::<usize>()
                            .map_err(|_| format!("invalid index '{}' in path '{}'", n, text))?;
                        segments.push(Segment::Index(idx));
                    },
                }
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(format!("unexpected '{}' in path '{}'", rest, text));
                }
            }
        }
        Ok(Self::Attr(segments))
    }

    /// Whether the path can yield several values
    pub fn is_projection(&self) -> bool {
        matches!(self, Self::Attr(segments) if segments.contains(&Segment::Flatten))
    }

    /// Resolve against a raw JSON document. Tag paths are always absent here.
    pub fn resolve<'a>(&self, value: &'a Value) -> Lookup<'a> {
        let Self::Attr(segments) = self else {
            return Lookup::Absent;
        };
        match segments.iter().position(|s| *s == Segment::Flatten) {
            None => Lookup::from_ref(walk(value, segments)),
            Some(idx) => {
                // A projection over a missing or non-sequence prefix is absent
                if !matches!(walk(value, &segments[..idx]), Some(Value::Array(_))) {
                    return Lookup::Absent;
                }
                let mut out = Vec::new();
                project(value, segments, &mut out);
                Lookup::Present(Cow::Owned(Value::Array(
                    out.into_iter().cloned().collect(),
                )))
            },
        }
    }

    /// Every value the path yields, flattening projections. Absent and null
    /// values are skipped.
    pub fn collect<'a>(&self, value: &'a Value) -> Vec<&'a Value> {
        let Self::Attr(segments) = self else {
            return Vec::new();
        };
        let mut out = Vec::new();
        project(value, segments, &mut out);
        out
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(key) => write!(f, "tag:{}", key),
            Self::Attr(segments) => {
                let mut first = true;
                for segment in segments {
                    match segment {
                        Segment::Key(k) => {
                            if !first {
                                write!(f, ".")?;
                            }
                            write!(f, "{}", k)?;
                        },
                        Segment::Index(i) => write!(f, "[{}]", i)?,
                        Segment::Flatten => write!(f, "[]")?,
                    }
                    first = false;
                }
                Ok(())
            },
        }
    }
}

fn step<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match segment {
        Segment::Key(key) => value.get(key.as_str()),
        Segment::Index(idx) => value.get(*idx),
        Segment::Flatten => None,
    }
}

fn walk<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| step(current, segment))
}

fn project<'a>(value: &'a Value, segments: &[Segment], out: &mut Vec<&'a Value>) {
    let Some((first, rest)) = segments.split_first() else {
        match value {
            Value::Null => {},
            Value::Array(items) => out.extend(items.iter().filter(|v| !v.is_null())),
            other => out.push(other),
        }
        return;
    };
    match first {
        Segment::Flatten => {
            if let Value::Array(items) = value {
                for item in items {
                    project(item, rest, out);
                }
            }
        },
        other => {
            if let Some(next) = step(value, other) {
                project(next, rest, out);
            }
        },
    }
}

/// Read tags from a raw record according to the resource type's tag layout
pub fn tags_from_value(data: &Value, spec: &TagSpec) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    let Ok(path) = AttrPath::parse(&spec.path) else {
        return tags;
    };
    let Some(raw) = path.resolve(data).into_owned() else {
        return tags;
    };

    match spec.style {
        TagStyle::KeyValueList => {
            for entry in raw.as_array().into_iter().flatten() {
                let key = entry.get("Key").and_then(|k| k.as_str());
                if let Some(key) = key {
                    let value = entry.get("Value").map(scalar_text).unwrap_or_default();
                    tags.insert(key.to_string(), value);
                }
            }
        },
        TagStyle::Map => {
            if let Value::Object(map) = raw {
                for (key, value) in map {
                    tags.insert(key, scalar_text(&value));
                }
            }
        },
    }
    tags
}

/// Render a scalar as text; strings are returned without quotes
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> Resource {
        Resource::new(
            "i-1",
            "aws.ec2",
            Scope::new("aws", "123", "us-east-1"),
            json!({
                "InstanceId": "i-1",
                "State": {"Name": "running"},
                "SecurityGroups": [{"GroupId": "sg-1"}, {"GroupId": "sg-2"}],
                "Tags": [{"Key": "Owner", "Value": "ops"}],
                "KernelId": null
            }),
        )
        .with_tags(BTreeMap::from([("Owner".to_string(), "ops".to_string())]))
    }

    #[test]
    fn test_nested_lookup() {
        let r = instance();
        assert_eq!(r.get("State.Name").value(), Some(&json!("running")));
        assert_eq!(r.get("SecurityGroups[1].GroupId").value(), Some(&json!("sg-2")));
        assert!(r.get("State.Code").is_absent());
        assert!(r.get("Missing.Deeply.Nested").is_absent());
    }

    #[test]
    fn test_null_is_absent() {
        assert!(instance().get("KernelId").is_absent());
    }

    #[test]
    fn test_projection() {
        let r = instance();
        assert_eq!(
            r.get("SecurityGroups[].GroupId").into_owned(),
            Some(json!(["sg-1", "sg-2"]))
        );
        let path = AttrPath::parse("SecurityGroups[].GroupId").unwrap();
        assert!(path.is_projection());
        assert_eq!(path.collect(&r.data), vec![&json!("sg-1"), &json!("sg-2")]);
    }

    #[test]
    fn test_projection_over_missing_prefix_is_absent() {
        let path = AttrPath::parse("SecurityGroups[].GroupId").unwrap();
        assert!(path.resolve(&json!({"InstanceId": "i-1"})).is_absent());
        assert!(path.resolve(&json!({"SecurityGroups": null})).is_absent());
        assert!(path.resolve(&json!({"SecurityGroups": "sg-1"})).is_absent());
        assert_eq!(
            path.resolve(&json!({"SecurityGroups": []})).into_owned(),
            Some(json!([]))
        );
    }

    #[test]
    fn test_tag_lookup() {
        let r = instance();
        assert_eq!(r.get("tag:Owner").value(), Some(&json!("ops")));
        assert!(r.get("tag:Environment").is_absent());
    }

    #[test]
    fn test_parse_errors() {
        assert!(AttrPath::parse("").is_err());
        assert!(AttrPath::parse("a[1").is_err());
        assert!(AttrPath::parse("a[x]").is_err());
        assert!(AttrPath::parse("a..b").is_err());
        assert!(AttrPath::parse("tag:").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["State.Name", "Reservations[].Instances[]", "Tags[0].Key", "tag:Env"] {
            assert_eq!(AttrPath::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_tags_from_value() {
        let spec = TagSpec {
            path: "Tags".into(),
            style: TagStyle::KeyValueList,
        };
        let tags = tags_from_value(&json!({"Tags": [{"Key": "a", "Value": "1"}]}), &spec);
        assert_eq!(tags.get("a").map(|s| s.as_str()), Some("1"));

        let spec = TagSpec {
            path: "labels".into(),
            style: TagStyle::Map,
        };
        let tags = tags_from_value(&json!({"labels": {"env": "prod", "n": 3}}), &spec);
        assert_eq!(tags.get("env").map(|s| s.as_str()), Some("prod"));
        assert_eq!(tags.get("n").map(|s| s.as_str()), Some("3"));
    }
}
