//! Value filter
//!
//! Compares one attribute of a resource against a configured value:
//!
//! ```yaml
//! - type: value
//!   key: State.Name
//!   op: in
//!   value: [running, pending]
//! ```
//!
//! [`ValueMatcher`] holds the comparison itself and is shared with the
//! related-resource and event filters.
//!
//! Coercion: when both sides look numeric they compare as numbers, when both
//! look like ISO-8601 timestamps they compare as instants, otherwise as
//! strings (case-sensitive unless `ignore_case: true` or
//! `value_type: normalize`).
//!
//! Absent attributes (missing path or explicit null) fail every operator
//! except `absent` and `empty`.

use super::external::{load_external, ValueFrom};
use super::{Filter, FilterContext};
use crate::error::{ConfigIssue, FilterEvaluationError};
use crate::resource::model::{scalar_text, AttrPath, Lookup, Resource};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::OnceLock;

// ============================================================================
// Operators
// ============================================================================

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Intersect,
    Regex,
    Absent,
    Present,
    Empty,
    NotNull,
}

impl Op {
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name {
            "eq" | "equal" => Self::Eq,
            "ne" | "not-equal" => Self::Ne,
            "gt" | "greater-than" => Self::Gt,
            "gte" | "ge" | "greater-or-equal" => Self::Gte,
            "lt" | "less-than" => Self::Lt,
            "lte" | "le" | "less-or-equal" => Self::Lte,
            "in" => Self::In,
            "ni" | "not-in" => Self::NotIn,
            "contains" => Self::Contains,
            "intersect" => Self::Intersect,
            "regex" => Self::Regex,
            "absent" => Self::Absent,
            "present" => Self::Present,
            "empty" => Self::Empty,
            "not-null" => Self::NotNull,
            _ => return None,
        };
        Some(op)
    }

    /// Operators that need no configured value
    pub fn is_existence(self) -> bool {
        matches!(self, Self::Absent | Self::Present | Self::Empty | Self::NotNull)
    }

    /// Numeric/ordering comparison, used for counts and ages
    pub fn compare_numbers(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Gt => left > right,
            Self::Gte => left >= right,
            Self::Lt => left < right,
            Self::Lte => left <= right,
            _ => false,
        }
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Gt | Self::Gte | Self::Lt | Self::Lte
        )
    }

    pub const NAMES: &'static [&'static str] = &[
        "eq", "ne", "gt", "gte", "lt", "lte", "in", "not-in", "contains", "intersect", "regex",
        "absent", "present", "empty", "not-null",
    ];
}

/// Transform applied before comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Attribute is a timestamp; compare its age in days
    Age,
    /// Attribute is a timestamp; compare days until it is reached
    Expiration,
    Integer,
    /// Compare the length of a string, sequence or mapping
    Size,
    /// Lowercase and trim both sides
    Normalize,
    /// Swap operands
    Swap,
    /// Compare both sides as timestamps
    Date,
    /// Number of related resources (related filters only)
    ResourceCount,
}

impl ValueType {
    pub fn parse(name: &str) -> Option<Self> {
        let vt = match name {
            "age" => Self::Age,
            "expiration" => Self::Expiration,
            "integer" => Self::Integer,
            "size" => Self::Size,
            "normalize" => Self::Normalize,
            "swap" => Self::Swap,
            "date" => Self::Date,
            "resource_count" => Self::ResourceCount,
            _ => return None,
        };
        Some(vt)
    }
}

// ============================================================================
// Coercion
// ============================================================================

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|z|[+-]\d{2}:?\d{2})?)?$",
        )
        .unwrap_or_else(|e| panic!("invalid timestamp pattern: {}", e))
    })
}

/// Parse a numeric-looking string. `inf`/`nan` spellings are not numbers here.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    let first = text.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, '-' | '+' | '.')) {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parse an ISO-8601-looking string as a UTC instant
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if !timestamp_pattern().is_match(text) {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Interpret a JSON value as an instant: timestamp strings, or epoch seconds
/// (milliseconds when the number is too large for seconds)
pub fn value_as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let n = n.as_f64()?;
            let secs = if n.abs() > 1e11 { n / 1000.0 } else { n };
            DateTime::from_timestamp(secs.trunc() as i64, 0)
        },
        _ => None,
    }
}

/// A value ready for comparison
#[derive(Debug, Clone, PartialEq)]
enum Operand<'a> {
    Number(f64),
    Time(DateTime<Utc>),
    Bool(bool),
    Text(Cow<'a, str>),
    /// Sequences and mappings: equality only
    Structured(&'a Value),
}

fn operand(value: &Value) -> Operand<'_> {
    match value {
        Value::Number(n) => n.as_f64().map(Operand::Number).unwrap_or(Operand::Structured(value)),
        Value::Bool(b) => Operand::Bool(*b),
        Value::String(s) => {
            if let Some(n) = parse_number(s) {
                Operand::Number(n)
            } else if let Some(t) = parse_timestamp(s) {
                Operand::Time(t)
            } else {
                Operand::Text(Cow::Borrowed(s.as_str()))
            }
        },
        Value::Null => Operand::Text(Cow::Borrowed("")),
        other => Operand::Structured(other),
    }
}

fn fold(text: &str, ignore_case: bool) -> Cow<'_, str> {
    if ignore_case {
        Cow::Owned(text.trim().to_lowercase())
    } else {
        Cow::Borrowed(text)
    }
}

/// Order two values under the coercion rules. `None` when the values are
/// not comparable.
fn compare(left: &Value, right: &Value, ignore_case: bool) -> Option<Ordering> {
    match (operand(left), operand(right)) {
        (Operand::Number(a), Operand::Number(b)) => a.partial_cmp(&b),
        (Operand::Time(a), Operand::Time(b)) => Some(a.cmp(&b)),
        (Operand::Bool(a), Operand::Bool(b)) => Some(a.cmp(&b)),
        (Operand::Structured(a), Operand::Structured(b)) => (a == b).then_some(Ordering::Equal),
        (Operand::Structured(_), _) | (_, Operand::Structured(_)) => None,
        _ => {
            let a = scalar_text(left);
            let b = scalar_text(right);
            Some(fold(&a, ignore_case).cmp(&fold(&b, ignore_case)))
        },
    }
}

fn equals(left: &Value, right: &Value, ignore_case: bool) -> bool {
    compare(left, right, ignore_case) == Some(Ordering::Equal)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn as_list(value: &Value) -> Cow<'_, [Value]> {
    match value {
        Value::Array(items) => Cow::Borrowed(items.as_slice()),
        other => Cow::Owned(vec![other.clone()]),
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// Inputs of one comparison besides the attribute itself
#[derive(Debug, Clone, Copy)]
pub struct MatchEnv<'a> {
    pub now: DateTime<Utc>,
    /// Values loaded through `value_from`
    pub external: Option<&'a Value>,
}

/// Configured attribute comparison
#[derive(Debug, Clone)]
pub struct ValueMatcher {
    pub key: AttrPath,
    pub op: Op,
    pub value: Option<Value>,
    pub value_type: Option<ValueType>,
    pub ignore_case: bool,
    regex: Option<Regex>,
    value_regex: Option<Regex>,
    pub value_from: Option<ValueFrom>,
}

impl ValueMatcher {
    /// Build from filter options. `allow_count` accepts `value_type: resource_count`.
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        key_required: bool,
        allow_count: bool,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();

        let key = match options.get("key") {
            Some(Value::String(k)) => match AttrPath::parse(k) {
                Ok(path) => Some(path),
                Err(e) => {
                    issues.push(ConfigIssue::new(format!("{}.key", location), e));
                    None
                },
            },
            Some(other) => {
                issues.push(ConfigIssue::new(
                    format!("{}.key", location),
                    format!("expected a string, got {}", other),
                ));
                None
            },
            None if key_required => {
                issues.push(ConfigIssue::new(format!("{}.key", location), "missing required field"));
                None
            },
            None => None,
        };

        let mut value = options.get("value").cloned();
        let mut op = match options.get("op") {
            None => Op::Eq,
            Some(Value::String(name)) => Op::parse(name).unwrap_or_else(|| {
                issues.push(ConfigIssue::new(
                    format!("{}.op", location),
                    format!("unknown operator '{}' (expected one of {})", name, Op::NAMES.join(", ")),
                ));
                Op::Eq
            }),
            Some(other) => {
                issues.push(ConfigIssue::new(
                    format!("{}.op", location),
                    format!("expected a string, got {}", other),
                ));
                Op::Eq
            },
        };

        // `value: absent` spelling of the existence operators
        if op == Op::Eq {
            if let Some(special) = value.as_ref().and_then(|v| v.as_str()).and_then(Op::parse) {
                if special.is_existence() {
                    op = special;
                    value = None;
                }
            }
        }

        let value_type = match options.get("value_type").and_then(|v| v.as_str()) {
            None => None,
            Some(name) => match ValueType::parse(name) {
                Some(ValueType::ResourceCount) if !allow_count => {
                    issues.push(ConfigIssue::new(
                        format!("{}.value_type", location),
                        "resource_count is only valid on related-resource filters",
                    ));
                    None
                },
                Some(vt) => Some(vt),
                None => {
                    issues.push(ConfigIssue::new(
                        format!("{}.value_type", location),
                        format!("unknown value_type '{}'", name),
                    ));
                    None
                },
            },
        };

        let value_from = match options.get("value_from") {
            Some(spec) => match ValueFrom::from_value(spec, &format!("{}.value_from", location)) {
                Ok(vf) => Some(vf),
                Err(mut e) => {
                    issues.append(&mut e);
                    None
                },
            },
            None => None,
        };

        if !op.is_existence() && value.is_none() && value_from.is_none() {
            issues.push(ConfigIssue::new(
                format!("{}.value", location),
                format!("operator '{:?}' requires a value or value_from", op).to_lowercase(),
            ));
        }
        if value.is_some() && value_from.is_some() {
            issues.push(ConfigIssue::new(
                format!("{}.value_from", location),
                "value and value_from are mutually exclusive",
            ));
        }

        let ignore_case = options
            .get("ignore_case")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            || value_type == Some(ValueType::Normalize);

        let regex = if op == Op::Regex {
            match value.as_ref().and_then(|v| v.as_str()) {
                Some(pattern) => match anchored(pattern, ignore_case) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        issues.push(ConfigIssue::new(
                            format!("{}.value", location),
                            format!("invalid regex: {}", e),
                        ));
                        None
                    },
                },
                None => {
                    if value.is_some() {
                        issues.push(ConfigIssue::new(
                            format!("{}.value", location),
                            "regex operator requires a string pattern",
                        ));
                    }
                    None
                },
            }
        } else {
            None
        };

        let value_regex = match options.get("value_regex").and_then(|v| v.as_str()) {
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) if re.captures_len() >= 2 => Some(re),
                Ok(_) => {
                    issues.push(ConfigIssue::new(
                        format!("{}.value_regex", location),
                        "pattern needs one capture group",
                    ));
                    None
                },
                Err(e) => {
                    issues.push(ConfigIssue::new(
                        format!("{}.value_regex", location),
                        format!("invalid regex: {}", e),
                    ));
                    None
                },
            },
            None => None,
        };

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(Self {
            key: key.unwrap_or_else(|| AttrPath::Attr(Vec::new())),
            op,
            value,
            value_type,
            ignore_case,
            regex,
            value_regex,
            value_from,
        })
    }

    /// Shorthand `{path: value}` entry
    pub fn shorthand(path: &str, value: &Value, location: &str) -> Result<Self, Vec<ConfigIssue>> {
        let mut options = Map::new();
        options.insert("key".to_string(), Value::String(path.to_string()));
        options.insert("value".to_string(), value.clone());
        Self::from_options(&options, location, true, false)
    }

    /// Test the attribute of a resource
    pub fn matches_resource(&self, resource: &Resource, env: &MatchEnv<'_>) -> Result<bool, String> {
        self.test(resource.lookup(&self.key), env)
    }

    /// Test the attribute of a raw document (event payloads, related records)
    pub fn matches_document(&self, document: &Value, env: &MatchEnv<'_>) -> Result<bool, String> {
        self.test(self.key.resolve(document), env)
    }

    /// Apply the operator to a resolved attribute
    pub fn test(&self, lookup: Lookup<'_>, env: &MatchEnv<'_>) -> Result<bool, String> {
        let attribute = match lookup {
            Lookup::Absent => return Ok(matches!(self.op, Op::Absent | Op::Empty)),
            Lookup::Present(v) => v,
        };

        match self.op {
            Op::Absent => return Ok(false),
            Op::Present => return Ok(true),
            Op::Empty => return Ok(is_empty_value(&attribute)),
            Op::NotNull => return Ok(!is_empty_value(&attribute)),
            _ => {},
        }

        let attribute = match &self.value_regex {
            Some(re) => {
                let text = scalar_text(&attribute);
                match re.captures(&text).and_then(|c| c.get(1)) {
                    Some(m) => Cow::Owned(Value::String(m.as_str().to_string())),
                    None => return Ok(false),
                }
            },
            None => attribute,
        };

        let configured: Cow<'_, Value> = match (&self.value, env.external) {
            (Some(v), _) => Cow::Borrowed(v),
            (None, Some(external)) => Cow::Borrowed(external),
            (None, None) => return Err("external value list was not loaded".to_string()),
        };

        let (left, right) = self.transform(&attribute, &configured, env)?;
        let (left, right) = if self.value_type == Some(ValueType::Swap) {
            (right, left)
        } else {
            (left, right)
        };
        Ok(self.apply(&left, &right))
    }

    fn transform<'v>(
        &self,
        attribute: &'v Value,
        configured: &'v Value,
        env: &MatchEnv<'_>,
    ) -> Result<(Cow<'v, Value>, Cow<'v, Value>), String> {
        let pair = match self.value_type {
            Some(ValueType::Age) => {
                let when = value_as_datetime(attribute)
                    .ok_or_else(|| format!("'{}' is not a timestamp", scalar_text(attribute)))?;
                let days = (env.now - when).num_seconds() as f64 / 86_400.0;
                (Cow::Owned(Value::from(days)), Cow::Borrowed(configured))
            },
            Some(ValueType::Expiration) => {
                let when = value_as_datetime(attribute)
                    .ok_or_else(|| format!("'{}' is not a timestamp", scalar_text(attribute)))?;
                let days = (when - env.now).num_seconds() as f64 / 86_400.0;
                (Cow::Owned(Value::from(days)), Cow::Borrowed(configured))
            },
            Some(ValueType::Integer) => {
                let n = match attribute {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => parse_number(s),
                    _ => None,
                }
                .ok_or_else(|| format!("'{}' is not an integer", scalar_text(attribute)))?;
                (Cow::Owned(Value::from(n.trunc() as i64)), Cow::Borrowed(configured))
            },
            Some(ValueType::Size) => {
                let len = match attribute {
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    Value::String(s) => s.chars().count(),
                    other => return Err(format!("'{}' has no size", other)),
                };
                (Cow::Owned(Value::from(len)), Cow::Borrowed(configured))
            },
            Some(ValueType::Date) => {
                let left = value_as_datetime(attribute)
                    .ok_or_else(|| format!("'{}' is not a timestamp", scalar_text(attribute)))?;
                let right = value_as_datetime(configured).ok_or_else(|| {
                    format!("configured value '{}' is not a timestamp", scalar_text(configured))
                })?;
                (
                    Cow::Owned(Value::String(left.to_rfc3339())),
                    Cow::Owned(Value::String(right.to_rfc3339())),
                )
            },
            _ => (Cow::Borrowed(attribute), Cow::Borrowed(configured)),
        };
        Ok(pair)
    }

    fn apply(&self, left: &Value, right: &Value) -> bool {
        let ic = self.ignore_case;
        match self.op {
            Op::Eq => equals(left, right, ic),
            Op::Ne => !equals(left, right, ic),
            Op::Gt => compare(left, right, ic) == Some(Ordering::Greater),
            Op::Gte => matches!(compare(left, right, ic), Some(Ordering::Greater | Ordering::Equal)),
            Op::Lt => compare(left, right, ic) == Some(Ordering::Less),
            Op::Lte => matches!(compare(left, right, ic), Some(Ordering::Less | Ordering::Equal)),
            Op::In => as_list(right).iter().any(|c| equals(left, c, ic)),
            Op::NotIn => !as_list(right).iter().any(|c| equals(left, c, ic)),
            Op::Contains => match left {
                Value::Array(items) => items.iter().any(|item| equals(item, right, ic)),
                Value::String(s) => {
                    let needle = scalar_text(right);
                    fold(s, ic).contains(fold(&needle, ic).as_ref())
                },
                _ => false,
            },
            Op::Intersect => {
                let right = as_list(right);
                as_list(left)
                    .iter()
                    .any(|l| right.iter().any(|r| equals(l, r, ic)))
            },
            Op::Regex => match (&self.regex, left) {
                (Some(re), Value::String(s)) => re.is_match(s),
                (Some(re), other) if !other.is_array() && !other.is_object() => {
                    re.is_match(&scalar_text(other))
                },
                _ => false,
            },
            Op::Absent | Op::Present | Op::Empty | Op::NotNull => false,
        }
    }
}

/// Compile a pattern anchored at the start of the value
fn anchored(pattern: &str, ignore_case: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{})", pattern))
        .case_insensitive(ignore_case)
        .build()
}

// ============================================================================
// Filter
// ============================================================================

/// `type: value` leaf
#[derive(Debug)]
pub struct ValueFilter {
    matcher: ValueMatcher,
}

impl ValueFilter {
    pub fn new(matcher: ValueMatcher) -> Self {
        Self { matcher }
    }

    pub fn from_options(options: &Map<String, Value>, location: &str) -> Result<Self, Vec<ConfigIssue>> {
        ValueMatcher::from_options(options, location, true, false).map(Self::new)
    }

    pub fn matcher(&self) -> &ValueMatcher {
        &self.matcher
    }
}

#[async_trait]
impl Filter for ValueFilter {
    fn type_name(&self) -> &str {
        "value"
    }

    async fn prepare(&self, ctx: &FilterContext) -> crate::error::Result<()> {
        if let Some(value_from) = &self.matcher.value_from {
            load_external(value_from, ctx).await?;
        }
        Ok(())
    }

    async fn matches(&self, resource: &Resource, ctx: &FilterContext) -> Result<bool, FilterEvaluationError> {
        let external = match &self.matcher.value_from {
            Some(value_from) => Some(load_external(value_from, ctx).await.map_err(|e| {
                FilterEvaluationError {
                    filter: "value".to_string(),
                    resource_id: resource.id.clone(),
                    message: e.to_string(),
                }
            })?),
            None => None,
        };
        let env = MatchEnv {
            now: ctx.now,
            external: external.as_ref().and_then(|v| v.as_blob()),
        };
        self.matcher
            .matches_resource(resource, &env)
            .map_err(|message| FilterEvaluationError {
                filter: format!("value {}", self.matcher.key),
                resource_id: resource.id.clone(),
                message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matcher(options: Value) -> ValueMatcher {
        let Value::Object(map) = options else {
            panic!("options must be a mapping")
        };
        ValueMatcher::from_options(&map, "filters[0]", true, false).expect("valid options")
    }

    fn env() -> MatchEnv<'static> {
        MatchEnv {
            now: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            external: None,
        }
    }

    fn check(options: Value, doc: Value) -> bool {
        matcher(options).matches_document(&doc, &env()).unwrap()
    }

    #[test]
    fn test_equality_and_coercion() {
        assert!(check(json!({"key": "a", "value": "x"}), json!({"a": "x"})));
        assert!(!check(json!({"key": "a", "value": "X"}), json!({"a": "x"})));
        assert!(check(json!({"key": "a", "value": "X", "ignore_case": true}), json!({"a": "x"})));
        assert!(check(json!({"key": "n", "value": 10}), json!({"n": "10"})));
        assert!(check(json!({"key": "n", "value": "10.0"}), json!({"n": 10})));
        assert!(check(json!({"key": "n", "op": "gt", "value": 9}), json!({"n": "10"})));
        // text comparison would put "10" before "9"
        assert!(!check(json!({"key": "n", "op": "lt", "value": "9"}), json!({"n": "10"})));
        assert!(check(json!({"key": "b", "value": true}), json!({"b": true})));
    }

    #[test]
    fn test_timestamps_compare_as_instants() {
        let doc = json!({"t": "2024-01-02T00:00:00+02:00"});
        assert!(check(json!({"key": "t", "op": "gt", "value": "2024-01-01T21:00:00Z"}), doc.clone()));
        assert!(check(json!({"key": "t", "op": "lt", "value": "2024-01-02"}), doc));
    }

    #[test]
    fn test_absent_policy() {
        let doc = json!({"present": 1, "nothing": null});
        for op in ["eq", "ne", "gt", "gte", "lt", "lte", "in", "not-in", "contains", "intersect", "regex"] {
            let options = json!({"key": "missing", "op": op, "value": "1"});
            assert!(!check(options, doc.clone()), "{} must be false on absent", op);
            let options = json!({"key": "nothing", "op": op, "value": "1"});
            assert!(!check(options, doc.clone()), "{} must be false on null", op);
        }
        assert!(check(json!({"key": "missing", "value": "absent"}), doc.clone()));
        assert!(check(json!({"key": "missing", "op": "empty"}), doc.clone()));
        assert!(!check(json!({"key": "missing", "value": "present"}), doc.clone()));
        assert!(!check(json!({"key": "missing", "value": "not-null"}), doc.clone()));
        assert!(check(json!({"key": "present", "value": "present"}), doc.clone()));
        assert!(!check(json!({"key": "present", "value": "absent"}), doc));

        let doc = json!({"InstanceId": "i-1"});
        let key = "SecurityGroups[].GroupId";
        assert!(check(json!({"key": key, "value": "absent"}), doc.clone()));
        assert!(check(json!({"key": key, "op": "empty"}), doc.clone()));
        for op in ["eq", "ne", "in", "not-in", "contains", "regex"] {
            let value = match op {
                "in" | "not-in" => json!(["sg-1"]),
                "regex" => json!("sg-.*"),
                _ => json!("sg-1"),
            };
            let options = json!({"key": key, "op": op, "value": value});
            assert!(!check(options, doc.clone()), "{} must be false on an absent projection", op);
        }
    }

    #[test]
    fn test_empty_and_not_null() {
        let doc = json!({"s": "", "a": [], "m": {}, "x": [1]});
        for key in ["s", "a", "m"] {
            assert!(check(json!({"key": key, "value": "empty"}), doc.clone()));
            assert!(!check(json!({"key": key, "value": "not-null"}), doc.clone()));
        }
        assert!(check(json!({"key": "x", "value": "not-null"}), doc));
    }

    #[test]
    fn test_membership_operators() {
        let doc = json!({"state": "running", "groups": ["a", "b"]});
        assert!(check(json!({"key": "state", "op": "in", "value": ["running", "pending"]}), doc.clone()));
        assert!(check(json!({"key": "state", "op": "not-in", "value": ["stopped"]}), doc.clone()));
        assert!(check(json!({"key": "groups", "op": "contains", "value": "b"}), doc.clone()));
        assert!(check(json!({"key": "state", "op": "contains", "value": "unn"}), doc.clone()));
        assert!(check(json!({"key": "groups", "op": "intersect", "value": ["z", "a"]}), doc.clone()));
        assert!(!check(json!({"key": "groups", "op": "intersect", "value": ["z"]}), doc));
    }

    #[test]
    fn test_regex_is_anchored_at_start() {
        let doc = json!({"name": "prod-web-1"});
        assert!(check(json!({"key": "name", "op": "regex", "value": "prod-.*"}), doc.clone()));
        assert!(!check(json!({"key": "name", "op": "regex", "value": "web"}), doc.clone()));
        assert!(check(json!({"key": "name", "op": "regex", "value": ".*web"}), doc));
    }

    #[test]
    fn test_value_types() {
        // 2024-06-01 minus 2024-05-01 = 31 days
        let doc = json!({"created": "2024-05-01T00:00:00Z", "expires": "2024-06-11T00:00:00Z", "n": "42.7", "list": [1, 2, 3]});
        assert!(check(json!({"key": "created", "value_type": "age", "op": "gt", "value": 30}), doc.clone()));
        assert!(!check(json!({"key": "created", "value_type": "age", "op": "gt", "value": 31}), doc.clone()));
        assert!(check(json!({"key": "expires", "value_type": "expiration", "op": "lt", "value": 15}), doc.clone()));
        assert!(check(json!({"key": "n", "value_type": "integer", "value": 42}), doc.clone()));
        assert!(check(json!({"key": "list", "value_type": "size", "op": "gte", "value": 3}), doc.clone()));
        assert!(check(json!({"key": "created", "value_type": "date", "op": "lt", "value": "2024-05-02"}), doc.clone()));
        assert!(!check(json!({"key": "n", "value_type": "swap", "op": "lt", "value": 50}), json!({"n": 10})));
        assert!(check(json!({"key": "n", "value_type": "normalize", "value": " ABC "}), json!({"n": "abc"})));
    }

    #[test]
    fn test_malformed_data_is_an_evaluation_error() {
        let m = matcher(json!({"key": "n", "value_type": "integer", "value": 1}));
        assert!(m.matches_document(&json!({"n": "many"}), &env()).is_err());
        let m = matcher(json!({"key": "t", "value_type": "age", "op": "gt", "value": 1}));
        assert!(m.matches_document(&json!({"t": "yesterday"}), &env()).is_err());
    }

    #[test]
    fn test_option_errors_are_collected() {
        let Value::Object(map) = json!({"op": "explode", "value_type": "weird"}) else {
            unreachable!()
        };
        let issues = ValueMatcher::from_options(&map, "filters[3]", true, false).unwrap_err();
        // missing key, unknown op, unknown value_type, missing value
        assert_eq!(issues.len(), 4);
        assert!(issues.iter().all(|i| i.location.starts_with("filters[3]")));

        let Value::Object(map) = json!({"key": "a", "op": "regex", "value": "("}) else {
            unreachable!()
        };
        assert!(ValueMatcher::from_options(&map, "f", true, false).is_err());

        let Value::Object(map) = json!({"key": "a", "value_type": "resource_count", "value": 1}) else {
            unreachable!()
        };
        assert!(ValueMatcher::from_options(&map, "f", true, false).is_err());
    }

    #[test]
    fn test_value_regex_extracts_before_compare() {
        let doc = json!({"Description": "Created by CreateImage(i-0abc) for ami-123"});
        assert!(check(
            json!({"key": "Description", "value_regex": "CreateImage\\((i-[0-9a-f]+)\\)", "value": "i-0abc"}),
            doc
        ));
    }

    #[test]
    fn test_parse_number_rejects_words() {
        assert_eq!(parse_number("12"), Some(12.0));
        assert_eq!(parse_number("-1.5"), Some(-1.5));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number("2024-01-01"), None);
    }
}
