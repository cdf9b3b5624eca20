//! Age-based filters
//!
//! - `age`: resources older than a threshold, read from the resource type's
//!   declared creation timestamp.
//! - `marked-for-op`: resources whose operation mark (written by the
//!   `mark-for-op` action) is due.
//!
//! A mark is a tag value of the form
//! `Resource does not meet policy: stop@2024/06/05`, optionally with a
//! `HHMM UTC` suffix on the date for hour-precision marks.

use super::value::{value_as_datetime, Op};
use super::{Filter, FilterContext};
use crate::error::{ConfigIssue, FilterEvaluationError};
use crate::resource::model::{scalar_text, Resource};
use crate::resource::registry::ResourceDef;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Tag holding operation marks unless a policy names another
pub const DEFAULT_MARK_TAG: &str = "custodian_status";

/// Operation scheduled when a policy names none
pub const DEFAULT_MARK_OP: &str = "stop";

/// Default mark message; `{op}` and `{action_date}` are substituted
pub const DEFAULT_MARK_MESSAGE: &str = "Resource does not meet policy: {op}@{action_date}";

const DATE_FORMAT: &str = "%Y/%m/%d";
const HOUR_FORMAT: &str = "%Y/%m/%d %H%M UTC";

/// Render the date part of a mark
pub fn format_action_date(when: DateTime<Utc>, with_hours: bool) -> String {
    when.format(if with_hours { HOUR_FORMAT } else { DATE_FORMAT }).to_string()
}

/// Split a mark into (operation, due date)
pub fn parse_mark(value: &str) -> Option<(String, DateTime<Utc>)> {
    let (_, target) = value.rsplit_once(':')?;
    let (op, date) = target.trim().split_once('@')?;
    let date = date.trim();

    let when = NaiveDateTime::parse_from_str(date, HOUR_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(date, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some((op.trim().to_string(), Utc.from_utc_datetime(&when)))
}

fn number(options: &Map<String, Value>, name: &str, location: &str, issues: &mut Vec<ConfigIssue>) -> f64 {
    match options.get(name) {
        None => 0.0,
        Some(v) => match v.as_f64() {
            Some(n) if n >= 0.0 => n,
            _ => {
                issues.push(ConfigIssue::new(
                    format!("{}.{}", location, name),
                    format!("expected a non-negative number, got {}", v),
                ));
                0.0
            },
        },
    }
}

fn duration_of(days: f64, hours: f64) -> Duration {
    Duration::seconds(((days * 24.0 + hours) * 3600.0).round() as i64)
}

// ============================================================================
// age
// ============================================================================

/// `type: age` with `days`/`hours` and an optional comparison `op`
#[derive(Debug)]
pub struct AgeFilter {
    date_field: String,
    threshold: Duration,
    op: Op,
}

impl AgeFilter {
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let days = number(options, "days", location, &mut issues);
        let hours = number(options, "hours", location, &mut issues);
        if !options.contains_key("days") && !options.contains_key("hours") {
            issues.push(ConfigIssue::new(location, "age requires days or hours"));
        }

        let op = match options.get("op").and_then(|v| v.as_str()) {
            None => Op::Gt,
            Some(name) => match Op::parse(name).filter(|op| op.is_ordering()) {
                Some(op) => op,
                None => {
                    issues.push(ConfigIssue::new(
                        format!("{}.op", location),
                        format!("'{}' is not a comparison operator", name),
                    ));
                    Op::Gt
                },
            },
        };

        let date_field = match &resource.date_field {
            Some(field) => field.clone(),
            None => {
                issues.push(ConfigIssue::new(
                    location,
                    format!("resource {} has no creation date for age filters", resource.key),
                ));
                String::new()
            },
        };

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(Self {
            date_field,
            threshold: duration_of(days, hours),
            op,
        })
    }
}

#[async_trait]
impl Filter for AgeFilter {
    fn type_name(&self) -> &str {
        "age"
    }

    async fn matches(&self, resource: &Resource, ctx: &FilterContext) -> Result<bool, FilterEvaluationError> {
        let Some(raw) = resource.get(&self.date_field).into_owned() else {
            return Ok(false);
        };
        let created = value_as_datetime(&raw).ok_or_else(|| FilterEvaluationError {
            filter: "age".to_string(),
            resource_id: resource.id.clone(),
            message: format!("{} '{}' is not a timestamp", self.date_field, scalar_text(&raw)),
        })?;

        let age = (ctx.now - created).num_seconds() as f64;
        Ok(self.op.compare_numbers(age, self.threshold.num_seconds() as f64))
    }
}

// ============================================================================
// marked-for-op
// ============================================================================

/// `type: marked-for-op` with `tag`, `op`, `skew` (days) and `skew_hours`
#[derive(Debug)]
pub struct MarkedForOpFilter {
    tag: String,
    op: String,
    skew: Duration,
}

impl MarkedForOpFilter {
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        if !resource.taggable() {
            issues.push(ConfigIssue::new(
                location,
                format!("resource {} does not support tags", resource.key),
            ));
        }
        let skew = number(options, "skew", location, &mut issues);
        let skew_hours = number(options, "skew_hours", location, &mut issues);
        let text = |name: &str, default: &str| {
            options
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(Self {
            tag: text("tag", DEFAULT_MARK_TAG),
            op: text("op", DEFAULT_MARK_OP),
            skew: duration_of(skew, skew_hours),
        })
    }
}

#[async_trait]
impl Filter for MarkedForOpFilter {
    fn type_name(&self) -> &str {
        "marked-for-op"
    }

    async fn matches(&self, resource: &Resource, ctx: &FilterContext) -> Result<bool, FilterEvaluationError> {
        let Some(value) = resource.tag(&self.tag) else {
            return Ok(false);
        };
        let Some((op, due)) = parse_mark(value) else {
            tracing::debug!("{}: tag {}='{}' is not an operation mark", resource.id, self.tag, value);
            return Ok(false);
        };
        if op != self.op {
            return Ok(false);
        }
        Ok(ctx.now >= due - self.skew)
    }
}
