//! Policy variables
//!
//! String values in a policy may reference `{account_id}`, `{region}`,
//! `{provider}`, `{policy_name}` and `{now}`. Placeholders are expanded per
//! scope just before the policy runs. Unknown placeholders are left as
//! written; actions substitute their own (`{op}`, `{action_date}`, `{count}`).

use crate::provider::Scope;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Names expanded by [`Variables`]
pub const NAMES: &[&str] = &["account_id", "region", "provider", "policy_name", "now"];

#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<&'static str, String>,
}

impl Variables {
    pub fn for_scope(policy: &str, scope: &Scope, now: DateTime<Utc>) -> Self {
        let mut values = BTreeMap::new();
        values.insert("account_id", scope.account.clone());
        values.insert("region", scope.region.clone());
        values.insert("provider", scope.provider.clone());
        values.insert("policy_name", policy.to_string());
        values.insert("now", now.to_rfc3339_opts(SecondsFormat::Secs, true));
        Self { values }
    }

    /// Values used when validating a policy outside of any scope
    pub fn placeholders(policy: &str) -> Self {
        let scope = Scope::new("provider", "account", "region");
        Self::for_scope(policy, &scope, DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn expand_str(&self, text: &str) -> String {
        if !text.contains('{') {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.values.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        },
                    }
                    rest = &after[close + 1..];
                },
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                },
            }
        }
        out.push_str(rest);
        out
    }

    /// Expand every string in a document (keys are left alone)
    pub fn expand(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.expand_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.expand(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.expand(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Whether any string in the document references a known variable
pub fn references_variables(value: &Value) -> bool {
    match value {
        Value::String(s) => NAMES.iter().any(|name| s.contains(&format!("{{{}}}", name))),
        Value::Array(items) => items.iter().any(references_variables),
        Value::Object(map) => map.values().any(references_variables),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn vars() -> Variables {
        Variables::for_scope(
            "idle",
            &Scope::new("aws", "123", "eu-west-1"),
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_known_names_are_expanded() {
        assert_eq!(
            vars().expand_str("arn:aws:sns:{region}:{account_id}:{policy_name}"),
            "arn:aws:sns:eu-west-1:123:idle"
        );
        assert_eq!(vars().expand_str("{now}"), "2024-06-01T00:00:00Z");
    }

    #[test]
    fn test_unknown_and_unbalanced_are_kept() {
        assert_eq!(vars().expand_str("{op}@{action_date}"), "{op}@{action_date}");
        assert_eq!(vars().expand_str("a {region"), "a {region");
    }

    #[test]
    fn test_document_expansion() {
        let doc = json!({"filters": [{"tag:Owner": "{account_id}"}], "n": 3});
        assert!(references_variables(&doc));
        assert_eq!(vars().expand(&doc), json!({"filters": [{"tag:Owner": "123"}], "n": 3}));
        assert!(!references_variables(&json!({"msg": "{op}"})));
    }
}
