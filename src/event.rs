//! Trigger Events
//!
//! Envelope of the cloud event that starts a push-mode run:
//!
//! ```json
//! {
//!   "provider": "aws",
//!   "account": "123456789012",
//!   "region": "us-east-1",
//!   "resource_type": "ec2",
//!   "name": "RunInstances",
//!   "resource_ids": ["i-0abc"],
//!   "detail": { "userIdentity": { "type": "Root" } }
//! }
//! ```
//!
//! The event either carries full resource records (`resources`), ids
//! (`resource_ids`), or leaves the policy's mode to find ids in the payload
//! through its `ids` path. The whole envelope is what `event` filters see.

use crate::policy::ExecutionMode;
use crate::provider::Scope;
use crate::resource::model::scalar_text;
use crate::resource::registry::{qualify_for, ResourceDef};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(default)]
    provider: Option<String>,
    account: String,
    region: String,
    #[serde(default, alias = "resource-type")]
    resource_type: Option<String>,
    #[serde(default, alias = "eventName")]
    name: Option<String>,
    #[serde(default)]
    resources: Vec<Value>,
    #[serde(default, alias = "resource-ids")]
    resource_ids: Vec<String>,
    #[serde(default, alias = "errorCode")]
    error_code: Option<String>,
}

/// A push-mode trigger
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub provider: Option<String>,
    pub account: String,
    pub region: String,
    /// Resource type the event is about; any when unset
    pub resource_type: Option<String>,
    pub name: Option<String>,
    /// Full raw records carried by the event
    pub resources: Vec<Value>,
    pub resource_ids: Vec<String>,
    pub error_code: Option<String>,
    payload: Value,
}

impl TriggerEvent {
    pub fn from_value(payload: Value) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_value(payload.clone()).context("Invalid event envelope")?;
        // CloudTrail-style payloads keep the name and error code under `detail`
        let detail = payload.get("detail");
        let from_detail = |key: &str| {
            detail
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_str())
                .map(String::from)
        };
        Ok(Self {
            provider: envelope.provider,
            account: envelope.account,
            region: envelope.region,
            resource_type: envelope.resource_type,
            name: envelope.name.or_else(|| from_detail("eventName")),
            resources: envelope.resources,
            resource_ids: envelope.resource_ids,
            error_code: envelope.error_code.or_else(|| from_detail("errorCode")),
            payload,
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let payload: Value = serde_json::from_str(text).context("Event is not valid JSON")?;
        Self::from_value(payload)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid event {}", path.display()))
    }

    /// The envelope as received
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Events for failed API calls describe nothing that exists
    pub fn is_error(&self) -> bool {
        self.error_code.as_deref().is_some_and(|code| !code.is_empty())
    }

    pub fn scope(&self, default_provider: &str) -> Scope {
        Scope::new(
            self.provider.as_deref().unwrap_or(default_provider),
            &self.account,
            &self.region,
        )
    }

    /// Whether the event concerns a resource type
    pub fn concerns(&self, def: &ResourceDef) -> bool {
        if let Some(provider) = &self.provider {
            if *provider != def.provider {
                return false;
            }
        }
        match &self.resource_type {
            Some(rtype) => qualify_for(&def.provider, rtype) == def.key,
            None => true,
        }
    }

    /// Resource ids referenced by the event: explicit ids first, then ids
    /// found through the mode's `ids` path. Duplicates are dropped.
    pub fn resource_ids_for(&self, mode: &ExecutionMode) -> Vec<String> {
        let mut ids = self.resource_ids.clone();
        if let ExecutionMode::Event { ids: Some(path), .. } = mode {
            ids.extend(
                path.collect(&self.payload)
                    .into_iter()
                    .map(scalar_text)
                    .filter(|id| !id.is_empty()),
            );
        }
        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::get_resource;
    use crate::resource::model::AttrPath;
    use serde_json::json;

    fn cloudtrail() -> TriggerEvent {
        TriggerEvent::from_value(json!({
            "account": "123",
            "region": "us-east-1",
            "resource_type": "ec2",
            "detail": {
                "eventName": "RunInstances",
                "responseElements": {"instancesSet": {"items": [
                    {"instanceId": "i-1"}, {"instanceId": "i-2"}
                ]}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_ids_through_mode_path() {
        let event = cloudtrail();
        assert_eq!(event.name.as_deref(), Some("RunInstances"));
        let mode = ExecutionMode::Event {
            events: vec![],
            ids: Some(AttrPath::parse("detail.responseElements.instancesSet.items[].instanceId").unwrap()),
        };
        assert_eq!(event.resource_ids_for(&mode), vec!["i-1", "i-2"]);
        assert!(event.resource_ids_for(&ExecutionMode::Pull).is_empty());
    }

    #[test]
    fn test_error_events() {
        let event = TriggerEvent::from_json(
            r#"{"account": "1", "region": "r", "detail": {"errorCode": "AccessDenied"}}"#,
        )
        .unwrap();
        assert!(event.is_error());
        assert!(!cloudtrail().is_error());
    }

    #[test]
    fn test_concerns_resource_type() {
        let event = cloudtrail();
        assert!(event.concerns(get_resource("ec2").unwrap()));
        assert!(!event.concerns(get_resource("ebs").unwrap()));
        assert!(!event.concerns(get_resource("gcp.instance").unwrap()));
        assert_eq!(event.scope("aws"), Scope::new("aws", "123", "us-east-1"));
    }

    #[test]
    fn test_missing_account_is_rejected() {
        assert!(TriggerEvent::from_json(r#"{"region": "r"}"#).is_err());
    }
}
