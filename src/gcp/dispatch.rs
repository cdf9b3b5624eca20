//! Request Dispatch
//!
//! Maps registry operation names (`list_instances`, `stop_instance`, `tag`,
//! ...) to Compute Engine, Cloud Storage and GKE REST calls, and reshapes
//! their responses into flat, enriched record lists.

use crate::error::ProviderError;
use crate::resource::model::scalar_text;
use reqwest::Method;
use serde_json::{json, Map, Value};

pub const COMPUTE_BASE: &str = "https://compute.googleapis.com";
pub const STORAGE_BASE: &str = "https://storage.googleapis.com";
pub const CONTAINER_BASE: &str = "https://container.googleapis.com";

/// Base URLs of the REST services
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub compute: String,
    pub storage: String,
    pub container: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            compute: COMPUTE_BASE.to_string(),
            storage: STORAGE_BASE.to_string(),
            container: CONTAINER_BASE.to_string(),
        }
    }
}

impl Endpoints {
    /// Every service behind one base URL
    pub fn single(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            compute: base.clone(),
            storage: base.clone(),
            container: base,
        }
    }

    fn compute(&self, project: &str, path: &str) -> String {
        format!("{}/compute/v1/projects/{}/{}", self.compute, project, path)
    }

    fn storage(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.storage, path)
    }

    fn container(&self, project: &str, path: &str) -> String {
        format!("{}/v1/projects/{}/{}", self.container, project, path)
    }
}

/// Where a resource type lives in the GCP API surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Compute collection under `zones/<zone>/`, listed through `aggregated/`
    Zonal(&'static str),
    /// Compute collection under `global/`
    Global(&'static str),
    Bucket,
    Cluster,
}

impl Placement {
    /// Placement of a resource type from its listing method
    pub fn of(list_method: &str) -> Result<Self, ProviderError> {
        match list_method {
            "list_instances" => Ok(Self::Zonal("instances")),
            "list_disks" => Ok(Self::Zonal("disks")),
            "list_networks" => Ok(Self::Global("networks")),
            "list_firewalls" => Ok(Self::Global("firewalls")),
            "list_buckets" => Ok(Self::Bucket),
            "list_clusters" => Ok(Self::Cluster),
            other => Err(ProviderError::Permanent(format!("unsupported listing method {}", other))),
        }
    }

    /// Whether mutating `operation` needs the current record (zone, labels)
    pub fn needs_record(&self, operation: &str) -> bool {
        match self {
            Self::Zonal(_) => true,
            Self::Cluster => is_tag_operation(operation),
            Self::Global(_) | Self::Bucket => false,
        }
    }
}

fn is_tag_operation(operation: &str) -> bool {
    operation == "tag" || operation == "remove-tag"
}

/// One REST call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

impl ApiCall {
    fn new(method: Method, url: String) -> Self {
        Self { method, url, body: None }
    }

    fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

// =============================================================================
// Listing
// =============================================================================

/// Compute API filter matching any of `names`
pub fn name_filter(names: &[String]) -> String {
    match names {
        [single] => format!("name = \"{}\"", single),
        _ => names
            .iter()
            .map(|n| format!("(name = \"{}\")", n))
            .collect::<Vec<_>>()
            .join(" OR "),
    }
}

fn add_query_params(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    if url.contains('?') {
        format!("{}&{}", url, query)
    } else {
        format!("{}?{}", url, query)
    }
}

/// URL of one listing page; `names` narrows compute listings server-side
pub fn list_url(
    endpoints: &Endpoints,
    placement: Placement,
    project: &str,
    page_token: Option<&str>,
    names: Option<&[String]>,
) -> String {
    let filter = names.filter(|n| !n.is_empty()).map(name_filter);
    let mut params: Vec<(&str, &str)> = Vec::new();
    let url = match placement {
        Placement::Zonal(collection) => {
            if let Some(filter) = &filter {
                params.push(("filter", filter.as_str()));
            }
            endpoints.compute(project, &format!("aggregated/{}", collection))
        },
        Placement::Global(collection) => {
            if let Some(filter) = &filter {
                params.push(("filter", filter.as_str()));
            }
            endpoints.compute(project, &format!("global/{}", collection))
        },
        Placement::Bucket => {
            params.push(("project", project));
            endpoints.storage("b")
        },
        Placement::Cluster => endpoints.container(project, "locations/-/clusters"),
    };
    if let Some(token) = page_token {
        params.push(("pageToken", token));
    }
    add_query_params(&url, &params)
}

/// URL of a single non-zonal record
pub fn describe_url(endpoints: &Endpoints, placement: Placement, project: &str, id: &str) -> Option<String> {
    let id = urlencoding::encode(id);
    match placement {
        Placement::Zonal(_) => None,
        Placement::Global(collection) => Some(endpoints.compute(project, &format!("global/{}/{}", collection, id))),
        Placement::Bucket => Some(endpoints.storage(&format!("b/{}", id))),
        Placement::Cluster => Some(endpoints.container(project, &format!("locations/-/clusters/{}", id))),
    }
}

pub fn next_page_token(response: &Value) -> Option<String> {
    response
        .get("nextPageToken")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

/// Zone names of a region start with `<region>-`
fn zone_in_region(zone: &str, region: &str) -> bool {
    zone.strip_prefix(region).is_some_and(|rest| rest.starts_with('-'))
}

/// Records of a listing response, enriched.
///
/// Aggregated responses (`{"items": {"zones/us-central1-a": {"instances": [...]}}}`)
/// are flattened, keeping only the zones of `region`.
pub fn extract_items(response: &Value, placement: Placement, response_path: &str, region: &str) -> Vec<Value> {
    let raw: Vec<Value> = match placement {
        Placement::Zonal(collection) => {
            let Some(scopes) = response.get("items").and_then(|v| v.as_object()) else {
                return Vec::new();
            };
            scopes
                .iter()
                .filter(|(key, _)| {
                    key.strip_prefix("zones/")
                        .is_some_and(|zone| zone_in_region(zone, region))
                })
                .filter_map(|(_, entry)| entry.get(collection).and_then(|v| v.as_array()))
                .flatten()
                .cloned()
                .collect()
        },
        _ => response
            .get(response_path)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
    };
    raw.into_iter().map(enrich).collect()
}

// =============================================================================
// Enrichment
// =============================================================================

/// Last path segment of a GCP resource URL
/// e.g. `https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a` -> `us-central1-a`
pub fn short_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn add_short_fields(map: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(short) = map.get(*field).and_then(|v| v.as_str()).map(short_name) {
            let short = Value::String(short.to_string());
            map.insert(format!("{}_short", field), short);
        }
    }
}

/// Add `<field>_short` names next to resource URLs, including nested
/// network interfaces and attached disks
pub fn enrich(mut item: Value) -> Value {
    let Value::Object(map) = &mut item else {
        return item;
    };
    add_short_fields(map, &["zone", "region", "machineType", "type", "network", "subnetwork"]);

    for (list, fields) in [
        ("networkInterfaces", &["network", "subnetwork"][..]),
        ("disks", &["source"][..]),
    ] {
        if let Some(Value::Array(entries)) = map.get_mut(list) {
            for entry in entries.iter_mut() {
                if let Value::Object(entry) = entry {
                    add_short_fields(entry, fields);
                }
            }
        }
    }
    item
}

// =============================================================================
// Mutations
// =============================================================================

/// Labels after applying a `tag` / `remove-tag` request to `current`
pub fn merged_labels(current: Option<&Value>, operation: &str, params: &Value) -> Map<String, Value> {
    let mut labels = current.and_then(|v| v.as_object()).cloned().unwrap_or_default();
    match (operation, params.get("tags")) {
        ("tag", Some(Value::Object(tags))) => {
            for (key, value) in tags {
                labels.insert(key.clone(), Value::String(scalar_text(value)));
            }
        },
        ("remove-tag", Some(Value::Array(keys))) => {
            for key in keys {
                labels.remove(&scalar_text(key));
            }
        },
        _ => {},
    }
    labels
}

/// Bucket label patch: new values for `tag`, nulls for `remove-tag`
fn bucket_label_patch(operation: &str, params: &Value) -> Map<String, Value> {
    match (operation, params.get("tags")) {
        ("tag", Some(Value::Object(tags))) => tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(scalar_text(v))))
            .collect(),
        ("remove-tag", Some(Value::Array(keys))) => {
            keys.iter().map(|k| (scalar_text(k), Value::Null)).collect()
        },
        _ => Map::new(),
    }
}

fn record_field<'a>(record: Option<&'a Value>, field: &str, id: &str) -> Result<&'a str, ProviderError> {
    record
        .and_then(|r| r.get(field))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::Permanent(format!("{} has no {}", id, field)))
}

fn unsupported(operation: &str, placement: Placement) -> ProviderError {
    ProviderError::Permanent(format!("operation {} is not supported for {:?}", operation, placement))
}

/// The REST call applying `operation` to one target.
///
/// `record` is the target's current record when [`Placement::needs_record`]
/// asks for it.
pub fn mutation_call(
    endpoints: &Endpoints,
    placement: Placement,
    project: &str,
    operation: &str,
    id: &str,
    record: Option<&Value>,
    params: &Value,
) -> Result<ApiCall, ProviderError> {
    let encoded = urlencoding::encode(id);
    match placement {
        Placement::Zonal(collection) => {
            let zone = short_name(record_field(record, "zone", id)?);
            let base = endpoints.compute(project, &format!("zones/{}/{}/{}", zone, collection, encoded));
            match operation {
                "start_instance" => Ok(ApiCall::new(Method::POST, format!("{}/start", base))),
                "stop_instance" => Ok(ApiCall::new(Method::POST, format!("{}/stop", base))),
                "delete_instance" | "delete_disk" => Ok(ApiCall::new(Method::DELETE, base)),
                op if is_tag_operation(op) => {
                    let fingerprint = record_field(record, "labelFingerprint", id)?;
                    let labels = merged_labels(record.and_then(|r| r.get("labels")), op, params);
                    Ok(ApiCall::new(Method::POST, format!("{}/setLabels", base))
                        .with_body(json!({ "labels": labels, "labelFingerprint": fingerprint })))
                },
                op => Err(unsupported(op, placement)),
            }
        },
        Placement::Global(collection) => match operation {
            "delete_firewall" | "delete_network" => Ok(ApiCall::new(
                Method::DELETE,
                endpoints.compute(project, &format!("global/{}/{}", collection, encoded)),
            )),
            op => Err(unsupported(op, placement)),
        },
        Placement::Bucket => {
            let url = endpoints.storage(&format!("b/{}", encoded));
            match operation {
                "delete_bucket" => Ok(ApiCall::new(Method::DELETE, url)),
                op if is_tag_operation(op) => Ok(ApiCall::new(Method::PATCH, url)
                    .with_body(json!({ "labels": bucket_label_patch(op, params) }))),
                op => Err(unsupported(op, placement)),
            }
        },
        Placement::Cluster => match operation {
            op if is_tag_operation(op) => {
                let location = record_field(record, "location", id)?;
                let fingerprint = record_field(record, "labelFingerprint", id)?;
                let labels = merged_labels(record.and_then(|r| r.get("resourceLabels")), op, params);
                Ok(ApiCall::new(
                    Method::POST,
                    endpoints.container(
                        project,
                        &format!("locations/{}/clusters/{}:setResourceLabels", location, encoded),
                    ),
                )
                .with_body(json!({ "resourceLabels": labels, "labelFingerprint": fingerprint })))
            },
            op => Err(unsupported(op, placement)),
        },
    }
}
