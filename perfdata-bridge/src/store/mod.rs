//! Remote metric store boundary
//!
//! The service only needs five operations from the store: resource type
//! lookup/creation (startup), resource and metric creation (reconciliation)
//! and batch measure submission. [`MetricStore`] is the seam; [`GnocchiClient`]
//! talks to a Gnocchi API over HTTP and the devkit provides an in-memory mock.

mod gnocchi;

pub use gnocchi::{error_from_response, GnocchiClient};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::batch::BatchPayload;
use crate::retry::{retry_on_connect, ExponentialBackoff};

pub const UNKNOWN_RESOURCES_CAUSE: &str = "Unknown resources";
pub const UNKNOWN_METRICS_CAUSE: &str = "Unknown metrics";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("bad request: {message}")]
    BadRequest {
        cause: Option<String>,
        detail: Value,
        message: String,
    },
    #[error("cannot connect to store: {0}")]
    Connect(String),
    #[error("store answered {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, StoreError::Connect(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    fn cause(&self) -> Option<&str> {
        match self {
            StoreError::BadRequest { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Resource ids listed by an "Unknown resources" rejection.
    ///
    /// Detail entries carry `original_resource_id` (the id as sent) and/or
    /// `resource_id`; the former is preferred.
    pub fn unknown_resources(&self) -> Option<Vec<String>> {
        if self.cause() != Some(UNKNOWN_RESOURCES_CAUSE) {
            return None;
        }
        let StoreError::BadRequest { detail, .. } = self else {
            return None;
        };
        let ids = detail
            .as_array()?
            .iter()
            .filter_map(|entry| match entry {
                Value::String(id) => Some(id.clone()),
                Value::Object(map) => map
                    .get("original_resource_id")
                    .or_else(|| map.get("resource_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect();
        Some(ids)
    }

    /// `(resource_id, metric)` pairs listed by an "Unknown metrics" rejection.
    ///
    /// Entries are either `"<resource_id>/<metric>"` strings or objects with
    /// `resource_id` and `name`.
    pub fn unknown_metrics(&self) -> Option<Vec<(String, String)>> {
        if self.cause() != Some(UNKNOWN_METRICS_CAUSE) {
            return None;
        }
        let StoreError::BadRequest { detail, .. } = self else {
            return None;
        };
        let metrics = detail
            .as_array()?
            .iter()
            .filter_map(|entry| match entry {
                Value::String(s) => s
                    .split_once('/')
                    .map(|(r, m)| (r.to_string(), m.to_string())),
                Value::Object(map) => {
                    let resource_id = map.get("resource_id")?.as_str()?;
                    let name = map.get("name")?.as_str()?;
                    Some((resource_id.to_string(), name.to_string()))
                }
                _ => None,
            })
            .collect();
        Some(metrics)
    }
}

/// Minimal resource record created for an unknown resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewResource {
    pub id: String,
    pub host: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMetric {
    pub resource_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_policy_name: Option<String>,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn get_resource_type(&self, name: &str) -> Result<(), StoreError>;

    async fn create_resource_type(&self, name: &str, attributes: &Value) -> Result<(), StoreError>;

    async fn create_resource(&self, resource_type: &str, resource: &NewResource) -> Result<(), StoreError>;

    async fn create_metric(&self, metric: &NewMetric) -> Result<(), StoreError>;

    async fn batch_measures(&self, payload: &BatchPayload, create_metrics: bool) -> Result<(), StoreError>;
}

/// Attributes of the resource type holding one `(host, service)` pair.
pub fn resource_type_attributes() -> Value {
    let string_attr = json!({"type": "string", "min_length": 0, "max_length": 255, "required": true});
    json!({
        "host": string_attr.clone(),
        "service": string_attr,
    })
}

/// Makes sure the resource type exists before any worker starts.
///
/// Only a `NotFound` lookup triggers the creation; a concurrent creation
/// (`AlreadyExists`) is fine. Connection failures are retried.
pub async fn ensure_resource_type(
    store: &dyn MetricStore,
    resource_type: &str,
    backoff: ExponentialBackoff,
) -> Result<(), StoreError> {
    retry_on_connect("resource type bootstrap", backoff, move || async move {
        match store.get_resource_type(resource_type).await {
            Err(StoreError::NotFound(_)) => {
                tracing::info!(resource_type, "creating resource type");
                match store
                    .create_resource_type(resource_type, &resource_type_attributes())
                    .await
                {
                    Err(err) if err.is_already_exists() => Ok(()),
                    other => other,
                }
            }
            other => other,
        }
    })
    .await
}
