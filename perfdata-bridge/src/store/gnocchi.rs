use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};

use super::{MetricStore, NewMetric, NewResource, StoreError};
use crate::batch::BatchPayload;
use crate::config::StoreConfig;

/// HTTP client for the Gnocchi v1 API
#[derive(Clone)]
pub struct GnocchiClient {
    http: reqwest::Client,
    endpoint: String,
    username: Option<String>,
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            StoreError::Connect(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

impl GnocchiClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("perfdata-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            username: config.username.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}/v1/{}", self.endpoint, path));
        match &self.username {
            Some(user) => builder.basic_auth(user, Some("")),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<(), StoreError> {
        let response = builder.send().await?;
        check_response(response).await
    }
}

async fn check_response(response: Response) -> Result<(), StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_response(status.as_u16(), &body))
}

/// Maps a non-2xx Gnocchi answer to a [`StoreError`].
///
/// Gnocchi wraps errors as `{"code": .., "title": .., "description": ..}`
/// where `description` is either a message or a `{cause, detail}` object.
pub fn error_from_response(status: u16, body: &str) -> StoreError {
    let description = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("description").cloned());
    let message = match &description {
        Some(Value::String(s)) => s.clone(),
        _ => body.to_string(),
    };

    match status {
        404 => StoreError::NotFound(message),
        409 => StoreError::AlreadyExists(message),
        400 => match description {
            Some(Value::Object(map)) => StoreError::BadRequest {
                cause: map.get("cause").and_then(Value::as_str).map(str::to_string),
                detail: map.get("detail").cloned().unwrap_or(Value::Null),
                message,
            },
            _ => StoreError::BadRequest {
                cause: None,
                detail: Value::Null,
                message,
            },
        },
        _ => StoreError::Http {
            status,
            body: body.to_string(),
        },
    }
}

#[async_trait]
impl MetricStore for GnocchiClient {
    async fn get_resource_type(&self, name: &str) -> Result<(), StoreError> {
        self.send(self.request(Method::GET, &format!("resource_type/{}", name)))
            .await
    }

    async fn create_resource_type(&self, name: &str, attributes: &Value) -> Result<(), StoreError> {
        let body = json!({"name": name, "attributes": attributes});
        self.send(self.request(Method::POST, "resource_type").json(&body))
            .await
    }

    async fn create_resource(&self, resource_type: &str, resource: &NewResource) -> Result<(), StoreError> {
        self.send(
            self.request(Method::POST, &format!("resource/{}", resource_type))
                .json(resource),
        )
        .await
    }

    async fn create_metric(&self, metric: &NewMetric) -> Result<(), StoreError> {
        self.send(self.request(Method::POST, "metric").json(metric)).await
    }

    async fn batch_measures(&self, payload: &BatchPayload, create_metrics: bool) -> Result<(), StoreError> {
        self.send(
            self.request(Method::POST, "batch/resources/metrics/measures")
                .query(&[("create_metrics", create_metrics)])
                .json(payload),
        )
        .await
    }
}
