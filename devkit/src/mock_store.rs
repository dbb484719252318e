/*!
Mock du store Gnocchi pour tests sans serveur

Reproduit les réponses utiles au bridge :
- `Unknown resources` (400) quand un batch vise une ressource absente
- `Unknown metrics` (400) quand `create_metrics=false` et la métrique est absente
- `AlreadyExists` (409) sur les créations en double, ou forcé pour simuler une course
- échecs de connexion scriptés pour tester le back-off

Chaque appel est enregistré pour les assertions.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use perfdata_bridge::batch::BatchPayload;
use perfdata_bridge::perfdata::Measure;
use perfdata_bridge::store::{
    MetricStore, NewMetric, NewResource, StoreError, UNKNOWN_METRICS_CAUSE, UNKNOWN_RESOURCES_CAUSE,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Appel reçu par le mock
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    GetResourceType(String),
    CreateResourceType(String),
    CreateResource(NewResource),
    CreateMetric(NewMetric),
    BatchMeasures {
        payload: BatchPayload,
        create_metrics: bool,
    },
}

#[derive(Default)]
struct MockState {
    resource_types: HashSet<String>,
    resources: HashMap<String, NewResource>,
    metrics: HashSet<(String, String)>,
    measures: HashMap<(String, String), Vec<Measure>>,
    /// ids créés "par un autre process" au moment du create
    racing_resources: HashSet<String>,
    connect_failures: usize,
    calls: Vec<StoreCall>,
}

/// Store en mémoire, clonable (état partagé)
#[derive(Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<MockState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Déclare une ressource déjà présente
    pub fn with_resource(self, id: &str, host: &str, service: &str) -> Self {
        self.state.lock().resources.insert(
            id.to_string(),
            NewResource {
                id: id.to_string(),
                host: host.to_string(),
                service: service.to_string(),
            },
        );
        self
    }

    pub fn with_resource_type(self, name: &str) -> Self {
        self.state.lock().resource_types.insert(name.to_string());
        self
    }

    /// Les `count` prochains appels échouent comme si le store était injoignable
    pub fn fail_connects(&self, count: usize) {
        self.state.lock().connect_failures = count;
    }

    /// Le prochain create de `id` répond 409 : quelqu'un l'a créée entre-temps
    pub fn race_on_create(&self, id: &str) {
        self.state.lock().racing_resources.insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn batch_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, StoreCall::BatchMeasures { .. }))
    }

    pub fn created_resources(&self) -> Vec<NewResource> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::CreateResource(resource) => Some(resource.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count_calls(&self, filter: impl Fn(&StoreCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| filter(call)).count()
    }

    pub fn has_resource(&self, id: &str) -> bool {
        self.state.lock().resources.contains_key(id)
    }

    pub fn has_resource_type(&self, name: &str) -> bool {
        self.state.lock().resource_types.contains(name)
    }

    /// Mesures stockées pour une métrique
    pub fn measures(&self, resource_id: &str, metric: &str) -> Vec<Measure> {
        self.state
            .lock()
            .measures
            .get(&(resource_id.to_string(), metric.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_measures(&self) -> usize {
        self.state.lock().measures.values().map(Vec::len).sum()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: StoreCall) -> Result<(), StoreError> {
        tracing::debug!(call = ?call, "[mock] store call");
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(StoreError::Connect("connection refused (mock)".to_string()));
        }
        Ok(())
    }
}

fn bad_request(cause: &str, detail: Value) -> StoreError {
    StoreError::BadRequest {
        cause: Some(cause.to_string()),
        detail,
        message: cause.to_string(),
    }
}

#[async_trait]
impl MetricStore for MockStore {
    async fn get_resource_type(&self, name: &str) -> Result<(), StoreError> {
        self.record(StoreCall::GetResourceType(name.to_string()))?;
        if self.has_resource_type(name) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("Resource type {} does not exist", name)))
        }
    }

    async fn create_resource_type(&self, name: &str, _attributes: &Value) -> Result<(), StoreError> {
        self.record(StoreCall::CreateResourceType(name.to_string()))?;
        if self.state.lock().resource_types.insert(name.to_string()) {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(format!("Resource type {} already exists", name)))
        }
    }

    async fn create_resource(&self, _resource_type: &str, resource: &NewResource) -> Result<(), StoreError> {
        self.record(StoreCall::CreateResource(resource.clone()))?;
        let mut state = self.state.lock();
        let raced = state.racing_resources.remove(&resource.id);
        if state.resources.contains_key(&resource.id) || raced {
            state.resources.insert(resource.id.clone(), resource.clone());
            return Err(StoreError::AlreadyExists(format!("Resource {} already exists", resource.id)));
        }
        state.resources.insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn create_metric(&self, metric: &NewMetric) -> Result<(), StoreError> {
        self.record(StoreCall::CreateMetric(metric.clone()))?;
        let key = (metric.resource_id.clone(), metric.name.clone());
        if self.state.lock().metrics.insert(key) {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(format!("Metric {} already exists", metric.name)))
        }
    }

    async fn batch_measures(&self, payload: &BatchPayload, create_metrics: bool) -> Result<(), StoreError> {
        self.record(StoreCall::BatchMeasures {
            payload: payload.clone(),
            create_metrics,
        })?;
        let mut state = self.state.lock();

        let unknown: Vec<Value> = payload
            .keys()
            .filter(|id| !state.resources.contains_key(*id))
            .map(|id| json!({"resource_id": id, "original_resource_id": id}))
            .collect();
        if !unknown.is_empty() {
            return Err(bad_request(UNKNOWN_RESOURCES_CAUSE, Value::Array(unknown)));
        }

        if !create_metrics {
            let missing: Vec<Value> = payload
                .iter()
                .flat_map(|(id, metrics)| metrics.keys().map(move |name| (id, name)))
                .filter(|(id, name)| !state.metrics.contains(&((*id).clone(), (*name).clone())))
                .map(|(id, name)| Value::String(format!("{}/{}", id, name)))
                .collect();
            if !missing.is_empty() {
                return Err(bad_request(UNKNOWN_METRICS_CAUSE, Value::Array(missing)));
            }
        }

        for (id, metrics) in payload {
            for (name, measures) in metrics {
                state.metrics.insert((id.clone(), name.clone()));
                state
                    .measures
                    .entry((id.clone(), name.clone()))
                    .or_default()
                    .extend(measures.iter().cloned());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn payload(id: &str) -> BatchPayload {
        let measure = Measure {
            timestamp: "2016-11-21T11:11:00+00:00".to_string(),
            value: 1.0,
        };
        let metrics = BTreeMap::from([("Uptime::uptime".to_string(), vec![measure])]);
        BTreeMap::from([(id.to_string(), metrics)])
    }

    #[tokio::test]
    async fn test_unknown_resources_are_reported() {
        let store = MockStore::new();
        let err = store.batch_measures(&payload("r1"), true).await.unwrap_err();
        assert_eq!(err.unknown_resources(), Some(vec!["r1".to_string()]));

        let store = store.with_resource("r1", "arn", "Uptime");
        store.batch_measures(&payload("r1"), true).await.unwrap();
        assert_eq!(store.measures("r1", "Uptime::uptime").len(), 1);
        assert_eq!(store.batch_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_metrics_without_on_demand_creation() {
        let store = MockStore::new().with_resource("r1", "arn", "Uptime");
        let err = store.batch_measures(&payload("r1"), false).await.unwrap_err();
        assert_eq!(
            err.unknown_metrics(),
            Some(vec![("r1".to_string(), "Uptime::uptime".to_string())])
        );
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let store = MockStore::new().with_resource_type("nagios-service");
        store.fail_connects(1);
        assert!(store.get_resource_type("nagios-service").await.unwrap_err().is_connect_failure());
        store.get_resource_type("nagios-service").await.unwrap();
    }

    #[tokio::test]
    async fn test_race_on_create_answers_conflict() {
        let store = MockStore::new();
        store.race_on_create("r1");
        let resource = NewResource {
            id: "r1".to_string(),
            host: "arn".to_string(),
            service: "Uptime".to_string(),
        };
        assert!(store.create_resource("t", &resource).await.unwrap_err().is_already_exists());
        assert!(store.has_resource("r1"));
    }
}
