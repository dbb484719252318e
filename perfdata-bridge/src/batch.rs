//! Grouping of parsed records into one store submission
//!
//! Wire format, keyed by resource id then metric name:
//!
//! ```json
//! {"5b1f...": {"Uptime::uptime": [{"timestamp": "2016-11-21T11:11:00+00:00", "value": 9175101.06}]}}
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::identity::ResourceIdentity;
use crate::perfdata::{Measure, ParsedRecord};

/// resource id -> metric name -> measures
pub type BatchPayload = BTreeMap<String, BTreeMap<String, Vec<Measure>>>;

#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub payload: BatchPayload,
    /// resource id -> identity, kept to rebuild resources the store does not know
    pub resources: HashMap<String, ResourceIdentity>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.payload.len()
    }

    pub fn measure_count(&self) -> usize {
        self.payload
            .values()
            .flat_map(|metrics| metrics.values())
            .map(Vec::len)
            .sum()
    }

    pub fn identity(&self, resource_id: &str) -> Option<&ResourceIdentity> {
        self.resources.get(resource_id)
    }

    /// Metric names submitted for a resource.
    pub fn metric_names(&self, resource_id: &str) -> Vec<String> {
        self.payload
            .get(resource_id)
            .map(|metrics| metrics.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Builds [`Batch`]es with the configured naming rules.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    slash_replacement: String,
    metric_delim: String,
}

impl BatchBuilder {
    pub fn new(slash_replacement: impl Into<String>, metric_delim: impl Into<String>) -> Self {
        Self {
            slash_replacement: slash_replacement.into(),
            metric_delim: metric_delim.into(),
        }
    }

    fn sanitize(&self, name: &str) -> String {
        name.replace('/', &self.slash_replacement)
    }

    pub fn metric_name(&self, service: &str, metric: &str) -> String {
        self.sanitize(&format!("{}{}{}", service, self.metric_delim, metric))
    }

    pub fn identity(&self, record: &ParsedRecord) -> ResourceIdentity {
        ResourceIdentity::new(self.sanitize(&record.host), self.sanitize(&record.service))
    }

    /// Groups records by resource. Measures of the same metric are appended.
    pub fn build(&self, records: &[ParsedRecord]) -> Batch {
        let mut batch = Batch::default();
        for record in records.iter().filter(|r| !r.measures.is_empty()) {
            let identity = self.identity(record);
            let resource_id = identity.resource_id().to_string();
            let metrics = batch.payload.entry(resource_id.clone()).or_default();
            for (metric, measure) in &record.measures {
                metrics
                    .entry(self.metric_name(&record.service, metric))
                    .or_default()
                    .push(measure.clone());
            }
            batch.resources.insert(resource_id, identity);
        }
        batch
    }
}
