use serde::Serialize;
use uuid::Uuid;

/// Namespace of the UUID-v5 resource ids. Changing it re-keys every resource in the store.
const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6c2f_0b7e_91d4_4a55_9a3e_2f1c_8e40_d7b3);

/// `(host, service)` pair identifying one monitored entity in the metric store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceIdentity {
    pub host: String,
    pub service: String,
}

impl ResourceIdentity {
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
        }
    }

    /// Stable store id for this identity, valid whatever characters host/service contain.
    pub fn resource_id(&self) -> Uuid {
        let mut key = Vec::with_capacity(self.host.len() + self.service.len() + 1);
        key.extend_from_slice(self.host.as_bytes());
        key.push(0);
        key.extend_from_slice(self.service.as_bytes());
        Uuid::new_v5(&IDENTITY_NAMESPACE, &key)
    }
}
