use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use super::endpoint::{Endpoint, EndpointId, EndpointSpec};
use crate::error::ResilienceError;

/// Capability name to endpoints, kept in registration order
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    capabilities: RwLock<HashMap<String, Vec<Arc<Endpoint>>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under a capability.
    ///
    /// Re-registering an id under the same capability replaces the entry in place
    /// and resets its health. Endpoint ids are unique across capabilities.
    pub fn register(
        &self,
        capability: &str,
        spec: EndpointSpec,
        weight: u32,
    ) -> Result<Arc<Endpoint>, ResilienceError> {
        self.insert(Arc::new(Endpoint::new(capability, spec, weight)))
    }

    /// Fail with `DuplicateEndpoint` if `endpoint_id` belongs to another capability
    pub fn ensure_available(&self, capability: &str, endpoint_id: &str) -> Result<(), ResilienceError> {
        let capabilities = self
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        check_unique(&capabilities, capability, endpoint_id)
    }

    /// Publish an already built endpoint under its capability
    pub fn insert(&self, endpoint: Arc<Endpoint>) -> Result<Arc<Endpoint>, ResilienceError> {
        let mut capabilities = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        check_unique(&capabilities, endpoint.capability(), endpoint.id())?;

        let endpoints = capabilities.entry(endpoint.capability().to_string()).or_default();
        match endpoints.iter_mut().find(|e| e.id() == endpoint.id()) {
            Some(existing) => *existing = Arc::clone(&endpoint),
            None => endpoints.push(Arc::clone(&endpoint)),
        }

        info!(
            capability = %endpoint.capability(),
            endpoint_id = %endpoint.id(),
            address = %endpoint.address(),
            weight = endpoint.weight(),
            "Registered endpoint"
        );

        Ok(endpoint)
    }

    /// Remove an endpoint. Callers holding its `Arc` keep a valid handle.
    pub fn deregister(&self, capability: &str, endpoint_id: &str) -> Option<Arc<Endpoint>> {
        let mut capabilities = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let endpoints = capabilities.get_mut(capability)?;
        let index = endpoints.iter().position(|e| e.id() == endpoint_id)?;
        let removed = endpoints.remove(index);
        if endpoints.is_empty() {
            capabilities.remove(capability);
        }

        info!(capability = %capability, endpoint_id = %endpoint_id, "Deregistered endpoint");
        Some(removed)
    }

    /// Endpoints for a capability in registration order
    pub fn endpoints(&self, capability: &str) -> Vec<Arc<Endpoint>> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find(&self, endpoint_id: &str) -> Option<Arc<Endpoint>> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .find(|e| e.id() == endpoint_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        let capabilities = self
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = capabilities.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| capabilities[name].iter().cloned())
            .collect()
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.all().iter().map(|e| e.id().to_string()).collect()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_unique(
    capabilities: &HashMap<String, Vec<Arc<Endpoint>>>,
    capability: &str,
    endpoint_id: &str,
) -> Result<(), ResilienceError> {
    match capabilities
        .iter()
        .find(|(name, eps)| name.as_str() != capability && eps.iter().any(|e| e.id() == endpoint_id))
    {
        Some((other, _)) => Err(ResilienceError::DuplicateEndpoint {
            endpoint: endpoint_id.to_string(),
            capability: other.clone(),
        }),
        None => Ok(()),
    }
}
