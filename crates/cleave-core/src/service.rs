//! The service contract and the registry mapping locators to factories.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::payload::CallArgs;

/// A unit of application logic that can run in-process or behind a bridge.
///
/// `dispatch` is the one generic invocation primitive: implementations
/// match on the method name and forward to the real method. Typed call
/// surfaces are thin wrappers that build a [`CallArgs`] and delegate here,
/// which is what keeps live instances and remote facades interchangeable.
///
/// An implementation raises [`crate::CleaveError::UnknownMethod`] for names
/// it does not recognize and [`crate::CleaveError::service`] for domain
/// failures it wants callers to be able to match on.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, args: &CallArgs) -> Result<Value>;
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Service")
    }
}

/// Ties a service type to the stable locator used in configuration files
/// and call payloads.
pub trait NamedService: Service {
    const SERVICE_ID: &'static str;
}

/// Builds the process-wide instance of one service type.
pub type ServiceFactory = Arc<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

/// Explicit mapping from service locators to instance factories.
///
/// Every process registers factories for the services it might activate;
/// resolution consults this registry instead of scanning for types.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Register a factory under `S::SERVICE_ID`.
    pub fn register<S: NamedService>(
        &mut self,
        factory: impl Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    ) {
        self.register_by_id(S::SERVICE_ID, factory);
    }

    /// Register a factory under an explicit locator.
    pub fn register_by_id(
        &mut self,
        service_id: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    ) {
        self.factories.insert(service_id.into(), Arc::new(factory));
    }

    /// Factory for a locator, if one was registered.
    pub fn factory(&self, service_id: &str) -> Option<ServiceFactory> {
        self.factories.get(service_id).cloned()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.factories.contains_key(service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CleaveError;
    use serde_json::json;

    struct Adder;

    impl NamedService for Adder {
        const SERVICE_ID: &'static str = "test.Adder";
    }

    #[async_trait]
    impl Service for Adder {
        async fn dispatch(&self, method: &str, args: &CallArgs) -> Result<Value> {
            match method {
                "add" => {
                    let a = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
                    let b = args.arg(1).and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(a + b))
                }
                other => Err(CleaveError::UnknownMethod {
                    service: Self::SERVICE_ID.to_string(),
                    method: other.to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let adder = Adder;
        let value = adder
            .dispatch("add", &CallArgs::positional(vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(value, json!(5));

        let err = adder.dispatch("subtract", &CallArgs::none()).await.unwrap_err();
        assert!(matches!(err, CleaveError::UnknownMethod { method, .. } if method == "subtract"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ServiceRegistry::new();
        registry.register::<Adder>(|| Arc::new(Adder));
        assert!(registry.contains("test.Adder"));
        assert!(!registry.contains("test.Missing"));
        assert!(registry.factory("test.Adder").is_some());
    }

    #[test]
    fn test_registry_by_id_overrides() {
        let mut registry = ServiceRegistry::new();
        registry.register_by_id("test.Adder", || Arc::new(Adder));
        registry.register::<Adder>(|| Arc::new(Adder));
        assert!(registry.contains("test.Adder"));
    }
}
