//! Service resolution: one lookup that yields either the live local
//! instance or a bridge-backed facade, behind the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::bridge::BridgeClient;
use crate::config::{BridgeTimeouts, ServiceDescriptor};
use crate::controller::Controller;
use crate::error::Result;
use crate::middleware::{Handler, MiddlewareContext, MiddlewareStack};
use crate::payload::{CallArgs, MethodCallPayload, ResultPayload};
use crate::service::{NamedService, Service};

/// Resolves service locators against a controller's partition.
///
/// Callers hold whatever `resolve` hands back and use it identically in
/// both cases; whether a given service is co-located is purely a matter of
/// process configuration.
#[derive(Clone)]
pub struct Resolver {
    controller: Controller,
}

impl Resolver {
    pub(crate) fn new(controller: Controller) -> Self {
        Resolver { controller }
    }

    /// Resolve a service locator to its calling surface.
    ///
    /// Active services resolve to the process singleton, created on first
    /// use. Remote services resolve to a fresh facade over their
    /// configured bridge; no connection is made until the first call.
    pub fn resolve(&self, service_id: &str) -> Result<Arc<dyn Service>> {
        let descriptor = self.controller.descriptor_for(service_id)?;
        if self.controller.is_active(&descriptor.name) {
            debug!(service = service_id, "resolved to local instance");
            self.controller.instance(service_id)
        } else {
            debug!(service = service_id, "resolved to remote facade");
            let facade = ServiceFacade::for_descriptor(&self.controller, descriptor)?;
            Ok(Arc::new(facade))
        }
    }

    /// `resolve` by the service type's declared locator.
    pub fn resolve_service<S: NamedService>(&self) -> Result<Arc<dyn Service>> {
        self.resolve(S::SERVICE_ID)
    }

    /// Wait until a service is callable, up to `timeout` (default
    /// [`BridgeTimeouts::READY`]). Active services are callable already;
    /// for remote ones this polls the bridge until it accepts connections.
    pub async fn wait_ready(&self, service_id: &str, timeout: Option<Duration>) -> Result<()> {
        let descriptor = self.controller.descriptor_for(service_id)?;
        if self.controller.is_active(&descriptor.name) {
            return Ok(());
        }
        let bridge = self.controller.bridge_registry().get(descriptor.bridge_kind())?;
        let client = bridge.create_client(descriptor)?;
        client
            .wait_ready(timeout.unwrap_or(BridgeTimeouts::READY))
            .await
    }
}

/// Local stand-in for a remote service.
///
/// `dispatch` builds a call payload, runs it through the client middleware
/// pipeline down to the bridge send, and unwraps the result payload. A
/// remote failure comes back as [`crate::CleaveError::Remote`] with the
/// serving side's trace attached.
pub struct ServiceFacade {
    service_id: String,
    client: Arc<dyn BridgeClient>,
    stack: MiddlewareStack,
}

impl ServiceFacade {
    pub(crate) fn for_descriptor(
        controller: &Controller,
        descriptor: &ServiceDescriptor,
    ) -> Result<Self> {
        let bridge = controller.bridge_registry().get(descriptor.bridge_kind())?;
        let client = bridge.create_client(descriptor)?;
        let stack =
            MiddlewareStack::from_decls(controller.middleware_registry(), descriptor.middleware())?;
        Ok(ServiceFacade {
            service_id: descriptor.service.clone(),
            client,
            stack,
        })
    }
}

#[async_trait]
impl Service for ServiceFacade {
    async fn dispatch(&self, method: &str, args: &CallArgs) -> Result<Value> {
        let payload = MethodCallPayload::new(self.service_id.clone(), method, args.clone());
        let send = SendStage {
            client: self.client.clone(),
        };
        let result = self
            .stack
            .run(MiddlewareContext::Client, payload, Box::new(send))
            .await?;
        result.into_result()
    }
}

/// Innermost client stage: the transport send.
struct SendStage {
    client: Arc<dyn BridgeClient>,
}

#[async_trait]
impl Handler for SendStage {
    async fn call(&self, payload: MethodCallPayload) -> Result<ResultPayload> {
        self.client.call(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, ServiceHost};
    use crate::config::ServicesConfig;
    use crate::controller::RunMode;
    use crate::error::CleaveError;
    use serde_json::json;

    struct Calculator;

    impl NamedService for Calculator {
        const SERVICE_ID: &'static str = "t.Calculator";
    }

    #[async_trait]
    impl Service for Calculator {
        async fn dispatch(&self, method: &str, args: &CallArgs) -> Result<Value> {
            match method {
                "add" => {
                    let a = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
                    let b = args.arg(1).and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(a + b))
                }
                "fail" => Err(CleaveError::service("InvalidValue", "cannot do that")),
                other => Err(CleaveError::UnknownMethod {
                    service: Self::SERVICE_ID.to_string(),
                    method: other.to_string(),
                }),
            }
        }
    }

    /// In-process bridge: clients hand payloads straight to a service host,
    /// exercising the full client-to-server path without a socket.
    struct LoopbackBridge {
        host: Arc<ServiceHost>,
    }

    impl Bridge for LoopbackBridge {
        fn create_client(&self, _descriptor: &ServiceDescriptor) -> Result<Arc<dyn BridgeClient>> {
            Ok(Arc::new(LoopbackClient {
                host: self.host.clone(),
            }))
        }

        fn create_server(&self, _descriptor: &ServiceDescriptor, _controller: &Controller) -> Result<()> {
            Err(CleaveError::config("loopback bridges have no serving side"))
        }
    }

    struct LoopbackClient {
        host: Arc<ServiceHost>,
    }

    #[async_trait]
    impl BridgeClient for LoopbackClient {
        async fn call(&self, payload: MethodCallPayload) -> Result<ResultPayload> {
            // Through the codec and back, like a real transport would.
            let bytes = serde_json::to_vec(&payload)?;
            let payload: MethodCallPayload = serde_json::from_slice(&bytes)?;
            let response = self.host.handle(payload).await;
            let bytes = serde_json::to_vec(&response)?;
            Ok(serde_json::from_slice(&bytes)?)
        }

        async fn wait_ready(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    const CONFIG: &str = r#"{ "services": [
        { "name": "calc", "service": "t.Calculator", "bridge": "loopback" }
    ] }"#;

    fn serving_controller() -> Controller {
        Controller::builder(ServicesConfig::parse(CONFIG).unwrap())
            .mode(RunMode::Monolithic)
            .register_service::<Calculator>(|| Arc::new(Calculator))
            .build()
            .unwrap()
    }

    /// A controller in which `calc` is remote, reached over loopback into
    /// `serving`'s host.
    fn remote_controller(serving: &Controller) -> Controller {
        let host = Arc::new(ServiceHost::new(
            Calculator::SERVICE_ID,
            serving.clone(),
            MiddlewareStack::empty(),
        ));
        Controller::builder(ServicesConfig::parse(CONFIG).unwrap())
            .mode(RunMode::Distributed { active: vec![] })
            .register_bridge("loopback", Arc::new(LoopbackBridge { host }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_and_remote_results_are_identical() {
        let serving = serving_controller();
        let remote = remote_controller(&serving);

        let local = serving.resolver().resolve("t.Calculator").unwrap();
        let facade = remote.resolver().resolve("t.Calculator").unwrap();

        let args = CallArgs::positional(vec![json!(19), json!(23)]);
        let local_value = local.dispatch("add", &args).await.unwrap();
        let remote_value = facade.dispatch("add", &args).await.unwrap();
        assert_eq!(local_value, remote_value);
        assert_eq!(remote_value, json!(42));
    }

    #[tokio::test]
    async fn test_remote_errors_keep_kind_message_and_trace() {
        let serving = serving_controller();
        let remote = remote_controller(&serving);
        let facade = remote.resolver().resolve("t.Calculator").unwrap();

        let err = facade.dispatch("fail", &CallArgs::none()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidValue");
        assert_eq!(err.message(), "cannot do that");
        assert!(matches!(err, CleaveError::Remote { .. }));

        let source = std::error::Error::source(&err).expect("trace attached");
        let rendered = source.to_string();
        assert!(rendered.contains("error in t.Calculator.fail"));
        assert!(rendered.contains("came from a remote service"));
    }

    #[tokio::test]
    async fn test_active_resolution_returns_the_singleton() {
        let serving = serving_controller();
        let resolver = serving.resolver();
        let first = resolver.resolve("t.Calculator").unwrap();
        let second = resolver.resolve("t.Calculator").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unknown_locator_is_a_config_error() {
        let serving = serving_controller();
        let err = serving.resolver().resolve("t.Missing").unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_wait_ready_is_immediate_for_active_services() {
        let serving = serving_controller();
        serving
            .resolver()
            .wait_ready("t.Calculator", Some(Duration::from_millis(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_typed_wrapper_over_dispatch() {
        /// The typed-surface pattern: a caller-side struct whose methods
        /// build args and delegate to whatever `resolve` returned.
        struct CalculatorClient {
            inner: Arc<dyn Service>,
        }

        impl CalculatorClient {
            async fn add(&self, a: i64, b: i64) -> Result<i64> {
                let value = self
                    .inner
                    .dispatch("add", &CallArgs::positional(vec![json!(a), json!(b)]))
                    .await?;
                Ok(value.as_i64().unwrap_or_default())
            }
        }

        let serving = serving_controller();
        let remote = remote_controller(&serving);
        for controller in [&serving, &remote] {
            let client = CalculatorClient {
                inner: controller.resolver().resolve("t.Calculator").unwrap(),
            };
            assert_eq!(client.add(2, 2).await.unwrap(), 4);
        }
    }
}
