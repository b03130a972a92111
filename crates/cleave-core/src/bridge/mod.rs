//! Bridges: paired client and server factories for one transport.
//!
//! A bridge owns everything between a facade's `dispatch` and the real
//! method invocation in another process. Clients deliver one call payload
//! and return one result payload; servers accept calls for exactly one
//! service and never let a call failure escape to the transport.

pub mod tcp;
pub mod wire;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::ServiceDescriptor;
use crate::controller::Controller;
use crate::error::{CleaveError, Result};
use crate::middleware::{Handler, MiddlewareContext, MiddlewareStack};
use crate::payload::{ErrorDescriptor, MethodCallPayload, ResultPayload};

/// Client half of a bridge: delivers one call and returns the response.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Deliver `payload` to the serving process and return its result.
    ///
    /// Failures of the transport itself are raised; failures of the call
    /// come back inside the [`ResultPayload`].
    async fn call(&self, payload: MethodCallPayload) -> Result<ResultPayload>;

    /// Block until the serving side accepts connections, up to `timeout`.
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;
}

/// Factory for one transport's client and server halves.
pub trait Bridge: Send + Sync {
    /// Build a client for the service described by `descriptor`.
    fn create_client(&self, descriptor: &ServiceDescriptor) -> Result<Arc<dyn BridgeClient>>;

    /// Prepare the serving side for `descriptor`: queue its accept loop on
    /// the controller as a launch task and expose any handle external
    /// callers need as an entry point.
    fn create_server(&self, descriptor: &ServiceDescriptor, controller: &Controller) -> Result<()>;
}

impl fmt::Debug for dyn Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Bridge")
    }
}

/// Explicit mapping from bridge locators to transport factories.
///
/// `Default` registers the built-in `tcp` transport with its secret from
/// the environment.
pub struct BridgeRegistry {
    bridges: HashMap<String, Arc<dyn Bridge>>,
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        let mut registry = BridgeRegistry {
            bridges: HashMap::new(),
        };
        registry.register("tcp", Arc::new(tcp::TcpBridge::from_env()));
        registry
    }
}

impl BridgeRegistry {
    pub fn new() -> Self {
        BridgeRegistry::default()
    }

    /// Registry without the built-in transports.
    pub fn empty() -> Self {
        BridgeRegistry {
            bridges: HashMap::new(),
        }
    }

    pub fn register(&mut self, locator: impl Into<String>, bridge: Arc<dyn Bridge>) {
        self.bridges.insert(locator.into(), bridge);
    }

    pub fn get(&self, locator: &str) -> Result<Arc<dyn Bridge>> {
        self.bridges
            .get(locator)
            .cloned()
            .ok_or_else(|| CleaveError::UnknownBridge {
                locator: locator.to_string(),
            })
    }
}

/// Serving-side endpoint for one service.
///
/// Runs each incoming call through the server middleware pipeline down to
/// the live instance. Every failure of the call itself is captured into an
/// error payload here, so server middleware observes error results and the
/// transport only ever carries well-formed responses.
pub struct ServiceHost {
    service_id: String,
    controller: Controller,
    stack: MiddlewareStack,
}

impl ServiceHost {
    pub fn new(service_id: impl Into<String>, controller: Controller, stack: MiddlewareStack) -> Self {
        ServiceHost {
            service_id: service_id.into(),
            controller,
            stack,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Run one call to completion.
    pub async fn handle(&self, payload: MethodCallPayload) -> ResultPayload {
        let service = payload.service.clone();
        let method = payload.method.clone();
        let invoke = Invoke {
            service_id: self.service_id.clone(),
            controller: self.controller.clone(),
        };
        match self
            .stack
            .run(MiddlewareContext::Server, payload, Box::new(invoke))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(%service, %method, error = %err, "call failed in server pipeline");
                ResultPayload::Err(ErrorDescriptor::capture(&service, &method, &err))
            }
        }
    }
}

/// Terminal server stage: identity check, then singleton dispatch.
/// Dispatch failures become error payloads so middleware sees them as
/// results rather than as unwinding errors.
struct Invoke {
    service_id: String,
    controller: Controller,
}

#[async_trait]
impl Handler for Invoke {
    async fn call(&self, payload: MethodCallPayload) -> Result<ResultPayload> {
        match self.dispatch(&payload).await {
            Ok(value) => Ok(ResultPayload::Ok(value)),
            Err(err) => Ok(ResultPayload::Err(ErrorDescriptor::capture(
                &payload.service,
                &payload.method,
                &err,
            ))),
        }
    }
}

impl Invoke {
    async fn dispatch(&self, payload: &MethodCallPayload) -> Result<serde_json::Value> {
        if payload.service != self.service_id {
            return Err(CleaveError::ServiceMismatch {
                expected: self.service_id.clone(),
                received: payload.service.clone(),
            });
        }
        let instance = self.controller.instance(&self.service_id)?;
        instance.dispatch(&payload.method, &payload.call).await
    }
}
