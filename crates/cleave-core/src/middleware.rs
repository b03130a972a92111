//! Interceptor pipeline wrapped around bridged calls.
//!
//! Middleware is a bridge concern: it runs on the calling side around the
//! transport send, and on the serving side around the method invocation.
//! Co-located calls never pass through it. Each call gets fresh middleware
//! instances, built from the declarations on the service's descriptor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::MiddlewareDecl;
use crate::error::{CleaveError, Result};
use crate::payload::{MethodCallPayload, ResultPayload};

/// Which side of the bridge a pipeline run is wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareContext {
    /// Around the transport send in the calling process.
    Client,
    /// Around the method invocation in the serving process.
    Server,
}

impl MiddlewareContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareContext::Client => "client",
            MiddlewareContext::Server => "server",
        }
    }
}

/// The contexts a middleware instance participates in, declared up front.
///
/// The stack builder consults this instead of probing behavior: an instance
/// that declares only `CLIENT` is dropped from server-side runs entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiddlewareContexts {
    client: bool,
    server: bool,
}

impl MiddlewareContexts {
    pub const CLIENT: Self = MiddlewareContexts {
        client: true,
        server: false,
    };
    pub const SERVER: Self = MiddlewareContexts {
        client: false,
        server: true,
    };
    pub const BOTH: Self = MiddlewareContexts {
        client: true,
        server: true,
    };

    pub fn contains(&self, ctx: MiddlewareContext) -> bool {
        match ctx {
            MiddlewareContext::Client => self.client,
            MiddlewareContext::Server => self.server,
        }
    }
}

/// Innermost stage of a pipeline: the transport send on the calling side,
/// the real method invocation on the serving side.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, payload: MethodCallPayload) -> Result<ResultPayload>;
}

/// One interceptor around a bridged call.
///
/// A stage may transform the payload before passing it on, transform the
/// result on the way back, short-circuit by returning without calling
/// `next`, or raise. Raised errors unwind through the outer stages as
/// errors, not as result payloads.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Contexts this instance participates in.
    fn contexts(&self) -> MiddlewareContexts;

    /// Wrap one call. `next.run(payload)` continues toward the service.
    async fn handle(
        &self,
        ctx: MiddlewareContext,
        payload: MethodCallPayload,
        next: Next,
    ) -> Result<ResultPayload>;
}

/// The remainder of a pipeline: the stages downstream of the current one,
/// ending at the terminal handler.
pub struct Next {
    ctx: MiddlewareContext,
    stages: VecDeque<Box<dyn Middleware>>,
    handler: Box<dyn Handler>,
}

impl Next {
    /// Run the rest of the pipeline on `payload`.
    pub async fn run(mut self, payload: MethodCallPayload) -> Result<ResultPayload> {
        match self.stages.pop_front() {
            Some(stage) => {
                let ctx = self.ctx;
                stage.handle(ctx, payload, self).await
            }
            None => self.handler.call(payload).await,
        }
    }
}

/// Builds one fresh middleware instance from its declared settings.
pub type MiddlewareFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Box<dyn Middleware>> + Send + Sync>;

/// Explicit mapping from middleware locators to factories.
#[derive(Default)]
pub struct MiddlewareRegistry {
    factories: HashMap<String, MiddlewareFactory>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        MiddlewareRegistry::default()
    }

    pub fn register(
        &mut self,
        locator: impl Into<String>,
        factory: impl Fn(&Map<String, Value>) -> Result<Box<dyn Middleware>> + Send + Sync + 'static,
    ) {
        self.factories.insert(locator.into(), Arc::new(factory));
    }

    pub fn factory(&self, locator: &str) -> Result<MiddlewareFactory> {
        self.factories
            .get(locator)
            .cloned()
            .ok_or_else(|| CleaveError::UnknownMiddleware {
                locator: locator.to_string(),
            })
    }
}

/// The ordered middleware constructors for one service's bridge.
///
/// Running a call instantiates every declared stage fresh, keeps the ones
/// that declare the current context, and threads the payload through them
/// outermost first down to the terminal handler.
pub struct MiddlewareStack {
    specs: Vec<(MiddlewareFactory, Map<String, Value>)>,
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("stages", &self.specs.len())
            .finish()
    }
}

impl MiddlewareStack {
    /// A stack with no stages; calls go straight to the handler.
    pub fn empty() -> Self {
        MiddlewareStack { specs: Vec::new() }
    }

    /// Resolve declarations against the registry, keeping declaration order.
    pub fn from_decls(registry: &MiddlewareRegistry, decls: &[MiddlewareDecl]) -> Result<Self> {
        let mut specs = Vec::with_capacity(decls.len());
        for decl in decls {
            let factory = registry.factory(decl.kind())?;
            specs.push((factory, decl.settings()));
        }
        Ok(MiddlewareStack { specs })
    }

    /// Run one call through the pipeline for the given context.
    pub async fn run(
        &self,
        ctx: MiddlewareContext,
        payload: MethodCallPayload,
        handler: Box<dyn Handler>,
    ) -> Result<ResultPayload> {
        let mut stages = VecDeque::with_capacity(self.specs.len());
        for (factory, settings) in &self.specs {
            let stage = factory(settings)?;
            if stage.contexts().contains(ctx) {
                stages.push_back(stage);
            }
        }
        Next {
            ctx,
            stages,
            handler,
        }
        .run(payload)
        .await
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
