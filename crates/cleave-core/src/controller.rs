//! The controller: explicit per-process runtime context.
//!
//! One controller owns one process's view of the application: the shared
//! configuration, the registries, the active/remote split, the instance
//! cache, and the queue of launch tasks. Components receive controller
//! clones at construction; nothing in the crate reaches for globals.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::bridge::BridgeRegistry;
use crate::config::{is_identifier, ServiceDescriptor, ServicesConfig, ACTIVE_SERVICES_ENV};
use crate::error::{CleaveError, Result};
use crate::middleware::{Middleware, MiddlewareRegistry};
use crate::resolve::Resolver;
use crate::service::{NamedService, Service, ServiceRegistry};

/// Stages a controller moves through, strictly forward.
///
/// The builder is the unconfigured stage; `build` produces a controller in
/// `Configured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Configured,
    Bootstrapped,
    Running,
    Terminated,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Configured => "configured",
            Lifecycle::Bootstrapped => "bootstrapped",
            Lifecycle::Running => "running",
            Lifecycle::Terminated => "terminated",
        }
    }
}

/// How a process decides which configured services are local to it.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Every configured service is active here. Instances are created on
    /// first resolution and no bridge servers are started.
    Monolithic,
    /// Only the selected services are active; every other configured
    /// service is remote. An empty selection is a pure client process.
    Distributed { active: Vec<String> },
}

impl RunMode {
    /// Distributed mode with selectors from `CLEAVE_ACTIVE_SERVICES`.
    pub fn from_env() -> Self {
        let active = std::env::var(ACTIVE_SERVICES_ENV)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        RunMode::Distributed { active }
    }
}

/// The partition a mode induces over the configured service names.
struct Partition {
    active: HashSet<String>,
    remote: HashSet<String>,
}

struct LaunchTask {
    name: String,
    fut: BoxFuture<'static, Result<()>>,
}

struct ControllerInner {
    config: ServicesConfig,
    mode: RunMode,
    services: ServiceRegistry,
    bridges: BridgeRegistry,
    middleware: MiddlewareRegistry,
    lifecycle: Mutex<Lifecycle>,
    partition: OnceLock<Partition>,
    instances: Mutex<HashMap<String, Arc<dyn Service>>>,
    launch_tasks: Mutex<Vec<LaunchTask>>,
    entry_points: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

/// Cheaply clonable handle onto one process's runtime context.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

/// Collects configuration, mode, and registries for a controller.
pub struct ControllerBuilder {
    config: ServicesConfig,
    mode: RunMode,
    services: ServiceRegistry,
    bridges: BridgeRegistry,
    middleware: MiddlewareRegistry,
}

impl ControllerBuilder {
    fn new(config: ServicesConfig) -> Self {
        ControllerBuilder {
            config,
            mode: RunMode::Monolithic,
            services: ServiceRegistry::new(),
            bridges: BridgeRegistry::new(),
            middleware: MiddlewareRegistry::new(),
        }
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the service registry wholesale.
    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// Replace the bridge registry wholesale.
    pub fn bridges(mut self, bridges: BridgeRegistry) -> Self {
        self.bridges = bridges;
        self
    }

    /// Replace the middleware registry wholesale.
    pub fn middleware(mut self, middleware: MiddlewareRegistry) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn register_service<S: NamedService>(
        mut self,
        factory: impl Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    ) -> Self {
        self.services.register::<S>(factory);
        self
    }

    pub fn register_service_id(
        mut self,
        service_id: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    ) -> Self {
        self.services.register_by_id(service_id, factory);
        self
    }

    pub fn register_bridge(
        mut self,
        locator: impl Into<String>,
        bridge: Arc<dyn crate::bridge::Bridge>,
    ) -> Self {
        self.bridges.register(locator, bridge);
        self
    }

    pub fn register_middleware(
        mut self,
        locator: impl Into<String>,
        factory: impl Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Box<dyn Middleware>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.middleware.register(locator, factory);
        self
    }

    /// Validate the configuration and produce a `Configured` controller.
    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;
        Ok(Controller {
            inner: Arc::new(ControllerInner {
                config: self.config,
                mode: self.mode,
                services: self.services,
                bridges: self.bridges,
                middleware: self.middleware,
                lifecycle: Mutex::new(Lifecycle::Configured),
                partition: OnceLock::new(),
                instances: Mutex::new(HashMap::new()),
                launch_tasks: Mutex::new(Vec::new()),
                entry_points: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Controller {
    pub fn builder(config: ServicesConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    pub fn config(&self) -> &ServicesConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.inner.lifecycle.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn advance(&self, from: Lifecycle, to: Lifecycle, operation: &'static str) -> Result<()> {
        let mut state = match self.inner.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != from {
            return Err(CleaveError::Lifecycle {
                operation,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_lifecycle(&self, to: Lifecycle) {
        let mut state = match self.inner.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = to;
    }

    fn partition(&self) -> &Partition {
        self.inner.partition.get_or_init(|| {
            let mut active = HashSet::new();
            let mut remote = HashSet::new();
            match &self.inner.mode {
                RunMode::Monolithic => {
                    active.extend(self.inner.config.names().map(String::from));
                }
                RunMode::Distributed { active: selected } => {
                    for name in self.inner.config.names() {
                        if selected.iter().any(|s| s == name) {
                            active.insert(name.to_string());
                        } else {
                            remote.insert(name.to_string());
                        }
                    }
                }
            }
            Partition { active, remote }
        })
    }

    /// Whether the named service runs in this process.
    pub fn is_active(&self, name: &str) -> bool {
        self.partition().active.contains(name)
    }

    /// Descriptors of the services active in this process.
    pub fn active_services(&self) -> Vec<&ServiceDescriptor> {
        let partition = self.partition();
        self.inner
            .config
            .services
            .iter()
            .filter(|d| partition.active.contains(&d.name))
            .collect()
    }

    /// Descriptors of the configured services that are remote here.
    pub fn remote_services(&self) -> Vec<&ServiceDescriptor> {
        let partition = self.partition();
        self.inner
            .config
            .services
            .iter()
            .filter(|d| partition.remote.contains(&d.name))
            .collect()
    }

    /// Descriptor providing `service_id`, or a configuration error naming it.
    pub fn descriptor_for(&self, service_id: &str) -> Result<&ServiceDescriptor> {
        self.inner
            .config
            .descriptor_for_service(service_id)
            .ok_or_else(|| {
                CleaveError::config(format!("no configured service provides {service_id}"))
            })
    }

    /// A resolver over this controller's partition.
    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.clone())
    }

    pub(crate) fn bridge_registry(&self) -> &BridgeRegistry {
        &self.inner.bridges
    }

    pub(crate) fn middleware_registry(&self) -> &MiddlewareRegistry {
        &self.inner.middleware
    }

    /// The process singleton for an active service, created on first use.
    pub(crate) fn instance(&self, service_id: &str) -> Result<Arc<dyn Service>> {
        let mut instances = self.inner.instances.lock().map_err(|_| {
            CleaveError::internal("instance registry lock poisoned")
        })?;
        if let Some(existing) = instances.get(service_id) {
            return Ok(existing.clone());
        }
        let factory = self.inner.services.factory(service_id).ok_or_else(|| {
            CleaveError::config(format!("no factory registered for service {service_id}"))
        })?;
        let instance = factory();
        instances.insert(service_id.to_string(), instance.clone());
        debug!(service = service_id, "service instance created");
        Ok(instance)
    }

    /// Validate the activation selectors and prepare this process.
    ///
    /// In distributed mode every selector must name a configured service;
    /// each active service is instantiated and its bridge's serving side
    /// queued as a launch task. Monolithic processes prepare nothing up
    /// front, instances appear on first resolution.
    pub fn bootstrap(&self) -> Result<()> {
        if let RunMode::Distributed { active } = &self.inner.mode {
            let known: Vec<&str> = self.inner.config.names().collect();
            for selector in active {
                if !known.contains(&selector.as_str()) {
                    return Err(CleaveError::UnknownActiveService {
                        name: selector.clone(),
                        known: known.join(", "),
                    });
                }
            }
        }
        self.advance(Lifecycle::Configured, Lifecycle::Bootstrapped, "bootstrap")?;

        match &self.inner.mode {
            RunMode::Monolithic => {
                debug!(
                    services = self.inner.config.services.len(),
                    "monolithic process; every service is local"
                );
            }
            RunMode::Distributed { .. } => {
                for descriptor in self.active_services() {
                    self.instance(&descriptor.service)?;
                    let bridge = self.inner.bridges.get(descriptor.bridge_kind())?;
                    bridge.create_server(descriptor, self)?;
                    info!(service = %descriptor.name, "bridge server scheduled");
                }
            }
        }
        Ok(())
    }

    /// Queue a named task to be driven by [`launch`](Self::launch).
    /// Rejected once the controller is running.
    pub fn add_launch_task<F>(&self, name: impl Into<String>, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut queue = self.inner.launch_tasks.lock().map_err(|_| {
            CleaveError::internal("launch queue lock poisoned")
        })?;
        // Checked under the queue lock so a task cannot slip in after the
        // running drain.
        let state = self.lifecycle();
        if matches!(state, Lifecycle::Running | Lifecycle::Terminated) {
            return Err(CleaveError::Lifecycle {
                operation: "queue launch tasks",
                state: state.as_str(),
            });
        }
        queue.push(LaunchTask {
            name: name.into(),
            fut: Box::pin(task),
        });
        Ok(())
    }

    /// Register a named value for external callers to pick up, replacing
    /// any previous registration under the same name.
    pub fn create_entry_point(&self, name: &str, value: Arc<dyn Any + Send + Sync>) -> Result<()> {
        if !is_identifier(name) {
            return Err(CleaveError::config(format!(
                "entry point name must be an identifier without a leading underscore: {name:?}"
            )));
        }
        let mut entries = self.inner.entry_points.lock().map_err(|_| {
            CleaveError::internal("entry point registry lock poisoned")
        })?;
        if entries.insert(name.to_string(), value).is_some() {
            debug!(name, "entry point replaced");
        }
        Ok(())
    }

    /// Look up a registered entry point.
    pub fn entry_point(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        match self.inner.entry_points.lock() {
            Ok(entries) => entries.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    /// Drive every queued launch task to completion.
    ///
    /// Tasks run concurrently in one group. The first failure or panic
    /// aborts the rest; `launch` returns once every task has finished, and
    /// the controller is `Terminated` afterwards either way. The first
    /// failure is the one reported.
    pub async fn launch(&self) -> Result<()> {
        self.advance(Lifecycle::Bootstrapped, Lifecycle::Running, "launch")?;
        let tasks = {
            let mut queue = self.inner.launch_tasks.lock().map_err(|_| {
                CleaveError::internal("launch queue lock poisoned")
            })?;
            std::mem::take(&mut *queue)
        };
        info!(tasks = tasks.len(), "launching");

        let mut group = JoinSet::new();
        for task in tasks {
            let name = task.name;
            let fut = task.fut;
            group.spawn(async move { (name, fut.await) });
        }

        let mut first_failure: Option<CleaveError> = None;
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(task = %name, "launch task finished"),
                Ok((name, Err(err))) => {
                    error!(task = %name, error = %err, "launch task failed; stopping the rest");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                        group.abort_all();
                    }
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(error = %join_err, "launch task panicked; stopping the rest");
                    if first_failure.is_none() {
                        first_failure = Some(CleaveError::Launch {
                            task: "unnamed".to_string(),
                            message: join_err.to_string(),
                        });
                        group.abort_all();
                    }
                }
                // Cancelled by abort_all above.
                Err(_) => {}
            }
        }

        self.set_lifecycle(Lifecycle::Terminated);
        info!("controller terminated");
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queue `app` as the application task, then launch everything.
    pub async fn run<F>(&self, app: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_launch_task("application", app)?;
        self.launch().await
    }
}
