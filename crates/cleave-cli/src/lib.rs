//! Embeddable runner turning a configured application into a `cleave`
//! command line: `run service <name>...` hosts the named services in this
//! process, `run [<entry-point>]` starts the application itself.
//!
//! Service, bridge, and middleware factories are compiled into the
//! application, so the runner is a builder the application embeds in its
//! own `main`:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     cleave_cli::CliApp::new()
//!         .register_service::<Calculator>(|| Arc::new(Calculator::default()))
//!         .entry("main_app", |controller| async move {
//!             let calc = controller.resolver().resolve_service::<Calculator>()?;
//!             let sum = calc.dispatch("add", &CallArgs::positional(vec![1.into(), 2.into()])).await?;
//!             println!("{sum}");
//!             Ok(())
//!         })
//!         .run()
//!         .await
//! }
//! ```

mod args;

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use futures::future::BoxFuture;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cleave_core::{
    Bridge, BridgeRegistry, CleaveError, Controller, Middleware, MiddlewareRegistry, NamedService,
    Result, RunMode, Service, ServiceRegistry, ServicesConfig, DEFAULT_CONFIG_FILE,
};

use crate::args::{resolve_target, Cli, Command, LaunchPlan, PlanTarget, USAGE};

type EntryFn = Box<dyn FnOnce(Controller) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Builder for the command line surface of one application.
pub struct CliApp {
    config_path: Option<PathBuf>,
    services: ServiceRegistry,
    bridges: BridgeRegistry,
    middleware: MiddlewareRegistry,
    entries: HashMap<String, EntryFn>,
}

impl Default for CliApp {
    fn default() -> Self {
        CliApp::new()
    }
}

impl CliApp {
    pub fn new() -> Self {
        CliApp {
            config_path: None,
            services: ServiceRegistry::new(),
            bridges: BridgeRegistry::new(),
            middleware: MiddlewareRegistry::new(),
            entries: HashMap::new(),
        }
    }

    /// Configuration file used when `--config` is absent.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
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

    pub fn register_bridge(mut self, locator: impl Into<String>, bridge: Arc<dyn Bridge>) -> Self {
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

    /// Register a named application entry callback.
    ///
    /// The callback receives the bootstrapped controller and runs as the
    /// application task alongside any launched services.
    pub fn entry<F, Fut>(mut self, name: impl Into<String>, entry: F) -> Self
    where
        F: FnOnce(Controller) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries
            .insert(name.into(), Box::new(move |controller| Box::pin(entry(controller))));
        self
    }

    /// Parse `std::env::args_os` and run to completion.
    pub async fn run(self) -> ExitCode {
        ExitCode::from(self.run_from(std::env::args_os()).await)
    }

    /// Run with explicit arguments; returns the process exit code.
    pub async fn run_from<I, T>(self, args: I) -> u8
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => {
                let _ = err.print();
                return if err.use_stderr() { 2 } else { 0 };
            }
        };
        init_tracing(cli.debug);
        self.execute(cli).await
    }

    async fn execute(self, cli: Cli) -> u8 {
        let CliApp {
            config_path,
            services,
            bridges,
            middleware,
            mut entries,
        } = self;

        let path = cli
            .config
            .or(config_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config = match ServicesConfig::load(&path) {
            Ok(config) => config,
            Err(err) => return fatal(&err),
        };

        let Command::Run { target } = cli.command;
        let LaunchPlan { mode, target } = match resolve_target(target, &config, RunMode::from_env())
        {
            Ok(plan) => plan,
            Err(err) => return fatal(&err),
        };

        let built = Controller::builder(config)
            .mode(mode)
            .services(services)
            .bridges(bridges)
            .middleware(middleware)
            .build();
        let controller = match built {
            Ok(controller) => controller,
            Err(err) => return fatal(&err),
        };
        if let Err(err) = controller.bootstrap() {
            return fatal(&err);
        }

        match target {
            PlanTarget::Services => {
                let names: Vec<&str> = controller
                    .active_services()
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect();
                info!(services = ?names, "serving");
                tokio::select! {
                    result = controller.launch() => finish(result),
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown signal received, exiting");
                        0
                    }
                }
            }
            PlanTarget::Entry(name) => {
                let Some(entry) = entries.remove(&name) else {
                    let mut known: Vec<&str> = entries.keys().map(String::as_str).collect();
                    known.sort_unstable();
                    return fatal(&CleaveError::config(format!(
                        "unknown entry point {name:?} (registered: {})",
                        known.join(", ")
                    )));
                };
                info!(entry = %name, "starting application");
                let app = entry(controller.clone());
                let task = async move {
                    app.await.map_err(|err| CleaveError::Launch {
                        task: name,
                        message: format!("{err:#}"),
                    })
                };
                tokio::select! {
                    result = controller.run(task) => finish(result),
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown signal received, exiting");
                        0
                    }
                }
            }
        }
    }
}

fn fatal(err: &CleaveError) -> u8 {
    eprintln!("{err}");
    if err.is_config() {
        eprintln!("{USAGE}");
        2
    } else {
        1
    }
}

fn finish(result: Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // try_init so embedding tests can call the runner repeatedly.
    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
