//! Cleave: run an application's services together in one process, or
//! cleaved apart across many, without changing a call site.
//!
//! An application declares its services once in a JSON configuration. Each
//! process builds a [`Controller`] over that configuration and a
//! [`RunMode`] naming which services are active locally; every other
//! configured service is remote. The controller's [`Resolver`] then hands
//! out a calling surface per service: the live instance when it is local,
//! a facade speaking the service's bridge when it is not. Both implement
//! [`Service`], so callers cannot tell the difference and the same binary
//! serves every deployment shape.
//!
//! Bridged calls travel as signed frames over per-call TCP connections and
//! pass through a configurable middleware pipeline on both sides.
//!
//! # Example
//!
//! ```rust,ignore
//! use cleave_core::{CallArgs, Controller, RunMode, ServicesConfig};
//!
//! let config = ServicesConfig::load("cleave.config.json")?;
//! let controller = Controller::builder(config)
//!     .mode(RunMode::from_env())
//!     .register_service::<Ledger>(|| Arc::new(Ledger::new()))
//!     .build()?;
//! controller.bootstrap()?;
//!
//! let resolver = controller.resolver();
//! controller
//!     .run(async move {
//!         let ledger = resolver.resolve("demo.Ledger")?;
//!         let balance = ledger.dispatch("balance", &CallArgs::none()).await?;
//!         println!("balance: {balance}");
//!         Ok(())
//!     })
//!     .await
//! ```

pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod middleware;
pub mod payload;
pub mod resolve;
pub mod service;

pub use bridge::tcp::{TcpBridge, TcpBridgeConfig, TcpServerHandle, SECRET_ENV};
pub use bridge::{Bridge, BridgeClient, BridgeRegistry, ServiceHost};
pub use config::{
    BridgeDecl, BridgeTimeouts, MiddlewareDecl, ServiceDescriptor, ServicesConfig, WireLimits,
    ACTIVE_SERVICES_ENV, DEFAULT_CONFIG_FILE,
};
pub use controller::{Controller, ControllerBuilder, Lifecycle, RunMode};
pub use error::{CleaveError, RemoteTrace, Result};
pub use middleware::{
    Handler, Middleware, MiddlewareContext, MiddlewareContexts, MiddlewareRegistry,
    MiddlewareStack, Next,
};
pub use payload::{CallArgs, ErrorDescriptor, MethodCallPayload, ResultPayload};
pub use resolve::{Resolver, ServiceFacade};
pub use service::{NamedService, Service, ServiceRegistry};
