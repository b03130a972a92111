//! The built-in TCP bridge: one connection per call, signed frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::wire::{read_frame, write_frame};
use super::{Bridge, BridgeClient, ServiceHost};
use crate::config::{BridgeTimeouts, ServiceDescriptor};
use crate::controller::Controller;
use crate::error::{CleaveError, Result};
use crate::middleware::MiddlewareStack;
use crate::payload::{MethodCallPayload, ResultPayload};

/// Environment variable holding the shared frame-signing secret.
pub const SECRET_ENV: &str = "CLEAVE_BRIDGE_SECRET";

/// Connection parameters for one service's TCP bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpBridgeConfig {
    /// Address the serving side binds. Port 0 binds an ephemeral port.
    pub serve_on: String,
    /// Address clients dial. Defaults to `serve_on`.
    pub client: String,
}

impl TcpBridgeConfig {
    /// Build from raw descriptor settings: either a bare `"host:port"`
    /// string or a `{ "serve_on": ..., "client": ... }` table.
    pub fn from_raw(raw: &Value) -> Result<Self> {
        match raw {
            Value::String(addr) => Ok(TcpBridgeConfig {
                serve_on: addr.clone(),
                client: addr.clone(),
            }),
            Value::Object(table) => {
                let serve_on = table
                    .get("serve_on")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        CleaveError::config("tcp bridge settings require a serve_on address")
                    })?;
                let client = table
                    .get("client")
                    .and_then(Value::as_str)
                    .unwrap_or(serve_on);
                Ok(TcpBridgeConfig {
                    serve_on: serve_on.to_string(),
                    client: client.to_string(),
                })
            }
            _ => Err(CleaveError::config(
                "tcp bridge settings must be an address string or a settings table",
            )),
        }
    }
}

/// Factory for the TCP transport.
pub struct TcpBridge {
    secret: Vec<u8>,
}

impl TcpBridge {
    /// Bridge signing frames with an explicit secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        TcpBridge {
            secret: secret.into(),
        }
    }

    /// Bridge with the secret from `CLEAVE_BRIDGE_SECRET`, empty if unset.
    /// Every process of an application must agree on this value.
    pub fn from_env() -> Self {
        TcpBridge::new(std::env::var(SECRET_ENV).unwrap_or_default().into_bytes())
    }
}

impl Bridge for TcpBridge {
    fn create_client(&self, descriptor: &ServiceDescriptor) -> Result<Arc<dyn BridgeClient>> {
        let config = TcpBridgeConfig::from_raw(&descriptor.bridge_settings())?;
        Ok(Arc::new(TcpBridgeClient {
            addr: config.client,
            secret: self.secret.clone(),
        }))
    }

    fn create_server(&self, descriptor: &ServiceDescriptor, controller: &Controller) -> Result<()> {
        let config = TcpBridgeConfig::from_raw(&descriptor.bridge_settings())?;
        let stack =
            MiddlewareStack::from_decls(controller.middleware_registry(), descriptor.middleware())?;
        let host = ServiceHost::new(descriptor.service.clone(), controller.clone(), stack);
        let server = TcpBridgeServer::new(config.serve_on, self.secret.clone(), host);
        controller.create_entry_point(
            &format!("{}_server", descriptor.name),
            Arc::new(server.handle()),
        )?;
        controller.add_launch_task(format!("{} bridge server", descriptor.name), server.serve())?;
        Ok(())
    }
}

/// One-connection-per-call client.
struct TcpBridgeClient {
    addr: String,
    secret: Vec<u8>,
}

#[async_trait]
impl BridgeClient for TcpBridgeClient {
    async fn call(&self, payload: MethodCallPayload) -> Result<ResultPayload> {
        let request = serde_json::to_vec(&payload)?;
        tokio::time::timeout(BridgeTimeouts::CALL, self.exchange(&request))
            .await
            .map_err(|_| CleaveError::Timeout {
                what: "completing a bridged call",
                after: BridgeTimeouts::CALL,
            })?
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let probe = async {
            loop {
                if TcpStream::connect(&self.addr).await.is_ok() {
                    return;
                }
                tokio::time::sleep(BridgeTimeouts::READY_POLL).await;
            }
        };
        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| CleaveError::ReadyTimeout {
                addr: self.addr.clone(),
                after: timeout,
            })
    }
}

impl TcpBridgeClient {
    async fn exchange(&self, request: &[u8]) -> Result<ResultPayload> {
        let mut stream = tokio::time::timeout(BridgeTimeouts::CONNECT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| CleaveError::Timeout {
                what: "connecting to the bridge server",
                after: BridgeTimeouts::CONNECT,
            })?
            .map_err(|e| CleaveError::Connect {
                addr: self.addr.clone(),
                source: e,
            })?;

        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, request, &self.secret).await?;
        let response = read_frame(&mut reader, &self.secret)
            .await?
            .ok_or_else(|| CleaveError::Io {
                message: "connection closed before a response arrived".to_string(),
                source: None,
            })?;
        serde_json::from_slice(&response)
            .map_err(|e| CleaveError::frame(format!("undecodable response payload: {e}")))
    }
}

/// Accept loop serving one bridged service.
///
/// Connection handlers are spawned into a set owned by the loop, so a
/// process tearing the server down takes its in-flight calls with it and
/// their peers see a transport failure rather than silence.
pub struct TcpBridgeServer {
    serve_on: String,
    secret: Vec<u8>,
    host: Arc<ServiceHost>,
    addr_tx: watch::Sender<Option<SocketAddr>>,
    addr_rx: watch::Receiver<Option<SocketAddr>>,
}

/// Handle onto a running [`TcpBridgeServer`], exposing its bound address.
/// Registered as the `<name>_server` entry point on the controller.
#[derive(Debug, Clone)]
pub struct TcpServerHandle {
    addr_rx: watch::Receiver<Option<SocketAddr>>,
}

impl TcpServerHandle {
    /// Wait for the server to bind and return the actual listen address.
    /// Resolves port-zero binds to the port the OS picked.
    pub async fn bound_addr(&self) -> Result<SocketAddr> {
        let mut rx = self.addr_rx.clone();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return Ok(addr);
            }
            rx.changed().await.map_err(|_| CleaveError::Io {
                message: "bridge server exited before binding".to_string(),
                source: None,
            })?;
        }
    }

    /// The bound address if the server has already bound.
    pub fn try_bound_addr(&self) -> Option<SocketAddr> {
        *self.addr_rx.borrow()
    }
}

impl TcpBridgeServer {
    pub fn new(serve_on: impl Into<String>, secret: Vec<u8>, host: ServiceHost) -> Self {
        let (addr_tx, addr_rx) = watch::channel(None);
        TcpBridgeServer {
            serve_on: serve_on.into(),
            secret,
            host: Arc::new(host),
            addr_tx,
            addr_rx,
        }
    }

    pub fn handle(&self) -> TcpServerHandle {
        TcpServerHandle {
            addr_rx: self.addr_rx.clone(),
        }
    }

    /// Bind and serve until the surrounding task is cancelled.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.serve_on).await.map_err(|e| {
            CleaveError::config(format!("cannot bind {}: {e}", self.serve_on))
        })?;
        let addr = listener.local_addr()?;
        let _ = self.addr_tx.send(Some(addr));
        info!(service = %self.host.service_id(), %addr, "bridge server listening");

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "bridge connection accepted");
                            let secret = self.secret.clone();
                            let host = self.host.clone();
                            handlers.spawn(async move {
                                if let Err(err) = handle_connection(stream, &secret, &host).await {
                                    warn!(%peer, error = %err, "bridge connection failed");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                finished = handlers.join_next(), if !handlers.is_empty() => {
                    if let Some(Err(err)) = finished {
                        if err.is_panic() {
                            warn!(error = %err, "connection handler panicked");
                        }
                    }
                }
            }
        }
    }
}

/// One request, one response, then the connection is done.
///
/// Frames that fail verification or decoding error out here; the caller
/// logs and drops the connection without a response, and the accept loop
/// carries on.
async fn handle_connection(
    mut stream: TcpStream,
    secret: &[u8],
    host: &ServiceHost,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let frame = match read_frame(&mut reader, secret).await? {
        Some(frame) => frame,
        // Readiness probes connect and leave without sending a frame.
        None => return Ok(()),
    };
    let payload: MethodCallPayload = serde_json::from_slice(&frame)
        .map_err(|e| CleaveError::frame(format!("undecodable call payload: {e}")))?;
    debug!(service = %payload.service, method = %payload.method, "bridge call received");

    let response = host.handle(payload).await;
    let bytes = serde_json::to_vec(&response)?;
    write_frame(&mut writer, &bytes, secret).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicesConfig;
    use crate::controller::RunMode;
    use crate::error::Result;
    use crate::payload::CallArgs;
    use crate::service::Service;
    use serde_json::json;
    use std::time::Instant;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn dispatch(&self, method: &str, args: &CallArgs) -> Result<Value> {
            match method {
                "echo" => Ok(args.arg(0).cloned().unwrap_or(Value::Null)),
                other => Err(CleaveError::UnknownMethod {
                    service: "t.Echo".to_string(),
                    method: other.to_string(),
                }),
            }
        }
    }

    fn test_controller() -> Controller {
        let config = ServicesConfig::parse(
            r#"{ "services": [ { "name": "echoer", "service": "t.Echo", "bridge": "tcp:127.0.0.1:0" } ] }"#,
        )
        .unwrap();
        Controller::builder(config)
            .mode(RunMode::Monolithic)
            .register_service_id("t.Echo", || Arc::new(Echo))
            .build()
            .unwrap()
    }

    fn spawn_server(secret: &[u8]) -> (TcpServerHandle, tokio::task::JoinHandle<Result<()>>) {
        let host = ServiceHost::new("t.Echo", test_controller(), MiddlewareStack::empty());
        let server = TcpBridgeServer::new("127.0.0.1:0", secret.to_vec(), host);
        let handle = server.handle();
        let task = tokio::spawn(server.serve());
        (handle, task)
    }

    fn echo_call() -> MethodCallPayload {
        MethodCallPayload::new("t.Echo", "echo", CallArgs::positional(vec![json!("ping")]))
    }

    #[test]
    fn test_config_from_bare_address() {
        let config = TcpBridgeConfig::from_raw(&json!("127.0.0.1:4040")).unwrap();
        assert_eq!(config.serve_on, "127.0.0.1:4040");
        assert_eq!(config.client, "127.0.0.1:4040");
    }

    #[test]
    fn test_config_from_table() {
        let config =
            TcpBridgeConfig::from_raw(&json!({ "serve_on": "0.0.0.0:4040", "client": "svc:4040" }))
                .unwrap();
        assert_eq!(config.serve_on, "0.0.0.0:4040");
        assert_eq!(config.client, "svc:4040");

        let config = TcpBridgeConfig::from_raw(&json!({ "serve_on": "0.0.0.0:4040" })).unwrap();
        assert_eq!(config.client, "0.0.0.0:4040");
    }

    #[test]
    fn test_config_rejects_other_shapes() {
        assert!(TcpBridgeConfig::from_raw(&Value::Null).unwrap_err().is_config());
        assert!(TcpBridgeConfig::from_raw(&json!(42)).unwrap_err().is_config());
        assert!(TcpBridgeConfig::from_raw(&json!({ "client": "x:1" }))
            .unwrap_err()
            .is_config());
    }

    #[tokio::test]
    async fn test_call_round_trip_over_a_socket() {
        let (handle, task) = spawn_server(b"s3cret");
        let addr = handle.bound_addr().await.unwrap();
        let client = TcpBridgeClient {
            addr: addr.to_string(),
            secret: b"s3cret".to_vec(),
        };

        let result = client.call(echo_call()).await.unwrap();
        assert_eq!(result, ResultPayload::Ok(json!("ping")));
        task.abort();
    }

    #[tokio::test]
    async fn test_bad_secret_gets_no_response_and_server_survives() {
        let (handle, task) = spawn_server(b"right");
        let addr = handle.bound_addr().await.unwrap();

        let bad = TcpBridgeClient {
            addr: addr.to_string(),
            secret: b"wrong".to_vec(),
        };
        let err = bad.call(echo_call()).await.unwrap_err();
        assert!(err.is_transport(), "got {err}");

        let good = TcpBridgeClient {
            addr: addr.to_string(),
            secret: b"right".to_vec(),
        };
        let result = good.call(echo_call()).await.unwrap();
        assert_eq!(result, ResultPayload::Ok(json!("ping")));
        task.abort();
    }

    #[tokio::test]
    async fn test_wait_ready_tolerates_probe_connections() {
        let (handle, task) = spawn_server(b"s");
        let addr = handle.bound_addr().await.unwrap();
        let client = TcpBridgeClient {
            addr: addr.to_string(),
            secret: b"s".to_vec(),
        };

        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        // The probe connection must not have wedged the server.
        let result = client.call(echo_call()).await.unwrap();
        assert_eq!(result, ResultPayload::Ok(json!("ping")));
        task.abort();
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_against_a_dead_address() {
        let client = TcpBridgeClient {
            addr: "127.0.0.1:1".to_string(),
            secret: Vec::new(),
        };
        let started = Instant::now();
        let err = client.wait_ready(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, CleaveError::ReadyTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_refused_is_a_connect_error() {
        let client = TcpBridgeClient {
            addr: "127.0.0.1:1".to_string(),
            secret: Vec::new(),
        };
        let err = client.call(echo_call()).await.unwrap_err();
        assert!(matches!(err, CleaveError::Connect { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_handle_reports_server_that_never_bound() {
        let host = ServiceHost::new("t.Echo", test_controller(), MiddlewareStack::empty());
        let server = TcpBridgeServer::new("definitely not an address", Vec::new(), host);
        let handle = server.handle();
        let task = tokio::spawn(server.serve());

        let err = handle.bound_addr().await.unwrap_err();
        assert!(err.is_transport());
        let serve_result = task.await.unwrap();
        assert!(serve_result.unwrap_err().is_config());
    }
}
