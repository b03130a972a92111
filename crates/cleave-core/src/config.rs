//! Service configuration: the JSON model naming every service, the bridge
//! that carries its calls when remote, and load-time validation.
//!
//! A configuration is shared by every process of one application. Which
//! services a given process activates is decided at startup, not here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CleaveError, Result};

/// Environment variable naming the services a process activates,
/// comma-separated. An alternative to the CLI `run service` target.
pub const ACTIVE_SERVICES_ENV: &str = "CLEAVE_ACTIVE_SERVICES";

/// Configuration file name looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "cleave.config.json";

/// Size ceilings for bridge transports.
pub struct WireLimits;

impl WireLimits {
    /// Largest frame payload a bridge endpoint will write or accept.
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
}

/// Deadlines governing bridge clients.
pub struct BridgeTimeouts;

impl BridgeTimeouts {
    /// Establishing a connection for one call.
    pub const CONNECT: Duration = Duration::from_secs(5);
    /// A complete call round trip, connection included.
    pub const CALL: Duration = Duration::from_secs(30);
    /// Default bound for waiting on a remote server to come up.
    pub const READY: Duration = Duration::from_secs(5);
    /// Interval between readiness probes.
    pub const READY_POLL: Duration = Duration::from_millis(100);
}

/// Whole-application service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Every service the application is made of.
    pub services: Vec<ServiceDescriptor>,
    /// Entry callback started by the CLI when no target is named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

impl ServicesConfig {
    /// Parse and validate a configuration from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CleaveError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CleaveError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Names of every configured service, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|d| d.name.as_str())
    }

    /// Descriptor with the given name.
    pub fn descriptor_named(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|d| d.name == name)
    }

    /// Descriptor providing the given service locator.
    pub fn descriptor_for_service(&self, service_id: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|d| d.service == service_id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        let mut locators = std::collections::HashSet::new();
        for descriptor in &self.services {
            if !is_identifier(&descriptor.name) {
                return Err(CleaveError::config(format!(
                    "service name must be an identifier without a leading underscore: {:?}",
                    descriptor.name
                )));
            }
            if descriptor.service.is_empty() {
                return Err(CleaveError::config(format!(
                    "service {} declares an empty service locator",
                    descriptor.name
                )));
            }
            if descriptor.bridge_kind().is_empty() {
                return Err(CleaveError::config(format!(
                    "service {} declares an empty bridge locator",
                    descriptor.name
                )));
            }
            if !names.insert(descriptor.name.as_str()) {
                return Err(CleaveError::DuplicateService {
                    name: descriptor.name.clone(),
                });
            }
            if !locators.insert(descriptor.service.as_str()) {
                return Err(CleaveError::DuplicateService {
                    name: descriptor.service.clone(),
                });
            }
        }
        Ok(())
    }
}

/// One configured service: who it is, and how to reach it when remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Selector name used to activate the service in a process.
    pub name: String,
    /// Service-type locator: the registry key, and the identity every call
    /// payload carries.
    pub service: String,
    /// Transport declaration for the remote case.
    pub bridge: BridgeDecl,
}

impl ServiceDescriptor {
    /// Locator of the bridge transport.
    pub fn bridge_kind(&self) -> &str {
        self.bridge.kind()
    }

    /// Transport-specific settings, as raw JSON for the bridge factory.
    pub fn bridge_settings(&self) -> Value {
        self.bridge.settings()
    }

    /// Middleware declarations, outermost first.
    pub fn middleware(&self) -> &[MiddlewareDecl] {
        self.bridge.middleware()
    }
}

/// Bridge declaration, in either of its configuration forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeDecl {
    /// Compact form: `"tcp"`, or `"tcp:127.0.0.1:4040"` packing the
    /// transport settings after the first colon.
    Locator(String),
    /// Detailed form: `{ "type": "tcp", "serve_on": ..., "middleware": [...] }`.
    Detailed(BridgeTable),
}

/// The detailed bridge form. Fields other than `type` and `middleware`
/// belong to the transport and are passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTable {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middleware: Vec<MiddlewareDecl>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl BridgeDecl {
    /// The bridge locator to look up in the bridge registry.
    pub fn kind(&self) -> &str {
        match self {
            BridgeDecl::Locator(locator) => locator
                .split_once(':')
                .map_or(locator.as_str(), |(kind, _)| kind),
            BridgeDecl::Detailed(table) => &table.kind,
        }
    }

    /// Raw settings for the transport's config factory.
    ///
    /// The compact form yields the text after the first colon as a string;
    /// the detailed form yields its extra fields as an object. A bare
    /// locator yields null.
    pub fn settings(&self) -> Value {
        match self {
            BridgeDecl::Locator(locator) => locator
                .split_once(':')
                .map_or(Value::Null, |(_, rest)| Value::String(rest.to_string())),
            BridgeDecl::Detailed(table) => Value::Object(table.settings.clone()),
        }
    }

    /// Declared middleware, outermost first. The compact form has none.
    pub fn middleware(&self) -> &[MiddlewareDecl] {
        match self {
            BridgeDecl::Locator(_) => &[],
            BridgeDecl::Detailed(table) => &table.middleware,
        }
    }
}

/// Middleware declaration, in either of its configuration forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiddlewareDecl {
    /// Compact form: just the locator.
    Locator(String),
    /// Detailed form: `{ "type": ..., ...settings }`.
    Detailed(MiddlewareTable),
}

/// The detailed middleware form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareTable {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl MiddlewareDecl {
    /// The middleware locator to look up in the middleware registry.
    pub fn kind(&self) -> &str {
        match self {
            MiddlewareDecl::Locator(locator) => locator,
            MiddlewareDecl::Detailed(table) => &table.kind,
        }
    }

    /// Settings for the middleware factory. The compact form has none.
    pub fn settings(&self) -> Map<String, Value> {
        match self {
            MiddlewareDecl::Locator(_) => Map::new(),
            MiddlewareDecl::Detailed(table) => table.settings.clone(),
        }
    }
}

/// Identifier rule shared by service names and entry point names: ASCII
/// alphabetic first, then alphanumerics or underscores.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => {
            first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "services": [
            { "name": "greeter", "service": "demo.Greeter", "bridge": "tcp:127.0.0.1:4040" },
            {
                "name": "ledger",
                "service": "demo.Ledger",
                "bridge": {
                    "type": "tcp",
                    "serve_on": "0.0.0.0:4041",
                    "client": "ledger.internal:4041",
                    "middleware": [
                        "timing",
                        { "type": "redact", "fields": ["password"] }
                    ]
                }
            }
        ],
        "entry_point": "main_app"
    }"#;

    #[test]
    fn test_parse_both_bridge_forms() {
        let config = ServicesConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.entry_point.as_deref(), Some("main_app"));

        let greeter = config.descriptor_named("greeter").unwrap();
        assert_eq!(greeter.bridge_kind(), "tcp");
        assert_eq!(
            greeter.bridge_settings(),
            Value::String("127.0.0.1:4040".to_string())
        );
        assert!(greeter.middleware().is_empty());

        let ledger = config.descriptor_for_service("demo.Ledger").unwrap();
        assert_eq!(ledger.name, "ledger");
        assert_eq!(ledger.bridge_kind(), "tcp");
        let settings = ledger.bridge_settings();
        assert_eq!(settings["serve_on"], "0.0.0.0:4041");
        assert_eq!(settings["client"], "ledger.internal:4041");
        assert_eq!(ledger.middleware().len(), 2);
        assert_eq!(ledger.middleware()[0].kind(), "timing");
        assert_eq!(ledger.middleware()[1].kind(), "redact");
        assert_eq!(
            ledger.middleware()[1].settings()["fields"],
            serde_json::json!(["password"])
        );
    }

    #[test]
    fn test_bare_locator_has_null_settings() {
        let decl = BridgeDecl::Locator("tcp".to_string());
        assert_eq!(decl.kind(), "tcp");
        assert_eq!(decl.settings(), Value::Null);
    }

    #[test]
    fn test_compact_locator_splits_on_first_colon_only() {
        let decl = BridgeDecl::Locator("tcp:127.0.0.1:4040".to_string());
        assert_eq!(decl.kind(), "tcp");
        assert_eq!(decl.settings(), Value::String("127.0.0.1:4040".to_string()));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"{ "services": [
            { "name": "a", "service": "x.One", "bridge": "tcp" },
            { "name": "a", "service": "x.Two", "bridge": "tcp" }
        ]}"#;
        let err = ServicesConfig::parse(text).unwrap_err();
        assert!(matches!(err, CleaveError::DuplicateService { name } if name == "a"));
    }

    #[test]
    fn test_duplicate_service_locators_rejected() {
        let text = r#"{ "services": [
            { "name": "a", "service": "x.One", "bridge": "tcp" },
            { "name": "b", "service": "x.One", "bridge": "tcp" }
        ]}"#;
        let err = ServicesConfig::parse(text).unwrap_err();
        assert!(matches!(err, CleaveError::DuplicateService { name } if name == "x.One"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        for bad in ["", "9lives", "_hidden", "has-dash", "has space"] {
            let text = format!(
                r#"{{ "services": [ {{ "name": {bad:?}, "service": "x.One", "bridge": "tcp" }} ] }}"#
            );
            let err = ServicesConfig::parse(&text).unwrap_err();
            assert!(err.is_config(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ServicesConfig::load(file.path()).unwrap();
        assert_eq!(config.names().collect::<Vec<_>>(), vec!["greeter", "ledger"]);
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = ServicesConfig::load("/nonexistent/cleave.config.json").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("greeter"));
        assert!(is_identifier("svc_b2"));
        assert!(!is_identifier("_private"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("has-dash"));
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(BridgeTimeouts::CONNECT < BridgeTimeouts::CALL);
        assert!(BridgeTimeouts::READY_POLL < BridgeTimeouts::READY);
        assert!(WireLimits::MAX_FRAME_BYTES >= 1024 * 1024);
    }
}
