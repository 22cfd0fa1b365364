//! Function Registry
//!
//! Name-to-callable mapping for every externally invokable operation.
//! Each entry carries an input schema and a mutates-external-state flag;
//! the orchestration core never inspects a handler's internals, only its
//! declared metadata. Built once at startup, shared read-only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Uniform return value from every registry handler.
///
/// Never mutated after return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    /// Identifier of the resource created or touched, when applicable
    pub resource_id: Option<String>,
    pub message: String,
    /// Reference to a backup taken before the operation, for undo
    pub backup_ref: Option<String>,
    /// Structured payload for rendering (tables, reports)
    pub payload: Option<Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            resource_id: None,
            message: message.into(),
            backup_ref: None,
            payload: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            resource_id: None,
            message: message.into(),
            backup_ref: None,
            payload: None,
        }
    }

    pub fn with_resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<OperationResult>> + Send>>;

/// Boxed async handler taking a JSON argument object.
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// One registered operation.
#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object
    pub schema: Value,
    /// Whether invoking this function changes external state
    pub mutates: bool,
    pub handler: Handler,
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("mutates", &self.mutates)
            .finish()
    }
}

/// The startup function registry.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    entries: HashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: FunctionEntry) {
        debug!(function = %entry.name, mutates = entry.mutates, "registered function");
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke a handler by name. `Err` means the handler itself raised;
    /// an unsuccessful `OperationResult` is a domain-level failure.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<OperationResult> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("function '{}' not found in registry", name))?;
        debug!(function = %name, "invoking registry handler");
        (entry.handler)(args).await
    }

    /// Simulated handler set standing in for a real device driver.
    ///
    /// Returns canned inventory and echoes mutations back as successful
    /// results so the full orchestration path can run end to end without
    /// managed hardware.
    pub fn simulated() -> Self {
        let mut registry = Self::new();

        registry.register(FunctionEntry {
            name: "discover_networks".to_string(),
            description: "List all managed networks".to_string(),
            schema: json!({"type": "object", "properties": {}}),
            mutates: false,
            handler: Arc::new(|_args| {
                Box::pin(async {
                    Ok(OperationResult::ok("2 networks found").with_payload(json!([
                        {"id": "net-100", "name": "HQ", "devices": 14},
                        {"id": "net-200", "name": "Branch", "devices": 6},
                    ])))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "discover_devices".to_string(),
            description: "List devices in a network".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string", "description": "Network to inspect"}
                },
                "required": ["network_id"]
            }),
            mutates: false,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let network = args["network_id"].as_str().unwrap_or("net-100").to_string();
                    Ok(OperationResult::ok(format!("3 devices in {}", network)).with_payload(
                        json!([
                            {"serial": "Q2XX-0001", "model": "MX68", "status": "online"},
                            {"serial": "Q2XX-0002", "model": "MS120", "status": "online"},
                            {"serial": "Q2XX-0003", "model": "MR36", "status": "offline"},
                        ]),
                    ))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "list_clients".to_string(),
            description: "List clients seen on a network".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string"}
                },
                "required": ["network_id"]
            }),
            mutates: false,
            handler: Arc::new(|_args| {
                Box::pin(async {
                    Ok(OperationResult::ok("2 clients").with_payload(json!([
                        {"mac": "aa:bb:cc:00:00:01", "usage_mb": 412},
                        {"mac": "aa:bb:cc:00:00:02", "usage_mb": 87},
                    ])))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "get_network_health".to_string(),
            description: "Summarize health of a network".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string"}
                }
            }),
            mutates: false,
            handler: Arc::new(|_args| {
                Box::pin(async {
                    Ok(OperationResult::ok("health ok").with_payload(
                        json!({"uplinks": "ok", "loss_pct": 0.2, "latency_ms": 18}),
                    ))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "get_device_status".to_string(),
            description: "Status of a single device".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "serial": {"type": "string"}
                },
                "required": ["serial"]
            }),
            mutates: false,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let serial = args["serial"].as_str().unwrap_or("unknown").to_string();
                    Ok(OperationResult::ok(format!("{} online", serial))
                        .with_payload(json!({"serial": serial, "status": "online"})))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "generate_report".to_string(),
            description: "Render a report over discovered inventory".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "kind": {"type": "string", "description": "Report kind, e.g. health, audit"}
                }
            }),
            mutates: false,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let kind = args["kind"].as_str().unwrap_or("health").to_string();
                    Ok(OperationResult::ok(format!("{} report generated", kind)))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "render_template".to_string(),
            description: "Render a templated artifact".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "template": {"type": "string"},
                    "values": {"type": "object"}
                },
                "required": ["template"]
            }),
            mutates: false,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let template = args["template"].as_str().unwrap_or("").to_string();
                    Ok(OperationResult::ok(format!("rendered '{}'", template)))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "configure_ssid".to_string(),
            description: "Create or update an SSID".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string"},
                    "name": {"type": "string"},
                    "enabled": {"type": "boolean"}
                },
                "required": ["network_id", "name"]
            }),
            mutates: true,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let name = args["name"].as_str().unwrap_or("ssid").to_string();
                    Ok(OperationResult::ok(format!("ssid '{}' configured", name))
                        .with_resource(format!("ssid:{}", name)))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "create_vlan".to_string(),
            description: "Create a VLAN on a network".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string"},
                    "vlan_id": {"type": "integer"},
                    "name": {"type": "string"}
                },
                "required": ["network_id", "vlan_id"]
            }),
            mutates: true,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let vlan = args["vlan_id"].as_u64().unwrap_or(0);
                    Ok(OperationResult::ok(format!("vlan {} created", vlan))
                        .with_resource(format!("vlan:{}", vlan)))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "add_firewall_rule".to_string(),
            description: "Append a firewall rule".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string"},
                    "policy": {"type": "string", "enum": ["allow", "deny"]},
                    "protocol": {"type": "string"},
                    "dest_port": {"type": "string"}
                },
                "required": ["network_id", "policy"]
            }),
            mutates: true,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let policy = args["policy"].as_str().unwrap_or("deny").to_string();
                    Ok(OperationResult::ok(format!("{} rule appended", policy))
                        .with_resource("fw-rule:append".to_string()))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "remove_firewall_rule".to_string(),
            description: "Remove a firewall rule by index".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "network_id": {"type": "string"},
                    "index": {"type": "integer"}
                },
                "required": ["network_id", "index"]
            }),
            mutates: true,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let index = args["index"].as_u64().unwrap_or(0);
                    Ok(OperationResult::ok(format!("rule {} removed", index)))
                })
            }),
        });

        registry.register(FunctionEntry {
            name: "update_device_settings".to_string(),
            description: "Update settings on a device".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "serial": {"type": "string"},
                    "settings": {"type": "object"}
                },
                "required": ["serial"]
            }),
            mutates: true,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let serial = args["serial"].as_str().unwrap_or("unknown").to_string();
                    Ok(OperationResult::ok(format!("settings updated on {}", serial))
                        .with_resource(format!("device:{}", serial)))
                })
            }),
        });

        registry
    }
}
