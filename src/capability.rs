//! Capability definitions
//!
//! A capability is a named specialist profile: the registry functions it may
//! invoke, a behavior prompt, and the lexicon the router scores against.
//! The set is built once at startup and shared read-only.

use regex::Regex;

use crate::verbs::VerbKind;

/// A specialist capability profile. Immutable after load.
#[derive(Debug, Clone)]
pub struct CapabilityDefinition {
    /// Stable identifier, e.g. "network-analyst"
    pub name: String,
    pub description: String,
    /// Registry functions this capability may call
    pub functions: Vec<String>,
    /// Behavior prompt prepended to every conversation
    pub prompt: String,
    /// Example utterances, used for lexical overlap scoring
    pub examples: Vec<String>,
    /// Explicit `@prefix` overrides that select this capability
    pub prefixes: Vec<String>,
    /// Keywords scored during quick classification
    pub keywords: Vec<String>,
    /// Patterns scored during quick classification, compiled at startup
    pub patterns: Vec<Regex>,
    /// Whether this capability is oriented toward mutating operations
    pub mutation_oriented: bool,
}

impl CapabilityDefinition {
    /// Whether a detected verb orientation agrees with this capability.
    pub fn verb_agrees(&self, kind: VerbKind) -> Option<bool> {
        match kind {
            VerbKind::Action => Some(self.mutation_oriented),
            VerbKind::Analysis => Some(!self.mutation_oriented),
            VerbKind::Unknown => None,
        }
    }
}

/// The startup capability set with name lookup.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    capabilities: Vec<CapabilityDefinition>,
}

/// Name of the most conservative read-only capability, used as the
/// classification fallback of last resort.
pub const FALLBACK_CAPABILITY: &str = "network-analyst";

impl CapabilitySet {
    pub fn new(capabilities: Vec<CapabilityDefinition>) -> Self {
        Self { capabilities }
    }

    /// The built-in specialist profiles.
    pub fn builtin() -> Self {
        Self::new(vec![
            CapabilityDefinition {
                name: "network-analyst".to_string(),
                description: "Read-only analysis of networks, devices, clients and health"
                    .to_string(),
                functions: vec![
                    "discover_networks".to_string(),
                    "discover_devices".to_string(),
                    "list_clients".to_string(),
                    "get_network_health".to_string(),
                    "get_device_status".to_string(),
                    "generate_report".to_string(),
                ],
                prompt: "You are a network analyst. You inspect networks, devices and \
                         clients and explain what you find. You never change configuration. \
                         Prefer calling discovery functions over guessing; summarize results \
                         for a network operator."
                    .to_string(),
                examples: vec![
                    "show me the current status".to_string(),
                    "list all devices in the branch network".to_string(),
                    "which clients are using the most bandwidth".to_string(),
                    "generate a health report".to_string(),
                ],
                prefixes: vec!["analyst".to_string(), "network".to_string()],
                keywords: vec![
                    "show".to_string(),
                    "list".to_string(),
                    "status".to_string(),
                    "health".to_string(),
                    "device".to_string(),
                    "client".to_string(),
                    "report".to_string(),
                    "analyze".to_string(),
                    "audit".to_string(),
                    "offline".to_string(),
                    "usage".to_string(),
                ],
                patterns: vec![
                    Regex::new(r"(?i)\b(how many|which|what)\b.*\b(device|network|client)s?\b")
                        .unwrap(),
                    Regex::new(r"(?i)\b(health|status)\b").unwrap(),
                ],
                mutation_oriented: false,
            },
            CapabilityDefinition {
                name: "config-specialist".to_string(),
                description: "Configuration changes: SSIDs, VLANs, firewall rules, device settings"
                    .to_string(),
                functions: vec![
                    "discover_networks".to_string(),
                    "discover_devices".to_string(),
                    "configure_ssid".to_string(),
                    "create_vlan".to_string(),
                    "add_firewall_rule".to_string(),
                    "update_device_settings".to_string(),
                    "remove_firewall_rule".to_string(),
                ],
                prompt: "You are a network configuration specialist. You translate operator \
                         intent into precise configuration calls. Every change is guarded by \
                         the safety engine; describe what will change before changing it and \
                         never invent identifiers."
                    .to_string(),
                examples: vec![
                    "configure a guest wifi network".to_string(),
                    "create vlan 30 for iot devices".to_string(),
                    "add a firewall rule blocking telnet".to_string(),
                    "disable the lobby ssid".to_string(),
                ],
                prefixes: vec!["specialist".to_string(), "config".to_string()],
                keywords: vec![
                    "configure".to_string(),
                    "create".to_string(),
                    "vlan".to_string(),
                    "ssid".to_string(),
                    "firewall".to_string(),
                    "rule".to_string(),
                    "enable".to_string(),
                    "disable".to_string(),
                    "change".to_string(),
                    "update".to_string(),
                    "wifi".to_string(),
                ],
                patterns: vec![
                    Regex::new(r"(?i)\b(set up|setup)\b.*\b(ssid|vlan|wifi|network)\b").unwrap(),
                    Regex::new(r"(?i)\bvlan\s*\d+\b").unwrap(),
                ],
                mutation_oriented: true,
            },
            CapabilityDefinition {
                name: "workflow-creator".to_string(),
                description: "Multi-step workflow authoring and templated artifact generation"
                    .to_string(),
                functions: vec![
                    "discover_networks".to_string(),
                    "generate_report".to_string(),
                    "render_template".to_string(),
                ],
                prompt: "You are a workflow author. You design repeatable multi-step \
                         procedures from operator descriptions and render templated \
                         artifacts. You do not apply configuration yourself."
                    .to_string(),
                examples: vec![
                    "create a workflow for onboarding a new site".to_string(),
                    "automate the weekly audit report".to_string(),
                ],
                prefixes: vec!["workflow".to_string(), "automat".to_string()],
                keywords: vec![
                    "workflow".to_string(),
                    "automate".to_string(),
                    "automation".to_string(),
                    "template".to_string(),
                    "procedure".to_string(),
                    "schedule".to_string(),
                    "repeatable".to_string(),
                ],
                patterns: vec![Regex::new(r"(?i)\b(every|each)\s+(day|week|month)\b").unwrap()],
                mutation_oriented: false,
            },
        ])
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDefinition> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    pub fn all(&self) -> &[CapabilityDefinition] {
        &self.capabilities
    }

    /// Capability names, for constrained generative classification.
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }

    /// Resolve an explicit `@prefix` token to a capability name.
    pub fn match_prefix(&self, token: &str) -> Option<&CapabilityDefinition> {
        let token = token.to_lowercase();
        self.capabilities
            .iter()
            .find(|c| c.prefixes.iter().any(|p| token.starts_with(p.as_str())))
    }
}
