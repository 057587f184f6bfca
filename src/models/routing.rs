// Routing rule models - inbound and outbound definitions

//! # Routing Models
//!
//! Value types for everything the catalog publishes:
//! - [`RoutingKey`]: the `(agent, entity, action)` addressing triple
//! - [`InboundRule`]: how an event from a source agent is classified
//! - [`OutboundRule`]: which destination receives a canonical event
//! - [`IntegrationEntity`]: per-entity defaults such as the routing mode
//!
//! Rules are immutable once published. A new version is a new row; only the
//! `active` flag moves between versions of the same key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::{ActionPattern, Versioned};
use super::condition::{self, ConditionNode};

/// Addressing triple used for every rule lookup
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutingKey {
    pub agent: String,
    pub entity: String,
    pub action: String,
}

impl RoutingKey {
    pub fn new(agent: &str, entity: &str, action: &str) -> Self {
        Self {
            agent: agent.to_string(),
            entity: entity.to_string(),
            action: action.to_string(),
        }
    }

    /// Event name used in webhook payloads, e.g. `driver.update`
    pub fn event_name(&self) -> String {
        format!("{}.{}", self.entity, self.action)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.agent, self.entity, self.action)
    }
}

/// How the hub processes an entity after the inbound stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Straight to destination agents
    Direct,
    /// Through the operational data store first
    Ods,
    /// Through the master data management queue first
    Mdm,
}

impl Default for RoutingMode {
    fn default() -> Self {
        RoutingMode::Direct
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingMode::Direct => "direct",
            RoutingMode::Ods => "ods",
            RoutingMode::Mdm => "mdm",
        };
        f.write_str(name)
    }
}

/// An inbound rule's routing mode: either its own or the entity's
///
/// Stored as a nullable string where `"default"` and `null` both mean
/// "use the entity configuration". Any other unknown value is rejected when
/// the rule is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub enum RoutingModeOverride {
    #[default]
    Inherit,
    Mode(RoutingMode),
}

impl RoutingModeOverride {
    /// Resolve against the entity default
    pub fn resolve(self, entity_default: RoutingMode) -> RoutingMode {
        match self {
            RoutingModeOverride::Inherit => entity_default,
            RoutingModeOverride::Mode(mode) => mode,
        }
    }
}

impl TryFrom<Option<String>> for RoutingModeOverride {
    type Error = String;

    fn try_from(raw: Option<String>) -> Result<Self, Self::Error> {
        let Some(raw) = raw else {
            return Ok(RoutingModeOverride::Inherit);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(RoutingModeOverride::Inherit),
            "direct" => Ok(RoutingModeOverride::Mode(RoutingMode::Direct)),
            "ods" => Ok(RoutingModeOverride::Mode(RoutingMode::Ods)),
            "mdm" => Ok(RoutingModeOverride::Mode(RoutingMode::Mdm)),
            _ => Err(format!(
                "unknown routing mode override {:?}, expected default, direct, ods or mdm",
                raw
            )),
        }
    }
}

impl From<RoutingModeOverride> for Option<String> {
    fn from(mode: RoutingModeOverride) -> Self {
        match mode {
            RoutingModeOverride::Inherit => Some("default".to_string()),
            RoutingModeOverride::Mode(mode) => Some(mode.to_string()),
        }
    }
}

/// What to do when evaluating a routing entry's conditions fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Abort resolution with an application error
    Fail,
    /// Treat the failure as "no match" and move on
    #[default]
    Ignore,
}

/// One entry of an inbound rule's `routingEntity` / `routingAction` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRoute {
    /// Entity or action that replaces the default when this entry matches
    pub route: String,

    #[serde(default, with = "condition::optional", skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionNode>,

    /// Fallback entry, used only when no earlier entry matched
    #[serde(default)]
    pub default: bool,

    #[serde(default)]
    pub on_error: OnError,
}

impl InboundRoute {
    pub fn new(route: &str, conditions: Option<ConditionNode>) -> Self {
        Self {
            route: route.to_string(),
            conditions,
            default: false,
            on_error: OnError::Ignore,
        }
    }

    pub fn fallback(route: &str) -> Self {
        Self {
            default: true,
            ..Self::new(route, None)
        }
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// A default entry without conditions is held back until the table is exhausted
    pub fn is_fallback(&self) -> bool {
        self.default && self.conditions.is_none()
    }
}

/// Inbound routing definition for events arriving from a source agent
///
/// Identified by `(agent, endpoint, method, version)`. At most one version of
/// `(agent, endpoint, method)` is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRule {
    /// Source agent (e.g. `erp`)
    pub agent: String,

    /// Endpoint or entity key the event was addressed to (e.g. `driver`)
    pub endpoint: String,

    /// Actions this rule owns, matched against the observed action/method
    pub method: ActionPattern,

    /// Canonical entity; defaults to the endpoint
    #[serde(default)]
    pub entity: Option<String>,

    /// Canonical action; defaults to the observed action
    #[serde(default)]
    pub action: Option<String>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub description: Option<String>,

    /// Payload pre-validation schema, owned by the validation collaborator
    #[serde(default)]
    pub validation: Option<Value>,

    /// Transformation expression, owned by the transformation collaborator
    #[serde(default)]
    pub transformation: Option<String>,

    /// Business-rule configuration, owned by the rule engine collaborator
    #[serde(default)]
    pub rules: Option<Value>,

    #[serde(default)]
    pub external_reference_extraction: Option<String>,

    #[serde(default)]
    pub routing_entity: Vec<InboundRoute>,

    #[serde(default)]
    pub routing_action: Vec<InboundRoute>,

    #[serde(default)]
    pub override_routing_mode: RoutingModeOverride,
}

impl InboundRule {
    pub fn new(agent: &str, endpoint: &str, method: &str, version: u32) -> Self {
        Self {
            agent: agent.to_string(),
            endpoint: endpoint.to_string(),
            method: ActionPattern::parse(method),
            entity: None,
            action: None,
            version,
            active: true,
            description: None,
            validation: None,
            transformation: None,
            rules: None,
            external_reference_extraction: None,
            routing_entity: Vec::new(),
            routing_action: Vec::new(),
            override_routing_mode: RoutingModeOverride::Inherit,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Logical identity without the version
    pub fn series(&self) -> (String, String, String) {
        (self.agent.clone(), self.endpoint.clone(), self.method.to_string())
    }

    /// Every condition tree the rule carries
    pub fn conditions(&self) -> impl Iterator<Item = &ConditionNode> {
        self.routing_entity
            .iter()
            .chain(self.routing_action.iter())
            .filter_map(|route| route.conditions.as_ref())
    }
}

impl Versioned for InboundRule {
    fn pattern(&self) -> &ActionPattern {
        &self.method
    }
    fn version(&self) -> u32 {
        self.version
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

/// Outbound routing definition: one destination for a canonical event
///
/// Identified by `(agent, entity, action, target, version)`. Several targets
/// can be active for the same key at once; each target has at most one
/// active version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRule {
    /// Source agent of the canonical event
    pub agent: String,

    pub entity: String,

    pub action: ActionPattern,

    /// Destination agent; also the name other rules use in `dependencies`
    #[serde(alias = "targetAgent")]
    pub target: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub description: Option<String>,

    /// Gate deciding whether this rule fires for a given payload
    #[serde(default, with = "condition::optional", skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionNode>,

    /// Targets of the same key that must have succeeded before this one
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dependencies: BTreeMap<String, Value>,

    #[serde(default)]
    pub transformation: Option<String>,

    #[serde(default)]
    pub rules: Option<Value>,
}

impl OutboundRule {
    pub fn new(agent: &str, entity: &str, action: &str, target: &str) -> Self {
        Self {
            agent: agent.to_string(),
            entity: entity.to_string(),
            action: ActionPattern::parse(action),
            target: target.to_string(),
            version: 1,
            active: true,
            description: None,
            conditions: None,
            dependencies: BTreeMap::new(),
            transformation: None,
            rules: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionNode) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn depends_on(mut self, target: &str) -> Self {
        self.dependencies.insert(target.to_string(), Value::Bool(true));
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn series(&self) -> (String, String, String, String) {
        (
            self.agent.clone(),
            self.entity.clone(),
            self.action.to_string(),
            self.target.clone(),
        )
    }
}

impl Versioned for OutboundRule {
    fn pattern(&self) -> &ActionPattern {
        &self.action
    }
    fn version(&self) -> u32 {
        self.version
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

/// Canonical entity configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEntity {
    pub entity: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub routing_mode: RoutingMode,
}

impl IntegrationEntity {
    pub fn new(entity: &str, routing_mode: RoutingMode) -> Self {
        Self {
            entity: entity.to_string(),
            version: 1,
            active: true,
            description: None,
            routing_mode,
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<BTreeMap<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}
