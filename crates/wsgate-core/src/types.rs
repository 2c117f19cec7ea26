//! Declarative resource graph of a WebSocket API.
//!
//! Routes target integrations, integrations reference backend functions.
//! Routes cannot target routes, so the graph is acyclic by construction.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::{Fingerprint, FingerprintBuilder, fingerprint};

/// Opaque identifier of an API.
pub type ApiId = String;

/// Identifier of a deployment snapshot, unique within an API.
pub type DeploymentId = String;

/// Identifier of an integration, unique within an API.
pub type IntegrationId = String;

/// Identifier of a backend function.
pub type FunctionId = String;

// ── Api ────────────────────────────────────────────────────────────

/// A logical WebSocket API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Api {
    pub id: ApiId,
    pub name: String,
    /// How an inbound frame selects a route, e.g. `$request.body.action`.
    pub route_selection_expression: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub api_key_selection_expression: Option<String>,
    #[serde(default)]
    pub disable_schema_validation: bool,
    #[serde(default)]
    pub version: Option<String>,
}

impl Api {
    pub fn protocol(&self) -> &'static str {
        "WEBSOCKET"
    }
}

// ── Routes ─────────────────────────────────────────────────────────

/// Where a route dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Integration(IntegrationId),
}

impl RouteTarget {
    pub fn integration_id(&self) -> &str {
        match self {
            RouteTarget::Integration(id) => id,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Integration(id) => write!(f, "integrations/{id}"),
        }
    }
}

impl FromStr for RouteTarget {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("integrations/") {
            Some(id) if !id.is_empty() && !id.contains('/') => {
                Ok(RouteTarget::Integration(id.to_string()))
            }
            _ => Err(GraphError::InvalidTarget(s.to_string())),
        }
    }
}

impl Serialize for RouteTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RouteTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A dispatch rule mapping a route key to an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Route key, e.g. `$connect`, `$default`, or an action name.
    pub route_key: String,
    pub target: RouteTarget,
    #[serde(default = "default_authorization")]
    pub authorization_type: String,
    #[serde(default)]
    pub route_response_selection_expression: Option<String>,
}

fn default_authorization() -> String {
    "NONE".to_string()
}

// ── Integrations ───────────────────────────────────────────────────

/// Kind of backend an integration proxies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationKind {
    /// Backend-proxy: the whole frame is handed to the function.
    #[default]
    AwsProxy,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::AwsProxy => "AWS_PROXY",
        }
    }
}

/// Binds an API to a backend function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub name: String,
    #[serde(default)]
    pub kind: IntegrationKind,
    /// Non-owning reference to the backend function.
    pub function: FunctionId,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub timeout_millis: Option<u32>,
    /// Whether a `$default` integration response accompanies the integration.
    #[serde(default = "default_true")]
    pub default_response: bool,
}

fn default_true() -> bool {
    true
}

/// Bounds accepted for WebSocket integration timeouts.
pub const INTEGRATION_TIMEOUT_MILLIS: std::ops::RangeInclusive<u32> = 50..=29_000;

impl Integration {
    /// Digest over the declarative identity and the integration name.
    ///
    /// Other attributes are cosmetic for deployment-triggering purposes.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.id, &self.name)
    }
}

// ── Backend functions ──────────────────────────────────────────────

/// The compute unit invoked by an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFunction {
    pub id: FunctionId,
    /// Configured function name.
    pub name: String,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
}

impl BackendFunction {
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.id, &self.name)
    }
}

// ── Graph ──────────────────────────────────────────────────────────

/// Errors found while validating a resource graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("route {route_key} references missing integration {integration_id}")]
    MissingIntegration {
        route_key: String,
        integration_id: IntegrationId,
    },

    #[error("integration {integration_id} references missing function {function_id}")]
    MissingFunction {
        integration_id: IntegrationId,
        function_id: FunctionId,
    },

    #[error("duplicate route key: {0}")]
    DuplicateRoute(String),

    #[error("duplicate integration id: {0}")]
    DuplicateIntegration(IntegrationId),

    #[error("integration {integration_id} timeout {millis}ms is outside 50..=29000")]
    InvalidTimeout {
        integration_id: IntegrationId,
        millis: u32,
    },

    #[error("invalid route target: {0} (expected integrations/<id>)")]
    InvalidTarget(String),
}

/// Everything reachable from one API: its routes, integrations and functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiGraph {
    pub api: Api,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub integrations: Vec<Integration>,
    #[serde(default)]
    pub functions: Vec<BackendFunction>,
}

impl ApiGraph {
    pub fn new(api: Api) -> Self {
        Self {
            api,
            routes: Vec::new(),
            integrations: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Add a backend function with default handler/runtime.
    pub fn with_function(mut self, id: &str, name: &str) -> Self {
        self.functions.push(BackendFunction {
            id: id.to_string(),
            name: name.to_string(),
            handler: None,
            runtime: None,
        });
        self
    }

    /// Add a backend-proxy integration to `function`.
    pub fn with_integration(mut self, id: &str, name: &str, function: &str) -> Self {
        self.integrations.push(Integration {
            id: id.to_string(),
            name: name.to_string(),
            kind: IntegrationKind::AwsProxy,
            function: function.to_string(),
            description: None,
            timeout_millis: None,
            default_response: true,
        });
        self
    }

    /// Add a route dispatching `route_key` to `integration`.
    pub fn with_route(mut self, route_key: &str, integration: &str) -> Self {
        self.routes.push(Route {
            route_key: route_key.to_string(),
            target: RouteTarget::Integration(integration.to_string()),
            authorization_type: default_authorization(),
            route_response_selection_expression: None,
        });
        self
    }

    pub fn integration(&self, id: &str) -> Option<&Integration> {
        self.integrations.iter().find(|i| i.id == id)
    }

    pub fn function(&self, id: &str) -> Option<&BackendFunction> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Check that every route resolves to an integration and every
    /// integration to a function.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen_integrations = HashSet::new();
        for integration in &self.integrations {
            if !seen_integrations.insert(integration.id.as_str()) {
                return Err(GraphError::DuplicateIntegration(integration.id.clone()));
            }
            if let Some(millis) = integration.timeout_millis {
                if !INTEGRATION_TIMEOUT_MILLIS.contains(&millis) {
                    return Err(GraphError::InvalidTimeout {
                        integration_id: integration.id.clone(),
                        millis,
                    });
                }
            }
            if self.function(&integration.function).is_none() {
                return Err(GraphError::MissingFunction {
                    integration_id: integration.id.clone(),
                    function_id: integration.function.clone(),
                });
            }
        }

        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            if !seen_routes.insert(route.route_key.as_str()) {
                return Err(GraphError::DuplicateRoute(route.route_key.clone()));
            }
            let integration_id = route.target.integration_id();
            if self.integration(integration_id).is_none() {
                return Err(GraphError::MissingIntegration {
                    route_key: route.route_key.clone(),
                    integration_id: integration_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Aggregate fingerprint over every route and what it resolves to.
    ///
    /// Routes are visited in route-key order so declaration order does not
    /// matter. Unresolvable references contribute an empty field; callers
    /// validate first.
    pub fn fingerprint(&self) -> Fingerprint {
        let by_key: BTreeMap<&str, &Route> =
            self.routes.iter().map(|r| (r.route_key.as_str(), r)).collect();

        let mut builder = FingerprintBuilder::new().field(&self.api.id);
        for (key, route) in by_key {
            let integration = self.integration(route.target.integration_id());
            let integration_fp = integration.map(Integration::fingerprint);
            let function_fp = integration
                .and_then(|i| self.function(&i.function))
                .map(BackendFunction::fingerprint);

            builder = builder
                .field(key)
                .field(&route.target.to_string())
                .field(integration_fp.as_ref().map_or("", |f| f.as_str()))
                .field(function_fp.as_ref().map_or("", |f| f.as_str()));
        }
        builder.finish()
    }

    /// The integrations actually reachable from a route.
    pub fn routed_integrations(&self) -> Vec<&Integration> {
        let mut ids: Vec<&str> = self
            .routes
            .iter()
            .map(|r| r.target.integration_id())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().filter_map(|id| self.integration(id)).collect()
    }
}

// ── Deployments ────────────────────────────────────────────────────

/// Immutable snapshot of an API's routes and integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub api_id: ApiId,
    /// Stage the snapshot was valid for at creation time.
    pub stage_name: String,
    pub description: String,
    /// Position in the API's append-only deployment history, from 1.
    pub sequence: u64,
    /// Aggregate graph fingerprint at creation time.
    pub fingerprint: Fingerprint,
    pub routes: Vec<Route>,
    pub integrations: Vec<Integration>,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

impl Deployment {
    /// Whether two deployments carry the same routes/integrations.
    pub fn same_content(&self, other: &Deployment) -> bool {
        self.api_id == other.api_id && self.fingerprint == other.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> ApiGraph {
        let mut graph = ApiGraph::new(Api {
            id: "a1b2c3".to_string(),
            name: "TestWsApi".to_string(),
            route_selection_expression: "$request.body.action".to_string(),
            description: Some("Test description.".to_string()),
            api_key_selection_expression: None,
            disable_schema_validation: false,
            version: None,
        });
        graph.functions.push(BackendFunction {
            id: "TestFunction".to_string(),
            name: "TestFunction".to_string(),
            handler: Some("index.handler".to_string()),
            runtime: None,
        });
        graph.integrations.push(Integration {
            id: "TestIntegration".to_string(),
            name: "TestIntegration".to_string(),
            kind: IntegrationKind::AwsProxy,
            function: "TestFunction".to_string(),
            description: None,
            timeout_millis: None,
            default_response: true,
        });
        graph.routes.push(Route {
            route_key: "test".to_string(),
            target: RouteTarget::Integration("TestIntegration".to_string()),
            authorization_type: "NONE".to_string(),
            route_response_selection_expression: Some("$default".to_string()),
        });
        graph
    }

    #[test]
    fn sample_graph_is_valid() {
        assert!(sample_graph().validate().is_ok());
    }

    #[test]
    fn route_to_missing_integration_is_rejected() {
        let mut graph = sample_graph();
        graph.routes[0].target = RouteTarget::Integration("Gone".to_string());
        assert_eq!(
            graph.validate(),
            Err(GraphError::MissingIntegration {
                route_key: "test".to_string(),
                integration_id: "Gone".to_string(),
            })
        );
    }

    #[test]
    fn integration_to_missing_function_is_rejected() {
        let mut graph = sample_graph();
        graph.functions.clear();
        assert!(matches!(
            graph.validate(),
            Err(GraphError::MissingFunction { .. })
        ));
    }

    #[test]
    fn duplicate_route_keys_are_rejected() {
        let mut graph = sample_graph();
        let dup = graph.routes[0].clone();
        graph.routes.push(dup);
        assert_eq!(
            graph.validate(),
            Err(GraphError::DuplicateRoute("test".to_string()))
        );
    }

    #[test]
    fn timeout_bounds_are_enforced() {
        let mut graph = sample_graph();
        graph.integrations[0].timeout_millis = Some(30_000);
        assert!(matches!(graph.validate(), Err(GraphError::InvalidTimeout { .. })));
        graph.integrations[0].timeout_millis = Some(29_000);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn route_target_parses_and_displays() {
        let target: RouteTarget = "integrations/abc123".parse().unwrap();
        assert_eq!(target, RouteTarget::Integration("abc123".to_string()));
        assert_eq!(target.to_string(), "integrations/abc123");

        assert!("routes/abc".parse::<RouteTarget>().is_err());
        assert!("integrations/".parse::<RouteTarget>().is_err());
    }

    #[test]
    fn route_target_serializes_as_string() {
        let route = sample_graph().routes.remove(0);
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["target"], "integrations/TestIntegration");
    }

    #[test]
    fn graph_fingerprint_ignores_route_order() {
        let mut a = sample_graph();
        a.routes.push(Route {
            route_key: "$default".to_string(),
            target: RouteTarget::Integration("TestIntegration".to_string()),
            authorization_type: "NONE".to_string(),
            route_response_selection_expression: None,
        });
        let mut b = a.clone();
        b.routes.reverse();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn graph_fingerprint_ignores_cosmetic_integration_changes() {
        let a = sample_graph();
        let mut b = a.clone();
        b.integrations[0].description = Some("now with a description".to_string());
        b.integrations[0].timeout_millis = Some(5_000);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn graph_fingerprint_tracks_meaningful_changes() {
        let a = sample_graph();

        let mut renamed = a.clone();
        renamed.integrations[0].name = "RenamedIntegration".to_string();
        assert_ne!(a.fingerprint(), renamed.fingerprint());

        let mut new_function = a.clone();
        new_function.functions[0].name = "TestFunctionV2".to_string();
        assert_ne!(a.fingerprint(), new_function.fingerprint());

        let mut new_route = a.clone();
        new_route.routes[0].route_key = "echo".to_string();
        assert_ne!(a.fingerprint(), new_route.fingerprint());
    }

    #[test]
    fn routed_integrations_skip_unreferenced() {
        let mut graph = sample_graph();
        graph.integrations.push(Integration {
            id: "Orphan".to_string(),
            name: "Orphan".to_string(),
            kind: IntegrationKind::AwsProxy,
            function: "TestFunction".to_string(),
            description: None,
            timeout_millis: None,
            default_response: false,
        });
        let routed = graph.routed_integrations();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].id, "TestIntegration");
    }

    #[test]
    fn builder_methods_produce_valid_graph() {
        let graph = ApiGraph::new(sample_graph().api)
            .with_function("fn", "fn")
            .with_integration("int", "int", "fn")
            .with_route("$default", "int");
        assert!(graph.validate().is_ok());
        assert_eq!(graph.routes[0].authorization_type, "NONE");
        assert!(graph.integrations[0].default_response);
    }

    #[test]
    fn api_protocol_is_websocket() {
        assert_eq!(sample_graph().api.protocol(), "WEBSOCKET");
    }
}
