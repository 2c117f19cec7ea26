//! gateway.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::{EndpointContext, StageConfig, StageError, StageSpec};
use crate::types::{Api, ApiGraph, BackendFunction, GraphError, Integration, Route};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid gateway config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render gateway config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid resource graph: {0}")]
    Graph(#[from] GraphError),

    #[error("invalid stage: {0}")]
    Stage(#[from] StageError),

    #[error("invalid duration for {field}: {value}")]
    InvalidDuration { field: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub api: Api,
    pub stage: StageSpec,
    #[serde(default)]
    pub functions: Vec<BackendFunction>,
    #[serde(default)]
    pub integrations: Vec<Integration>,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub context: Option<EndpointContext>,
    pub verify: Option<VerifySettings>,
}

/// `[verify]` section: how to probe a stage after it has been deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifySettings {
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_expect_field")]
    pub expect_field: String,
    #[serde(default = "default_expect_value")]
    pub expect_value: String,
    pub max_attempts: Option<u32>,
    pub initial_sleep: Option<String>,
    pub backoff_factor: Option<f64>,
    pub response_timeout: Option<String>,
    /// Overall deadline; `"none"` turns it off.
    pub deadline: Option<String>,
}

fn default_action() -> String {
    "test".to_string()
}

fn default_expect_field() -> String {
    "message".to_string()
}

fn default_expect_value() -> String {
    "success".to_string()
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            action: default_action(),
            expect_field: default_expect_field(),
            expect_value: default_expect_value(),
            max_attempts: None,
            initial_sleep: None,
            backoff_factor: None,
            response_timeout: None,
            deadline: None,
        }
    }
}

impl VerifySettings {
    pub fn initial_sleep(&self) -> ConfigResult<Option<Duration>> {
        optional_duration("verify.initial_sleep", self.initial_sleep.as_deref())
    }

    pub fn response_timeout(&self) -> ConfigResult<Option<Duration>> {
        optional_duration("verify.response_timeout", self.response_timeout.as_deref())
    }

    /// `deadline = "none"` turns the overall deadline off.
    pub fn deadline_disabled(&self) -> bool {
        self.deadline
            .as_deref()
            .is_some_and(|d| d.eq_ignore_ascii_case("none"))
    }

    pub fn deadline(&self) -> ConfigResult<Option<Duration>> {
        if self.deadline_disabled() {
            return Ok(None);
        }
        optional_duration("verify.deadline", self.deadline.as_deref())
    }
}

fn optional_duration(field: &'static str, value: Option<&str>) -> ConfigResult<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(raw) => parse_duration(raw)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidDuration {
                field,
                value: raw.to_string(),
            }),
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The declared resource graph, validated.
    pub fn graph(&self) -> ConfigResult<ApiGraph> {
        let graph = ApiGraph {
            api: self.api.clone(),
            routes: self.routes.clone(),
            integrations: self.integrations.clone(),
            functions: self.functions.clone(),
        };
        graph.validate()?;
        Ok(graph)
    }

    /// The declared stage, validated.
    pub fn stage(&self) -> ConfigResult<StageConfig> {
        Ok(self.stage.clone().resolve()?)
    }

    /// Scaffold a single-route gateway with one backend function.
    pub fn scaffold(api_name: &str, stage_name: &str) -> Self {
        let graph = ApiGraph::new(Api {
            id: api_name.to_string(),
            name: api_name.to_string(),
            route_selection_expression: "$request.body.action".to_string(),
            description: None,
            api_key_selection_expression: None,
            disable_schema_validation: false,
            version: None,
        })
        .with_function(&format!("{api_name}Function"), &format!("{api_name}Function"))
        .with_integration(
            &format!("{api_name}Integration"),
            &format!("{api_name}Integration"),
            &format!("{api_name}Function"),
        )
        .with_route("test", &format!("{api_name}Integration"));

        GatewayConfig {
            api: graph.api,
            stage: StageSpec {
                id: format!("{api_name}Stage"),
                stage_name: stage_name.to_string(),
                ..Default::default()
            },
            functions: graph.functions,
            integrations: graph.integrations,
            routes: graph.routes,
            context: Some(EndpointContext::new("eu-west-1", "123456789012")),
            verify: Some(VerifySettings::default()),
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(Duration::from_secs_f64)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
