//! Stage configuration and endpoint derivation.
//!
//! Endpoints are pure string templates over {api id, stage name, region,
//! account}. Stage construction validates settings before anything is
//! created on the control surface.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building a stage or deriving its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("access log settings supplied; cannot also request default ones")]
    ConfigConflict,

    #[error("missing context: {0}")]
    MissingContext(&'static str),

    #[error("invalid stage name: {0} (alphanumerics, '-' and '_', at most 128 characters)")]
    InvalidStageName(String),

    #[error("invalid stage variable {name}: {reason}")]
    InvalidStageVariable { name: String, reason: &'static str },
}

static STAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static regex"));

static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex"));

static VARIABLE_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-._~:/?#&=,]+$").expect("static regex"));

/// Access log format emitted when default access logging is requested.
pub const DEFAULT_ACCESS_LOG_FORMAT: &str = concat!(
    "{",
    "\"requestId\":\"$context.requestId\", ",
    "\"ip\": \"$context.identity.sourceIp\", ",
    "\"caller\":\"$context.identity.caller\", ",
    "\"user\":\"$context.identity.user\",",
    "\"requestTime\":\"$context.requestTime\", ",
    "\"eventType\":\"$context.eventType\",",
    "\"routeKey\":\"$context.routeKey\", ",
    "\"status\":\"$context.status\",",
    "\"connectionId\":\"$context.connectionId\"",
    "}"
);

/// Retention for generated access-log sinks.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;

// ── Settings ───────────────────────────────────────────────────────

/// Per-route logging and throttling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSettings {
    #[serde(default)]
    pub data_trace_enabled: bool,
    #[serde(default)]
    pub detailed_metrics_enabled: bool,
    #[serde(default)]
    pub logging_level: Option<String>,
    #[serde(default)]
    pub throttling_burst_limit: Option<u32>,
    #[serde(default)]
    pub throttling_rate_limit: Option<f64>,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            data_trace_enabled: true,
            detailed_metrics_enabled: true,
            logging_level: Some("INFO".to_string()),
            throttling_burst_limit: None,
            throttling_rate_limit: None,
        }
    }
}

/// Where access logs go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccessLogDestination {
    /// An existing sink supplied by the caller.
    Arn { arn: String },
    /// A sink to be provisioned alongside the stage.
    Generated {
        log_group_name: String,
        retention_days: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogSettings {
    pub destination: AccessLogDestination,
    pub format: String,
}

/// Stage as declared by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Declarative identity of the stage; names generated resources.
    pub id: String,
    pub stage_name: String,
    #[serde(default)]
    pub auto_deploy: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub access_log: Option<AccessLogSettings>,
    #[serde(default)]
    pub create_default_access_log: bool,
    #[serde(default)]
    pub default_route_settings: Option<RouteSettings>,
    #[serde(default)]
    pub route_settings: BTreeMap<String, RouteSettings>,
    #[serde(default)]
    pub stage_variables: BTreeMap<String, String>,
}

/// A validated stage, ready to be created on the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: String,
    pub stage_name: String,
    pub auto_deploy: bool,
    pub description: Option<String>,
    pub access_log: Option<AccessLogSettings>,
    pub default_route_settings: RouteSettings,
    pub route_settings: BTreeMap<String, RouteSettings>,
    pub stage_variables: BTreeMap<String, String>,
}

impl StageSpec {
    /// Validate the stage spec and fill in defaults.
    pub fn resolve(self) -> Result<StageConfig, StageError> {
        if self.access_log.is_some() && self.create_default_access_log {
            return Err(StageError::ConfigConflict);
        }
        validate_stage_name(&self.stage_name)?;
        for (name, value) in &self.stage_variables {
            if !VARIABLE_NAME.is_match(name) {
                return Err(StageError::InvalidStageVariable {
                    name: name.clone(),
                    reason: "names may only contain alphanumerics and '_'",
                });
            }
            if !VARIABLE_VALUE.is_match(value) {
                return Err(StageError::InvalidStageVariable {
                    name: name.clone(),
                    reason: "value contains unsupported characters",
                });
            }
        }

        let access_log = if self.create_default_access_log {
            Some(AccessLogSettings {
                destination: AccessLogDestination::Generated {
                    log_group_name: format!("{}LogGroup", self.id),
                    retention_days: DEFAULT_LOG_RETENTION_DAYS,
                },
                format: DEFAULT_ACCESS_LOG_FORMAT.to_string(),
            })
        } else {
            self.access_log
        };

        Ok(StageConfig {
            id: self.id,
            stage_name: self.stage_name,
            auto_deploy: self.auto_deploy,
            description: self.description,
            access_log,
            default_route_settings: self.default_route_settings.unwrap_or_default(),
            route_settings: self.route_settings,
            stage_variables: self.stage_variables,
        })
    }
}

pub fn validate_stage_name(name: &str) -> Result<(), StageError> {
    if STAGE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(StageError::InvalidStageName(name.to_string()))
    }
}

// ── Endpoints ──────────────────────────────────────────────────────

/// Region/account context endpoints are derived in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointContext {
    pub region: String,
    pub account: String,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_dns_suffix")]
    pub dns_suffix: String,
}

fn default_partition() -> String {
    "aws".to_string()
}

fn default_dns_suffix() -> String {
    "amazonaws.com".to_string()
}

impl EndpointContext {
    pub fn new(region: &str, account: &str) -> Self {
        Self {
            region: region.to_string(),
            account: account.to_string(),
            partition: default_partition(),
            dns_suffix: default_dns_suffix(),
        }
    }

    fn check(&self) -> Result<(), StageError> {
        if self.region.is_empty() {
            return Err(StageError::MissingContext("region"));
        }
        if self.account.is_empty() {
            return Err(StageError::MissingContext("account"));
        }
        if self.partition.is_empty() {
            return Err(StageError::MissingContext("partition"));
        }
        if self.dns_suffix.is_empty() {
            return Err(StageError::MissingContext("dns_suffix"));
        }
        Ok(())
    }

    /// ARN of a backend function by name.
    pub fn function_arn(&self, function_name: &str) -> Result<String, StageError> {
        self.check()?;
        if function_name.is_empty() {
            return Err(StageError::MissingContext("function_name"));
        }
        Ok(format!(
            "arn:{}:lambda:{}:{}:function:{}",
            self.partition, self.region, self.account, function_name
        ))
    }

    /// Invocation URI a backend-proxy integration points at.
    pub fn integration_uri(&self, function_name: &str) -> Result<String, StageError> {
        let function_arn = self.function_arn(function_name)?;
        Ok(format!(
            "arn:{}:apigateway:{}:lambda:path/2015-03-31/functions/{}/invocations",
            self.partition, self.region, function_arn
        ))
    }
}

/// Endpoints of a deployed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEndpoints {
    /// Bidirectional streaming endpoint clients connect to.
    pub stream_url: String,
    /// Send-only endpoint for pushing messages to open connections.
    pub send_url: String,
    /// Administrative locator of the stage.
    pub resource_arn: String,
    /// Permission pattern covering posts to any open connection.
    pub connections_arn: String,
}

/// Derive the endpoints of `stage_name` on `api_id`.
pub fn derive_endpoints(
    api_id: &str,
    stage_name: &str,
    ctx: &EndpointContext,
) -> Result<StageEndpoints, StageError> {
    if api_id.is_empty() {
        return Err(StageError::MissingContext("api_id"));
    }
    if stage_name.is_empty() {
        return Err(StageError::MissingContext("stage_name"));
    }
    ctx.check()?;

    let host = format!("{api_id}.execute-api.{}.{}", ctx.region, ctx.dns_suffix);
    Ok(StageEndpoints {
        stream_url: format!("wss://{host}/{stage_name}"),
        send_url: format!("https://{host}/{stage_name}"),
        resource_arn: format!(
            "arn:{}:apigateway:{}::/restapis/{api_id}/stages/{stage_name}",
            ctx.partition, ctx.region
        ),
        connections_arn: format!(
            "arn:{}:execute-api:{}:{}:{api_id}/{stage_name}/POST/@connections/*",
            ctx.partition, ctx.region, ctx.account
        ),
    })
}
