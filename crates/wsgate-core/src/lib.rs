//! wsgate-core — domain types for WebSocket gateway deployments.
//!
//! - **`types`** — Api / Route / Integration / BackendFunction graph and
//!   immutable deployment snapshots
//! - **`fingerprint`** — content digests that decide whether a change
//!   requires a new deployment
//! - **`stage`** — stage validation and endpoint derivation
//! - **`config`** — `gateway.toml` parsing

pub mod config;
pub mod fingerprint;
pub mod stage;
pub mod types;

pub use config::{ConfigError, GatewayConfig, VerifySettings};
pub use fingerprint::{Fingerprint, FingerprintBuilder, fingerprint};
pub use stage::{
    AccessLogDestination, AccessLogSettings, EndpointContext, RouteSettings, StageConfig,
    StageEndpoints, StageError, StageSpec, derive_endpoints,
};
pub use types::*;
