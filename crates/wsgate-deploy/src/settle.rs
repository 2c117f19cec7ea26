//! Settle a declared gateway into the state store.
//!
//! Routes, integrations, functions and the stage must all exist before a
//! reconcile runs. Settling writes them in that order.

use tracing::info;

use wsgate_core::{ApiGraph, GatewayConfig};
use wsgate_state::{StageRecord, StateStore};

use crate::error::SettleResult;

/// What was written by [`settle`].
#[derive(Debug, Clone)]
pub struct Settled {
    pub graph: ApiGraph,
    pub stage: StageRecord,
}

/// Validate `config` and store its graph and stage. Nothing is written if
/// validation fails.
pub fn settle(store: &StateStore, config: &GatewayConfig) -> SettleResult<Settled> {
    let graph = config.graph()?;
    let stage = config.stage()?;

    store.put_graph(&graph)?;
    let stage = store.put_stage(&graph.api.id, &stage)?;
    info!(
        api = %graph.api.id,
        stage = %stage.config.stage_name,
        routes = graph.routes.len(),
        integrations = graph.integrations.len(),
        "gateway settled"
    );
    Ok(Settled { graph, stage })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettleError;
    use wsgate_core::{AccessLogDestination, AccessLogSettings, ConfigError, StageError};

    #[test]
    fn settles_graph_and_stage() {
        let store = StateStore::open_in_memory().unwrap();
        let cfg = GatewayConfig::scaffold("Chat", "dev");
        let settled = settle(&store, &cfg).unwrap();
        assert_eq!(settled.stage.deployment_id, None);
        assert!(store.get_graph("Chat").unwrap().is_some());
        assert!(store.get_stage("Chat", "dev").unwrap().is_some());
    }

    #[test]
    fn conflicting_stage_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cfg = GatewayConfig::scaffold("Chat", "dev");
        cfg.stage.create_default_access_log = true;
        cfg.stage.access_log = Some(AccessLogSettings {
            destination: AccessLogDestination::Arn {
                arn: "arn:aws:logs:eu-west-1:123456789012:log-group:chat".into(),
            },
            format: "$context.requestId".into(),
        });

        let err = settle(&store, &cfg).unwrap_err();
        assert!(matches!(
            err,
            SettleError::Config(ConfigError::Stage(StageError::ConfigConflict))
        ));
        assert!(store.get_graph("Chat").unwrap().is_none());
        assert!(store.list_deployments("Chat").unwrap().is_empty());
    }
}
