//! StateStore: redb-backed control surface for wsgate.
//!
//! Holds the resource graph of each API, its stages, and the deployment
//! snapshots created from those graphs. Deployments are append-only; the
//! only mutable pointer is the deployment a stage is bound to.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use wsgate_core::{ApiGraph, Deployment, DeploymentId, FingerprintBuilder, StageConfig};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A stage together with the deployment it currently serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub api_id: String,
    pub config: StageConfig,
    /// `None` until the first deployment is bound.
    pub deployment_id: Option<DeploymentId>,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
}

/// Counts of records reclaimed by a teardown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub stages: u32,
    pub deployments: u32,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(GRAPHS).map_err(map_err!(Table))?;
        txn.open_table(STAGES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Graphs ─────────────────────────────────────────────────────

    /// Insert or replace the resource graph of an API.
    ///
    /// Stages and deployments are untouched; existing deployments keep the
    /// snapshot they were created from.
    pub fn put_graph(&self, graph: &ApiGraph) -> StateResult<()> {
        check_segment("api id", &graph.api.id)?;
        graph.validate()?;
        let key = graph.api.id.as_str();
        let value = encode(graph)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(api = %key, fingerprint = %graph.fingerprint().short(), "graph stored");
        Ok(())
    }

    pub fn get_graph(&self, api_id: &str) -> StateResult<Option<ApiGraph>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
        match table.get(api_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// IDs of every API with a stored graph.
    pub fn list_apis(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            results.push(key.value().to_string());
        }
        Ok(results)
    }

    /// Remove an API with all of its stages and deployments.
    ///
    /// The deployment sequence survives so identifiers are never reissued.
    pub fn delete_api(&self, api_id: &str) -> StateResult<Teardown> {
        let prefix = child_prefix(api_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut teardown = Teardown::default();
        {
            let mut graphs = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
            graphs.remove(api_id).map_err(map_err!(Write))?;

            let mut stages = txn.open_table(STAGES).map_err(map_err!(Table))?;
            for key in prefixed_keys(&stages, &prefix)? {
                stages.remove(key.as_str()).map_err(map_err!(Write))?;
                teardown.stages += 1;
            }

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for key in prefixed_keys(&deployments, &prefix)? {
                deployments.remove(key.as_str()).map_err(map_err!(Write))?;
                teardown.deployments += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            api = %api_id,
            stages = teardown.stages,
            deployments = teardown.deployments,
            "api torn down"
        );
        Ok(teardown)
    }

    // ── Stages ─────────────────────────────────────────────────────

    /// Insert or update a stage. An existing binding is preserved.
    pub fn put_stage(&self, api_id: &str, config: &StageConfig) -> StateResult<StageRecord> {
        let key = child_key(api_id, &config.stage_name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let graphs = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
            if graphs.get(api_id).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("api {api_id}")));
            }

            let mut stages = txn.open_table(STAGES).map_err(map_err!(Table))?;
            let existing: Option<StageRecord> = match stages.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let record = StageRecord {
                api_id: api_id.to_string(),
                config: config.clone(),
                deployment_id: existing.and_then(|r| r.deployment_id),
                updated_at: epoch_secs(),
            };
            let value = encode(&record)?;
            stages
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "stage stored");
        Ok(record)
    }

    pub fn get_stage(&self, api_id: &str, stage_name: &str) -> StateResult<Option<StageRecord>> {
        let key = child_key(api_id, stage_name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STAGES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All stages of an API, ordered by stage name.
    pub fn list_stages(&self, api_id: &str) -> StateResult<Vec<StageRecord>> {
        self.scan(STAGES, &child_prefix(api_id))
    }

    /// Remove a stage and reclaim the deployments created for it.
    ///
    /// Returns `None` if the stage did not exist.
    pub fn delete_stage(&self, api_id: &str, stage_name: &str) -> StateResult<Option<Teardown>> {
        let key = child_key(api_id, stage_name);
        let prefix = child_prefix(api_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let teardown = {
            let mut stages = txn.open_table(STAGES).map_err(map_err!(Table))?;
            if stages.remove(key.as_str()).map_err(map_err!(Write))?.is_none() {
                return Ok(None);
            }

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut doomed = Vec::new();
            for entry in deployments.iter().map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                if !k.value().starts_with(&prefix) {
                    continue;
                }
                let deployment: Deployment = decode(v.value())?;
                if deployment.stage_name == stage_name {
                    doomed.push(k.value().to_string());
                }
            }
            for k in &doomed {
                deployments.remove(k.as_str()).map_err(map_err!(Write))?;
            }
            Teardown {
                stages: 1,
                deployments: doomed.len() as u32,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%key, deployments = teardown.deployments, "stage torn down");
        Ok(Some(teardown))
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Snapshot the current graph of `api_id` into a new deployment.
    ///
    /// The snapshot is taken inside the same write transaction that assigns
    /// the deployment its sequence number, so it reflects exactly one
    /// version of the graph.
    pub fn create_deployment(
        &self,
        api_id: &str,
        stage_name: &str,
        description: &str,
    ) -> StateResult<Deployment> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deployment = {
            let graphs = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
            let graph: ApiGraph = match graphs.get(api_id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("api {api_id}"))),
            };

            let stages = txn.open_table(STAGES).map_err(map_err!(Table))?;
            let stage_key = child_key(api_id, stage_name);
            if stages.get(stage_key.as_str()).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("stage {stage_key}")));
            }

            graph.validate()?;

            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let sequence = sequences
                .get(api_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            sequences.insert(api_id, sequence).map_err(map_err!(Write))?;

            let deployment = Deployment {
                id: deployment_id(api_id, stage_name, sequence),
                api_id: api_id.to_string(),
                stage_name: stage_name.to_string(),
                description: description.to_string(),
                sequence,
                fingerprint: graph.fingerprint(),
                routes: graph.routes.clone(),
                integrations: graph.routed_integrations().into_iter().cloned().collect(),
                created_at: epoch_secs(),
            };

            let key = child_key(api_id, &deployment.id);
            let value = encode(&deployment)?;
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            deployments
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            deployment
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            api = %api_id,
            stage = %stage_name,
            deployment = %deployment.id,
            sequence = deployment.sequence,
            fingerprint = %deployment.fingerprint.short(),
            "deployment created"
        );
        Ok(deployment)
    }

    pub fn get_deployment(
        &self,
        api_id: &str,
        deployment_id: &str,
    ) -> StateResult<Option<Deployment>> {
        let key = child_key(api_id, deployment_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Deployment history of an API, oldest first.
    pub fn list_deployments(&self, api_id: &str) -> StateResult<Vec<Deployment>> {
        let mut results: Vec<Deployment> = self.scan(DEPLOYMENTS, &child_prefix(api_id))?;
        results.sort_by_key(|d| d.sequence);
        Ok(results)
    }

    /// Point a stage at a deployment. Returns the previously bound
    /// deployment, if any.
    ///
    /// The deployment must exist and must have been created for this
    /// stage; otherwise the stage is left unchanged.
    pub fn bind_stage(
        &self,
        api_id: &str,
        stage_name: &str,
        deployment_id: &str,
    ) -> StateResult<Option<DeploymentId>> {
        let stage_key = child_key(api_id, stage_name);
        let deployment_key = child_key(api_id, deployment_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous = {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let deployment: Deployment =
                match deployments.get(deployment_key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => decode(guard.value())?,
                    None => {
                        return Err(StateError::NotFound(format!("deployment {deployment_key}")));
                    }
                };
            if deployment.stage_name != stage_name {
                return Err(StateError::Conflict(format!(
                    "deployment {deployment_id} was created for stage {}, not {stage_name}",
                    deployment.stage_name
                )));
            }

            let mut stages = txn.open_table(STAGES).map_err(map_err!(Table))?;
            let mut record: StageRecord =
                match stages.get(stage_key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => decode(guard.value())?,
                    None => return Err(StateError::NotFound(format!("stage {stage_key}"))),
                };
            let previous = record.deployment_id.replace(deployment_id.to_string());
            record.updated_at = epoch_secs();
            let value = encode(&record)?;
            stages
                .insert(stage_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            previous
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            stage = %stage_key,
            deployment = %deployment_id,
            previous = previous.as_deref().unwrap_or("-"),
            "stage bound"
        );
        Ok(previous)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn scan<T: DeserializeOwned>(
        &self,
        table: redb::TableDefinition<'static, &'static str, &'static [u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }
}

fn prefixed_keys<T>(table: &T, prefix: &str) -> StateResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let k = key.value();
        if k.starts_with(prefix) {
            keys.push(k.to_string());
        }
    }
    Ok(keys)
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Reject key segments that would break `{api}/{child}` prefix scans.
fn check_segment(what: &str, value: &str) -> StateResult<()> {
    if value.is_empty() || value.contains('/') {
        return Err(StateError::InvalidKey(format!("{what} {value:?}")));
    }
    Ok(())
}

/// Ten hex characters derived from the API, stage and sequence number.
fn deployment_id(api_id: &str, stage_name: &str, sequence: u64) -> DeploymentId {
    let digest = FingerprintBuilder::new()
        .field(api_id)
        .field(stage_name)
        .field(&sequence.to_string())
        .finish();
    digest.as_str()[..10].to_string()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
