//! Deployment reconciler: one state machine per {api, stage} pairing.
//!
//! A reconcile loads the current resource graph, validates it, snapshots it
//! into a new deployment and repoints the stage at that snapshot. When the
//! graph fingerprint matches the deployment the stage already serves, no
//! snapshot is taken.
//!
//! Reconciles for the same pairing are serialized behind a per-pairing
//! async mutex. Different pairings proceed independently.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wsgate_core::{ApiGraph, DeploymentId, EndpointContext, Fingerprint, StageEndpoints, derive_endpoints};

use crate::control::{ControlError, ControlSurface, GraphSource};
use crate::error::{ReconcileError, ReconcileResult};

/// Lifecycle event delivered by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Create,
    Update,
    Delete,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleEvent::Create => "create",
            LifecycleEvent::Update => "update",
            LifecycleEvent::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl FromStr for LifecycleEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(LifecycleEvent::Create),
            "update" => Ok(LifecycleEvent::Update),
            "delete" => Ok(LifecycleEvent::Delete),
            other => Err(format!("unknown lifecycle event: {other}")),
        }
    }
}

/// What a second reconcile does while one is in flight for the same pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Wait for the in-flight reconcile to finish.
    #[default]
    Queue,
    /// Fail immediately with `ConflictingReconciliation`.
    FailFast,
}

/// Phase of a pairing's state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcilePhase {
    #[default]
    Absent,
    Creating,
    Bound,
    Updating,
    Deleting,
}

/// Where a successfully reconciled stage can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub deployment_id: DeploymentId,
    pub fingerprint: Fingerprint,
    pub endpoints: StageEndpoints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// A new deployment was created and the stage now serves it.
    Deployed(EndpointInfo),
    /// The stage already serves a deployment with identical content.
    Unchanged(EndpointInfo),
    /// Delete event: the pairing's process state was released.
    Released,
}

impl ReconcileOutcome {
    pub fn endpoint(&self) -> Option<&EndpointInfo> {
        match self {
            ReconcileOutcome::Deployed(info) | ReconcileOutcome::Unchanged(info) => Some(info),
            ReconcileOutcome::Released => None,
        }
    }
}

/// A resource the reconcile of a pairing must wait for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Dependency {
    Route(String),
    Stage(String),
}

/// Read-only preview of what a reconcile would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub fingerprint: Fingerprint,
    pub bound: Option<DeploymentId>,
    pub bound_fingerprint: Option<Fingerprint>,
}

impl Plan {
    pub fn needs_deployment(&self) -> bool {
        self.bound_fingerprint.as_ref() != Some(&self.fingerprint)
    }
}

#[derive(Debug, Default)]
struct PairingState {
    phase: ReconcilePhase,
    /// Fingerprint and id of the deployment last bound by this reconciler.
    applied: Option<(Fingerprint, DeploymentId)>,
}

type PairingKey = (String, String);

pub struct Reconciler<C> {
    control: Arc<C>,
    context: EndpointContext,
    policy: ConflictPolicy,
    pairings: Mutex<HashMap<PairingKey, Arc<Mutex<PairingState>>>>,
}

impl<C> Reconciler<C>
where
    C: ControlSurface + GraphSource + 'static,
{
    pub fn new(control: Arc<C>, context: EndpointContext) -> Self {
        Self {
            control,
            context,
            policy: ConflictPolicy::default(),
            pairings: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn control(&self) -> &Arc<C> {
        &self.control
    }

    /// Current phase of a pairing. Waits for an in-flight reconcile.
    pub async fn phase(&self, api_id: &str, stage_name: &str) -> ReconcilePhase {
        let slot = self.slot(api_id, stage_name).await;
        let state = slot.lock().await;
        state.phase
    }

    /// Every route key of the API plus the stage itself.
    pub async fn dependencies(
        &self,
        api_id: &str,
        stage_name: &str,
    ) -> ReconcileResult<Vec<Dependency>> {
        let graph = self.control.load_graph(api_id).await?;
        let mut deps: Vec<Dependency> = graph
            .routes
            .iter()
            .map(|r| Dependency::Route(r.route_key.clone()))
            .collect();
        deps.push(Dependency::Stage(stage_name.to_string()));
        Ok(deps)
    }

    /// Compare the current graph with the deployment the stage serves.
    pub async fn plan(&self, api_id: &str, stage_name: &str) -> ReconcileResult<Plan> {
        let graph = self.control.load_graph(api_id).await?;
        self.plan_for(&graph, stage_name).await
    }

    /// Compare `graph`, which need not be stored yet, with the deployment
    /// the stage serves.
    pub async fn plan_for(&self, graph: &ApiGraph, stage_name: &str) -> ReconcileResult<Plan> {
        graph.validate()?;
        let api_id = graph.api.id.as_str();
        let bound = match self.control.describe_stage(api_id, stage_name).await {
            Ok(bound) => bound,
            // Not settled yet, so nothing is served.
            Err(ControlError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let bound_fingerprint = match &bound {
            Some(id) => Some(
                self.control
                    .describe_deployment(api_id, id)
                    .await?
                    .fingerprint,
            ),
            None => None,
        };
        Ok(Plan {
            fingerprint: graph.fingerprint(),
            bound,
            bound_fingerprint,
        })
    }

    /// Drive a pairing in response to a lifecycle event.
    pub async fn reconcile(
        &self,
        event: LifecycleEvent,
        api_id: &str,
        stage_name: &str,
        description: &str,
    ) -> ReconcileResult<ReconcileOutcome> {
        let slot = self.slot(api_id, stage_name).await;
        let mut state = match self.policy {
            ConflictPolicy::Queue => Arc::clone(&slot).lock_owned().await,
            ConflictPolicy::FailFast => Arc::clone(&slot).try_lock_owned().map_err(|_| {
                warn!(api = %api_id, stage = %stage_name, "reconcile already in flight");
                ReconcileError::ConflictingReconciliation {
                    api_id: api_id.to_string(),
                    stage_name: stage_name.to_string(),
                }
            })?,
        };

        debug!(api = %api_id, stage = %stage_name, %event, phase = ?state.phase, "reconcile");
        match event {
            LifecycleEvent::Delete => {
                state.phase = ReconcilePhase::Deleting;
                state.applied = None;
                self.release(api_id, stage_name, &slot).await;
                state.phase = ReconcilePhase::Absent;
                info!(api = %api_id, stage = %stage_name, "pairing released");
                Ok(ReconcileOutcome::Released)
            }
            LifecycleEvent::Create | LifecycleEvent::Update => {
                let prior = state.phase;
                let result = self.apply(&mut state, api_id, stage_name, description).await;
                if result.is_err() {
                    state.phase = prior;
                }
                result
            }
        }
    }

    async fn apply(
        &self,
        state: &mut PairingState,
        api_id: &str,
        stage_name: &str,
        description: &str,
    ) -> ReconcileResult<ReconcileOutcome> {
        // Everything that can be rejected up front is checked before the
        // first side effect.
        let endpoints = derive_endpoints(api_id, stage_name, &self.context)?;
        let graph = self.control.load_graph(api_id).await?;
        graph.validate()?;
        let graph_fingerprint = graph.fingerprint();

        let current = self.control.describe_stage(api_id, stage_name).await?;
        if state.applied.is_none() {
            state.applied = self.adopt(api_id, stage_name, current.as_deref()).await?;
        }

        if let Some((applied_fp, applied_id)) = &state.applied {
            if *applied_fp == graph_fingerprint
                && current.as_deref() == Some(applied_id.as_str())
            {
                state.phase = ReconcilePhase::Bound;
                debug!(
                    api = %api_id,
                    stage = %stage_name,
                    deployment = %applied_id,
                    fingerprint = %graph_fingerprint.short(),
                    "graph unchanged, keeping deployment"
                );
                return Ok(ReconcileOutcome::Unchanged(EndpointInfo {
                    deployment_id: applied_id.clone(),
                    fingerprint: graph_fingerprint,
                    endpoints,
                }));
            }
        }

        state.phase = if current.is_some() {
            ReconcilePhase::Updating
        } else {
            ReconcilePhase::Creating
        };

        let deployment_id = self
            .control
            .create_deployment(api_id, stage_name, description)
            .await?;
        // Record what the snapshot holds, not what was loaded above.
        let fingerprint = self
            .control
            .describe_deployment(api_id, &deployment_id)
            .await?
            .fingerprint;
        if fingerprint != graph_fingerprint {
            warn!(
                api = %api_id,
                stage = %stage_name,
                deployment = %deployment_id,
                loaded = %graph_fingerprint.short(),
                snapshot = %fingerprint.short(),
                "snapshot differs from the validated graph"
            );
        }

        if let Err(err) = self
            .control
            .bind_stage(api_id, stage_name, &deployment_id)
            .await
        {
            return Err(self.restore(api_id, stage_name, current.as_deref(), err).await);
        }

        state.applied = Some((fingerprint.clone(), deployment_id.clone()));
        state.phase = ReconcilePhase::Bound;
        info!(
            api = %api_id,
            stage = %stage_name,
            deployment = %deployment_id,
            fingerprint = %fingerprint.short(),
            previous = current.as_deref().unwrap_or("-"),
            "stage repointed"
        );
        Ok(ReconcileOutcome::Deployed(EndpointInfo {
            deployment_id,
            fingerprint,
            endpoints,
        }))
    }

    /// Take over a binding made by an earlier process, so an unchanged graph
    /// is recognised across restarts.
    async fn adopt(
        &self,
        api_id: &str,
        stage_name: &str,
        bound: Option<&str>,
    ) -> ReconcileResult<Option<(Fingerprint, DeploymentId)>> {
        let Some(id) = bound else {
            return Ok(None);
        };
        match self.control.describe_deployment(api_id, id).await {
            Ok(deployment) if deployment.stage_name == stage_name => {
                debug!(api = %api_id, stage = %stage_name, deployment = %id, "adopted binding");
                Ok(Some((deployment.fingerprint, deployment.id)))
            }
            Ok(_) | Err(ControlError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Put the prior binding back after a failed bind.
    async fn restore(
        &self,
        api_id: &str,
        stage_name: &str,
        prior: Option<&str>,
        err: ControlError,
    ) -> ReconcileError {
        let original = ReconcileError::from(err);
        warn!(api = %api_id, stage = %stage_name, error = %original, "bind failed");
        let Some(prior) = prior else {
            return original;
        };
        match self.control.bind_stage(api_id, stage_name, prior).await {
            Ok(_) => {
                info!(api = %api_id, stage = %stage_name, deployment = %prior, "prior binding restored");
                original
            }
            Err(restore) => {
                warn!(api = %api_id, stage = %stage_name, error = %restore, "restore failed");
                ReconcileError::BindRestoreFailed {
                    original: Box::new(original),
                    restore: Box::new(restore.into()),
                }
            }
        }
    }

    /// Drop the pairing's slot unless another caller is queued on it.
    /// Expects the caller to hold the slot's lock.
    async fn release(&self, api_id: &str, stage_name: &str, slot: &Arc<Mutex<PairingState>>) {
        let mut pairings = self.pairings.lock().await;
        let key = (api_id.to_string(), stage_name.to_string());
        let ours = pairings.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, slot));
        // The map entry, `slot` and the held guard.
        if ours && Arc::strong_count(slot) == 3 {
            pairings.remove(&key);
        }
    }

    async fn slot(&self, api_id: &str, stage_name: &str) -> Arc<Mutex<PairingState>> {
        let mut pairings = self.pairings.lock().await;
        pairings
            .entry((api_id.to_string(), stage_name.to_string()))
            .or_default()
            .clone()
    }
}
