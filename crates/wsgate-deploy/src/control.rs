//! Seams between the reconciler and the systems it drives.
//!
//! `ControlSurface` creates deployments and moves stage pointers;
//! `GraphSource` supplies the current declarative graph. Both are
//! implemented for [`StateStore`].

use async_trait::async_trait;
use thiserror::Error;

use wsgate_core::{ApiGraph, Deployment, DeploymentId};
use wsgate_state::{StateError, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control surface unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<StateError> for ControlError {
    fn from(err: StateError) -> Self {
        match err {
            e if e.is_storage() => ControlError::Unavailable(e.to_string()),
            StateError::NotFound(what) => ControlError::NotFound(what),
            e => ControlError::Rejected(e.to_string()),
        }
    }
}

#[async_trait]
pub trait ControlSurface: Send + Sync {
    /// Snapshot the current graph of `api_id` for `stage_name`.
    async fn create_deployment(
        &self,
        api_id: &str,
        stage_name: &str,
        description: &str,
    ) -> ControlResult<DeploymentId>;

    /// Repoint a stage. Returns the previously bound deployment.
    async fn bind_stage(
        &self,
        api_id: &str,
        stage_name: &str,
        deployment_id: &str,
    ) -> ControlResult<Option<DeploymentId>>;

    /// The deployment a stage currently serves, if any.
    async fn describe_stage(
        &self,
        api_id: &str,
        stage_name: &str,
    ) -> ControlResult<Option<DeploymentId>>;

    async fn describe_deployment(
        &self,
        api_id: &str,
        deployment_id: &str,
    ) -> ControlResult<Deployment>;
}

#[async_trait]
pub trait GraphSource: Send + Sync {
    async fn load_graph(&self, api_id: &str) -> ControlResult<ApiGraph>;
}

#[async_trait]
impl ControlSurface for StateStore {
    async fn create_deployment(
        &self,
        api_id: &str,
        stage_name: &str,
        description: &str,
    ) -> ControlResult<DeploymentId> {
        Ok(StateStore::create_deployment(self, api_id, stage_name, description)?.id)
    }

    async fn bind_stage(
        &self,
        api_id: &str,
        stage_name: &str,
        deployment_id: &str,
    ) -> ControlResult<Option<DeploymentId>> {
        Ok(StateStore::bind_stage(self, api_id, stage_name, deployment_id)?)
    }

    async fn describe_stage(
        &self,
        api_id: &str,
        stage_name: &str,
    ) -> ControlResult<Option<DeploymentId>> {
        match self.get_stage(api_id, stage_name)? {
            Some(record) => Ok(record.deployment_id),
            None => Err(ControlError::NotFound(format!("stage {api_id}/{stage_name}"))),
        }
    }

    async fn describe_deployment(
        &self,
        api_id: &str,
        deployment_id: &str,
    ) -> ControlResult<Deployment> {
        self.get_deployment(api_id, deployment_id)?
            .ok_or_else(|| ControlError::NotFound(format!("deployment {api_id}/{deployment_id}")))
    }
}

#[async_trait]
impl GraphSource for StateStore {
    async fn load_graph(&self, api_id: &str) -> ControlResult<ApiGraph> {
        self.get_graph(api_id)?
            .ok_or_else(|| ControlError::NotFound(format!("api {api_id}")))
    }
}
