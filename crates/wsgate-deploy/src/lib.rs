//! wsgate-deploy — deployment reconciliation for WebSocket gateways.
//!
//! # Components
//!
//! - **`control`**: the control-surface and graph-source traits, implemented
//!   for the redb-backed [`wsgate_state::StateStore`]
//! - **`reconciler`**: per-pairing state machine that snapshots the graph
//!   and repoints the stage
//! - **`settle`**: writes a declared `gateway.toml` into the store ahead of
//!   a reconcile
//!
//! # Failure handling
//!
//! Configuration errors surface before any side effect. A failed stage bind
//! restores the prior binding; if the restore fails too, both errors are
//! reported with the original first.

pub mod control;
pub mod error;
pub mod reconciler;
pub mod settle;

pub use control::{ControlError, ControlResult, ControlSurface, GraphSource};
pub use error::{ReconcileError, ReconcileErrorKind, ReconcileResult, SettleError, SettleResult};
pub use reconciler::{
    ConflictPolicy, Dependency, EndpointInfo, LifecycleEvent, Plan, ReconcileOutcome,
    ReconcilePhase, Reconciler,
};
pub use settle::{Settled, settle};
