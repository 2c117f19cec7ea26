//! wsgate-state — local control surface for wsgate.
//!
//! Backed by [redb](https://docs.rs/redb), stores the resource graph of each
//! API, its stages with their bound-deployment pointer, and the append-only
//! deployment snapshots.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Child records use `{api_id}/{name}` keys, so tearing down an API or a
//! stage is a prefix scan. Creating a deployment and moving a stage pointer
//! each happen inside a single write transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{StageRecord, StateStore, Teardown};
