//! redb table definitions for the wsgate state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Child keys are `{api_id}/{child}` so everything belonging to an
//! API can be found with a prefix scan.

use redb::TableDefinition;

/// Resource graphs keyed by `{api_id}`.
pub const GRAPHS: TableDefinition<&str, &[u8]> = TableDefinition::new("graphs");

/// Stage records keyed by `{api_id}/{stage_name}`.
pub const STAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("stages");

/// Deployment snapshots keyed by `{api_id}/{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Monotonic deployment sequence per API, keyed by `{api_id}`.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub fn child_key(api_id: &str, child: &str) -> String {
    format!("{api_id}/{child}")
}

pub fn child_prefix(api_id: &str) -> String {
    format!("{api_id}/")
}
