//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{group}/{name}`.

use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Node groups keyed by `{name}`.
pub const NODE_GROUPS: Table = TableDefinition::new("node_groups");

/// Managed nodes keyed by `{group}/{node_name}`.
pub const MANAGED_NODES: Table = TableDefinition::new("managed_nodes");

/// Pending rebalance opportunities keyed by `{group}/{opportunity_id}`.
pub const OPPORTUNITIES: Table = TableDefinition::new("opportunities");

/// Rebalance plans keyed by `{plan_id}`.
pub const PLANS: Table = TableDefinition::new("plans");

/// Execution checkpoints keyed by `{plan_id}`.
pub const EXECUTIONS: Table = TableDefinition::new("executions");

/// Leader leases keyed by `{lease_name}`.
pub const LEASES: Table = TableDefinition::new("leases");

/// Event log keyed by `{object}/{timestamp:020}-{seq:06}`.
pub const EVENTS: Table = TableDefinition::new("events");
