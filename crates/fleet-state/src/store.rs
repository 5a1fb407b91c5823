//! StateStore — redb-backed persistence for the fleet controller.
//!
//! Provides typed CRUD operations over node groups, managed nodes,
//! opportunities, plans, executions, leases, and events. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports both
//! on-disk and in-memory backends (the latter for testing).
//!
//! Writes of versioned records are compare-and-swap inside a single write
//! transaction: the stored version must equal the caller's copy.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::error::{StateError, StateResult};
use crate::events::{Event, EventKind};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Events kept per object before the oldest are pruned.
const MAX_EVENTS_PER_OBJECT: usize = 256;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            NODE_GROUPS,
            MANAGED_NODES,
            OPPORTUNITIES,
            PLANS,
            EXECUTIONS,
            LEASES,
            EVENTS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn get_record<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Insert a new record at version 1.
    fn create_record<T: Versioned + Serialize>(&self, table: Table, record: &mut T) -> StateResult<()> {
        let key = record.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            if t.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            record.set_version(1);
            let value = serde_json::to_vec(&*record).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "record created");
        Ok(())
    }

    /// Compare-and-swap update; bumps the record's version on success.
    fn update_record<T: Versioned + Serialize + DeserializeOwned>(
        &self,
        table: Table,
        record: &mut T,
    ) -> StateResult<()> {
        let key = record.table_key();
        let expected = record.version();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let stored: Option<T> = match t.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let Some(stored) = stored else {
                return Err(StateError::NotFound(key));
            };
            if stored.version() != expected {
                return Err(StateError::Conflict {
                    key,
                    expected,
                    found: stored.version(),
                });
            }
            record.set_version(expected + 1);
            let value = serde_json::to_vec(&*record).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_record(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "record deleted");
        Ok(existed)
    }

    // ── Node groups ────────────────────────────────────────────────

    pub fn create_group(&self, group: &mut NodeGroup) -> StateResult<()> {
        self.create_record(NODE_GROUPS, group)
    }

    pub fn update_group(&self, group: &mut NodeGroup) -> StateResult<()> {
        self.update_record(NODE_GROUPS, group)
    }

    /// Create a group or replace the spec of an existing one, keeping its
    /// status. Used by the admission path.
    pub fn apply_group_spec(&self, spec: NodeGroupSpec, now: u64) -> StateResult<NodeGroup> {
        let key = spec.name.clone();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let group;
        {
            let mut t = txn.open_table(NODE_GROUPS).map_err(map_err!(Table))?;
            let existing: Option<NodeGroup> = match t.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            group = match existing {
                Some(mut g) => {
                    g.spec = spec;
                    g.updated_at = now;
                    g.version += 1;
                    g
                }
                None => {
                    let mut g = NodeGroup::new(spec, now);
                    g.version = 1;
                    g
                }
            };
            let value = serde_json::to_vec(&group).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = group.version, "node group spec applied");
        Ok(group)
    }

    pub fn get_group(&self, name: &str) -> StateResult<Option<NodeGroup>> {
        self.get_record(NODE_GROUPS, name)
    }

    pub fn list_groups(&self) -> StateResult<Vec<NodeGroup>> {
        self.list_records(NODE_GROUPS, "")
    }

    pub fn delete_group(&self, name: &str) -> StateResult<bool> {
        self.delete_record(NODE_GROUPS, name)
    }

    // ── Managed nodes ──────────────────────────────────────────────

    pub fn create_node(&self, node: &mut ManagedNode) -> StateResult<()> {
        self.create_record(MANAGED_NODES, node)
    }

    pub fn update_node(&self, node: &mut ManagedNode) -> StateResult<()> {
        self.update_record(MANAGED_NODES, node)
    }

    pub fn get_node(&self, group: &str, name: &str) -> StateResult<Option<ManagedNode>> {
        self.get_record(MANAGED_NODES, &format!("{group}/{name}"))
    }

    /// List all managed nodes belonging to a group.
    pub fn list_nodes(&self, group: &str) -> StateResult<Vec<ManagedNode>> {
        self.list_records(MANAGED_NODES, &format!("{group}/"))
    }

    pub fn delete_node(&self, group: &str, name: &str) -> StateResult<bool> {
        self.delete_record(MANAGED_NODES, &format!("{group}/{name}"))
    }

    // ── Opportunities ──────────────────────────────────────────────

    pub fn create_opportunity(&self, opportunity: &mut Opportunity) -> StateResult<()> {
        self.create_record(OPPORTUNITIES, opportunity)
    }

    /// Opportunities for a group, oldest first.
    pub fn list_opportunities(&self, group: &str) -> StateResult<Vec<Opportunity>> {
        let mut all: Vec<Opportunity> = self.list_records(OPPORTUNITIES, &format!("{group}/"))?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub fn delete_opportunity(&self, group: &str, id: &str) -> StateResult<bool> {
        self.delete_record(OPPORTUNITIES, &format!("{group}/{id}"))
    }

    // ── Plans and executions ───────────────────────────────────────

    pub fn create_plan(&self, plan: &mut RebalancePlan) -> StateResult<()> {
        self.create_record(PLANS, plan)
    }

    pub fn get_plan(&self, id: &str) -> StateResult<Option<RebalancePlan>> {
        self.get_record(PLANS, id)
    }

    /// Insert a new execution checkpoint, refusing if the group already has a
    /// non-terminal execution.
    pub fn start_execution(&self, exec: &mut ExecutionState) -> StateResult<()> {
        let key = exec.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            let mut active = None;
            for entry in t.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let other: ExecutionState =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if other.group == exec.group && !other.status.is_terminal() {
                    active = Some(other.plan_id);
                    break;
                }
            }
            if let Some(plan_id) = active {
                return Err(StateError::ExecutionActive {
                    group: exec.group.clone(),
                    plan_id,
                });
            }
            if t.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            exec.version = 1;
            let value = serde_json::to_vec(&*exec).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = %exec.plan_id, group = %exec.group, "execution started");
        Ok(())
    }

    pub fn update_execution(&self, exec: &mut ExecutionState) -> StateResult<()> {
        self.update_record(EXECUTIONS, exec)
    }

    pub fn get_execution(&self, plan_id: &str) -> StateResult<Option<ExecutionState>> {
        self.get_record(EXECUTIONS, plan_id)
    }

    /// The non-terminal execution for a group, if any.
    pub fn active_execution(&self, group: &str) -> StateResult<Option<ExecutionState>> {
        let all: Vec<ExecutionState> = self.list_records(EXECUTIONS, "")?;
        Ok(all
            .into_iter()
            .find(|e| e.group == group && !e.status.is_terminal()))
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn get_lease(&self, name: &str) -> StateResult<Option<Lease>> {
        self.get_record(LEASES, name)
    }

    /// Acquire or renew a lease for `holder` in one write transaction.
    ///
    /// Returns the lease as stored; `holder` owns it iff
    /// `lease.holder == holder`.
    pub fn acquire_lease(&self, name: &str, holder: &str, ttl_secs: u64, now: u64) -> StateResult<Lease> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let lease;
        {
            let mut t = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match t.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            lease = match current {
                Some(l) if l.holder == holder => Lease {
                    renewed_at: now,
                    ttl_secs,
                    version: l.version + 1,
                    ..l
                },
                Some(l) if !l.is_expired(now) => return Ok(l),
                previous => Lease {
                    name: name.to_string(),
                    holder: holder.to_string(),
                    acquired_at: now,
                    renewed_at: now,
                    ttl_secs,
                    version: previous.map(|p| p.version + 1).unwrap_or(1),
                },
            };
            let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
            t.insert(name, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(lease)
    }

    /// Release a lease if `holder` owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<bool> {
        match self.get_lease(name)? {
            Some(l) if l.holder == holder => self.delete_record(LEASES, name),
            _ => Ok(false),
        }
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event, pruning the object's oldest events past the cap.
    pub fn record_event(&self, event: &Event) -> StateResult<()> {
        let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let prefix = format!("{}/", event.object);
        let key = format!("{prefix}{:020}-{seq:06}", event.at);
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            t.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let keys: Vec<String> = t
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (k, _) = entry.ok()?;
                    let k = k.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            if keys.len() > MAX_EVENTS_PER_OBJECT {
                for old in &keys[..keys.len() - MAX_EVENTS_PER_OBJECT] {
                    t.remove(old.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Record an event and mirror it to the log. A failed write is logged
    /// rather than returned so that emitting never aborts a reconcile.
    pub fn emit(&self, event: Event) {
        match event.kind {
            EventKind::Warning => {
                warn!(object = %event.object, reason = %event.reason, "{}", event.message)
            }
            EventKind::Normal => {
                info!(object = %event.object, reason = %event.reason, "{}", event.message)
            }
        }
        if let Err(e) = self.record_event(&event) {
            error!(object = %event.object, reason = %event.reason, error = %e, "failed to record event");
        }
    }

    /// Most recent events for an object, oldest first.
    pub fn list_events(&self, object: &str, limit: usize) -> StateResult<Vec<Event>> {
        let events: Vec<Event> = self.list_records(EVENTS, &format!("{object}/"))?;
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReason;
    use std::collections::HashMap;

    fn test_spec(name: &str) -> NodeGroupSpec {
        NodeGroupSpec {
            name: name.to_string(),
            datacenter_id: "dc-1".to_string(),
            image_id: "img-1".to_string(),
            offering_ids: vec!["small".to_string(), "medium".to_string()],
            min_nodes: 1,
            max_nodes: 10,
            scale_up: ScaleUpPolicy::default(),
            scale_down: ScaleDownPolicy::default(),
            rebalancing: RebalancePolicy::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    fn test_plan(id: &str, group: &str) -> RebalancePlan {
        RebalancePlan {
            id: id.to_string(),
            group: group.to_string(),
            opportunity: Opportunity {
                id: "opp-1".to_string(),
                group: group.to_string(),
                target_offering_id: "medium".to_string(),
                node_names: vec![],
                estimated_savings_percent: 20.0,
                estimated_monthly_savings: 0.0,
                performance_delta_percent: 0.0,
                created_at: 1000,
                expires_at: None,
                version: 0,
            },
            batches: vec![],
            strategy: RebalanceStrategy::Rolling,
            max_concurrent: 1,
            max_disrupted: 1,
            rollback: RollbackPlan::default(),
            estimated_duration_secs: 0,
            created_at: 1000,
            version: 0,
        }
    }

    // ── Versioned writes ───────────────────────────────────────────

    #[test]
    fn create_sets_version_and_rejects_duplicates() {
        let store = StateStore::open_in_memory().unwrap();
        let mut group = NodeGroup::new(test_spec("web"), 1000);

        store.create_group(&mut group).unwrap();
        assert_eq!(group.version, 1);

        let mut again = NodeGroup::new(test_spec("web"), 1000);
        assert!(matches!(
            store.create_group(&mut again),
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn stale_update_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let mut group = NodeGroup::new(test_spec("web"), 1000);
        store.create_group(&mut group).unwrap();

        let mut a = store.get_group("web").unwrap().unwrap();
        let mut b = store.get_group("web").unwrap().unwrap();

        a.status.desired_nodes = 3;
        store.update_group(&mut a).unwrap();
        assert_eq!(a.version, 2);

        b.status.desired_nodes = 7;
        let err = store.update_group(&mut b).unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get_group("web").unwrap().unwrap();
        assert_eq!(stored.status.desired_nodes, 3);
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let mut group = NodeGroup::new(test_spec("ghost"), 1000);
        group.version = 1;
        assert!(matches!(
            store.update_group(&mut group),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn apply_spec_preserves_status() {
        let store = StateStore::open_in_memory().unwrap();
        let mut group = store.apply_group_spec(test_spec("web"), 1000).unwrap();
        group.status.last_scale_up_time = 900;
        store.update_group(&mut group).unwrap();

        let mut spec = test_spec("web");
        spec.max_nodes = 20;
        let updated = store.apply_group_spec(spec, 2000).unwrap();

        assert_eq!(updated.spec.max_nodes, 20);
        assert_eq!(updated.status.last_scale_up_time, 900);
        assert_eq!(updated.version, group.version + 1);
    }

    // ── Nodes ──────────────────────────────────────────────────────

    #[test]
    fn nodes_are_scoped_by_group() {
        let store = StateStore::open_in_memory().unwrap();
        for (group, name) in [("web", "web-a"), ("web", "web-b"), ("db", "db-a")] {
            let mut node = ManagedNode::pending(name, group, "small", NodeOwner::Scaling, 1000);
            store.create_node(&mut node).unwrap();
        }

        assert_eq!(store.list_nodes("web").unwrap().len(), 2);
        assert_eq!(store.list_nodes("db").unwrap().len(), 1);
        assert!(store.get_node("web", "web-a").unwrap().is_some());
        assert!(store.delete_node("web", "web-a").unwrap());
        assert!(store.get_node("web", "web-a").unwrap().is_none());
    }

    // ── Executions ─────────────────────────────────────────────────

    #[test]
    fn only_one_active_execution_per_group() {
        let store = StateStore::open_in_memory().unwrap();

        let mut first = ExecutionState::new(&test_plan("p1", "web"));
        store.start_execution(&mut first).unwrap();

        let mut second = ExecutionState::new(&test_plan("p2", "web"));
        assert!(matches!(
            store.start_execution(&mut second),
            Err(StateError::ExecutionActive { .. })
        ));

        // Another group is unaffected.
        let mut other = ExecutionState::new(&test_plan("p3", "db"));
        store.start_execution(&mut other).unwrap();

        // Once the first finishes, a new one may start.
        first.status = ExecutionStatus::Succeeded;
        store.update_execution(&mut first).unwrap();
        store.start_execution(&mut second).unwrap();

        assert_eq!(
            store.active_execution("web").unwrap().unwrap().plan_id,
            "p2"
        );
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn lease_acquire_renew_and_takeover() {
        let store = StateStore::open_in_memory().unwrap();

        let l = store.acquire_lease("leader", "a", 15, 1000).unwrap();
        assert_eq!(l.holder, "a");

        // b cannot take a live lease.
        let l = store.acquire_lease("leader", "b", 15, 1005).unwrap();
        assert_eq!(l.holder, "a");

        // a renews.
        let l = store.acquire_lease("leader", "a", 15, 1010).unwrap();
        assert_eq!(l.renewed_at, 1010);

        // b takes over after expiry.
        let l = store.acquire_lease("leader", "b", 15, 1030).unwrap();
        assert_eq!(l.holder, "b");
        assert_eq!(l.acquired_at, 1030);

        assert!(!store.release_lease("leader", "a").unwrap());
        assert!(store.release_lease("leader", "b").unwrap());
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_are_pruned_per_object() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..(MAX_EVENTS_PER_OBJECT as u64 + 10) {
            store
                .record_event(&Event::new("nodegroup/web", EventReason::ScalingUp, format!("#{i}"), 1000 + i))
                .unwrap();
        }
        store
            .record_event(&Event::new("nodegroup/db", EventReason::ScalingDown, "x", 5000))
            .unwrap();

        let web = store.list_events("nodegroup/web", usize::MAX).unwrap();
        assert_eq!(web.len(), MAX_EVENTS_PER_OBJECT);
        assert_eq!(web.last().unwrap().message, format!("#{}", MAX_EVENTS_PER_OBJECT + 9));

        let recent = store.list_events("nodegroup/web", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(store.list_events("nodegroup/db", 10).unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let mut exec = ExecutionState::new(&test_plan("p1", "web"));
            store.start_execution(&mut exec).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let exec = store.active_execution("web").unwrap();
        assert_eq!(exec.unwrap().plan_id, "p1");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_groups().unwrap().is_empty());
        assert!(store.list_nodes("any").unwrap().is_empty());
        assert!(store.list_opportunities("any").unwrap().is_empty());
        assert!(store.active_execution("any").unwrap().is_none());
        assert!(!store.delete_group("nope").unwrap());
        assert!(!store.delete_node("nope", "nope").unwrap());
    }
}
