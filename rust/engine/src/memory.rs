//! In-process store: append-only tables behind one `RwLock`.
//!
//! `export`/`import` serialise every table to JSON, so a store can be
//! dropped and rebuilt and execution resumed from the same ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use parley_types::{Placeholder, ProcName, TypeKey, TypeName, TypeNode};
use serde::{Deserialize, Serialize};

use crate::coordinator::{self, CommitView, Mod};
use crate::env::{AliasDecl, ProcDecl};
use crate::error::{EngineResult, RepoError};
use crate::ids::{ChannelId, PoolId, ProcessId};
use crate::ledger::{
    current_binding, BindingEntry, HandOff, LiabilityRecord, PendingRecord, PollMark, ProcessRoot,
    Revision,
};
use crate::repository::{
    AliasRepo, BindingRepo, DeclRepo, HandOffRepo, PendingRepo, PoolRepo, PoolState, ProcessRepo,
    Store,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MemState {
    pools: BTreeMap<PoolId, PoolState>,
    processes: Vec<ProcessRoot>,
    bindings: Vec<BindingEntry>,
    pending: Vec<PendingRecord>,
    liabilities: Vec<LiabilityRecord>,
    hand_offs: Vec<HandOff>,
    polls: Vec<PollMark>,
    type_nodes: BTreeMap<TypeKey, TypeNode>,
    type_names: BTreeMap<TypeName, TypeKey>,
    proc_decls: BTreeMap<ProcName, ProcDecl>,
    proc_aliases: BTreeMap<ProcName, ProcName>,
    type_aliases: BTreeMap<TypeName, TypeName>,
}

impl CommitView for MemState {
    fn pool_revision(&self, pool_id: PoolId) -> Option<Revision> {
        self.pools.get(&pool_id).map(|pool| pool.revision)
    }

    fn pending_seq(&self, channel_id: ChannelId) -> u64 {
        self.pending
            .iter()
            .filter(|record| record.channel_id == channel_id)
            .map(|record| record.seq)
            .max()
            .unwrap_or(0)
    }

    fn has_process(&self, process_id: ProcessId) -> bool {
        self.processes.iter().any(|p| p.process_id == process_id)
    }

    fn type_name_taken(&self, name: &TypeName) -> bool {
        self.type_names.contains_key(name) || self.type_aliases.contains_key(name)
    }

    fn proc_name_taken(&self, name: &ProcName) -> bool {
        self.proc_decls.contains_key(name) || self.proc_aliases.contains_key(name)
    }
}

impl MemState {
    fn append(&mut self, changes: Mod) {
        for ticket in &changes.tickets {
            if let Some(pool) = self.pools.get_mut(&ticket.pool_id) {
                pool.revision += 1;
            }
        }
        for root in changes.pools {
            self.pools.insert(root.pool_id, PoolState { root, revision: 0 });
        }
        self.processes.extend(changes.processes);
        self.bindings.extend(changes.bindings);
        self.pending.extend(changes.pending);
        self.liabilities.extend(changes.liabilities);
        self.hand_offs.extend(changes.hand_offs);
        self.polls.extend(changes.polls);
        for (key, node) in changes.type_nodes {
            self.type_nodes.entry(key).or_insert(node);
        }
        self.type_names.extend(changes.type_names);
        for decl in changes.proc_decls {
            self.proc_decls.insert(decl.name.clone(), decl);
        }
        for alias in changes.aliases {
            match alias {
                AliasDecl::Proc { alias, target } => {
                    self.proc_aliases.insert(alias, target);
                }
                AliasDecl::Type { alias, target } => {
                    self.type_aliases.insert(alias, target);
                }
            }
        }
    }
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemStore {
    state: RwLock<MemState>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemState>, RepoError> {
        self.state.read().map_err(|_| RepoError::Poisoned("mem store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemState>, RepoError> {
        self.state.write().map_err(|_| RepoError::Poisoned("mem store"))
    }

    /// Serialise every table.
    ///
    /// # Errors
    ///
    /// `Poisoned` or `Codec`.
    pub fn export(&self) -> Result<String, RepoError> {
        let state = self.read()?;
        Ok(serde_json::to_string(&*state)?)
    }

    /// Rebuild a store from [`MemStore::export`] output.
    ///
    /// # Errors
    ///
    /// `Codec` if `json` is not an export.
    pub fn import(json: &str) -> Result<Self, RepoError> {
        let state: MemState = serde_json::from_str(json)?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Number of binding rows ever appended.
    ///
    /// # Errors
    ///
    /// `Poisoned`.
    pub fn ledger_len(&self) -> Result<usize, RepoError> {
        Ok(self.read()?.bindings.len())
    }
}

impl PoolRepo for MemStore {
    fn pools(&self, ids: &BTreeSet<PoolId>) -> Result<BTreeMap<PoolId, PoolState>, RepoError> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.pools.get(id).map(|pool| (*id, pool.clone())))
            .collect())
    }
}

impl ProcessRepo for MemStore {
    fn processes(&self, ids: &BTreeSet<ProcessId>) -> Result<BTreeMap<ProcessId, ProcessRoot>, RepoError> {
        let state = self.read()?;
        Ok(state
            .processes
            .iter()
            .filter(|p| ids.contains(&p.process_id))
            .map(|p| (p.process_id, p.clone()))
            .collect())
    }

    fn processes_in(&self, pool_id: PoolId) -> Result<Vec<ProcessRoot>, RepoError> {
        let state = self.read()?;
        Ok(state
            .processes
            .iter()
            .filter(|p| p.pool_id == pool_id)
            .cloned()
            .collect())
    }

    fn liabilities(
        &self,
        ids: &BTreeSet<ProcessId>,
    ) -> Result<BTreeMap<ProcessId, Vec<LiabilityRecord>>, RepoError> {
        let state = self.read()?;
        let mut out: BTreeMap<ProcessId, Vec<LiabilityRecord>> = BTreeMap::new();
        for record in state.liabilities.iter().filter(|r| ids.contains(&r.process_id)) {
            out.entry(record.process_id).or_default().push(record.clone());
        }
        Ok(out)
    }
}

impl BindingRepo for MemStore {
    fn live_bindings(
        &self,
        ids: &BTreeSet<ProcessId>,
    ) -> Result<BTreeMap<ProcessId, BTreeMap<Placeholder, BindingEntry>>, RepoError> {
        let state = self.read()?;
        let mut rows: BTreeMap<(ProcessId, &Placeholder), Vec<&BindingEntry>> = BTreeMap::new();
        for row in state.bindings.iter().filter(|r| ids.contains(&r.process_id)) {
            rows.entry((row.process_id, &row.placeholder)).or_default().push(row);
        }
        let mut out: BTreeMap<ProcessId, BTreeMap<Placeholder, BindingEntry>> = BTreeMap::new();
        for ((process_id, placeholder), history) in rows {
            if let Some(current) = current_binding(history) {
                out.entry(process_id)
                    .or_default()
                    .insert(placeholder.clone(), current.clone());
            }
        }
        Ok(out)
    }

    fn history(
        &self,
        process_id: ProcessId,
        placeholder: &Placeholder,
    ) -> Result<Vec<BindingEntry>, RepoError> {
        let state = self.read()?;
        Ok(state
            .bindings
            .iter()
            .filter(|r| r.process_id == process_id && &r.placeholder == placeholder)
            .cloned()
            .collect())
    }
}

impl PendingRepo for MemStore {
    fn latest_pending(
        &self,
        ids: &BTreeSet<ChannelId>,
    ) -> Result<BTreeMap<ChannelId, PendingRecord>, RepoError> {
        let state = self.read()?;
        let mut out: BTreeMap<ChannelId, PendingRecord> = BTreeMap::new();
        for record in state.pending.iter().filter(|r| ids.contains(&r.channel_id)) {
            let newer = out
                .get(&record.channel_id)
                .map_or(true, |current| record.seq > current.seq);
            if newer {
                out.insert(record.channel_id, record.clone());
            }
        }
        Ok(out)
    }
}

impl DeclRepo for MemStore {
    fn type_names(&self, names: &BTreeSet<TypeName>) -> Result<BTreeMap<TypeName, TypeKey>, RepoError> {
        let state = self.read()?;
        Ok(names
            .iter()
            .filter_map(|name| state.type_names.get(name).map(|key| (name.clone(), *key)))
            .collect())
    }

    fn type_nodes(&self, keys: &BTreeSet<TypeKey>) -> Result<BTreeMap<TypeKey, TypeNode>, RepoError> {
        let state = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|key| state.type_nodes.get(key).map(|node| (*key, node.clone())))
            .collect())
    }

    fn proc_decls(&self, names: &BTreeSet<ProcName>) -> Result<BTreeMap<ProcName, ProcDecl>, RepoError> {
        let state = self.read()?;
        Ok(names
            .iter()
            .filter_map(|name| state.proc_decls.get(name).map(|decl| (name.clone(), decl.clone())))
            .collect())
    }
}

impl AliasRepo for MemStore {
    fn proc_aliases(&self, names: &BTreeSet<ProcName>) -> Result<BTreeMap<ProcName, ProcName>, RepoError> {
        let state = self.read()?;
        Ok(names
            .iter()
            .filter_map(|name| state.proc_aliases.get(name).map(|t| (name.clone(), t.clone())))
            .collect())
    }

    fn type_aliases(&self, names: &BTreeSet<TypeName>) -> Result<BTreeMap<TypeName, TypeName>, RepoError> {
        let state = self.read()?;
        Ok(names
            .iter()
            .filter_map(|name| state.type_aliases.get(name).map(|t| (name.clone(), t.clone())))
            .collect())
    }
}

impl HandOffRepo for MemStore {
    fn hand_offs(&self, pool_id: PoolId) -> Result<Vec<HandOff>, RepoError> {
        let state = self.read()?;
        Ok(state
            .hand_offs
            .iter()
            .filter(|h| h.pool_id == pool_id)
            .cloned()
            .collect())
    }

    fn polled(&self, pool_id: PoolId) -> Result<BTreeSet<ProcessId>, RepoError> {
        let state = self.read()?;
        Ok(state
            .polls
            .iter()
            .filter(|m| m.pool_id == pool_id)
            .map(|m| m.process_id)
            .collect())
    }
}

impl Store for MemStore {
    fn apply(&self, changes: Mod) -> EngineResult<()> {
        let mut state = self.write()?;
        coordinator::verify(&*state, &changes)?;
        state.append(changes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConflictError, EngineError};
    use crate::ledger::{BindingEvent, PoolRoot, Role};
    use assert_matches::assert_matches;
    use parley_types::{key_of, SessionType};
    use uuid::Uuid;

    fn pool_id() -> PoolId {
        PoolId(Uuid::from_u128(1))
    }

    fn seeded() -> MemStore {
        let store = MemStore::new();
        let mut changes = Mod::default();
        changes.pools.push(PoolRoot {
            pool_id: pool_id(),
            title: "main".to_string(),
        });
        store.apply(changes).unwrap();
        store
    }

    fn row(event: BindingEvent) -> BindingEntry {
        BindingEntry {
            process_id: ProcessId(Uuid::from_u128(2)),
            placeholder: Placeholder::from_static("x"),
            channel_id: ChannelId(Uuid::from_u128(3)),
            role: Role::Provider,
            state: key_of(&SessionType::Unit),
            event,
        }
    }

    #[test]
    fn test_apply_bumps_ticketed_pool() {
        let store = seeded();
        let mut changes = Mod::default();
        changes.ticket(pool_id(), 0);
        changes.bindings.push(row(BindingEvent::Bound(1)));
        store.apply(changes).unwrap();

        let pools = store.pools(&BTreeSet::from([pool_id()])).unwrap();
        assert_eq!(pools[&pool_id()].revision, 1);
        let live = store.live_bindings(&BTreeSet::from([ProcessId(Uuid::from_u128(2))])).unwrap();
        assert_eq!(live.values().next().map(BTreeMap::len), Some(1));
    }

    #[test]
    fn test_rejected_apply_writes_nothing() {
        let store = seeded();
        let mut changes = Mod::default();
        changes.ticket(pool_id(), 4);
        changes.bindings.push(row(BindingEvent::Bound(5)));
        assert_matches!(
            store.apply(changes),
            Err(EngineError::Conflict(ConflictError::ConcurrentModification { .. }))
        );
        assert_eq!(store.ledger_len().unwrap(), 0);
    }

    #[test]
    fn test_consumed_binding_is_not_live() {
        let store = seeded();
        let bound = row(BindingEvent::Bound(1));
        let mut changes = Mod::default();
        changes.ticket(pool_id(), 0);
        changes.bindings.push(bound.clone());
        changes.bindings.push(bound.consumed());
        store.apply(changes).unwrap();
        let live = store.live_bindings(&BTreeSet::from([bound.process_id])).unwrap();
        assert!(live.is_empty());
        assert_eq!(store.history(bound.process_id, &bound.placeholder).unwrap().len(), 2);
    }

    #[test]
    fn test_export_import_round_trip() {
        let store = seeded();
        let mut changes = Mod::default();
        changes.ticket(pool_id(), 0);
        changes.bindings.push(row(BindingEvent::Bound(1)));
        store.apply(changes).unwrap();

        let restored = MemStore::import(&store.export().unwrap()).unwrap();
        assert_eq!(restored.ledger_len().unwrap(), 1);
        let pools = restored.pools(&BTreeSet::from([pool_id()])).unwrap();
        assert_eq!(pools[&pool_id()].revision, 1);
        assert_matches!(MemStore::import("{ not json"), Err(RepoError::Codec(_)));
    }
}
