//! Optimistic commit of step results.
//!
//! A step never writes directly. It returns a [`Mod`] bundling every row it
//! wants appended together with the revisions it read. [`commit`] hands the
//! bundle to the store, which re-checks those revisions with [`verify`] and
//! applies all rows in one critical section, or nothing at all. There are
//! no row locks and no retries: a caller that loses a race gets
//! `ConcurrentModification` and must recompute from a fresh snapshot.

use std::collections::BTreeSet;

use parley_types::{ProcName, TypeKey, TypeName, TypeNode};
use serde::{Deserialize, Serialize};

use crate::env::{AliasDecl, ProcDecl};
use crate::error::{ConflictError, EngineResult, RepoError};
use crate::ids::{ChannelId, PoolId, ProcessId};
use crate::ledger::{
    BindingEntry, HandOff, LiabilityRecord, PendingRecord, PollMark, PoolRoot, ProcessRoot, Revision,
};
use crate::repository::Store;

/// Pool revision a change was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockTicket {
    pub pool_id: PoolId,
    pub revision: Revision,
}

/// Latest pending sequence of a channel a change was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingGuard {
    pub channel_id: ChannelId,
    pub seq: u64,
}

/// Everything one step or declaration appends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mod {
    pub tickets: Vec<LockTicket>,
    pub pending_guards: Vec<PendingGuard>,
    pub pools: Vec<PoolRoot>,
    pub processes: Vec<ProcessRoot>,
    pub bindings: Vec<BindingEntry>,
    pub pending: Vec<PendingRecord>,
    pub liabilities: Vec<LiabilityRecord>,
    pub hand_offs: Vec<HandOff>,
    pub polls: Vec<PollMark>,
    pub type_nodes: Vec<(TypeKey, TypeNode)>,
    pub type_names: Vec<(TypeName, TypeKey)>,
    pub proc_decls: Vec<ProcDecl>,
    pub aliases: Vec<AliasDecl>,
}

impl Mod {
    /// Record a ticket for `pool_id`, once.
    pub fn ticket(&mut self, pool_id: PoolId, revision: Revision) {
        if !self.tickets.iter().any(|t| t.pool_id == pool_id) {
            self.tickets.push(LockTicket { pool_id, revision });
        }
    }

    /// Record a guard for `channel_id`, once.
    pub fn guard(&mut self, channel_id: ChannelId, seq: u64) {
        if !self.pending_guards.iter().any(|g| g.channel_id == channel_id) {
            self.pending_guards.push(PendingGuard { channel_id, seq });
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Mod::default()
    }
}

/// The committed state `verify` checks a [`Mod`] against.
pub trait CommitView {
    fn pool_revision(&self, pool_id: PoolId) -> Option<Revision>;
    /// Latest pending sequence of a channel, 0 if it never had one.
    fn pending_seq(&self, channel_id: ChannelId) -> u64;
    fn has_process(&self, process_id: ProcessId) -> bool;
    /// Declared or aliased.
    fn type_name_taken(&self, name: &TypeName) -> bool;
    /// Declared or aliased.
    fn proc_name_taken(&self, name: &ProcName) -> bool;
}

/// Re-check a change against committed state.
///
/// # Errors
///
/// `ConcurrentModification` for a stale ticket, `PendingConflict` for a
/// stale guard, `DuplicateDeclaration` or `DuplicateId` for taken names or
/// ids, `NotFound` for a ticket on an unknown pool.
pub fn verify(view: &impl CommitView, changes: &Mod) -> EngineResult<()> {
    for ticket in &changes.tickets {
        let got = view.pool_revision(ticket.pool_id).ok_or_else(|| RepoError::NotFound {
            entity: "pool",
            key: ticket.pool_id.to_string(),
        })?;
        if got != ticket.revision {
            return Err(ConflictError::ConcurrentModification {
                pool_id: ticket.pool_id,
                want: ticket.revision,
                got,
            }
            .into());
        }
    }
    for guard in &changes.pending_guards {
        let got = view.pending_seq(guard.channel_id);
        if got != guard.seq {
            return Err(ConflictError::PendingConflict {
                channel_id: guard.channel_id,
                want: guard.seq,
                got,
            }
            .into());
        }
    }
    for pool in &changes.pools {
        if view.pool_revision(pool.pool_id).is_some() {
            return Err(ConflictError::DuplicateId {
                kind: "pool",
                id: pool.pool_id.as_uuid(),
            }
            .into());
        }
    }
    for process in &changes.processes {
        if view.has_process(process.process_id) {
            return Err(ConflictError::DuplicateId {
                kind: "process",
                id: process.process_id.as_uuid(),
            }
            .into());
        }
    }

    let mut type_names: BTreeSet<&TypeName> = BTreeSet::new();
    let mut proc_names: BTreeSet<&ProcName> = BTreeSet::new();
    let declared_types = changes.type_names.iter().map(|(name, _)| name);
    let aliased_types = changes.aliases.iter().filter_map(|alias| match alias {
        AliasDecl::Type { alias, .. } => Some(alias),
        AliasDecl::Proc { .. } => None,
    });
    for name in declared_types.chain(aliased_types) {
        if view.type_name_taken(name) || !type_names.insert(name) {
            return Err(duplicate("type", name.as_str()));
        }
    }
    let declared_procs = changes.proc_decls.iter().map(|decl| &decl.name);
    let aliased_procs = changes.aliases.iter().filter_map(|alias| match alias {
        AliasDecl::Proc { alias, .. } => Some(alias),
        AliasDecl::Type { .. } => None,
    });
    for name in declared_procs.chain(aliased_procs) {
        if view.proc_name_taken(name) || !proc_names.insert(name) {
            return Err(duplicate("process", name.as_str()));
        }
    }
    Ok(())
}

fn duplicate(kind: &'static str, name: &str) -> crate::error::EngineError {
    ConflictError::DuplicateDeclaration {
        kind,
        name: name.to_string(),
    }
    .into()
}

/// Commit `changes` atomically.
///
/// # Errors
///
/// Whatever the store's verification rejects; the store is then unchanged.
pub fn commit<S: Store + ?Sized>(store: &S, changes: Mod) -> EngineResult<()> {
    tracing::trace!(
        tickets = changes.tickets.len(),
        bindings = changes.bindings.len(),
        pending = changes.pending.len(),
        "committing"
    );
    store.apply(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[derive(Default)]
    struct View {
        pools: BTreeMap<PoolId, Revision>,
        seqs: BTreeMap<ChannelId, u64>,
        types: BTreeSet<TypeName>,
    }

    impl CommitView for View {
        fn pool_revision(&self, pool_id: PoolId) -> Option<Revision> {
            self.pools.get(&pool_id).copied()
        }

        fn pending_seq(&self, channel_id: ChannelId) -> u64 {
            self.seqs.get(&channel_id).copied().unwrap_or(0)
        }

        fn has_process(&self, _process_id: ProcessId) -> bool {
            false
        }

        fn type_name_taken(&self, name: &TypeName) -> bool {
            self.types.contains(name)
        }

        fn proc_name_taken(&self, _name: &ProcName) -> bool {
            false
        }
    }

    fn pool(n: u128) -> PoolId {
        PoolId(Uuid::from_u128(n))
    }

    #[test]
    fn test_stale_ticket_is_rejected() {
        let mut view = View::default();
        view.pools.insert(pool(1), 3);
        let mut changes = Mod::default();
        changes.ticket(pool(1), 2);
        assert_matches!(
            verify(&view, &changes),
            Err(EngineError::Conflict(ConflictError::ConcurrentModification { want: 2, got: 3, .. }))
        );
        let mut fresh = Mod::default();
        fresh.ticket(pool(1), 3);
        assert!(verify(&view, &fresh).is_ok());
    }

    #[test]
    fn test_stale_guard_is_rejected() {
        let mut view = View::default();
        let channel = ChannelId(Uuid::from_u128(7));
        view.seqs.insert(channel, 1);
        let mut changes = Mod::default();
        changes.guard(channel, 0);
        assert_matches!(
            verify(&view, &changes),
            Err(EngineError::Conflict(ConflictError::PendingConflict { want: 0, got: 1, .. }))
        );
    }

    #[test]
    fn test_tickets_are_recorded_once() {
        let mut changes = Mod::default();
        changes.ticket(pool(1), 0);
        changes.ticket(pool(1), 0);
        changes.ticket(pool(2), 5);
        assert_eq!(changes.tickets.len(), 2);
    }

    #[test]
    fn test_duplicate_type_name() {
        let mut view = View::default();
        view.types.insert(TypeName::from_static("T"));
        let mut changes = Mod::default();
        changes
            .type_names
            .push((TypeName::from_static("T"), TypeKey::from_bytes(b"t")));
        assert_matches!(
            verify(&view, &changes),
            Err(EngineError::Conflict(ConflictError::DuplicateDeclaration { kind: "type", .. }))
        );
    }

    #[test]
    fn test_unknown_pool_ticket() {
        let mut changes = Mod::default();
        changes.ticket(pool(9), 0);
        assert_matches!(
            verify(&View::default(), &changes),
            Err(EngineError::Repo(RepoError::NotFound { entity: "pool", .. }))
        );
    }
}
