//! Storage ports and the transaction operator.
//!
//! One trait per entity family. Lookups are batched by key set and return
//! only the entries found; callers decide whether absence is an error.
//! Writes go exclusively through [`Store::apply`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parley_types::{Placeholder, ProcName, TypeKey, TypeName, TypeNode};

use crate::coordinator::{self, Mod};
use crate::env::ProcDecl;
use crate::error::{EngineResult, RepoError};
use crate::ids::{ChannelId, PoolId, ProcessId};
use crate::ledger::{BindingEntry, HandOff, LiabilityRecord, PendingRecord, PoolRoot, ProcessRoot, Revision};

/// A pool and its current revision.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolState {
    pub root: PoolRoot,
    pub revision: Revision,
}

pub trait PoolRepo {
    fn pools(&self, ids: &BTreeSet<PoolId>) -> Result<BTreeMap<PoolId, PoolState>, RepoError>;
}

pub trait ProcessRepo {
    fn processes(&self, ids: &BTreeSet<ProcessId>) -> Result<BTreeMap<ProcessId, ProcessRoot>, RepoError>;

    /// Processes of a pool in creation order.
    fn processes_in(&self, pool_id: PoolId) -> Result<Vec<ProcessRoot>, RepoError>;

    fn liabilities(
        &self,
        ids: &BTreeSet<ProcessId>,
    ) -> Result<BTreeMap<ProcessId, Vec<LiabilityRecord>>, RepoError>;
}

pub trait BindingRepo {
    /// Live bindings of each process, by placeholder.
    fn live_bindings(
        &self,
        ids: &BTreeSet<ProcessId>,
    ) -> Result<BTreeMap<ProcessId, BTreeMap<Placeholder, BindingEntry>>, RepoError>;

    /// Every row ever written for one pair, in append order.
    fn history(
        &self,
        process_id: ProcessId,
        placeholder: &Placeholder,
    ) -> Result<Vec<BindingEntry>, RepoError>;
}

pub trait PendingRepo {
    /// Latest record of each channel that has one.
    fn latest_pending(
        &self,
        ids: &BTreeSet<ChannelId>,
    ) -> Result<BTreeMap<ChannelId, PendingRecord>, RepoError>;
}

pub trait DeclRepo {
    fn type_names(&self, names: &BTreeSet<TypeName>) -> Result<BTreeMap<TypeName, TypeKey>, RepoError>;

    fn type_nodes(&self, keys: &BTreeSet<TypeKey>) -> Result<BTreeMap<TypeKey, TypeNode>, RepoError>;

    fn proc_decls(&self, names: &BTreeSet<ProcName>) -> Result<BTreeMap<ProcName, ProcDecl>, RepoError>;
}

/// Qualified synonyms resolved to canonical names.
pub trait AliasRepo {
    fn proc_aliases(&self, names: &BTreeSet<ProcName>) -> Result<BTreeMap<ProcName, ProcName>, RepoError>;

    fn type_aliases(&self, names: &BTreeSet<TypeName>) -> Result<BTreeMap<TypeName, TypeName>, RepoError>;
}

pub trait HandOffRepo {
    /// Hand-offs of a pool in spawn order.
    fn hand_offs(&self, pool_id: PoolId) -> Result<Vec<HandOff>, RepoError>;

    /// Processes of a pool already returned by `poll`.
    fn polled(&self, pool_id: PoolId) -> Result<BTreeSet<ProcessId>, RepoError>;
}

/// All ports plus the single write path.
pub trait Store:
    PoolRepo + ProcessRepo + BindingRepo + PendingRepo + DeclRepo + AliasRepo + HandOffRepo + Send + Sync
{
    /// Verify `changes` against committed state and append every row, in
    /// one critical section.
    ///
    /// # Errors
    ///
    /// A conflict from [`coordinator::verify`] or a storage failure. On
    /// error nothing is written.
    fn apply(&self, changes: Mod) -> EngineResult<()>;
}

/// Transaction scopes over a store.
pub trait Operator {
    type Store: Store;

    /// Read-only scope.
    ///
    /// # Errors
    ///
    /// Whatever `body` returns.
    fn implicit<T, F>(&self, body: F) -> EngineResult<T>
    where
        F: FnOnce(&Self::Store) -> EngineResult<T>;

    /// Read-write scope with exactly one commit point: `body` reads and
    /// returns its changes, which are committed once it returns.
    ///
    /// # Errors
    ///
    /// Whatever `body` returns, or the commit's rejection.
    fn explicit<T, F>(&self, body: F) -> EngineResult<T>
    where
        F: FnOnce(&Self::Store) -> EngineResult<(T, Mod)>;
}

/// [`Operator`] over a shared store.
#[derive(Debug)]
pub struct Transactor<S> {
    store: Arc<S>,
}

impl<S> Transactor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S> Clone for Transactor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> Operator for Transactor<S> {
    type Store = S;

    fn implicit<T, F>(&self, body: F) -> EngineResult<T>
    where
        F: FnOnce(&S) -> EngineResult<T>,
    {
        body(&self.store)
    }

    fn explicit<T, F>(&self, body: F) -> EngineResult<T>
    where
        F: FnOnce(&S) -> EngineResult<(T, Mod)>,
    {
        let (value, changes) = body(&self.store)?;
        coordinator::commit(&*self.store, changes)?;
        Ok(value)
    }
}
