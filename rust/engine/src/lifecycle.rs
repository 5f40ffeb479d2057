//! Pool and process lifecycle, and the step loop.
//!
//! [`Lifecycle::run`] is the only place steps are taken. Each iteration
//! reads a fresh snapshot, collects the environment, checks the term, takes
//! the step and commits it in its own transaction. When the step produced a
//! continuation the loop follows it, possibly on another process, until a
//! half-step ends the chain.

use std::collections::{BTreeMap, BTreeSet};

use parley_types::{ProcName, SessionType, TermKind, TypeKey, TypeModelError, TypeName, TypeStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checker::{check, check_declaration};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::coordinator::Mod;
use crate::env::{collect_decl_env, collect_env, find_proc, load_types, AliasDecl, Env, ProcDeclSpec};
use crate::error::{BindingError, EngineError, EngineResult, RepoError, TypeError};
use crate::ids::{ChannelId, IdSource, PoolId, ProcessId, RandomIds};
use crate::ledger::{
    open_liability, BindingEntry, BindingEvent, HandOff, LiabilityEvent, LiabilityRecord, PollMark,
    PoolRoot, ProcessRoot, Revision, Role,
};
use crate::repository::{
    BindingRepo, DeclRepo, HandOffRepo, Operator, PendingRepo, PoolRepo, ProcessRepo, Store,
};
use crate::snapshot::{BindingView, PoolSnapshot, ProcessSnapshot, ProcessSummary, Snapshot};
use crate::step::{take_step, Step, StepEvent, StepSnapshot, StepSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRef {
    pub pool_id: PoolId,
    pub title: String,
}

/// A process and the channel it provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pool_id: PoolId,
    pub process_id: ProcessId,
    pub proc_name: ProcName,
    pub channel_id: ChannelId,
}

/// Steps committed by one [`Lifecycle::run`] call, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub steps: Vec<StepEvent>,
}

impl RunReport {
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&StepEvent> {
        self.steps.last()
    }
}

/// Entry point for declaring, spawning and running processes.
pub struct Lifecycle<O> {
    operator: O,
    config: EngineConfig,
    ids: Box<dyn IdSource>,
}

impl<O: Operator> Lifecycle<O> {
    pub fn new(operator: O, config: EngineConfig) -> Self {
        Self {
            operator,
            config,
            ids: Box::new(RandomIds),
        }
    }

    /// Replace the identifier source.
    #[must_use]
    pub fn with_ids(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a named session type.
    ///
    /// # Errors
    ///
    /// `EmptyChoice` for a choice without arms, `DuplicateDeclaration` for
    /// a taken name.
    pub fn declare_type(&self, name: TypeName, ty: &SessionType) -> EngineResult<TypeKey> {
        if !ty.well_formed() {
            return Err(TypeModelError::EmptyChoice.into());
        }
        let mut types = TypeStore::new();
        let key = types.intern(ty);
        self.operator.explicit(|_| {
            let mut changes = Mod::default();
            changes.type_nodes = nodes_of(&types);
            changes.type_names.push((name, key));
            Ok((key, changes))
        })
    }

    /// Register a process declaration, checking its body unless disabled.
    ///
    /// # Errors
    ///
    /// A binding or type error from the body, or `DuplicateDeclaration`.
    pub fn declare_process(&self, spec: ProcDeclSpec) -> EngineResult<ProcName> {
        if !spec.session_types().all(SessionType::well_formed) {
            return Err(TypeModelError::EmptyChoice.into());
        }
        let mut types = TypeStore::new();
        let decl = spec.intern(&mut types);
        let check_body = self.config.check_declarations;
        self.operator.explicit(move |store| {
            let mut changes = Mod::default();
            changes.type_nodes = nodes_of(&types);
            if check_body {
                let env = collect_decl_env(store, &decl, types)?;
                check_declaration(&env, &decl)?;
            }
            let name = decl.name.clone();
            changes.proc_decls.push(decl);
            Ok((name, changes))
        })
    }

    /// Register a qualified synonym for a declared process or type.
    ///
    /// # Errors
    ///
    /// `UnknownProcName`/`UnknownTypeName` for an undeclared target, or
    /// `DuplicateDeclaration` for a taken alias.
    pub fn declare_alias(&self, alias: AliasDecl) -> EngineResult<()> {
        self.operator.explicit(|store| {
            match &alias {
                AliasDecl::Proc { target, .. } => {
                    let found = store.proc_decls(&BTreeSet::from([target.clone()]))?;
                    if found.is_empty() {
                        return Err(BindingError::UnknownProcName(target.clone()).into());
                    }
                }
                AliasDecl::Type { target, .. } => {
                    let found = store.type_names(&BTreeSet::from([target.clone()]))?;
                    if found.is_empty() {
                        return Err(BindingError::UnknownTypeName(target.clone()).into());
                    }
                }
            }
            let mut changes = Mod::default();
            changes.aliases.push(alias);
            Ok(((), changes))
        })
    }

    /// # Errors
    ///
    /// A storage failure.
    pub fn spawn_pool(&self, title: impl Into<String>) -> EngineResult<PoolRef> {
        let pool = PoolRoot {
            pool_id: PoolId(self.ids.fresh()),
            title: title.into(),
        };
        self.operator.explicit(|_| {
            let out = PoolRef {
                pool_id: pool.pool_id,
                title: pool.title.clone(),
            };
            let mut changes = Mod::default();
            changes.pools.push(pool);
            Ok((out, changes))
        })
    }

    /// Create a root process of a parameterless declaration. Only the
    /// provider side of its channel is bound; the returned [`ProcessRef`]
    /// carries the channel id.
    ///
    /// # Errors
    ///
    /// `UnknownPool`, `UnknownProcName`, `ArityMismatch` for a declaration
    /// with parameters, or a conflict with a concurrent writer.
    pub fn spawn_sub(&self, pool_id: PoolId, proc_name: &ProcName) -> EngineResult<ProcessRef> {
        self.operator.explicit(|store| {
            let pool = store
                .pools(&BTreeSet::from([pool_id]))?
                .remove(&pool_id)
                .ok_or(BindingError::UnknownPool(pool_id))?;
            let decl = find_proc(store, proc_name)?;
            if !decl.params.is_empty() {
                return Err(TypeError::ArityMismatch {
                    proc_name: decl.name,
                    want: decl.params.len(),
                    got: 0,
                }
                .into());
            }
            let process_id = ProcessId(self.ids.fresh());
            let channel_id = ChannelId(self.ids.fresh());
            let revision = pool.revision + 1;

            let mut changes = Mod::default();
            changes.ticket(pool_id, pool.revision);
            changes.processes.push(ProcessRoot {
                process_id,
                pool_id,
                proc_name: decl.name.clone(),
                parent: None,
            });
            changes.liabilities.push(LiabilityRecord {
                pool_id,
                process_id,
                event: LiabilityEvent::Created(revision),
            });
            let (provider, state) = decl.provider;
            changes.bindings.push(BindingEntry {
                process_id,
                placeholder: provider,
                channel_id,
                role: Role::Provider,
                state,
                event: BindingEvent::Bound(revision),
            });
            changes.hand_offs.push(HandOff {
                pool_id,
                process_id,
            });
            tracing::debug!(%pool_id, %process_id, proc_name = %decl.name, "root process spawned");
            let out = ProcessRef {
                pool_id,
                process_id,
                proc_name: decl.name,
                channel_id,
            };
            Ok((out, changes))
        })
    }

    /// Run a process's declared body.
    ///
    /// # Errors
    ///
    /// `UnknownProcess`, or whatever [`Lifecycle::run`] returns.
    pub fn start(&self, process_id: ProcessId) -> EngineResult<RunReport> {
        let spec = self.operator.implicit(|store| {
            let root = store
                .processes(&BTreeSet::from([process_id]))?
                .remove(&process_id)
                .ok_or(BindingError::UnknownProcess(process_id))?;
            let decl = find_proc(store, &root.proc_name)?;
            Ok(StepSpec {
                pool_id: root.pool_id,
                process_id,
                term: decl.body,
            })
        })?;
        self.run(spec)
    }

    /// Compute one step without committing it.
    ///
    /// # Errors
    ///
    /// Any binding, type or protocol error of the step.
    pub fn plan(&self, spec: &StepSpec) -> EngineResult<Step> {
        self.operator.implicit(|store| self.prepare(store, spec))
    }

    /// Commit changes computed earlier, typically by [`Lifecycle::plan`].
    ///
    /// # Errors
    ///
    /// `ConcurrentModification` or `PendingConflict` if the state they were
    /// computed from has moved on.
    pub fn commit(&self, changes: Mod) -> EngineResult<()> {
        self.operator.explicit(|_| Ok(((), changes)))
    }

    /// Take `spec` and every continuation it produces.
    ///
    /// Each step commits on its own. A failure part-way returns the error
    /// and leaves the earlier steps committed.
    ///
    /// # Errors
    ///
    /// The first failing step's error, or `CascadeLimit` when the chain
    /// exceeds `max_cascade` steps.
    pub fn run(&self, spec: StepSpec) -> EngineResult<RunReport> {
        let mut report = RunReport::default();
        let mut current = Some(spec);
        while let Some(spec) = current.take() {
            if report.len() >= self.config.max_cascade {
                let err = EngineError::CascadeLimit {
                    limit: self.config.max_cascade,
                };
                return Err(abandon(&report, &spec, err));
            }
            let committed = self.operator.explicit(|store| {
                let Step {
                    next,
                    changes,
                    event,
                } = self.prepare(store, &spec)?;
                Ok(((next, event), changes))
            });
            let (next, event) = match committed {
                Ok(done) => done,
                Err(err) => return Err(abandon(&report, &spec, err)),
            };
            tracing::debug!(
                process_id = %event.process_id,
                kind = %event.kind,
                outcome = ?event.outcome,
                released = event.released,
                "step committed"
            );
            report.steps.push(event);
            current = next;
        }
        Ok(report)
    }

    /// Next spawned process of `pool_id` not returned before, oldest first.
    ///
    /// # Errors
    ///
    /// `UnknownPool`, or a conflict with a concurrent poll.
    pub fn poll(&self, pool_id: PoolId) -> EngineResult<Option<ProcessRef>> {
        self.operator.explicit(|store| {
            let pool = store
                .pools(&BTreeSet::from([pool_id]))?
                .remove(&pool_id)
                .ok_or(BindingError::UnknownPool(pool_id))?;
            let polled = store.polled(pool_id)?;
            let Some(hand_off) = store
                .hand_offs(pool_id)?
                .into_iter()
                .find(|h| !polled.contains(&h.process_id))
            else {
                return Ok((None, Mod::default()));
            };
            let process_id = hand_off.process_id;
            let root = store
                .processes(&BTreeSet::from([process_id]))?
                .remove(&process_id)
                .ok_or(BindingError::UnknownProcess(process_id))?;
            let decl = find_proc(store, &root.proc_name)?;
            let channel_id = store
                .history(process_id, &decl.provider.0)?
                .first()
                .map(|row| row.channel_id)
                .ok_or_else(|| RepoError::NotFound {
                    entity: "provider binding",
                    key: process_id.to_string(),
                })?;

            let mut changes = Mod::default();
            changes.ticket(pool_id, pool.revision);
            changes.polls.push(PollMark {
                pool_id,
                process_id,
            });
            let out = ProcessRef {
                pool_id,
                process_id,
                proc_name: root.proc_name,
                channel_id,
            };
            Ok((Some(out), changes))
        })
    }

    /// Describe a pool or a process.
    ///
    /// # Errors
    ///
    /// `UnknownId` when `id` names neither.
    pub fn retrieve_snapshot(&self, id: impl Into<Uuid>) -> EngineResult<Snapshot> {
        let id = id.into();
        self.operator.implicit(|store| {
            let pool_id = PoolId(id);
            if let Some(pool) = store.pools(&BTreeSet::from([pool_id]))?.remove(&pool_id) {
                return pool_snapshot(store, pool.root, pool.revision).map(Snapshot::Pool);
            }
            let process_id = ProcessId(id);
            if let Some(root) = store
                .processes(&BTreeSet::from([process_id]))?
                .remove(&process_id)
            {
                return process_snapshot(store, root).map(Snapshot::Process);
            }
            Err(BindingError::UnknownId(id).into())
        })
    }

    fn prepare(&self, store: &O::Store, spec: &StepSpec) -> EngineResult<Step> {
        let snapshot = read_snapshot(store, spec)?;
        let env = collect_env(store, &spec.term, snapshot.states())?;
        let ctx = Context::from_bindings(snapshot.bindings.values());
        check(&env, &ctx, &spec.term)?;
        take_step(&env, &snapshot, spec, &*self.ids)
    }
}

fn abandon(report: &RunReport, spec: &StepSpec, err: EngineError) -> EngineError {
    if !report.is_empty() {
        tracing::warn!(
            committed = report.len(),
            process_id = %spec.process_id,
            error = %err,
            "cascade stopped after committed steps"
        );
    }
    err
}

fn nodes_of(types: &TypeStore) -> Vec<(TypeKey, parley_types::TypeNode)> {
    types.iter().map(|(key, node)| (*key, node.clone())).collect()
}

/// Everything the step reads, in one pass over the store.
fn read_snapshot<S: Store + ?Sized>(store: &S, spec: &StepSpec) -> EngineResult<StepSnapshot> {
    let me = spec.process_id;
    let root = store
        .processes(&BTreeSet::from([me]))?
        .remove(&me)
        .ok_or(BindingError::UnknownProcess(me))?;
    if root.pool_id != spec.pool_id {
        return Err(BindingError::ForeignProcess {
            process_id: me,
            expected: spec.pool_id,
            actual: root.pool_id,
        }
        .into());
    }

    let mut snapshot = StepSnapshot::default();
    // Read before any row the step depends on: a commit landing after this
    // point moves the revision and fails the ticket.
    snapshot.pools = revisions(store, &BTreeSet::from([root.pool_id]))?;
    let ids = BTreeSet::from([me]);
    snapshot.bindings = store.live_bindings(&ids)?.remove(&me).unwrap_or_default();
    snapshot.liability = store
        .liabilities(&ids)?
        .get(&me)
        .and_then(|rows| open_liability(rows))
        .cloned();
    snapshot.owners.insert(me, root.pool_id);

    let communicates = !matches!(spec.term.kind(), TermKind::Spawn | TermKind::Call);
    if let Some(via) = snapshot.bindings.get(spec.term.via()).filter(|_| communicates) {
        snapshot.pending = store.latest_pending(&BTreeSet::from([via.channel_id]))?;
    }
    let depositors: BTreeSet<ProcessId> = snapshot
        .pending
        .values()
        .filter_map(|record| record.step.depositor())
        .map(|d| d.process_id)
        .filter(|id| *id != me)
        .collect();
    if !depositors.is_empty() {
        for (id, process) in store.processes(&depositors)? {
            snapshot.owners.insert(id, process.pool_id);
        }
    }
    let foreign: BTreeSet<PoolId> = snapshot
        .owners
        .values()
        .filter(|id| !snapshot.pools.contains_key(*id))
        .copied()
        .collect();
    if !foreign.is_empty() {
        let read = revisions(store, &foreign)?;
        snapshot.pools.extend(read);
    }

    tracing::trace!(
        process_id = %me,
        bindings = snapshot.bindings.len(),
        pending = snapshot.pending.len(),
        pools = snapshot.pools.len(),
        "snapshot read"
    );
    Ok(snapshot)
}

fn revisions<S: Store + ?Sized>(
    store: &S,
    ids: &BTreeSet<PoolId>,
) -> EngineResult<BTreeMap<PoolId, Revision>> {
    Ok(store
        .pools(ids)?
        .into_iter()
        .map(|(id, pool)| (id, pool.revision))
        .collect())
}

fn pool_snapshot<S: Store + ?Sized>(
    store: &S,
    pool: PoolRoot,
    revision: u64,
) -> EngineResult<PoolSnapshot> {
    let roots = store.processes_in(pool.pool_id)?;
    let ids: BTreeSet<ProcessId> = roots.iter().map(|r| r.process_id).collect();
    let liabilities = store.liabilities(&ids)?;
    let processes = roots
        .into_iter()
        .map(|root| ProcessSummary {
            live: liabilities
                .get(&root.process_id)
                .and_then(|rows| open_liability(rows))
                .is_some(),
            process_id: root.process_id,
            proc_name: root.proc_name,
            parent: root.parent,
        })
        .collect();
    Ok(PoolSnapshot {
        pool,
        revision,
        processes,
    })
}

fn process_snapshot<S: Store + ?Sized>(store: &S, process: ProcessRoot) -> EngineResult<ProcessSnapshot> {
    let id = process.process_id;
    let ids = BTreeSet::from([id]);
    let bindings = store.live_bindings(&ids)?.remove(&id).unwrap_or_default();
    let live = store
        .liabilities(&ids)?
        .get(&id)
        .and_then(|rows| open_liability(rows))
        .is_some();

    let mut env = Env::default();
    load_types(store, &mut env, bindings.values().map(|b| b.state).collect())?;
    let bindings = bindings
        .into_values()
        .map(|b| {
            Ok(BindingView {
                session: env.types.tree(b.state)?,
                placeholder: b.placeholder,
                channel_id: b.channel_id,
                role: b.role,
                state: b.state,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;
    let children = store
        .processes_in(process.pool_id)?
        .into_iter()
        .filter(|p| p.parent == Some(id))
        .map(|p| p.process_id)
        .collect();
    Ok(ProcessSnapshot {
        process,
        live,
        bindings,
        children,
    })
}
