//! Rendezvous step engine.
//!
//! [`take_step`] advances one process by one term. It is pure: given the
//! environment and a snapshot read once for this attempt, it returns the
//! rows to append and, when the counterpart was already waiting, the next
//! step to take in the same run.
//!
//! A communication term meets the latest pending record of its via channel:
//!
//! - no live record: deposit a half-step and stop;
//! - `Forward` meets a live record: splice the depositor onto the forward
//!   target and replay its term there;
//! - a forward record meets any other term: redirect the arriving process
//!   to the forward target and take the same term again;
//! - a complementary record: complete the rendezvous and continue with the
//!   receiver's continuation.

use std::collections::{BTreeMap, BTreeSet};

use parley_types::{Label, Placeholder, ProcName, Term, TermKind, TypeKey};
use serde::{Deserialize, Serialize};

use crate::coordinator::Mod;
use crate::env::Env;
use crate::error::{BindingError, EngineResult, ProtocolError, RepoError, TypeError};
use crate::ids::{ChannelId, IdSource, PoolId, ProcessId};
use crate::ledger::{
    BindingEntry, BindingEvent, Continuation, Depositor, ForwardTarget, HandOff, LiabilityEvent,
    LiabilityRecord, Payload, PendingKind, PendingRecord, PendingStep, ProcessRoot, Revision, Role,
};

/// One process, one term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub pool_id: PoolId,
    pub process_id: ProcessId,
    pub term: Term,
}

/// Everything a step reads, taken once per attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSnapshot {
    /// Revision of every pool owning a process the step may write for.
    pub pools: BTreeMap<PoolId, Revision>,
    /// Pool of the stepping process and of every depositor met.
    pub owners: BTreeMap<ProcessId, PoolId>,
    /// Live bindings of the stepping process.
    pub bindings: BTreeMap<Placeholder, BindingEntry>,
    /// Latest pending record of the channels the term touches.
    pub pending: BTreeMap<ChannelId, PendingRecord>,
    /// Open liability of the stepping process.
    pub liability: Option<LiabilityRecord>,
}

impl StepSnapshot {
    /// Type keys an environment must cover for this snapshot.
    #[must_use]
    pub fn states(&self) -> Vec<TypeKey> {
        let mut out: Vec<TypeKey> = self.bindings.values().map(|b| b.state).collect();
        out.extend(self.pending.values().flat_map(|record| record.step.states()));
        out
    }
}

/// What a committed step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Half-step left on the channel.
    Deposited { channel_id: ChannelId },
    /// Completed a communication with a waiting partner.
    Rendezvous { channel_id: ChannelId, partner: ProcessId },
    /// Forwarded onto a waiting partner, who was moved to the target.
    Spliced { channel_id: ChannelId, partner: ProcessId },
    /// Met a forward and moved to its target channel.
    Redirected { from: ChannelId, to: ChannelId },
    Spawned { child: ProcessId, channel_id: ChannelId },
    Called { proc_name: ProcName },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub process_id: ProcessId,
    pub kind: TermKind,
    pub outcome: StepOutcome,
    /// The process's liability was released by this step.
    pub released: bool,
}

/// Result of [`take_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub next: Option<StepSpec>,
    pub changes: Mod,
    pub event: StepEvent,
}

/// Compute the effect of `spec.term` on `snapshot`.
///
/// The term must already have passed the checker against the same snapshot.
///
/// # Errors
///
/// `UnboundPlaceholder` for names missing from the snapshot, a protocol
/// error when the pending record cannot pair with the term, and type errors
/// for inconsistencies the checker would have caught.
pub fn take_step(
    env: &Env,
    snapshot: &StepSnapshot,
    spec: &StepSpec,
    ids: &dyn IdSource,
) -> EngineResult<Step> {
    let mut writer = Writer::new(snapshot, spec.process_id);
    let (next, outcome) = match &spec.term {
        Term::Spawn {
            via,
            proc_name,
            args,
            cont,
        } => spawn(env, &mut writer, spec, via, proc_name, args, cont, ids)?,
        Term::Call {
            via,
            proc_name,
            args,
        } => call(env, &mut writer, spec, via, proc_name, args)?,
        term => communicate(env, &mut writer, spec, term)?,
    };
    let released = matches!(spec.term.kind(), TermKind::Close | TermKind::Forward)
        && writer.release_if_done()?;
    Ok(Step {
        next,
        changes: writer.changes,
        event: StepEvent {
            process_id: spec.process_id,
            kind: spec.term.kind(),
            outcome,
            released,
        },
    })
}

type Advance = (Option<StepSpec>, StepOutcome);

#[allow(clippy::too_many_arguments)]
fn spawn(
    env: &Env,
    w: &mut Writer<'_>,
    spec: &StepSpec,
    via: &Placeholder,
    proc_name: &ProcName,
    args: &[Placeholder],
    cont: &Term,
    ids: &dyn IdSource,
) -> EngineResult<Advance> {
    let decl = env.proc(proc_name)?;
    expect_arity(proc_name, decl.params.len(), args.len())?;
    let pool_id = w.pool_of(spec.process_id)?;
    let child = ProcessId(ids.fresh());
    let channel_id = ChannelId(ids.fresh());

    w.adopt(child, pool_id);
    w.changes.processes.push(ProcessRoot {
        process_id: child,
        pool_id,
        proc_name: decl.name.clone(),
        parent: Some(spec.process_id),
    });
    let revision = w.next_revision(pool_id)?;
    w.changes.liabilities.push(LiabilityRecord {
        pool_id,
        process_id: child,
        event: LiabilityEvent::Created(revision),
    });

    let (provider, state) = &decl.provider;
    w.bind(child, provider, channel_id, Role::Provider, *state)?;
    w.bind(spec.process_id, via, channel_id, Role::Client, *state)?;
    for (arg, (param, _)) in args.iter().zip(&decl.params) {
        let held = w.held(arg)?;
        w.consume(&held)?;
        w.bind(child, param, held.channel_id, held.role, held.state)?;
    }
    w.changes.hand_offs.push(HandOff {
        pool_id,
        process_id: child,
    });

    tracing::trace!(%child, proc_name = %decl.name, "spawned");
    Ok((
        Some(StepSpec {
            pool_id: spec.pool_id,
            process_id: spec.process_id,
            term: cont.clone(),
        }),
        StepOutcome::Spawned { child, channel_id },
    ))
}

fn call(
    env: &Env,
    w: &mut Writer<'_>,
    spec: &StepSpec,
    via: &Placeholder,
    proc_name: &ProcName,
    args: &[Placeholder],
) -> EngineResult<Advance> {
    let decl = env.proc(proc_name)?;
    expect_arity(proc_name, decl.params.len(), args.len())?;
    let me = spec.process_id;

    let mut moved = vec![(w.held(via)?, &decl.provider.0)];
    for (arg, (param, _)) in args.iter().zip(&decl.params) {
        moved.push((w.held(arg)?, param));
    }
    for (held, _) in &moved {
        w.consume(held)?;
    }
    for (held, name) in &moved {
        w.bind(me, name, held.channel_id, held.role, held.state)?;
    }

    Ok((
        Some(StepSpec {
            pool_id: spec.pool_id,
            process_id: me,
            term: decl.body.clone(),
        }),
        StepOutcome::Called {
            proc_name: decl.name.clone(),
        },
    ))
}

fn communicate(env: &Env, w: &mut Writer<'_>, spec: &StepSpec, term: &Term) -> EngineResult<Advance> {
    let via = w.held(term.via())?;
    let live = w
        .snapshot
        .pending
        .get(&via.channel_id)
        .filter(|record| record.step.is_live())
        .cloned();
    let Some(record) = live else {
        return deposit(w, term, &via);
    };
    let (depositor, kind) = match (record.step.depositor(), record.step.kind()) {
        (Some(depositor), Some(kind)) => (depositor.clone(), kind),
        _ => return deposit(w, term, &via),
    };
    if depositor.role == via.role {
        return Err(kind_mismatch(via.channel_id, term.kind(), kind));
    }
    if !env.type_eq(depositor.state, via.state)? {
        return Err(ProtocolError::StateDivergence {
            channel_id: via.channel_id,
            want: via.state,
            got: depositor.state,
        }
        .into());
    }

    if let Term::Forward { target, .. } = term {
        return splice(w, spec, &via, target, &record, &depositor);
    }
    if let Some(forward) = record.step.forward_target() {
        return redirect(w, spec, &via, forward);
    }
    rendezvous(env, w, spec, term, &via, &record, &depositor, kind)
}

/// First arrival: consume what the term gives up and leave a record.
fn deposit(w: &mut Writer<'_>, term: &Term, via: &BindingEntry) -> EngineResult<Advance> {
    w.consume(via)?;
    let revision = w.next_revision(w.pool_of(via.process_id)?)?;
    let depositor = Depositor {
        process_id: via.process_id,
        revision,
        via: via.placeholder.clone(),
        role: via.role,
        state: via.state,
    };
    let step = match term {
        Term::Close { .. } => PendingStep::Message {
            depositor,
            payload: Payload::Close,
        },
        Term::Send { value, .. } => {
            let sent = w.held(value)?;
            w.consume(&sent)?;
            PendingStep::Message {
                depositor,
                payload: Payload::Value {
                    placeholder: sent.placeholder,
                    channel_id: sent.channel_id,
                    state: sent.state,
                },
            }
        }
        Term::Label { label, .. } => PendingStep::Message {
            depositor,
            payload: Payload::Label(label.clone()),
        },
        Term::Wait { cont, .. } => PendingStep::Service {
            depositor,
            cont: Continuation::Wait {
                cont: (**cont).clone(),
            },
        },
        Term::Recv { bind, cont, .. } => PendingStep::Service {
            depositor,
            cont: Continuation::Recv {
                bind: bind.clone(),
                cont: (**cont).clone(),
            },
        },
        Term::Case { branches, .. } => PendingStep::Service {
            depositor,
            cont: Continuation::Case {
                branches: branches.clone(),
            },
        },
        Term::Forward { target, .. } => {
            let other = w.held(target)?;
            w.consume(&other)?;
            let forward = ForwardTarget {
                placeholder: other.placeholder,
                channel_id: other.channel_id,
                role: other.role,
                state: other.state,
            };
            match via.role {
                Role::Provider => PendingStep::Message {
                    depositor,
                    payload: Payload::Forward(forward),
                },
                Role::Client => PendingStep::Service {
                    depositor,
                    cont: Continuation::Forward(forward),
                },
            }
        }
        Term::Spawn { .. } | Term::Call { .. } => {
            return Err(ProtocolError::NotCommunication(term.kind()).into())
        }
    };
    w.record(via.channel_id, step);
    Ok((
        None,
        StepOutcome::Deposited {
            channel_id: via.channel_id,
        },
    ))
}

/// `Forward` meets a waiting partner: move the partner onto the target.
fn splice(
    w: &mut Writer<'_>,
    spec: &StepSpec,
    via: &BindingEntry,
    target: &Placeholder,
    record: &PendingRecord,
    depositor: &Depositor,
) -> EngineResult<Advance> {
    let other = w.held(target)?;
    w.consume(via)?;
    w.consume(&other)?;
    w.record(via.channel_id, PendingStep::None);

    let partner = depositor.process_id;
    w.bind(partner, &depositor.via, other.channel_id, depositor.role, other.state)?;
    match &record.step {
        PendingStep::Message {
            payload:
                Payload::Value {
                    placeholder,
                    channel_id,
                    state,
                },
            ..
        } => w.bind(partner, placeholder, *channel_id, Role::Client, *state)?,
        step => {
            if let Some(forward) = step.forward_target() {
                w.bind(partner, &forward.placeholder, forward.channel_id, forward.role, forward.state)?;
            }
        }
    }
    let replay = record
        .step
        .replay_term()
        .ok_or(ProtocolError::NotCommunication(spec.term.kind()))?;

    Ok((
        Some(StepSpec {
            pool_id: w.pool_of(partner)?,
            process_id: partner,
            term: replay,
        }),
        StepOutcome::Spliced {
            channel_id: via.channel_id,
            partner,
        },
    ))
}

/// A forward record meets a term: move the arriving end and try again.
fn redirect(
    w: &mut Writer<'_>,
    spec: &StepSpec,
    via: &BindingEntry,
    forward: &ForwardTarget,
) -> EngineResult<Advance> {
    w.record(via.channel_id, PendingStep::None);
    w.consume(via)?;
    w.bind(spec.process_id, &via.placeholder, forward.channel_id, via.role, forward.state)?;
    Ok((
        Some(spec.clone()),
        StepOutcome::Redirected {
            from: via.channel_id,
            to: forward.channel_id,
        },
    ))
}

#[allow(clippy::too_many_arguments)]
fn rendezvous(
    env: &Env,
    w: &mut Writer<'_>,
    spec: &StepSpec,
    term: &Term,
    via: &BindingEntry,
    record: &PendingRecord,
    depositor: &Depositor,
    kind: PendingKind,
) -> EngineResult<Advance> {
    let me = spec.process_id;
    let partner = depositor.process_id;
    let channel_id = via.channel_id;
    w.record(channel_id, PendingStep::None);
    w.consume(via)?;

    // (process that continues, its continuation)
    let (receiver, cont) = match (term, &record.step) {
        (
            Term::Close { .. },
            PendingStep::Service {
                cont: Continuation::Wait { cont },
                ..
            },
        ) => (partner, cont.clone()),
        (
            Term::Wait { cont, .. },
            PendingStep::Message {
                payload: Payload::Close,
                ..
            },
        ) => (me, (**cont).clone()),
        (
            Term::Send { value, .. },
            PendingStep::Service {
                cont: Continuation::Recv { bind, cont },
                ..
            },
        ) => {
            let sent = w.held(value)?;
            w.consume(&sent)?;
            let next = continuation_of(env, via.state)?;
            w.bind(me, &via.placeholder, channel_id, via.role, next)?;
            w.bind(partner, &depositor.via, channel_id, depositor.role, next)?;
            w.bind(partner, bind, sent.channel_id, Role::Client, sent.state)?;
            (partner, cont.clone())
        }
        (
            Term::Recv { bind, cont, .. },
            PendingStep::Message {
                payload:
                    Payload::Value {
                        channel_id: value_channel,
                        state: value_state,
                        ..
                    },
                ..
            },
        ) => {
            let next = continuation_of(env, via.state)?;
            w.bind(me, &via.placeholder, channel_id, via.role, next)?;
            w.bind(partner, &depositor.via, channel_id, depositor.role, next)?;
            w.bind(me, bind, *value_channel, Role::Client, *value_state)?;
            (me, (**cont).clone())
        }
        (
            Term::Label { label, .. },
            PendingStep::Service {
                cont: Continuation::Case { branches },
                ..
            },
        ) => {
            let next = arm_of(env, &via.placeholder, via.state, label)?;
            let cont = branch_of(&depositor.via, branches, label)?;
            w.bind(me, &via.placeholder, channel_id, via.role, next)?;
            w.bind(partner, &depositor.via, channel_id, depositor.role, next)?;
            (partner, cont)
        }
        (
            Term::Case { branches, .. },
            PendingStep::Message {
                payload: Payload::Label(label),
                ..
            },
        ) => {
            let next = arm_of(env, &via.placeholder, via.state, label)?;
            let cont = branch_of(&via.placeholder, branches, label)?;
            w.bind(me, &via.placeholder, channel_id, via.role, next)?;
            w.bind(partner, &depositor.via, channel_id, depositor.role, next)?;
            (me, cont)
        }
        _ => return Err(kind_mismatch(channel_id, term.kind(), kind)),
    };

    Ok((
        Some(StepSpec {
            pool_id: w.pool_of(receiver)?,
            process_id: receiver,
            term: cont,
        }),
        StepOutcome::Rendezvous {
            channel_id,
            partner,
        },
    ))
}

fn continuation_of(env: &Env, state: TypeKey) -> EngineResult<TypeKey> {
    let (resolved, _) = env.resolve(state)?;
    Ok(env.types.next(resolved)?)
}

fn arm_of(env: &Env, via: &Placeholder, state: TypeKey, label: &Label) -> EngineResult<TypeKey> {
    let (resolved, _) = env.resolve(state)?;
    env.types.next_for(resolved, label).map_err(|_| {
        TypeError::LabelNotFound {
            placeholder: via.clone(),
            label: label.clone(),
        }
        .into()
    })
}

fn branch_of(via: &Placeholder, branches: &BTreeMap<Label, Term>, label: &Label) -> EngineResult<Term> {
    branches.get(label).cloned().ok_or_else(|| {
        TypeError::LabelNotFound {
            placeholder: via.clone(),
            label: label.clone(),
        }
        .into()
    })
}

fn expect_arity(proc_name: &ProcName, want: usize, got: usize) -> EngineResult<()> {
    if want == got {
        Ok(())
    } else {
        Err(TypeError::ArityMismatch {
            proc_name: proc_name.clone(),
            want,
            got,
        }
        .into())
    }
}

fn kind_mismatch(channel_id: ChannelId, term: TermKind, got: PendingKind) -> crate::error::EngineError {
    let want = match PendingKind::partner_of(term) {
        Some(kind) => format!("{kind} or forward"),
        None => "record".to_string(),
    };
    ProtocolError::PendingKindMismatch {
        channel_id,
        want,
        got,
    }
    .into()
}

/// Accumulates the rows of one step, ticketing every pool it writes for.
struct Writer<'a> {
    snapshot: &'a StepSnapshot,
    me: ProcessId,
    adopted: BTreeMap<ProcessId, PoolId>,
    changes: Mod,
}

impl<'a> Writer<'a> {
    fn new(snapshot: &'a StepSnapshot, me: ProcessId) -> Self {
        Self {
            snapshot,
            me,
            adopted: BTreeMap::new(),
            changes: Mod::default(),
        }
    }

    /// A live binding of the stepping process.
    fn held(&self, placeholder: &Placeholder) -> EngineResult<BindingEntry> {
        self.snapshot.bindings.get(placeholder).cloned().ok_or_else(|| {
            BindingError::UnboundPlaceholder {
                placeholder: placeholder.clone(),
            }
            .into()
        })
    }

    fn adopt(&mut self, process_id: ProcessId, pool_id: PoolId) {
        self.adopted.insert(process_id, pool_id);
    }

    fn pool_of(&self, process_id: ProcessId) -> EngineResult<PoolId> {
        self.snapshot
            .owners
            .get(&process_id)
            .or_else(|| self.adopted.get(&process_id))
            .copied()
            .ok_or_else(|| BindingError::UnknownProcess(process_id).into())
    }

    /// Ticket `pool_id` and return the revision new rows carry.
    fn next_revision(&mut self, pool_id: PoolId) -> EngineResult<Revision> {
        let revision = *self
            .snapshot
            .pools
            .get(&pool_id)
            .ok_or_else(|| RepoError::NotFound {
                entity: "pool revision",
                key: pool_id.to_string(),
            })?;
        self.changes.ticket(pool_id, revision);
        Ok(revision + 1)
    }

    fn consume(&mut self, entry: &BindingEntry) -> EngineResult<()> {
        let pool_id = self.pool_of(entry.process_id)?;
        self.next_revision(pool_id)?;
        self.changes.bindings.push(entry.consumed());
        Ok(())
    }

    fn bind(
        &mut self,
        process_id: ProcessId,
        placeholder: &Placeholder,
        channel_id: ChannelId,
        role: Role,
        state: TypeKey,
    ) -> EngineResult<()> {
        let pool_id = self.pool_of(process_id)?;
        let revision = self.next_revision(pool_id)?;
        self.changes.bindings.push(BindingEntry {
            process_id,
            placeholder: placeholder.clone(),
            channel_id,
            role,
            state,
            event: BindingEvent::Bound(revision),
        });
        Ok(())
    }

    /// Append the next pending record of `channel_id`, guarding the one read.
    fn record(&mut self, channel_id: ChannelId, step: PendingStep) {
        let seq = self
            .snapshot
            .pending
            .get(&channel_id)
            .map_or(0, |record| record.seq);
        self.changes.guard(channel_id, seq);
        self.changes.pending.push(PendingRecord {
            channel_id,
            seq: seq + 1,
            step,
        });
    }

    /// Release the stepping process's liability once it holds nothing.
    fn release_if_done(&mut self) -> EngineResult<bool> {
        let mut live: BTreeSet<&Placeholder> = self.snapshot.bindings.keys().collect();
        for row in self.changes.bindings.iter().filter(|row| row.process_id == self.me) {
            match row.event {
                BindingEvent::Bound(_) => live.insert(&row.placeholder),
                BindingEvent::Consumed(_) => live.remove(&row.placeholder),
            };
        }
        if !live.is_empty() {
            return Ok(false);
        }
        let Some(liability) = self.snapshot.liability.clone() else {
            return Ok(false);
        };
        self.next_revision(liability.pool_id)?;
        self.changes.liabilities.push(liability.released());
        Ok(true)
    }
}
