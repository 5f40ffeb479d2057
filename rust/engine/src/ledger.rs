//! Persisted rows: the append-only binding ledger, pending-step records,
//! liabilities, and the pool and process roots they hang off.
//!
//! Nothing here is ever updated in place. A binding is superseded by a row
//! of greater magnitude; a pending record by one with a greater `seq`.

use std::collections::BTreeMap;
use std::fmt;

use parley_types::{Label, Placeholder, ProcName, Term, TermKind, TypeKey};
use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, PoolId, ProcessId};

/// Pool revision a row was written at.
pub type Revision = u64;

/// One ledger event for a `(process, placeholder)` pair.
///
/// A `Consumed` event always carries the magnitude of the `Bound` event it
/// debits, so the two sort adjacent with the debit last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingEvent {
    Bound(Revision),
    Consumed(Revision),
}

impl BindingEvent {
    #[must_use]
    pub fn magnitude(&self) -> Revision {
        match self {
            BindingEvent::Bound(r) | BindingEvent::Consumed(r) => *r,
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, BindingEvent::Bound(_))
    }

    /// Total order used to pick the current row.
    #[must_use]
    pub fn order_key(&self) -> (Revision, bool) {
        (self.magnitude(), !self.is_live())
    }
}

/// Side of a channel a binding holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Offers the session; the channel is a liability.
    Provider,
    /// Uses the session; the channel is an asset.
    Client,
}

impl Role {
    #[must_use]
    pub fn opposite(self) -> Role {
        match self {
            Role::Provider => Role::Client,
            Role::Client => Role::Provider,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Provider => write!(f, "provider"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingEntry {
    pub process_id: ProcessId,
    pub placeholder: Placeholder,
    pub channel_id: ChannelId,
    pub role: Role,
    /// Session-type state of the channel as seen from this side.
    pub state: TypeKey,
    pub event: BindingEvent,
}

impl BindingEntry {
    /// The debit row for this binding.
    #[must_use]
    pub fn consumed(&self) -> BindingEntry {
        BindingEntry {
            event: BindingEvent::Consumed(self.event.magnitude()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.event.is_live()
    }
}

/// Current binding among the rows of one `(process, placeholder)` pair.
///
/// Returns the row of greatest magnitude when it is a `Bound` row.
pub fn current_binding<'a>(
    rows: impl IntoIterator<Item = &'a BindingEntry>,
) -> Option<&'a BindingEntry> {
    rows.into_iter()
        .max_by_key(|row| row.event.order_key())
        .filter(|row| row.is_live())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiabilityEvent {
    Created(Revision),
    Released(Revision),
}

impl LiabilityEvent {
    #[must_use]
    pub fn magnitude(&self) -> Revision {
        match self {
            LiabilityEvent::Created(r) | LiabilityEvent::Released(r) => *r,
        }
    }
}

/// The pool's responsibility for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiabilityRecord {
    pub pool_id: PoolId,
    pub process_id: ProcessId,
    pub event: LiabilityEvent,
}

impl LiabilityRecord {
    #[must_use]
    pub fn released(&self) -> LiabilityRecord {
        LiabilityRecord {
            event: LiabilityEvent::Released(self.event.magnitude()),
            ..self.clone()
        }
    }
}

/// The live creation record among `rows`, if the liability was not released.
pub fn open_liability<'a>(
    rows: impl IntoIterator<Item = &'a LiabilityRecord>,
) -> Option<&'a LiabilityRecord> {
    rows.into_iter()
        .max_by_key(|row| {
            (
                row.event.magnitude(),
                matches!(row.event, LiabilityEvent::Released(_)),
            )
        })
        .filter(|row| matches!(row.event, LiabilityEvent::Created(_)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRoot {
    pub pool_id: PoolId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRoot {
    pub process_id: ProcessId,
    pub pool_id: PoolId,
    pub proc_name: ProcName,
    /// Process whose `Spawn` created this one; `None` for pool roots.
    pub parent: Option<ProcessId>,
}

/// A spawned process waiting to be picked up by `poll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandOff {
    pub pool_id: PoolId,
    pub process_id: ProcessId,
}

/// Marks a hand-off as returned by `poll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollMark {
    pub pool_id: PoolId,
    pub process_id: ProcessId,
}

/// Who left a pending record, and on which side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depositor {
    pub process_id: ProcessId,
    pub revision: Revision,
    pub via: Placeholder,
    pub role: Role,
    pub state: TypeKey,
}

/// Where a forwarding process sends its partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub placeholder: Placeholder,
    pub channel_id: ChannelId,
    pub role: Role,
    pub state: TypeKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Close,
    Value {
        placeholder: Placeholder,
        channel_id: ChannelId,
        state: TypeKey,
    },
    Label(Label),
    Forward(ForwardTarget),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuation {
    Wait { cont: Term },
    Recv { bind: Placeholder, cont: Term },
    Case { branches: BTreeMap<Label, Term> },
    Forward(ForwardTarget),
}

/// State of a channel's half-finished communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStep {
    /// Nothing waiting; also the tombstone of a consumed record.
    None,
    /// Something was sent and awaits a receiver.
    Message { depositor: Depositor, payload: Payload },
    /// Something is expected and awaits a sender.
    Service { depositor: Depositor, cont: Continuation },
}

/// Kinds of live pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingKind {
    Close,
    Value,
    Label,
    Wait,
    Recv,
    Case,
    Forward,
}

impl PendingKind {
    /// The record kind a communication term completes.
    #[must_use]
    pub fn partner_of(kind: TermKind) -> Option<PendingKind> {
        match kind {
            TermKind::Close => Some(PendingKind::Wait),
            TermKind::Wait => Some(PendingKind::Close),
            TermKind::Send => Some(PendingKind::Recv),
            TermKind::Recv => Some(PendingKind::Value),
            TermKind::Label => Some(PendingKind::Case),
            TermKind::Case => Some(PendingKind::Label),
            TermKind::Forward | TermKind::Spawn | TermKind::Call => None,
        }
    }
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PendingKind::Close => "close",
            PendingKind::Value => "value",
            PendingKind::Label => "label",
            PendingKind::Wait => "wait",
            PendingKind::Recv => "recv",
            PendingKind::Case => "case",
            PendingKind::Forward => "forward",
        };
        f.write_str(name)
    }
}

impl PendingStep {
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self, PendingStep::None)
    }

    #[must_use]
    pub fn depositor(&self) -> Option<&Depositor> {
        match self {
            PendingStep::None => None,
            PendingStep::Message { depositor, .. } | PendingStep::Service { depositor, .. } => {
                Some(depositor)
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<PendingKind> {
        let kind = match self {
            PendingStep::None => return None,
            PendingStep::Message { payload, .. } => match payload {
                Payload::Close => PendingKind::Close,
                Payload::Value { .. } => PendingKind::Value,
                Payload::Label(_) => PendingKind::Label,
                Payload::Forward(_) => PendingKind::Forward,
            },
            PendingStep::Service { cont, .. } => match cont {
                Continuation::Wait { .. } => PendingKind::Wait,
                Continuation::Recv { .. } => PendingKind::Recv,
                Continuation::Case { .. } => PendingKind::Case,
                Continuation::Forward(_) => PendingKind::Forward,
            },
        };
        Some(kind)
    }

    #[must_use]
    pub fn forward_target(&self) -> Option<&ForwardTarget> {
        match self {
            PendingStep::Message {
                payload: Payload::Forward(target),
                ..
            }
            | PendingStep::Service {
                cont: Continuation::Forward(target),
                ..
            } => Some(target),
            _ => None,
        }
    }

    /// Every type key the record refers to.
    #[must_use]
    pub fn states(&self) -> Vec<TypeKey> {
        let mut out: Vec<TypeKey> = self.depositor().map(|d| d.state).into_iter().collect();
        match self {
            PendingStep::Message {
                payload: Payload::Value { state, .. },
                ..
            } => out.push(*state),
            _ => out.extend(self.forward_target().map(|target| target.state)),
        }
        out
    }

    /// The term that left this record.
    #[must_use]
    pub fn replay_term(&self) -> Option<Term> {
        let term = match self {
            PendingStep::None => return None,
            PendingStep::Message { depositor, payload } => {
                let via = depositor.via.clone();
                match payload {
                    Payload::Close => Term::close(via),
                    Payload::Value { placeholder, .. } => Term::send(via, placeholder.clone()),
                    Payload::Label(label) => Term::label(via, label.clone()),
                    Payload::Forward(target) => Term::forward(via, target.placeholder.clone()),
                }
            }
            PendingStep::Service { depositor, cont } => {
                let via = depositor.via.clone();
                match cont {
                    Continuation::Wait { cont } => Term::wait(via, cont.clone()),
                    Continuation::Recv { bind, cont } => Term::recv(via, bind.clone(), cont.clone()),
                    Continuation::Case { branches } => Term::case(via, branches.clone()),
                    Continuation::Forward(target) => Term::forward(via, target.placeholder.clone()),
                }
            }
        };
        Some(term)
    }
}

/// One entry in a channel's pending history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub channel_id: ChannelId,
    /// Strictly increasing per channel, starting at 1.
    pub seq: u64,
    pub step: PendingStep,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::{key_of, SessionType};
    use uuid::Uuid;

    fn entry(event: BindingEvent) -> BindingEntry {
        BindingEntry {
            process_id: ProcessId(Uuid::from_u128(1)),
            placeholder: Placeholder::from_static("x"),
            channel_id: ChannelId(Uuid::from_u128(2)),
            role: Role::Client,
            state: key_of(&SessionType::Unit),
            event,
        }
    }

    #[test]
    fn test_current_binding_picks_max_magnitude() {
        let rows = vec![
            entry(BindingEvent::Bound(1)),
            entry(BindingEvent::Consumed(1)),
            entry(BindingEvent::Bound(4)),
        ];
        assert_eq!(current_binding(&rows).map(|r| r.event), Some(BindingEvent::Bound(4)));
    }

    #[test]
    fn test_consumed_wins_tie() {
        let bound = entry(BindingEvent::Bound(3));
        let rows = vec![bound.consumed(), bound];
        assert!(current_binding(&rows).is_none());
    }

    #[test]
    fn test_open_liability() {
        let created = LiabilityRecord {
            pool_id: PoolId(Uuid::from_u128(1)),
            process_id: ProcessId(Uuid::from_u128(2)),
            event: LiabilityEvent::Created(5),
        };
        assert!(open_liability([&created]).is_some());
        let released = created.released();
        assert_eq!(released.event, LiabilityEvent::Released(5));
        assert!(open_liability([&created, &released]).is_none());
    }

    #[test]
    fn test_replay_term_rebuilds_depositing_term() {
        let depositor = Depositor {
            process_id: ProcessId(Uuid::from_u128(1)),
            revision: 1,
            via: Placeholder::from_static("a"),
            role: Role::Provider,
            state: key_of(&SessionType::Unit),
        };
        let cont = Term::wait(Placeholder::from_static("y"), Term::close(Placeholder::from_static("a")));
        let step = PendingStep::Service {
            depositor,
            cont: Continuation::Recv {
                bind: Placeholder::from_static("y"),
                cont: cont.clone(),
            },
        };
        assert_eq!(step.kind(), Some(PendingKind::Recv));
        assert_eq!(
            step.replay_term(),
            Some(Term::recv(Placeholder::from_static("a"), Placeholder::from_static("y"), cont))
        );
        assert!(PendingStep::None.replay_term().is_none());
    }

    #[test]
    fn test_partner_kinds() {
        assert_eq!(PendingKind::partner_of(TermKind::Send), Some(PendingKind::Recv));
        assert_eq!(PendingKind::partner_of(TermKind::Case), Some(PendingKind::Label));
        assert_eq!(PendingKind::partner_of(TermKind::Spawn), None);
    }
}
