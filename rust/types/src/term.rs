//! Process terms.
//!
//! A term acts on one channel first, its *via* placeholder. Continuations
//! hang off the variants that wait for something (`Wait`, `Recv`, `Case`,
//! `Spawn`); the others end the current step.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifiers::{Label, Placeholder, ProcName};

/// Process syntax.
///
/// # Examples
///
/// ```
/// use parley_types::{Placeholder, Term, TermKind};
///
/// let x = Placeholder::from_static("x");
/// let y = Placeholder::from_static("y");
/// let t = Term::recv(x.clone(), y.clone(), Term::wait(y, Term::close(x.clone())));
/// assert_eq!(t.via(), &x);
/// assert_eq!(t.kind(), TermKind::Recv);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "term", rename_all = "snake_case")]
pub enum Term {
    Close {
        via: Placeholder,
    },
    Wait {
        via: Placeholder,
        cont: Box<Term>,
    },
    Send {
        via: Placeholder,
        value: Placeholder,
    },
    Recv {
        via: Placeholder,
        bind: Placeholder,
        cont: Box<Term>,
    },
    Label {
        via: Placeholder,
        label: Label,
    },
    Case {
        via: Placeholder,
        branches: BTreeMap<Label, Term>,
    },
    Spawn {
        via: Placeholder,
        proc_name: ProcName,
        args: Vec<Placeholder>,
        cont: Box<Term>,
    },
    Call {
        via: Placeholder,
        proc_name: ProcName,
        args: Vec<Placeholder>,
    },
    Forward {
        via: Placeholder,
        target: Placeholder,
    },
}

/// Variant tag of a [`Term`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TermKind {
    Close,
    Wait,
    Send,
    Recv,
    Label,
    Case,
    Spawn,
    Call,
    Forward,
}

impl fmt::Display for TermKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TermKind::Close => "close",
            TermKind::Wait => "wait",
            TermKind::Send => "send",
            TermKind::Recv => "recv",
            TermKind::Label => "label",
            TermKind::Case => "case",
            TermKind::Spawn => "spawn",
            TermKind::Call => "call",
            TermKind::Forward => "forward",
        };
        f.write_str(name)
    }
}

impl Term {
    #[must_use]
    pub fn close(via: Placeholder) -> Self {
        Term::Close { via }
    }

    #[must_use]
    pub fn wait(via: Placeholder, cont: Term) -> Self {
        Term::Wait {
            via,
            cont: Box::new(cont),
        }
    }

    #[must_use]
    pub fn send(via: Placeholder, value: Placeholder) -> Self {
        Term::Send { via, value }
    }

    #[must_use]
    pub fn recv(via: Placeholder, bind: Placeholder, cont: Term) -> Self {
        Term::Recv {
            via,
            bind,
            cont: Box::new(cont),
        }
    }

    #[must_use]
    pub fn label(via: Placeholder, label: Label) -> Self {
        Term::Label { via, label }
    }

    #[must_use]
    pub fn case(via: Placeholder, branches: impl IntoIterator<Item = (Label, Term)>) -> Self {
        Term::Case {
            via,
            branches: branches.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn spawn(via: Placeholder, proc_name: ProcName, args: Vec<Placeholder>, cont: Term) -> Self {
        Term::Spawn {
            via,
            proc_name,
            args,
            cont: Box::new(cont),
        }
    }

    #[must_use]
    pub fn call(via: Placeholder, proc_name: ProcName, args: Vec<Placeholder>) -> Self {
        Term::Call {
            via,
            proc_name,
            args,
        }
    }

    #[must_use]
    pub fn forward(via: Placeholder, target: Placeholder) -> Self {
        Term::Forward { via, target }
    }

    /// The channel this term acts on first.
    #[must_use]
    pub fn via(&self) -> &Placeholder {
        match self {
            Term::Close { via }
            | Term::Wait { via, .. }
            | Term::Send { via, .. }
            | Term::Recv { via, .. }
            | Term::Label { via, .. }
            | Term::Case { via, .. }
            | Term::Spawn { via, .. }
            | Term::Call { via, .. }
            | Term::Forward { via, .. } => via,
        }
    }

    #[must_use]
    pub fn kind(&self) -> TermKind {
        match self {
            Term::Close { .. } => TermKind::Close,
            Term::Wait { .. } => TermKind::Wait,
            Term::Send { .. } => TermKind::Send,
            Term::Recv { .. } => TermKind::Recv,
            Term::Label { .. } => TermKind::Label,
            Term::Case { .. } => TermKind::Case,
            Term::Spawn { .. } => TermKind::Spawn,
            Term::Call { .. } => TermKind::Call,
            Term::Forward { .. } => TermKind::Forward,
        }
    }

    /// Every process name mentioned anywhere in the tree.
    #[must_use]
    pub fn proc_names(&self) -> BTreeSet<ProcName> {
        let mut out = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(term) = stack.pop() {
            match term {
                Term::Close { .. }
                | Term::Send { .. }
                | Term::Label { .. }
                | Term::Forward { .. } => {}
                Term::Wait { cont, .. } | Term::Recv { cont, .. } => stack.push(cont),
                Term::Case { branches, .. } => stack.extend(branches.values()),
                Term::Spawn { proc_name, cont, .. } => {
                    out.insert(proc_name.clone());
                    stack.push(cont);
                }
                Term::Call { proc_name, .. } => {
                    out.insert(proc_name.clone());
                }
            }
        }
        out
    }
}
