//! Session types over the connectives unit, tensor, lolli and the two choices.
//!
//! [`SessionType`] is the tree callers build. [`TypeNode`] is its hash-consed
//! form: children are referenced by [`TypeKey`], so identical subtrees are
//! stored once and compared by key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content_id::TypeKey;
use crate::identifiers::{Label, TypeName};

/// Which side drives the next action of a connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    /// Provider acts next.
    Pos,
    /// Client acts next.
    Neg,
    /// Indirection through a named type; resolve before asking again.
    Zero,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::Pos => write!(f, "+"),
            Polarity::Neg => write!(f, "-"),
            Polarity::Zero => write!(f, "0"),
        }
    }
}

/// Session type tree.
///
/// # Examples
///
/// ```
/// use parley_types::{Polarity, SessionType};
///
/// // receive a unit, then behave as unit
/// let t = SessionType::lolli(SessionType::Unit, SessionType::Unit);
/// assert_eq!(t.polarity(), Polarity::Neg);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// Terminal: the provider closes.
    Unit,
    /// Reference to a declared type.
    LinkTo(TypeName),
    /// Provider sends a channel of type `value`, then continues as `cont`.
    Tensor {
        value: Box<SessionType>,
        cont: Box<SessionType>,
    },
    /// Provider receives a channel of type `value`, then continues as `cont`.
    Lolli {
        value: Box<SessionType>,
        cont: Box<SessionType>,
    },
    /// Provider picks an arm.
    InternalChoice(BTreeMap<Label, SessionType>),
    /// Client picks an arm.
    ExternalChoice(BTreeMap<Label, SessionType>),
}

impl SessionType {
    #[must_use]
    pub fn link(name: TypeName) -> Self {
        SessionType::LinkTo(name)
    }

    #[must_use]
    pub fn tensor(value: SessionType, cont: SessionType) -> Self {
        SessionType::Tensor {
            value: Box::new(value),
            cont: Box::new(cont),
        }
    }

    #[must_use]
    pub fn lolli(value: SessionType, cont: SessionType) -> Self {
        SessionType::Lolli {
            value: Box::new(value),
            cont: Box::new(cont),
        }
    }

    #[must_use]
    pub fn internal(arms: impl IntoIterator<Item = (Label, SessionType)>) -> Self {
        SessionType::InternalChoice(arms.into_iter().collect())
    }

    #[must_use]
    pub fn external(arms: impl IntoIterator<Item = (Label, SessionType)>) -> Self {
        SessionType::ExternalChoice(arms.into_iter().collect())
    }

    #[must_use]
    pub fn polarity(&self) -> Polarity {
        match self {
            SessionType::Unit | SessionType::Tensor { .. } | SessionType::InternalChoice(_) => {
                Polarity::Pos
            }
            SessionType::Lolli { .. } | SessionType::ExternalChoice(_) => Polarity::Neg,
            SessionType::LinkTo(_) => Polarity::Zero,
        }
    }

    /// Names of every declared type this tree links to.
    #[must_use]
    pub fn links(&self) -> BTreeSet<TypeName> {
        let mut out = BTreeSet::new();
        self.collect_links(&mut out);
        out
    }

    fn collect_links(&self, out: &mut BTreeSet<TypeName>) {
        match self {
            SessionType::Unit => {}
            SessionType::LinkTo(name) => {
                out.insert(name.clone());
            }
            SessionType::Tensor { value, cont } | SessionType::Lolli { value, cont } => {
                value.collect_links(out);
                cont.collect_links(out);
            }
            SessionType::InternalChoice(arms) | SessionType::ExternalChoice(arms) => {
                for arm in arms.values() {
                    arm.collect_links(out);
                }
            }
        }
    }

    /// Every choice offers at least one arm.
    #[must_use]
    pub fn well_formed(&self) -> bool {
        match self {
            SessionType::Unit | SessionType::LinkTo(_) => true,
            SessionType::Tensor { value, cont } | SessionType::Lolli { value, cont } => {
                value.well_formed() && cont.well_formed()
            }
            SessionType::InternalChoice(arms) | SessionType::ExternalChoice(arms) => {
                !arms.is_empty() && arms.values().all(SessionType::well_formed)
            }
        }
    }
}

/// Hash-consed node: one connective whose children are keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeNode {
    Unit,
    LinkTo(TypeName),
    Tensor { value: TypeKey, cont: TypeKey },
    Lolli { value: TypeKey, cont: TypeKey },
    InternalChoice(BTreeMap<Label, TypeKey>),
    ExternalChoice(BTreeMap<Label, TypeKey>),
}

impl TypeNode {
    /// Content identity of this node.
    ///
    /// The canonical encoding is compact JSON; choice arms are already
    /// label-ordered by the map.
    #[must_use]
    pub fn key(&self) -> TypeKey {
        // Serialising plain enums, label strings and hex keys cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        TypeKey::from_bytes(&bytes)
    }

    #[must_use]
    pub fn polarity(&self) -> Polarity {
        match self {
            TypeNode::Unit | TypeNode::Tensor { .. } | TypeNode::InternalChoice(_) => Polarity::Pos,
            TypeNode::Lolli { .. } | TypeNode::ExternalChoice(_) => Polarity::Neg,
            TypeNode::LinkTo(_) => Polarity::Zero,
        }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            TypeNode::Unit => Shape::Unit,
            TypeNode::LinkTo(name) => Shape::Link(name.clone()),
            TypeNode::Tensor { .. } => Shape::Tensor,
            TypeNode::Lolli { .. } => Shape::Lolli,
            TypeNode::InternalChoice(arms) => Shape::Internal(arms.keys().cloned().collect()),
            TypeNode::ExternalChoice(arms) => Shape::External(arms.keys().cloned().collect()),
        }
    }

    /// Keys of the direct children.
    #[must_use]
    pub fn children(&self) -> Vec<TypeKey> {
        match self {
            TypeNode::Unit | TypeNode::LinkTo(_) => Vec::new(),
            TypeNode::Tensor { value, cont } | TypeNode::Lolli { value, cont } => {
                vec![*value, *cont]
            }
            TypeNode::InternalChoice(arms) | TypeNode::ExternalChoice(arms) => {
                arms.values().copied().collect()
            }
        }
    }
}

/// Key of a tree, computed by plain recursion without any store.
#[must_use]
pub fn key_of(ty: &SessionType) -> TypeKey {
    node_of(ty, &mut key_of).key()
}

/// Build the node for the root of `ty`, keying children with `child_key`.
pub(crate) fn node_of(ty: &SessionType, child_key: &mut dyn FnMut(&SessionType) -> TypeKey) -> TypeNode {
    match ty {
        SessionType::Unit => TypeNode::Unit,
        SessionType::LinkTo(name) => TypeNode::LinkTo(name.clone()),
        SessionType::Tensor { value, cont } => TypeNode::Tensor {
            value: child_key(value),
            cont: child_key(cont),
        },
        SessionType::Lolli { value, cont } => TypeNode::Lolli {
            value: child_key(value),
            cont: child_key(cont),
        },
        SessionType::InternalChoice(arms) => TypeNode::InternalChoice(
            arms.iter()
                .map(|(label, arm)| (label.clone(), child_key(arm)))
                .collect(),
        ),
        SessionType::ExternalChoice(arms) => TypeNode::ExternalChoice(
            arms.iter()
                .map(|(label, arm)| (label.clone(), child_key(arm)))
                .collect(),
        ),
    }
}

/// Coarse description of a node, used in diagnostics and mismatch errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Unit,
    Link(TypeName),
    Tensor,
    Lolli,
    Internal(BTreeSet<Label>),
    External(BTreeSet<Label>),
    /// A specific type, when equality rather than shape was required.
    Exact(TypeKey),
}

fn write_labels(f: &mut fmt::Formatter<'_>, labels: &BTreeSet<Label>) -> fmt::Result {
    let joined: Vec<&str> = labels.iter().map(Label::as_str).collect();
    write!(f, "{{{}}}", joined.join(", "))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Unit => write!(f, "unit"),
            Shape::Link(name) => write!(f, "link {name}"),
            Shape::Tensor => write!(f, "tensor"),
            Shape::Lolli => write!(f, "lolli"),
            Shape::Internal(labels) => {
                write!(f, "internal choice ")?;
                write_labels(f, labels)
            }
            Shape::External(labels) => {
                write!(f, "external choice ")?;
                write_labels(f, labels)
            }
            Shape::Exact(key) => write!(f, "type {}", key.short()),
        }
    }
}

/// Errors from type-level operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeModelError {
    #[error("expected a tensor or lolli, found {got}")]
    NotAProduct { got: Shape },

    #[error("expected a choice, found {got}")]
    NotASum { got: Shape },

    #[error("label '{0}' not offered by this choice")]
    LabelNotFound(Label),

    #[error("unknown type name '{0}'")]
    UnknownTypeName(TypeName),

    #[error("type name '{0}' links to itself")]
    CyclicLink(TypeName),

    #[error("type key {0} is not in the store")]
    UnknownTypeKey(TypeKey),

    #[error("choice must offer at least one arm")]
    EmptyChoice,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &'static str) -> Label {
        Label::from_static(s)
    }

    #[test]
    fn test_polarity_of_connectives() {
        assert_eq!(SessionType::Unit.polarity(), Polarity::Pos);
        assert_eq!(
            SessionType::tensor(SessionType::Unit, SessionType::Unit).polarity(),
            Polarity::Pos
        );
        assert_eq!(
            SessionType::lolli(SessionType::Unit, SessionType::Unit).polarity(),
            Polarity::Neg
        );
        assert_eq!(
            SessionType::internal([(label("a"), SessionType::Unit)]).polarity(),
            Polarity::Pos
        );
        assert_eq!(
            SessionType::external([(label("a"), SessionType::Unit)]).polarity(),
            Polarity::Neg
        );
        assert_eq!(
            SessionType::link(TypeName::from_static("T")).polarity(),
            Polarity::Zero
        );
    }

    #[test]
    fn test_identical_trees_share_a_key() {
        let a = SessionType::tensor(SessionType::Unit, SessionType::Unit);
        let b = SessionType::tensor(SessionType::Unit, SessionType::Unit);
        assert_eq!(key_of(&a), key_of(&b));
        assert_ne!(
            key_of(&a),
            key_of(&SessionType::lolli(SessionType::Unit, SessionType::Unit))
        );
    }

    #[test]
    fn test_arm_order_does_not_change_key() {
        let ab = SessionType::external([
            (label("a"), SessionType::Unit),
            (label("b"), SessionType::lolli(SessionType::Unit, SessionType::Unit)),
        ]);
        let ba = SessionType::external([
            (label("b"), SessionType::lolli(SessionType::Unit, SessionType::Unit)),
            (label("a"), SessionType::Unit),
        ]);
        assert_eq!(key_of(&ab), key_of(&ba));
    }

    #[test]
    fn test_choice_direction_changes_key() {
        let arms = [(label("a"), SessionType::Unit)];
        assert_ne!(
            key_of(&SessionType::internal(arms.clone())),
            key_of(&SessionType::external(arms))
        );
    }

    #[test]
    fn test_well_formed_rejects_empty_choice() {
        assert!(!SessionType::internal([]).well_formed());
        let nested = SessionType::tensor(SessionType::Unit, SessionType::external([]));
        assert!(!nested.well_formed());
    }

    #[test]
    fn test_links_are_collected() {
        let t = SessionType::tensor(
            SessionType::link(TypeName::from_static("A")),
            SessionType::internal([(label("x"), SessionType::link(TypeName::from_static("B")))]),
        );
        let links: Vec<_> = t.links().into_iter().map(|n| n.to_string()).collect();
        assert_eq!(links, vec!["A", "B"]);
    }

    #[test]
    fn test_shape_display() {
        let shape = TypeNode::InternalChoice(
            [(label("b"), key_of(&SessionType::Unit)), (label("a"), key_of(&SessionType::Unit))]
                .into_iter()
                .collect(),
        )
        .shape();
        assert_eq!(shape.to_string(), "internal choice {a, b}");
    }
}
