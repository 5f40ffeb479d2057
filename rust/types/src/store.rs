//! Hash-cons table for session-type nodes.
//!
//! The store maps [`TypeKey`] to [`TypeNode`]. Interning a tree records each
//! node once; trees that share subtrees share entries. Keys can always be
//! recomputed from the tree with [`key_of`](crate::key_of), so the table is a
//! cache for navigation, not a source of identity.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::content_id::TypeKey;
use crate::identifiers::{Label, TypeName};
use crate::session::{node_of, Polarity, SessionType, Shape, TypeModelError, TypeNode};

/// Declared type names and the root key each resolves to.
pub type NameTable = BTreeMap<TypeName, TypeKey>;

/// Intern metrics for cache analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Nodes that were already present when interned.
    pub hits: u64,
    /// Nodes newly recorded.
    pub misses: u64,
    /// Number of nodes currently stored.
    pub size: usize,
}

impl CacheMetrics {
    /// Hit rate as a percentage.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Content-addressed node table.
///
/// # Examples
///
/// ```
/// use parley_types::{key_of, SessionType, TypeStore};
///
/// let mut store = TypeStore::new();
/// let t = SessionType::tensor(SessionType::Unit, SessionType::Unit);
/// let key = store.intern(&t);
/// assert_eq!(key, key_of(&t));
/// // both children are the same `Unit` node
/// assert_eq!(store.len(), 2);
/// assert_eq!(store.next(key).unwrap(), key_of(&SessionType::Unit));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeStore {
    nodes: HashMap<TypeKey, TypeNode>,
    hits: u64,
    misses: u64,
}

impl TypeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every node of `ty` and return the root key.
    pub fn intern(&mut self, ty: &SessionType) -> TypeKey {
        let node = node_of(ty, &mut |child: &SessionType| self.intern(child));
        self.insert_node(node)
    }

    /// Record a single node whose children are already present.
    pub fn insert_node(&mut self, node: TypeNode) -> TypeKey {
        let key = node.key();
        if self.nodes.contains_key(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            self.nodes.insert(key, node);
        }
        key
    }

    /// Merge externally loaded nodes, keyed as stored.
    pub fn extend(&mut self, nodes: impl IntoIterator<Item = (TypeKey, TypeNode)>) {
        for (key, node) in nodes {
            self.nodes.entry(key).or_insert(node);
        }
    }

    #[must_use]
    pub fn contains(&self, key: &TypeKey) -> bool {
        self.nodes.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits,
            misses: self.misses,
            size: self.nodes.len(),
        }
    }

    /// Iterate over all stored nodes.
    pub fn iter(&self) -> impl Iterator<Item = (&TypeKey, &TypeNode)> {
        self.nodes.iter()
    }

    /// Look up a node.
    ///
    /// # Errors
    ///
    /// `UnknownTypeKey` if the key was never interned or loaded.
    pub fn node(&self, key: TypeKey) -> Result<&TypeNode, TypeModelError> {
        self.nodes
            .get(&key)
            .ok_or(TypeModelError::UnknownTypeKey(key))
    }

    /// Polarity of the node itself; a link reports `Zero`.
    ///
    /// # Errors
    ///
    /// `UnknownTypeKey` if the node is missing.
    pub fn polarity(&self, key: TypeKey) -> Result<Polarity, TypeModelError> {
        Ok(self.node(key)?.polarity())
    }

    /// Follow links until a non-link node.
    ///
    /// # Errors
    ///
    /// `UnknownTypeName` for an undeclared link target, `CyclicLink` when a
    /// name is reached twice, `UnknownTypeKey` for a missing node.
    pub fn resolve(&self, key: TypeKey, names: &NameTable) -> Result<TypeKey, TypeModelError> {
        let mut current = key;
        let mut seen = BTreeSet::new();
        loop {
            match self.node(current)? {
                TypeNode::LinkTo(name) => {
                    if !seen.insert(name.clone()) {
                        return Err(TypeModelError::CyclicLink(name.clone()));
                    }
                    current = *names
                        .get(name)
                        .ok_or_else(|| TypeModelError::UnknownTypeName(name.clone()))?;
                }
                _ => return Ok(current),
            }
        }
    }

    /// Structural equality, compared on resolved keys.
    ///
    /// # Errors
    ///
    /// Propagates resolution failures.
    pub fn type_eq(&self, a: TypeKey, b: TypeKey, names: &NameTable) -> Result<bool, TypeModelError> {
        if a == b {
            return Ok(true);
        }
        Ok(self.resolve(a, names)? == self.resolve(b, names)?)
    }

    /// Continuation of a product type.
    ///
    /// # Errors
    ///
    /// `NotAProduct` unless the node is a tensor or lolli.
    pub fn next(&self, key: TypeKey) -> Result<TypeKey, TypeModelError> {
        match self.node(key)? {
            TypeNode::Tensor { cont, .. } | TypeNode::Lolli { cont, .. } => Ok(*cont),
            other => Err(TypeModelError::NotAProduct { got: other.shape() }),
        }
    }

    /// Transmitted value type of a product type.
    ///
    /// # Errors
    ///
    /// `NotAProduct` unless the node is a tensor or lolli.
    pub fn value(&self, key: TypeKey) -> Result<TypeKey, TypeModelError> {
        match self.node(key)? {
            TypeNode::Tensor { value, .. } | TypeNode::Lolli { value, .. } => Ok(*value),
            other => Err(TypeModelError::NotAProduct { got: other.shape() }),
        }
    }

    /// Arm selected by `label` in a choice.
    ///
    /// # Errors
    ///
    /// `NotASum` for non-choices, `LabelNotFound` for an absent arm.
    pub fn next_for(&self, key: TypeKey, label: &Label) -> Result<TypeKey, TypeModelError> {
        match self.node(key)? {
            TypeNode::InternalChoice(arms) | TypeNode::ExternalChoice(arms) => arms
                .get(label)
                .copied()
                .ok_or_else(|| TypeModelError::LabelNotFound(label.clone())),
            other => Err(TypeModelError::NotASum { got: other.shape() }),
        }
    }

    /// Labels offered by a choice.
    ///
    /// # Errors
    ///
    /// `NotASum` for non-choices.
    pub fn labels(&self, key: TypeKey) -> Result<BTreeSet<Label>, TypeModelError> {
        match self.node(key)? {
            TypeNode::InternalChoice(arms) | TypeNode::ExternalChoice(arms) => {
                Ok(arms.keys().cloned().collect())
            }
            other => Err(TypeModelError::NotASum { got: other.shape() }),
        }
    }

    /// Shape of the node, or `Exact` when the key is unknown.
    #[must_use]
    pub fn shape(&self, key: TypeKey) -> Shape {
        self.nodes
            .get(&key)
            .map_or(Shape::Exact(key), TypeNode::shape)
    }

    /// Rebuild the tree rooted at `key`. Links stay links.
    ///
    /// # Errors
    ///
    /// `UnknownTypeKey` if any reachable node is missing.
    pub fn tree(&self, key: TypeKey) -> Result<SessionType, TypeModelError> {
        Ok(match self.node(key)? {
            TypeNode::Unit => SessionType::Unit,
            TypeNode::LinkTo(name) => SessionType::LinkTo(name.clone()),
            TypeNode::Tensor { value, cont } => {
                SessionType::tensor(self.tree(*value)?, self.tree(*cont)?)
            }
            TypeNode::Lolli { value, cont } => {
                SessionType::lolli(self.tree(*value)?, self.tree(*cont)?)
            }
            TypeNode::InternalChoice(arms) => SessionType::InternalChoice(self.tree_arms(arms)?),
            TypeNode::ExternalChoice(arms) => SessionType::ExternalChoice(self.tree_arms(arms)?),
        })
    }

    fn tree_arms(
        &self,
        arms: &BTreeMap<Label, TypeKey>,
    ) -> Result<BTreeMap<Label, SessionType>, TypeModelError> {
        arms.iter()
            .map(|(label, key)| Ok((label.clone(), self.tree(*key)?)))
            .collect()
    }

    /// Keys reachable from `roots` without crossing links, and the link
    /// names met on the way. Missing nodes are reported in the first set so
    /// a caller can load them and ask again.
    #[must_use]
    pub fn reachable(&self, roots: &[TypeKey]) -> Reachable {
        let mut out = Reachable::default();
        let mut stack: Vec<TypeKey> = roots.to_vec();
        while let Some(key) = stack.pop() {
            if out.present.contains(&key) || out.missing.contains(&key) {
                continue;
            }
            match self.nodes.get(&key) {
                None => {
                    out.missing.insert(key);
                }
                Some(node) => {
                    out.present.insert(key);
                    if let TypeNode::LinkTo(name) = node {
                        out.links.insert(name.clone());
                    }
                    stack.extend(node.children());
                }
            }
        }
        out
    }
}

/// Result of [`TypeStore::reachable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachable {
    pub present: BTreeSet<TypeKey>,
    pub missing: BTreeSet<TypeKey>,
    pub links: BTreeSet<TypeName>,
}
