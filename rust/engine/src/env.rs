//! Declarations and the per-step environment built from them.
//!
//! An [`Env`] is a read-only value assembled once per step attempt by
//! [`collect_env`], then passed explicitly to the checker and step engine.

use std::collections::{BTreeMap, BTreeSet};

use parley_types::{
    NameTable, Placeholder, ProcName, SessionType, Shape, Term, TypeKey, TypeName, TypeNode,
    TypeStore,
};
use serde::{Deserialize, Serialize};

use crate::error::{BindingError, EngineResult, RepoError};
use crate::repository::{AliasRepo, DeclRepo};

/// A declared process: its signature as type keys and its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcDecl {
    pub name: ProcName,
    /// Placeholder and type of the channel the process provides.
    pub provider: (Placeholder, TypeKey),
    /// Channels handed in by the spawner, held as client.
    pub params: Vec<(Placeholder, TypeKey)>,
    pub body: Term,
}

impl ProcDecl {
    pub fn signature_keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
        std::iter::once(self.provider.1).chain(self.params.iter().map(|(_, key)| *key))
    }
}

/// A process declaration with its signature given as trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcDeclSpec {
    pub name: ProcName,
    pub provider: (Placeholder, SessionType),
    pub params: Vec<(Placeholder, SessionType)>,
    pub body: Term,
}

impl ProcDeclSpec {
    /// Intern the signature into `types`.
    pub fn intern(&self, types: &mut TypeStore) -> ProcDecl {
        ProcDecl {
            name: self.name.clone(),
            provider: (self.provider.0.clone(), types.intern(&self.provider.1)),
            params: self
                .params
                .iter()
                .map(|(placeholder, ty)| (placeholder.clone(), types.intern(ty)))
                .collect(),
            body: self.body.clone(),
        }
    }

    pub fn session_types(&self) -> impl Iterator<Item = &SessionType> {
        std::iter::once(&self.provider.1).chain(self.params.iter().map(|(_, ty)| ty))
    }
}

/// A qualified synonym for a declared name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AliasDecl {
    Proc { alias: ProcName, target: ProcName },
    Type { alias: TypeName, target: TypeName },
}

/// Everything a step needs to know about declared types and processes.
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub types: TypeStore,
    pub names: NameTable,
    pub procs: BTreeMap<ProcName, ProcDecl>,
}

impl Env {
    /// Resolve links and return the first structural node.
    ///
    /// # Errors
    ///
    /// `UnknownTypeName` or a missing node.
    pub fn resolve(&self, key: TypeKey) -> EngineResult<(TypeKey, &TypeNode)> {
        let resolved = self.types.resolve(key, &self.names)?;
        Ok((resolved, self.types.node(resolved)?))
    }

    /// # Errors
    ///
    /// Propagates resolution failures.
    pub fn type_eq(&self, a: TypeKey, b: TypeKey) -> EngineResult<bool> {
        Ok(self.types.type_eq(a, b, &self.names)?)
    }

    /// # Errors
    ///
    /// `UnknownProcName` if the declaration was not collected.
    pub fn proc(&self, name: &ProcName) -> EngineResult<&ProcDecl> {
        self.procs
            .get(name)
            .ok_or_else(|| BindingError::UnknownProcName(name.clone()).into())
    }

    /// Shape after resolution; falls back to the raw node.
    #[must_use]
    pub fn shape(&self, key: TypeKey) -> Shape {
        match self.resolve(key) {
            Ok((_, node)) => node.shape(),
            Err(_) => self.types.shape(key),
        }
    }
}

/// Build the environment for checking and stepping `term`.
///
/// Loads the declarations of every process the term names (through aliases
/// when needed), then the closure of type nodes reachable from `seeds` and
/// from those declarations, following named links. Every repository lookup
/// is batched.
///
/// # Errors
///
/// `UnknownProcName` for a process that is neither declared nor aliased,
/// or a repository failure.
pub fn collect_env<S>(
    store: &S,
    term: &Term,
    seeds: impl IntoIterator<Item = TypeKey>,
) -> EngineResult<Env>
where
    S: DeclRepo + AliasRepo + ?Sized,
{
    let mut env = Env::default();
    load_procs(store, &mut env, term.proc_names())?;
    let mut roots: Vec<TypeKey> = seeds.into_iter().collect();
    roots.extend(env.procs.values().flat_map(ProcDecl::signature_keys));
    load_types(store, &mut env, roots)?;
    tracing::trace!(
        procs = env.procs.len(),
        names = env.names.len(),
        nodes = env.types.len(),
        "environment collected"
    );
    Ok(env)
}

/// Build the environment for checking a declaration that is not committed
/// yet. `types` holds the nodes of its signature; the declaration itself is
/// visible so the body may recurse.
///
/// # Errors
///
/// As [`collect_env`].
pub fn collect_decl_env<S>(store: &S, decl: &ProcDecl, types: TypeStore) -> EngineResult<Env>
where
    S: DeclRepo + AliasRepo + ?Sized,
{
    let mut env = Env {
        types,
        ..Env::default()
    };
    let mut names = decl.body.proc_names();
    names.remove(&decl.name);
    load_procs(store, &mut env, names)?;
    env.procs.insert(decl.name.clone(), decl.clone());
    let roots = env.procs.values().flat_map(ProcDecl::signature_keys).collect();
    load_types(store, &mut env, roots)?;
    Ok(env)
}

/// Look up one declaration, through an alias if needed.
///
/// # Errors
///
/// `UnknownProcName`, or a repository failure.
pub fn find_proc<S>(store: &S, name: &ProcName) -> EngineResult<ProcDecl>
where
    S: DeclRepo + AliasRepo + ?Sized,
{
    let mut env = Env::default();
    load_procs(store, &mut env, BTreeSet::from([name.clone()]))?;
    env.procs
        .remove(name)
        .ok_or_else(|| BindingError::UnknownProcName(name.clone()).into())
}

fn load_procs<S>(store: &S, env: &mut Env, names: BTreeSet<ProcName>) -> EngineResult<()>
where
    S: DeclRepo + AliasRepo + ?Sized,
{
    if names.is_empty() {
        return Ok(());
    }
    let mut found = store.proc_decls(&names)?;
    let missing: BTreeSet<ProcName> = names
        .into_iter()
        .filter(|name| !found.contains_key(name))
        .collect();
    if !missing.is_empty() {
        let aliases = store.proc_aliases(&missing)?;
        let targets: BTreeSet<ProcName> = aliases.values().cloned().collect();
        let resolved = store.proc_decls(&targets)?;
        for name in missing {
            let target = aliases
                .get(&name)
                .ok_or_else(|| BindingError::UnknownProcName(name.clone()))?;
            let decl = resolved
                .get(target)
                .ok_or_else(|| BindingError::UnknownProcName(target.clone()))?;
            found.insert(name, decl.clone());
        }
    }
    env.procs.extend(found);
    Ok(())
}

/// Load into `env` every node reachable from `roots`, following links
/// through declared (or aliased) type names. Unknown names are left
/// unresolved; resolving them later reports `UnknownTypeName`.
///
/// # Errors
///
/// A reachable node missing from the store, or a repository failure.
pub fn load_types<S>(store: &S, env: &mut Env, mut roots: Vec<TypeKey>) -> EngineResult<()>
where
    S: DeclRepo + AliasRepo + ?Sized,
{
    let mut tried: BTreeSet<TypeName> = BTreeSet::new();
    loop {
        let reach = env.types.reachable(&roots);
        let unnamed: BTreeSet<TypeName> = reach
            .links
            .iter()
            .filter(|name| !env.names.contains_key(*name) && !tried.contains(*name))
            .cloned()
            .collect();
        if reach.missing.is_empty() && unnamed.is_empty() {
            return Ok(());
        }

        if !reach.missing.is_empty() {
            let nodes = store.type_nodes(&reach.missing)?;
            if let Some(key) = reach.missing.iter().find(|key| !nodes.contains_key(*key)) {
                return Err(RepoError::NotFound {
                    entity: "type node",
                    key: key.to_hex(),
                }
                .into());
            }
            env.types.extend(nodes);
        }

        if !unnamed.is_empty() {
            let mut named = store.type_names(&unnamed)?;
            let rest: BTreeSet<TypeName> = unnamed
                .iter()
                .filter(|name| !named.contains_key(*name))
                .cloned()
                .collect();
            if !rest.is_empty() {
                let aliases = store.type_aliases(&rest)?;
                let targets: BTreeSet<TypeName> = aliases.values().cloned().collect();
                let resolved = store.type_names(&targets)?;
                for (alias, target) in aliases {
                    if let Some(key) = resolved.get(&target) {
                        named.insert(alias, *key);
                    }
                }
            }
            roots.extend(named.values().copied());
            env.names.extend(named);
            tried.extend(unnamed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemStore;
    use crate::coordinator::Mod;
    use crate::repository::Store;
    use assert_matches::assert_matches;
    use parley_types::{key_of, Label};

    fn p(s: &'static str) -> Placeholder {
        Placeholder::from_static(s)
    }

    fn declare(store: &MemStore, name: &'static str, ty: &SessionType) -> TypeKey {
        let mut types = TypeStore::new();
        let key = types.intern(ty);
        let mut changes = Mod::default();
        changes.type_nodes = types.iter().map(|(k, n)| (*k, n.clone())).collect();
        changes.type_names.push((TypeName::from_static(name), key));
        store.apply(changes).unwrap();
        key
    }

    #[test]
    fn test_collect_follows_links_across_names() {
        let store = MemStore::new();
        let stream = SessionType::external([
            (Label::from_static("next"), SessionType::tensor(SessionType::Unit, SessionType::link(TypeName::from_static("Stream")))),
            (Label::from_static("stop"), SessionType::Unit),
        ]);
        let stream_key = declare(&store, "Stream", &stream);
        let seed = key_of(&SessionType::link(TypeName::from_static("Stream")));
        let mut changes = Mod::default();
        changes.type_nodes.push((seed, TypeNode::LinkTo(TypeName::from_static("Stream"))));
        store.apply(changes).unwrap();

        let env = collect_env(&store, &Term::close(p("x")), [seed]).unwrap();
        assert_eq!(env.resolve(seed).unwrap().0, stream_key);
        assert_eq!(env.names.len(), 1);
    }

    #[test]
    fn test_collect_resolves_proc_aliases() {
        let store = MemStore::new();
        let unit = declare(&store, "One", &SessionType::Unit);
        let decl = ProcDecl {
            name: ProcName::from_static("billing.Closer"),
            provider: (p("r"), unit),
            params: vec![],
            body: Term::close(p("r")),
        };
        let mut changes = Mod::default();
        changes.proc_decls.push(decl);
        changes.aliases.push(AliasDecl::Proc {
            alias: ProcName::from_static("Closer"),
            target: ProcName::from_static("billing.Closer"),
        });
        store.apply(changes).unwrap();

        let term = Term::spawn(p("c"), ProcName::from_static("Closer"), vec![], Term::close(p("r")));
        let env = collect_env(&store, &term, []).unwrap();
        let decl = env.proc(&ProcName::from_static("Closer")).unwrap();
        assert_eq!(decl.name, ProcName::from_static("billing.Closer"));
    }

    #[test]
    fn test_unknown_proc_name() {
        let store = MemStore::new();
        let term = Term::call(p("r"), ProcName::from_static("Nowhere"), vec![]);
        assert_matches!(
            collect_env(&store, &term, []),
            Err(crate::EngineError::Binding(BindingError::UnknownProcName(name))) if name == "Nowhere"
        );
    }

    #[test]
    fn test_unknown_type_name_is_left_for_resolution() {
        let store = MemStore::new();
        let link = SessionType::link(TypeName::from_static("Ghost"));
        let seed = key_of(&link);
        let mut changes = Mod::default();
        changes.type_nodes.push((seed, TypeNode::LinkTo(TypeName::from_static("Ghost"))));
        store.apply(changes).unwrap();

        let env = collect_env(&store, &Term::close(p("x")), [seed]).unwrap();
        assert_matches!(
            env.resolve(seed),
            Err(crate::EngineError::Binding(BindingError::UnknownTypeName(_)))
        );
    }
}
