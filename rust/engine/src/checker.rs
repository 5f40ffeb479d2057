//! Local session-type checker.
//!
//! The checker validates a whole term tree against the context assembled
//! for the stepping process, before any change is computed. It threads a
//! private copy of the context through continuations and never touches the
//! ledger.
//!
//! Which rule applies depends on the side the process holds the via channel
//! on. Each (term, side) pair needs a polarity; a wrong polarity is a
//! `TermKindMismatch`, a right polarity with the wrong connective is a
//! `TypeMismatch`.
//!
//! | Side | Needs `+` | Needs `-` |
//! |------|-----------|-----------|
//! | provider | close, send, label | recv, case |
//! | client | wait, recv, case | send, label |

use std::collections::{BTreeMap, BTreeSet};

use parley_types::{Label, Placeholder, Polarity, Shape, Term, TypeKey, TypeNode};

use crate::context::{Context, Resource};
use crate::env::{Env, ProcDecl};
use crate::error::{BindingError, EngineError, EngineResult, TypeError};
use crate::ledger::Role;

/// Check `term` against `ctx`.
///
/// # Errors
///
/// A binding error for unknown names, a type error for an ill-typed term.
pub fn check(env: &Env, ctx: &Context, term: &Term) -> EngineResult<()> {
    let mut local = ctx.clone();
    check_term(env, &mut local, term)
}

/// Check a declared body against its own signature.
///
/// # Errors
///
/// As [`check`].
pub fn check_declaration(env: &Env, decl: &ProcDecl) -> EngineResult<()> {
    let mut ctx = Context::new();
    ctx.introduce(
        decl.provider.0.clone(),
        Resource {
            role: Role::Provider,
            state: decl.provider.1,
        },
    )?;
    for (name, state) in &decl.params {
        ctx.introduce(
            name.clone(),
            Resource {
                role: Role::Client,
                state: *state,
            },
        )?;
    }
    check_term(env, &mut ctx, &decl.body)
}

fn check_term(env: &Env, ctx: &mut Context, term: &Term) -> EngineResult<()> {
    match term {
        Term::Spawn {
            via,
            proc_name,
            args,
            cont,
        } => {
            if ctx.contains(via) {
                return Err(BindingError::DuplicatePlaceholder {
                    placeholder: via.clone(),
                }
                .into());
            }
            let decl = env.proc(proc_name)?;
            take_args(env, ctx, decl, args)?;
            ctx.introduce(
                via.clone(),
                Resource {
                    role: Role::Client,
                    state: decl.provider.1,
                },
            )?;
            check_term(env, ctx, cont)
        }
        Term::Call {
            via,
            proc_name,
            args,
        } => {
            let decl = env.proc(proc_name)?;
            let provided = ctx.require(via)?;
            expect_role(via, Role::Provider, provided.role)?;
            expect_equal(env, via, decl.provider.1, provided.state)?;
            let mut keep = vec![via];
            keep.extend(args);
            expect_only(ctx, via, &keep)?;
            ctx.discharge(via);
            take_args(env, ctx, decl, args)
        }
        _ => {
            let via = term.via();
            let held = ctx.require(via)?;
            match held.role {
                Role::Provider => check_as_provider(env, ctx, via, held.state, term),
                Role::Client => check_as_client(env, ctx, via, held.state, term),
            }
        }
    }
}

fn check_as_provider(
    env: &Env,
    ctx: &mut Context,
    via: &Placeholder,
    state: TypeKey,
    term: &Term,
) -> EngineResult<()> {
    const ROLE: Role = Role::Provider;
    let (resolved, node) = env.resolve(state)?;
    match term {
        Term::Close { .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Pos)?;
            if !matches!(node, TypeNode::Unit) {
                return Err(mismatch(via, Shape::Unit, node));
            }
            expect_only(ctx, via, &[via])?;
            ctx.discharge(via);
            Ok(())
        }
        Term::Send { value, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Pos)?;
            let TypeNode::Tensor { value: sent, cont } = node else {
                return Err(mismatch(via, Shape::Tensor, node));
            };
            take_value(env, ctx, via, value, *sent)?;
            ctx.advance(via, *cont);
            Ok(())
        }
        Term::Label { label, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Pos)?;
            let TypeNode::InternalChoice(arms) = node else {
                return Err(mismatch(via, Shape::Internal(BTreeSet::from([label.clone()])), node));
            };
            select(ctx, via, arms, label)
        }
        Term::Recv { bind, cont, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Neg)?;
            let TypeNode::Lolli { value, cont: next } = node else {
                return Err(mismatch(via, Shape::Lolli, node));
            };
            receive(env, ctx, via, bind, *value, *next, cont)
        }
        Term::Case { branches, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Neg)?;
            let TypeNode::ExternalChoice(arms) = node else {
                return Err(mismatch(via, Shape::External(branches.keys().cloned().collect()), node));
            };
            branch(env, ctx, via, resolved, arms, branches, Shape::External)
        }
        Term::Forward { target, .. } => check_forward(env, ctx, via, ROLE, state, target),
        Term::Wait { .. } => Err(TypeError::TermKindMismatch {
            placeholder: via.clone(),
            term: term.kind(),
            role: ROLE,
            polarity: node.polarity(),
        }
        .into()),
        Term::Spawn { .. } | Term::Call { .. } => check_term(env, ctx, term),
    }
}

fn check_as_client(
    env: &Env,
    ctx: &mut Context,
    via: &Placeholder,
    state: TypeKey,
    term: &Term,
) -> EngineResult<()> {
    const ROLE: Role = Role::Client;
    let (resolved, node) = env.resolve(state)?;
    match term {
        Term::Wait { cont, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Pos)?;
            if !matches!(node, TypeNode::Unit) {
                return Err(mismatch(via, Shape::Unit, node));
            }
            ctx.discharge(via);
            check_term(env, ctx, cont)
        }
        Term::Recv { bind, cont, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Pos)?;
            let TypeNode::Tensor { value, cont: next } = node else {
                return Err(mismatch(via, Shape::Tensor, node));
            };
            receive(env, ctx, via, bind, *value, *next, cont)
        }
        Term::Case { branches, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Pos)?;
            let TypeNode::InternalChoice(arms) = node else {
                return Err(mismatch(via, Shape::Internal(branches.keys().cloned().collect()), node));
            };
            branch(env, ctx, via, resolved, arms, branches, Shape::Internal)
        }
        Term::Send { value, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Neg)?;
            let TypeNode::Lolli { value: sent, cont } = node else {
                return Err(mismatch(via, Shape::Lolli, node));
            };
            take_value(env, ctx, via, value, *sent)?;
            ctx.advance(via, *cont);
            Ok(())
        }
        Term::Label { label, .. } => {
            expect_polarity(via, term, ROLE, node, Polarity::Neg)?;
            let TypeNode::ExternalChoice(arms) = node else {
                return Err(mismatch(via, Shape::External(BTreeSet::from([label.clone()])), node));
            };
            select(ctx, via, arms, label)
        }
        Term::Forward { target, .. } => check_forward(env, ctx, via, ROLE, state, target),
        Term::Close { .. } => Err(TypeError::TermKindMismatch {
            placeholder: via.clone(),
            term: term.kind(),
            role: ROLE,
            polarity: node.polarity(),
        }
        .into()),
        Term::Spawn { .. } | Term::Call { .. } => check_term(env, ctx, term),
    }
}

fn receive(
    env: &Env,
    ctx: &mut Context,
    via: &Placeholder,
    bind: &Placeholder,
    value: TypeKey,
    next: TypeKey,
    cont: &Term,
) -> EngineResult<()> {
    ctx.advance(via, next);
    ctx.introduce(
        bind.clone(),
        Resource {
            role: Role::Client,
            state: value,
        },
    )?;
    check_term(env, ctx, cont)
}

fn select(
    ctx: &mut Context,
    via: &Placeholder,
    arms: &BTreeMap<Label, TypeKey>,
    label: &Label,
) -> EngineResult<()> {
    let arm = arms.get(label).ok_or_else(|| TypeError::LabelNotFound {
        placeholder: via.clone(),
        label: label.clone(),
    })?;
    ctx.advance(via, *arm);
    Ok(())
}

/// Branch labels must equal the choice's arms exactly.
fn branch(
    env: &Env,
    ctx: &Context,
    via: &Placeholder,
    choice: TypeKey,
    arms: &BTreeMap<Label, TypeKey>,
    branches: &BTreeMap<Label, Term>,
    shape: fn(BTreeSet<Label>) -> Shape,
) -> EngineResult<()> {
    let offered = env.types.labels(choice)?;
    let handled: BTreeSet<Label> = branches.keys().cloned().collect();
    if offered != handled {
        return Err(TypeError::TypeMismatch {
            placeholder: via.clone(),
            want: shape(offered),
            got: shape(handled),
        }
        .into());
    }
    for (label, body) in branches {
        if let Some(arm) = arms.get(label) {
            let mut local = ctx.clone();
            local.advance(via, *arm);
            check_term(env, &mut local, body)?;
        }
    }
    Ok(())
}

fn check_forward(
    env: &Env,
    ctx: &mut Context,
    via: &Placeholder,
    role: Role,
    state: TypeKey,
    target: &Placeholder,
) -> EngineResult<()> {
    if target == via {
        return Err(BindingError::DuplicatePlaceholder {
            placeholder: target.clone(),
        }
        .into());
    }
    let other = ctx.require(target)?;
    expect_role(target, role.opposite(), other.role)?;
    expect_equal(env, target, state, other.state)?;
    expect_only(ctx, via, &[via, target])?;
    ctx.discharge(via);
    ctx.discharge(target);
    Ok(())
}

/// Move a sent channel out of the context.
fn take_value(
    env: &Env,
    ctx: &mut Context,
    via: &Placeholder,
    value: &Placeholder,
    want: TypeKey,
) -> EngineResult<()> {
    if value == via {
        return Err(BindingError::DuplicatePlaceholder {
            placeholder: value.clone(),
        }
        .into());
    }
    let held = ctx.require(value)?;
    expect_role(value, Role::Client, held.role)?;
    expect_equal(env, value, want, held.state)?;
    ctx.discharge(value);
    Ok(())
}

/// Move call or spawn arguments out of the context.
fn take_args(env: &Env, ctx: &mut Context, decl: &ProcDecl, args: &[Placeholder]) -> EngineResult<()> {
    if args.len() != decl.params.len() {
        return Err(TypeError::ArityMismatch {
            proc_name: decl.name.clone(),
            want: decl.params.len(),
            got: args.len(),
        }
        .into());
    }
    for (arg, (_, want)) in args.iter().zip(&decl.params) {
        let held = ctx.require(arg)?;
        expect_role(arg, Role::Client, held.role)?;
        expect_equal(env, arg, *want, held.state)?;
        ctx.discharge(arg);
    }
    Ok(())
}

fn expect_polarity(
    via: &Placeholder,
    term: &Term,
    role: Role,
    node: &TypeNode,
    want: Polarity,
) -> EngineResult<()> {
    let polarity = node.polarity();
    if polarity == want {
        Ok(())
    } else {
        Err(TypeError::TermKindMismatch {
            placeholder: via.clone(),
            term: term.kind(),
            role,
            polarity,
        }
        .into())
    }
}

fn expect_role(placeholder: &Placeholder, want: Role, got: Role) -> EngineResult<()> {
    if want == got {
        Ok(())
    } else {
        Err(TypeError::RoleMismatch {
            placeholder: placeholder.clone(),
            want,
            got,
        }
        .into())
    }
}

fn expect_equal(env: &Env, placeholder: &Placeholder, want: TypeKey, got: TypeKey) -> EngineResult<()> {
    if env.type_eq(want, got)? {
        return Ok(());
    }
    let (want_shape, got_shape) = (env.shape(want), env.shape(got));
    let (want, got) = if want_shape == got_shape {
        (Shape::Exact(want), Shape::Exact(got))
    } else {
        (want_shape, got_shape)
    };
    Err(TypeError::TypeMismatch {
        placeholder: placeholder.clone(),
        want,
        got,
    }
    .into())
}

fn expect_only(ctx: &Context, at: &Placeholder, keep: &[&Placeholder]) -> EngineResult<()> {
    let leftover = ctx.others(keep);
    if leftover.is_empty() {
        Ok(())
    } else {
        Err(TypeError::LinearityViolation {
            placeholder: at.clone(),
            leftover,
        }
        .into())
    }
}

fn mismatch(via: &Placeholder, want: Shape, node: &TypeNode) -> EngineError {
    TypeError::TypeMismatch {
        placeholder: via.clone(),
        want,
        got: node.shape(),
    }
    .into()
}
