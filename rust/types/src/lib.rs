//! Session types and process terms for the parley step engine.
//!
//! This crate is pure data: no I/O, no clocks, no ids. It provides
//!
//! - validated names ([`Placeholder`], [`Label`], [`TypeName`], [`ProcName`]),
//! - session-type trees ([`SessionType`]) and their hash-consed form
//!   ([`TypeNode`], keyed by [`TypeKey`]),
//! - the [`TypeStore`] that navigates hash-consed types,
//! - the process grammar ([`Term`]).
//!
//! # Connectives
//!
//! | Type | Polarity | Provider | Client |
//! |------|----------|----------|--------|
//! | `Unit` | + | close | wait |
//! | `Tensor(v, c)` | + | send `v` | receive `v` |
//! | `Lolli(v, c)` | - | receive `v` | send `v` |
//! | `InternalChoice` | + | pick a label | branch |
//! | `ExternalChoice` | - | branch | pick a label |
//! | `LinkTo(name)` | 0 | resolve first | resolve first |

mod content_id;
mod identifiers;
mod session;
mod store;
mod term;

pub use content_id::{Hasher, Sha256Hasher, TypeKey};
pub use identifiers::{IdentifierError, Label, Placeholder, ProcName, TypeName};
pub use session::{key_of, Polarity, SessionType, Shape, TypeModelError, TypeNode};
pub use store::{CacheMetrics, NameTable, Reachable, TypeStore};
pub use term::{Term, TermKind};
