//! Persistent rendezvous step engine for session-typed processes.
//!
//! Processes communicate over channels whose protocols are session types
//! (see `parley-types`). Every state change is an append to a ledger, so the
//! whole system can be stopped, serialised and resumed.
//!
//! # Architecture
//!
//! - **Ledger** ([`ledger`]): binding rows, pending half-steps, liabilities
//! - **Environment** ([`env::collect_env`]): declarations a term needs, loaded per step
//! - **Checker** ([`checker::check`]): local session-type check of a whole term
//! - **Step engine** ([`step::take_step`]): pure rendezvous over a snapshot
//! - **Coordinator** ([`coordinator`]): optimistic, all-or-nothing commit
//! - **Repository** ([`repository`], [`memory::MemStore`]): storage ports
//! - **Lifecycle** ([`lifecycle::Lifecycle`]): pools, processes and the run loop
//!
//! # Usage
//!
//! ```ignore
//! use parley_engine::{EngineConfig, Lifecycle, MemStore, Transactor};
//!
//! let lc = Lifecycle::new(Transactor::new(Arc::new(MemStore::new())), EngineConfig::default());
//! let pool = lc.spawn_pool("jobs")?;
//! lc.declare_process(decl)?;
//! let root = lc.spawn_sub(pool.pool_id, &name)?;
//! lc.start(root.process_id)?;
//! while let Some(child) = lc.poll(pool.pool_id)? {
//!     lc.start(child.process_id)?;
//! }
//! ```

pub mod checker;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod faults;
pub mod ids;
pub mod ledger;
pub mod lifecycle;
pub mod memory;
pub mod repository;
pub mod snapshot;
pub mod step;

pub use config::EngineConfig;
pub use context::{Context, Resource};
pub use coordinator::{commit, verify, CommitView, LockTicket, Mod, PendingGuard};
pub use env::{collect_env, AliasDecl, Env, ProcDecl, ProcDeclSpec};
pub use error::{
    BindingError, ConflictError, EngineError, EngineResult, ProtocolError, RepoError, TypeError,
};
pub use faults::{classify_error, error_code_of, ErrorClass};
pub use ids::{ChannelId, IdSource, PoolId, ProcessId, RandomIds, SequentialIds};
pub use ledger::{
    BindingEntry, BindingEvent, LiabilityEvent, LiabilityRecord, PendingKind, PendingRecord,
    PendingStep, Revision, Role,
};
pub use lifecycle::{Lifecycle, PoolRef, ProcessRef, RunReport};
pub use memory::MemStore;
pub use repository::{Operator, Store, Transactor};
pub use snapshot::{BindingView, PoolSnapshot, ProcessSnapshot, ProcessSummary, Snapshot};
pub use step::{take_step, Step, StepEvent, StepOutcome, StepSnapshot, StepSpec};
