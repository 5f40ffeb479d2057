//! Shared test infrastructure for engine integration tests.

use std::sync::Arc;

use parley_engine::{
    EngineConfig, EngineResult, Lifecycle, MemStore, PoolRef, ProcDeclSpec, ProcessId,
    ProcessRef, RunReport, SequentialIds, Snapshot, StepSpec, Transactor,
};
use parley_engine::snapshot::{BindingView, ProcessSnapshot};
use parley_types::{Label, Placeholder, ProcName, SessionType, Term, TypeName};

pub type MemLifecycle = Lifecycle<Transactor<MemStore>>;

pub fn p(name: &'static str) -> Placeholder {
    Placeholder::from_static(name)
}

pub fn proc_name(name: &'static str) -> ProcName {
    ProcName::from_static(name)
}

pub fn type_name(name: &'static str) -> TypeName {
    TypeName::from_static(name)
}

pub fn label(name: &'static str) -> Label {
    Label::from_static(name)
}

/// `name(provider: ty; params) = body`.
pub fn decl(
    name: &'static str,
    provider: (&'static str, SessionType),
    params: Vec<(&'static str, SessionType)>,
    body: Term,
) -> ProcDeclSpec {
    ProcDeclSpec {
        name: proc_name(name),
        provider: (p(provider.0), provider.1),
        params: params.into_iter().map(|(n, ty)| (p(n), ty)).collect(),
        body,
    }
}

/// A lifecycle over a fresh store, with sequential ids and one pool.
pub struct Harness {
    pub store: Arc<MemStore>,
    pub lc: MemLifecycle,
    pub pool: PoolRef,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemStore::new());
        let lc = Lifecycle::new(Transactor::new(Arc::clone(&store)), config)
            .with_ids(SequentialIds::new());
        let pool = lc.spawn_pool("test").unwrap();
        Self { store, lc, pool }
    }

    /// Resume over an imported store, continuing the id sequence.
    pub fn restore(json: &str, pool: PoolRef, issued: u64) -> Self {
        let store = Arc::new(MemStore::import(json).unwrap());
        let lc = Lifecycle::new(Transactor::new(Arc::clone(&store)), EngineConfig::default())
            .with_ids(SequentialIds::starting_after(issued));
        Self { store, lc, pool }
    }

    pub fn declare(&self, spec: ProcDeclSpec) {
        self.lc.declare_process(spec).unwrap();
    }

    pub fn root(&self, name: &'static str) -> ProcessRef {
        self.lc.spawn_sub(self.pool.pool_id, &proc_name(name)).unwrap()
    }

    pub fn poll(&self) -> Option<ProcessRef> {
        self.lc.poll(self.pool.pool_id).unwrap()
    }

    pub fn spec(&self, process_id: ProcessId, term: Term) -> StepSpec {
        StepSpec {
            pool_id: self.pool.pool_id,
            process_id,
            term,
        }
    }

    pub fn run(&self, process_id: ProcessId, term: Term) -> EngineResult<RunReport> {
        self.lc.run(self.spec(process_id, term))
    }

    /// Plan and commit exactly one step, returning its continuation.
    pub fn step_once(&self, spec: StepSpec) -> Option<StepSpec> {
        let step = self.lc.plan(&spec).unwrap();
        self.lc.commit(step.changes).unwrap();
        step.next
    }

    /// Poll and start processes until none are left.
    pub fn drain(&self) -> Vec<RunReport> {
        let mut reports = Vec::new();
        while let Some(next) = self.poll() {
            reports.push(self.lc.start(next.process_id).unwrap());
        }
        reports
    }

    pub fn process(&self, process_id: ProcessId) -> ProcessSnapshot {
        match self.lc.retrieve_snapshot(process_id).unwrap() {
            Snapshot::Process(snapshot) => snapshot,
            Snapshot::Pool(_) => panic!("{process_id} is a pool"),
        }
    }

    pub fn bindings(&self, process_id: ProcessId) -> Vec<BindingView> {
        self.process(process_id).bindings
    }

    pub fn live_processes(&self) -> usize {
        match self.lc.retrieve_snapshot(self.pool.pool_id).unwrap() {
            Snapshot::Pool(pool) => pool.live().count(),
            Snapshot::Process(_) => panic!("pool id names a process"),
        }
    }
}
