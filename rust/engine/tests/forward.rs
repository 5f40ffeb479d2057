//! Forwarding splices a relay out of the channel chain.

#[allow(dead_code, unreachable_pub)]
mod helpers;

use assert_matches::assert_matches;
use parley_engine::repository::PendingRepo;
use parley_engine::{PendingStep, ProcessId, StepOutcome};
use parley_types::{SessionType, Term, TermKind};
use std::collections::BTreeSet;
use uuid::Uuid;

use helpers::{decl, p, proc_name, Harness};

const MAIN: ProcessId = ProcessId(Uuid::from_u128(2));
const SERVER: ProcessId = ProcessId(Uuid::from_u128(4));
const RELAY: ProcessId = ProcessId(Uuid::from_u128(6));

fn main_body() -> Term {
    Term::spawn(
        p("s"),
        proc_name("Server"),
        vec![],
        Term::spawn(
            p("x"),
            proc_name("Relay"),
            vec![p("s")],
            Term::wait(p("x"), Term::close(p("r"))),
        ),
    )
}

/// `Relay(x: Unit; y: Unit) = fwd x y`, `Server(s: Unit) = close s`.
fn harness() -> Harness {
    let h = Harness::new();
    h.declare(decl("Server", ("s", SessionType::Unit), vec![], Term::close(p("s"))));
    h.declare(decl(
        "Relay",
        ("x", SessionType::Unit),
        vec![("y", SessionType::Unit)],
        Term::forward(p("x"), p("y")),
    ));
    h.declare(decl("Main", ("r", SessionType::Unit), vec![], main_body()));
    let main = h.root("Main");
    assert_eq!(main.process_id, MAIN);
    h
}

#[test]
fn test_forward_onto_waiting_partner_splices() {
    let h = harness();
    let report = h.lc.start(MAIN).unwrap();
    assert_eq!(report.len(), 3);
    let relay_channel = h.process(RELAY).binding("x").unwrap().channel_id;
    let server_channel = h.process(SERVER).binding("s").unwrap().channel_id;

    let report = h.lc.start(RELAY).unwrap();
    assert_eq!(report.len(), 2);
    assert_matches!(&report.steps[0].outcome, StepOutcome::Spliced { partner, .. } if *partner == MAIN);
    assert!(report.steps[0].released);
    // the partner replays its wait on the server channel
    assert_eq!(report.steps[1].process_id, MAIN);
    assert_eq!(report.steps[1].kind, TermKind::Wait);
    assert_matches!(&report.steps[1].outcome, StepOutcome::Deposited { channel_id } if *channel_id == server_channel);

    let latest = h.store.latest_pending(&BTreeSet::from([relay_channel])).unwrap();
    assert_eq!(latest[&relay_channel].step, PendingStep::None);
    assert!(h.bindings(RELAY).is_empty());

    let report = h.lc.start(SERVER).unwrap();
    let kinds: Vec<TermKind> = report.steps.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![TermKind::Close, TermKind::Close]);
    assert_eq!(h.live_processes(), 0);
}

#[test]
fn test_unserviced_forward_deposits_and_redirects() {
    let h = harness();
    let second = h.step_once(h.spec(MAIN, main_body())).unwrap();
    let wait = h.step_once(second).unwrap();
    let relay_channel = h.process(RELAY).binding("x").unwrap().channel_id;
    let server_channel = h.process(RELAY).binding("y").unwrap().channel_id;

    let report = h.lc.start(RELAY).unwrap();
    assert_eq!(report.len(), 1);
    assert!(h.bindings(RELAY).is_empty());
    assert!(report.steps[0].released);
    assert_matches!(report.steps[0].outcome, StepOutcome::Deposited { .. });

    let report = h.lc.run(wait).unwrap();
    assert_matches!(
        &report.steps[0].outcome,
        StepOutcome::Redirected { from, to } if *from == relay_channel && *to == server_channel
    );
    assert_eq!(report.len(), 2);
    assert_eq!(h.process(MAIN).binding("x"), None);

    let report = h.lc.start(SERVER).unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(h.live_processes(), 0);
}

#[test]
fn test_forward_chain_of_relays() {
    // Main -> Relay -> Relay -> Server
    let h = Harness::new();
    h.declare(decl("Server", ("s", SessionType::Unit), vec![], Term::close(p("s"))));
    h.declare(decl(
        "Relay",
        ("x", SessionType::Unit),
        vec![("y", SessionType::Unit)],
        Term::forward(p("x"), p("y")),
    ));
    let body = Term::spawn(
        p("s"),
        proc_name("Server"),
        vec![],
        Term::spawn(
            p("x1"),
            proc_name("Relay"),
            vec![p("s")],
            Term::spawn(
                p("x2"),
                proc_name("Relay"),
                vec![p("x1")],
                Term::wait(p("x2"), Term::close(p("r"))),
            ),
        ),
    );
    h.declare(decl("Main", ("r", SessionType::Unit), vec![], body));
    let main = h.root("Main");
    h.poll();

    h.lc.start(main.process_id).unwrap();
    let reports = h.drain();
    assert_eq!(reports.len(), 3);
    assert_eq!(h.live_processes(), 0);
    assert!(h.bindings(main.process_id).is_empty());
}
