//! Unit tests for the connection state machine.
//!
//! Covers:
//! - the forward chain advances one step at a time
//! - `closed` is reachable from any live state, `error` from any
//!   non-terminal state, `disconnected` from everywhere
//! - terminal states admit only explicit teardown
//! - `StateCell` publishes accepted transitions as events and ignores
//!   illegal ones

use tokio::sync::mpsc;

use agent_conduit::driver::ConnectionState::{
    Closed, Connected, Connecting, Disconnected, Error, Initializing, Ready,
};
use agent_conduit::driver::{AgentEvent, StateCell};

// ── Transition rules ─────────────────────────────────────────────────────────

#[test]
fn forward_chain_advances_one_step_at_a_time() {
    assert!(Disconnected.may_transition(Connecting));
    assert!(Connecting.may_transition(Connected));
    assert!(Connected.may_transition(Initializing));
    assert!(Initializing.may_transition(Ready));

    // Skipping a step is illegal.
    assert!(!Disconnected.may_transition(Connected));
    assert!(!Connecting.may_transition(Ready));
    // Moving backwards is illegal.
    assert!(!Ready.may_transition(Connecting));
}

#[test]
fn closed_is_reachable_from_any_live_state() {
    for from in [Connecting, Connected, Initializing, Ready] {
        assert!(from.may_transition(Closed), "{from} -> closed must be legal");
    }
    assert!(!Disconnected.may_transition(Closed));
    assert!(!Error.may_transition(Closed));
    assert!(!Closed.may_transition(Closed));
}

#[test]
fn error_is_reachable_from_any_non_terminal_state() {
    for from in [Connecting, Connected, Initializing, Ready, Closed] {
        assert!(from.may_transition(Error), "{from} -> error must be legal");
    }
    assert!(!Disconnected.may_transition(Error));
    assert!(!Error.may_transition(Error));
}

#[test]
fn teardown_is_reachable_from_everywhere() {
    for from in [Connecting, Connected, Initializing, Ready, Closed, Error] {
        assert!(
            from.may_transition(Disconnected),
            "{from} -> disconnected must be legal"
        );
    }
}

#[test]
fn terminal_states_admit_only_teardown() {
    for from in [Closed, Error] {
        for to in [Connecting, Connected, Initializing, Ready] {
            assert!(!from.may_transition(to), "{from} -> {to} must be illegal");
        }
    }
    // After teardown only a fresh connection (a fresh cell) starts over.
    assert!(Disconnected.may_transition(Connecting));
    assert!(!Disconnected.may_transition(Ready));
}

// ── StateCell ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn accepted_transitions_emit_events() {
    let (event_tx, mut event_rx) = mpsc::channel(8);
    let cell = StateCell::new(event_tx);
    assert_eq!(cell.current(), Disconnected);

    assert!(cell.set(Connecting).await);
    assert!(cell.set(Connected).await);

    for expected in [Connecting, Connected] {
        match event_rx.recv().await {
            Some(AgentEvent::StateChanged(state)) => assert_eq!(state, expected),
            other => panic!("expected StateChanged({expected}), got {other:?}"),
        }
    }
}

#[tokio::test]
async fn illegal_transitions_are_ignored() {
    let (event_tx, mut event_rx) = mpsc::channel(8);
    let cell = StateCell::new(event_tx);

    assert!(cell.set(Connecting).await);
    assert!(cell.set(Connected).await);
    assert!(cell.set(Initializing).await);
    assert!(cell.set(Ready).await);
    assert!(cell.set(Disconnected).await);

    // A late exit observation after teardown must not flip the state.
    assert!(!cell.set(Closed).await);
    assert_eq!(cell.current(), Disconnected);

    // Drain: exactly the five accepted transitions were published.
    let mut seen = 0;
    while event_rx.try_recv().is_ok() {
        seen += 1;
    }
    assert_eq!(seen, 5);
}

#[tokio::test]
async fn set_reports_whether_transition_applied() {
    let (event_tx, _event_rx) = mpsc::channel(8);
    let cell = StateCell::new(event_tx);

    assert!(cell.set(Connecting).await);
    assert!(!cell.set(Connecting).await, "same-state set must be a no-op");
}
