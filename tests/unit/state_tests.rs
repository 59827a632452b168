//! Unit tests for the session lifecycle state machine.

use agent_duplex::SessionState;
use SessionState::{Closed, Closing, Error, Ready, Sending, Starting, Streaming};

const ALL: [SessionState; 7] = [Starting, Ready, Sending, Streaming, Closing, Closed, Error];

#[test]
fn happy_path_turn_cycle_is_allowed() {
    let path = [Starting, Ready, Sending, Streaming, Ready, Sending, Streaming, Ready, Closing, Closed];
    for pair in path.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "{:?} -> {:?} must be allowed",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn error_is_reachable_from_every_live_state() {
    for state in [Starting, Ready, Sending, Streaming, Closing] {
        assert!(state.can_transition_to(Error), "{state:?} -> Error");
    }
}

#[test]
fn error_allows_only_cleanup() {
    for next in ALL {
        assert_eq!(Error.can_transition_to(next), next == Closed, "Error -> {next:?}");
    }
}

#[test]
fn nothing_leaves_closed() {
    for next in ALL {
        assert!(!Closed.can_transition_to(next), "Closed -> {next:?}");
    }
}

#[test]
fn cannot_skip_the_send_step() {
    assert!(!Ready.can_transition_to(Streaming));
    assert!(!Starting.can_transition_to(Sending));
    assert!(!Closing.can_transition_to(Ready));
}

#[test]
fn terminal_and_in_flight_predicates() {
    assert!(Closed.is_terminal());
    assert!(Closing.is_terminal());
    assert!(Error.is_terminal());
    assert!(!Ready.is_terminal());

    assert!(Sending.is_turn_in_flight());
    assert!(Streaming.is_turn_in_flight());
    assert!(!Ready.is_turn_in_flight());
}

#[test]
fn states_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&Streaming).expect("serialize"),
        "\"streaming\""
    );
}
