//! Integration tests for the sequence worker.
//!
//! Runs complete sequences against the in-memory controller: normal
//! completion, multi-poll ramps, mid-step stops, stop-after-finish, and the
//! optional per-step ceiling.

use cryo_daq::config::PpmsSettings;
use cryo_daq::error::DaqError;
use cryo_daq::ppms::{MockPpms, Ppms};
use cryo_daq::sequencer::{
    Sequence, SequenceOutcome, SequenceStep, Sequencer, StepState,
};
use std::sync::Arc;
use std::time::Duration;

fn controller(mock: &MockPpms) -> Arc<Ppms> {
    Arc::new(Ppms::new(Box::new(mock.clone()), &PpmsSettings::default()))
}

fn fast_sequencer(ppms: Arc<Ppms>) -> Sequencer {
    Sequencer::new(ppms).with_check_interval(Duration::from_millis(20))
}

#[tokio::test]
async fn runs_steps_in_order_and_finishes() {
    let mock = MockPpms::new();
    // Default steady temperature status is "Stable": the ramp completes on
    // its first completion poll.
    let sequencer = fast_sequencer(controller(&mock));

    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::SetTemperature {
        kelvin: 4.0,
        rate: 1.0,
    });
    sequence.push(SequenceStep::Wait { minutes: 0.001 });

    let handle = sequencer.start(sequence);
    let state = handle.state();
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome, SequenceOutcome::Finished);
    assert!(state.is_finished());
    assert_eq!(state.current_step(), 1);
    assert!(state.step_finished());
    assert_eq!(
        state.step_states(),
        vec![StepState::Finished, StepState::Finished]
    );
    assert_eq!(
        mock.journal(),
        vec!["set_temperature 4 1 FastSettle"]
    );
}

#[tokio::test]
async fn ramp_completes_after_several_polls() {
    let mock = MockPpms::new();
    mock.push_temperature_status("Tracking");
    mock.push_temperature_status("Near");
    // queue then runs dry and the steady "Stable" completes the step

    let sequencer = fast_sequencer(controller(&mock));
    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::SetTemperature {
        kelvin: 1.8,
        rate: 0.5,
    });

    let outcome = sequencer.start(sequence).join().await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Finished);
}

#[tokio::test]
async fn field_steps_poll_the_magnet_status() {
    let mock = MockPpms::new();
    mock.push_magnet_status("Charging");
    mock.set_steady_magnet_status("Persistent mode stable");

    let sequencer = fast_sequencer(controller(&mock));
    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::SetFieldPersistent {
        tesla: 1.0,
        rate: 0.5,
    });

    let outcome = sequencer.start(sequence).join().await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Finished);
    assert_eq!(
        mock.journal(),
        vec!["set_field 10000 83.33 Linear Persistent"]
    );
}

#[tokio::test]
async fn stop_mid_step_does_not_advance() {
    let mock = MockPpms::new();
    // Never reaches the target, so the first step polls forever.
    mock.set_steady_temperature_status("Tracking");

    let sequencer = fast_sequencer(controller(&mock));
    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::SetTemperature {
        kelvin: 4.0,
        rate: 1.0,
    });
    sequence.push(SequenceStep::SetFieldDriven {
        tesla: 2.0,
        rate: 0.5,
    });

    let handle = sequencer.start(sequence);
    let state = handle.state();
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.request_stop().await.unwrap();
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome, SequenceOutcome::Stopped);
    assert!(state.should_stop());
    assert!(!state.is_finished());
    assert_eq!(state.current_step(), 0);
    assert_eq!(
        state.step_states(),
        vec![StepState::Stopped, StepState::Pending]
    );

    // The controller got the abort, and the second step was never dispatched.
    let journal = mock.journal();
    assert!(journal.contains(&"abort".to_string()));
    assert!(!journal.iter().any(|entry| entry.starts_with("set_field")));
}

#[tokio::test]
async fn stop_request_after_finish_reports_finished_states() {
    let mock = MockPpms::new();
    let sequencer = fast_sequencer(controller(&mock));

    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::Wait { minutes: 0.001 });

    let handle = sequencer.start(sequence);
    let state = handle.state();

    // Let the single step finish first.
    while !state.is_finished() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.request_stop().await.unwrap();

    // Aborted after finishing: the step stays Finished, not Stopped.
    assert_eq!(state.step_states(), vec![StepState::Finished]);
    assert!(mock.journal().contains(&"abort".to_string()));
}

#[tokio::test]
async fn shutdown_steps_wait_for_standby() {
    let mock = MockPpms::new();
    mock.push_temperature_status("Cooling down");
    mock.set_steady_temperature_status("Standby");

    let sequencer = fast_sequencer(controller(&mock));
    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::ShutdownPotOps);

    let outcome = sequencer.start(sequence).join().await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Finished);
    assert_eq!(mock.journal(), vec!["shutdown_potops"]);
}

#[tokio::test]
async fn step_timeout_fails_instead_of_blocking() {
    let mock = MockPpms::new();
    mock.set_steady_temperature_status("Tracking");

    let sequencer = fast_sequencer(controller(&mock))
        .with_step_timeout(Some(Duration::from_millis(80)));
    let mut sequence = Sequence::new();
    sequence.push(SequenceStep::SetTemperature {
        kelvin: 4.0,
        rate: 1.0,
    });

    let err = sequencer.start(sequence).join().await.unwrap_err();
    match err {
        DaqError::StepTimeout { target, .. } => assert_eq!(target, "Stable"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn empty_sequence_finishes_immediately() {
    let mock = MockPpms::new();
    let sequencer = fast_sequencer(controller(&mock));
    let outcome = sequencer.start(Sequence::new()).join().await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Finished);
    assert!(mock.journal().is_empty());
}
