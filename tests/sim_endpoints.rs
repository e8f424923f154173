//! Integration tests for the simulated control endpoints.
//!
//! Both simulators are driven through the `DaqControl` trait, the same way
//! the run coordinator uses them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use beamline_daq::control::sim::SIM_TICK;
use beamline_daq::control::{BeginRequest, ConfigureRequest, ControlFactory, DaqControl};
use beamline_daq::{ControllerState, DaqError, SimControl, StrictSimControl};

async fn configured(control: Arc<dyn DaqControl>) -> Arc<dyn DaqControl> {
    control.connect().await.unwrap();
    control.configure(ConfigureRequest::events(0)).await.unwrap();
    control
}

fn endpoints() -> Vec<(&'static str, Arc<dyn DaqControl>)> {
    vec![
        ("lenient", Arc::new(SimControl::new())),
        ("strict", Arc::new(StrictSimControl::new())),
    ]
}

#[tokio::test]
async fn test_duration_run_ends_on_time() {
    for (label, control) in endpoints() {
        let control = configured(control).await;
        let start = Instant::now();
        control.begin(BeginRequest::duration(1, 0)).await.unwrap();
        assert_eq!(control.state().await.unwrap(), ControllerState::Running);
        control.end().await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1200),
            "{}: run took {:?}",
            label,
            elapsed
        );
        assert_eq!(control.state().await.unwrap(), ControllerState::Open);
    }
}

#[tokio::test]
async fn test_event_count_timing() {
    // 60 events at 120 Hz
    let control = configured(Arc::new(StrictSimControl::new())).await;
    let start = Instant::now();
    control.begin(BeginRequest::events(60)).await.unwrap();
    control.end().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "run took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "run took {:?}", elapsed);
}

#[tokio::test]
async fn test_stop_is_prompt() {
    for (label, control) in endpoints() {
        let control = configured(control).await;
        control.begin(BeginRequest::events(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(control.state().await.unwrap(), ControllerState::Running);

        let start = Instant::now();
        control.stop().await.unwrap();
        assert_eq!(control.state().await.unwrap(), ControllerState::Open, "{}", label);

        // A pending end wakes within one tick of the stop.
        control.end().await.ok();
        assert!(start.elapsed() < SIM_TICK, "{}: {:?}", label, start.elapsed());
    }
}

#[tokio::test]
async fn test_endrun_interrupts_run() {
    let control = configured(Arc::new(SimControl::new())).await;
    control.begin(BeginRequest::duration(5, 0)).await.unwrap();

    let waiter = {
        let control = Arc::clone(&control);
        tokio::spawn(async move { control.end().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    control.endrun().await.unwrap();

    tokio::time::timeout(SIM_TICK * 2, waiter)
        .await
        .expect("end should return after endrun")
        .unwrap()
        .unwrap();
    assert_eq!(control.state().await.unwrap(), ControllerState::Configured);
}

#[tokio::test]
async fn test_begin_from_open_starts_new_window() {
    let control = configured(Arc::new(StrictSimControl::new())).await;
    control.begin(BeginRequest::events(12)).await.unwrap();
    control.end().await.unwrap();
    assert_eq!(control.state().await.unwrap(), ControllerState::Open);

    control.begin(BeginRequest::events(12)).await.unwrap();
    assert_eq!(control.state().await.unwrap(), ControllerState::Running);
    control.end().await.unwrap();
    assert_eq!(control.state().await.unwrap(), ControllerState::Open);
}

#[tokio::test]
async fn test_refused_transitions() {
    let control: Arc<dyn DaqControl> = Arc::new(StrictSimControl::new());
    let err = control
        .configure(ConfigureRequest::events(0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaqError::InvalidTransition {
            state: ControllerState::Disconnected,
            ..
        }
    ));

    let control = configured(control).await;
    control.begin(BeginRequest::events(0)).await.unwrap();
    assert!(control.disconnect().await.is_err());
    assert!(control.configure(ConfigureRequest::events(0)).await.is_err());
    control.endrun().await.unwrap();
    control.disconnect().await.unwrap();
    assert_eq!(control.state().await.unwrap(), ControllerState::Disconnected);
}

#[tokio::test]
async fn test_end_when_idle() {
    let lenient = configured(Arc::new(SimControl::new())).await;
    lenient.end().await.unwrap();

    let strict = configured(Arc::new(StrictSimControl::new())).await;
    assert!(matches!(strict.end().await, Err(DaqError::NotRunning)));
}

#[tokio::test]
async fn test_factories_build_fresh_sessions() {
    let factory = StrictSimControl::factory();
    let first = factory.create("localhost", 0).unwrap();
    let second = factory.create("localhost", 0).unwrap();
    first.connect().await.unwrap();
    assert_eq!(first.state().await.unwrap(), ControllerState::Connected);
    assert_eq!(second.state().await.unwrap(), ControllerState::Disconnected);
}
