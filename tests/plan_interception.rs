//! The DAQ following wrapped plans in each acquisition mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use beamline_daq::plan::RunSummary;
use beamline_daq::{
    ConfigureArgs, ControllerState, Daq, DaqError, DaqMode, Msg, MsgList, Plan, RunArgs,
    RunEngine, StrictSimControl,
};

async fn configured_daq(args: ConfigureArgs) -> Arc<Daq> {
    let daq = Arc::new(Daq::new("daq", 0, StrictSimControl::factory()));
    daq.connect().await.unwrap();
    daq.configure(args).await.unwrap();
    daq
}

/// `create, read, save` per event, recording the DAQ state after each
/// `create` and each `save` has executed.
struct EventPlan {
    daq: Arc<Daq>,
    events: usize,
    step: usize,
    after_create: Vec<ControllerState>,
    after_save: Vec<ControllerState>,
}

impl EventPlan {
    fn new(daq: &Arc<Daq>, events: usize) -> Self {
        Self {
            daq: Arc::clone(daq),
            events,
            step: 0,
            after_create: Vec::new(),
            after_save: Vec::new(),
        }
    }
}

#[async_trait]
impl Plan for EventPlan {
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>> {
        // step counts messages already handed out
        match self.step % 3 {
            1 => self.after_create.push(self.daq.state().await),
            0 if self.step > 0 => self.after_save.push(self.daq.state().await),
            _ => {}
        }
        if self.step == self.events * 3 {
            return Ok(None);
        }
        let msg = match self.step % 3 {
            0 => Msg::Create {
                stream: "primary".to_string(),
            },
            1 => Msg::Read {
                device: "ipm2".to_string(),
            },
            _ => Msg::Save,
        };
        self.step += 1;
        Ok(Some(msg))
    }
}

/// Shares an [`EventPlan`]'s records with the test after the run engine
/// consumed the plan.
struct Shared(Arc<tokio::sync::Mutex<EventPlan>>);

#[async_trait]
impl Plan for Shared {
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>> {
        self.0.lock().await.next_msg().await
    }
}

async fn run_events(daq: &Arc<Daq>, engine: &RunEngine, events: usize) -> (RunSummary, EventPlan) {
    let plan = Arc::new(tokio::sync::Mutex::new(EventPlan::new(daq, events)));
    let summary = daq
        .wrap_plan(engine, Shared(Arc::clone(&plan)))
        .await
        .unwrap();
    let plan = Arc::try_unwrap(plan)
        .ok()
        .expect("engine released the plan")
        .into_inner();
    (summary, plan)
}

#[tokio::test]
async fn test_auto_mode_window_per_event() {
    let daq = configured_daq(
        ConfigureArgs::default()
            .with_events(1)
            .with_mode(DaqMode::Auto),
    )
    .await;
    let engine = RunEngine::new();

    let (summary, plan) = run_events(&daq, &engine, 10).await;

    assert_eq!(summary.events, 10);
    assert_eq!(plan.after_create, vec![ControllerState::Running; 10]);
    assert_eq!(plan.after_save, vec![ControllerState::Open; 10]);
    assert_eq!(daq.state().await, ControllerState::Configured);
    assert!(!engine.has_msg_hook());
}

#[tokio::test]
async fn test_on_mode_acquires_throughout() {
    let daq = configured_daq(ConfigureArgs::default()).await;
    let engine = RunEngine::new();

    let (summary, plan) = run_events(&daq, &engine, 3).await;

    assert_eq!(summary.events, 3);
    assert!(plan
        .after_create
        .iter()
        .chain(&plan.after_save)
        .all(|state| *state == ControllerState::Running));
    assert_eq!(daq.state().await, ControllerState::Configured);
}

/// Runs `cycles` calib cycles of 24 events, recording the state after each.
struct CalibPlan {
    daq: Arc<Daq>,
    cycles: usize,
    current: Option<MsgList>,
    after_cycle: Arc<parking_lot::Mutex<Vec<ControllerState>>>,
}

#[async_trait]
impl Plan for CalibPlan {
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>> {
        loop {
            if let Some(cycle) = self.current.as_mut() {
                if let Some(msg) = cycle.next_msg().await? {
                    return Ok(Some(msg));
                }
                self.current = None;
                let state = self.daq.state().await;
                self.after_cycle.lock().push(state);
            }
            if self.cycles == 0 {
                return Ok(None);
            }
            self.cycles -= 1;
            self.current = Some(self.daq.calib_cycle(RunArgs::events(24))?);
        }
    }
}

#[tokio::test]
async fn test_manual_mode_calib_cycles() {
    let daq = configured_daq(ConfigureArgs::default().with_mode(DaqMode::Manual)).await;
    let engine = RunEngine::new();
    let after_cycle = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let start = Instant::now();
    daq.wrap_plan(
        &engine,
        CalibPlan {
            daq: Arc::clone(&daq),
            cycles: 3,
            current: None,
            after_cycle: Arc::clone(&after_cycle),
        },
    )
    .await
    .unwrap();

    // 24 events at 120 Hz is 200ms per cycle
    assert!(start.elapsed() >= Duration::from_millis(600));
    assert_eq!(*after_cycle.lock(), vec![ControllerState::Open; 3]);
    assert_eq!(daq.state().await, ControllerState::Configured);
}

#[tokio::test]
async fn test_calib_cycle_outside_plan() {
    let daq = configured_daq(ConfigureArgs::default().with_events(10)).await;
    assert!(matches!(
        daq.calib_cycle(RunArgs::events(10)),
        Err(DaqError::OutsidePlan(_))
    ));
    assert_eq!(daq.state().await, ControllerState::Configured);
}

struct FailingPlan {
    sent: usize,
}

#[async_trait]
impl Plan for FailingPlan {
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>> {
        self.sent += 1;
        match self.sent {
            1 => Ok(Some(Msg::Create {
                stream: "primary".to_string(),
            })),
            2 => Ok(Some(Msg::Save)),
            _ => Err(anyhow!("motor fault")),
        }
    }
}

#[tokio::test]
async fn test_failed_plan_clears_hook() {
    let daq = configured_daq(
        ConfigureArgs::default()
            .with_events(1)
            .with_mode(DaqMode::Auto),
    )
    .await;
    let engine = RunEngine::new();

    let err = daq
        .wrap_plan(&engine, FailingPlan { sent: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Plan(ref message) if message.contains("motor fault")));
    assert!(!engine.has_msg_hook());
    assert_eq!(daq.state().await, ControllerState::Configured);
    assert!(matches!(
        daq.calib_cycle(RunArgs::events(1)),
        Err(DaqError::OutsidePlan(_))
    ));
}

#[tokio::test]
async fn test_dropped_plan_clears_hook() {
    let daq = configured_daq(ConfigureArgs::default()).await;
    let engine = RunEngine::new();
    let plan = MsgList::from(vec![Msg::Sleep(Duration::from_secs(10))]);

    let run = daq.wrap_plan(&engine, plan);
    assert!(tokio::time::timeout(Duration::from_millis(300), run)
        .await
        .is_err());
    assert!(!engine.has_msg_hook());
    daq.end_run().await.unwrap();
}
