//! Simulated DAQ control endpoints.
//!
//! Two drop-in replacements for a live control session, used to exercise the
//! run coordinator without a DAQ process:
//!
//! - [`SimControl`] - permissive: reproduces the state machine and run timing
//!   but accepts any run length it is given
//! - [`StrictSimControl`] - additionally rejects every argument the real
//!   controller hangs or crashes on, and refuses `end` with nothing running
//!
//! # Timing
//!
//! A run of `n` events lasts `n / 120` seconds, `0` events runs until stopped,
//! and a `[seconds, nanoseconds]` duration lasts exactly that long. The run
//! countdown advances in 100ms ticks and checks its stop flag every tick, so an
//! explicit `stop`/`endrun` is observed within one tick.

mod basic;
mod strict;

pub use basic::SimControl;
pub use strict::StrictSimControl;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use super::state::{ControllerState, StateMachine, Transition, TransitionOutcome};
use super::RunLength;
use crate::error::DaqResult;

/// Countdown increment of simulated runs.
pub const SIM_TICK: Duration = Duration::from_millis(100);

/// State shared between a simulator and its run countdown task.
pub(crate) struct SimCore {
    label: &'static str,
    machine: Mutex<StateMachine>,
    configured_length: Mutex<Option<RunLength>>,
    /// Stop flag of the current run. Replaced on every begin.
    run_done: Mutex<watch::Sender<bool>>,
    tick: Duration,
}

impl SimCore {
    pub(crate) fn new(label: &'static str) -> Arc<Self> {
        // No run yet, so "the current run" counts as finished.
        let (run_done, _) = watch::channel(true);
        Arc::new(Self {
            label,
            machine: Mutex::new(StateMachine::new()),
            configured_length: Mutex::new(None),
            run_done: Mutex::new(run_done),
            tick: SIM_TICK,
        })
    }

    pub(crate) fn state(&self) -> ControllerState {
        self.machine.lock().state()
    }

    pub(crate) fn transition(&self, transition: Transition) -> DaqResult<TransitionOutcome> {
        self.machine.lock().apply(transition)
    }

    pub(crate) fn force_state(&self, state: ControllerState) {
        debug!(sim = self.label, %state, "Forcing simulated controller state");
        self.machine.lock().force(state);
        if state != ControllerState::Running {
            self.finish_run();
        }
    }

    pub(crate) fn set_configured_length(&self, length: RunLength) {
        *self.configured_length.lock() = Some(length);
    }

    pub(crate) fn configured_length(&self) -> Option<RunLength> {
        *self.configured_length.lock()
    }

    /// Start the countdown for a run that has just entered `Running`.
    pub(crate) fn start_run(self: &Arc<Self>, length: RunLength) {
        let (tx, rx) = watch::channel(false);
        *self.run_done.lock() = tx;
        let core = Arc::clone(self);
        tokio::spawn(async move { core.countdown(rx, length).await });
    }

    /// Mark the current run as finished, waking `end` and the countdown.
    pub(crate) fn finish_run(&self) {
        self.run_done.lock().send_replace(true);
    }

    pub(crate) fn stop(&self) -> DaqResult<TransitionOutcome> {
        let outcome = self.transition(Transition::Stop)?;
        self.finish_run();
        Ok(outcome)
    }

    pub(crate) fn endrun(&self) -> DaqResult<TransitionOutcome> {
        let outcome = self.transition(Transition::EndRun)?;
        self.finish_run();
        Ok(outcome)
    }

    /// Wait until the current run's stop flag is raised.
    pub(crate) async fn wait_run_done(&self) {
        let mut rx = self.run_done.lock().subscribe();
        // A dropped sender means a newer run replaced this one.
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn countdown(self: Arc<Self>, mut done: watch::Receiver<bool>, length: RunLength) {
        debug!(sim = self.label, ?length, "Run countdown started");
        let started = Instant::now();
        let mut remaining = match length {
            RunLength::Forever => None,
            RunLength::For(duration) => Some(duration),
        };
        let interrupted = loop {
            if let Some(left) = remaining {
                if left.is_zero() {
                    break false;
                }
                remaining = Some(left.saturating_sub(self.tick));
            }
            // Err from wait_for means the run was replaced; treat it as a stop.
            let woke = timeout(self.tick, done.wait_for(|done| *done)).await.is_ok();
            if woke {
                break true;
            }
        };
        if !interrupted {
            if let Err(e) = self.stop() {
                debug!(sim = self.label, error = %e, "Countdown stop refused");
            }
        }
        debug!(
            sim = self.label,
            interrupted,
            elapsed = ?started.elapsed(),
            "Run countdown finished"
        );
    }
}
