//! Following a plan's structure.
//!
//! While [`Daq::wrap_plan`] runs a plan, the DAQ sees every plan message
//! before it executes. `open_run`/`close_run` mark the plan's run, and in
//! [`DaqMode::Auto`] each `create`..`save` event bundle gets its own
//! acquisition window:
//!
//! | message | auto mode action |
//! |---|---|
//! | `create` | pause then resume, so every event starts a fresh window |
//! | `save` | wait for a bounded window to end, otherwise pause |
//!
//! The hook is removed by a drop guard, so a plan that fails (or a future
//! that is dropped mid-plan) never leaves it installed.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Daq, DaqMode, RunArgs};
use crate::error::{DaqError, DaqResult};
use crate::flyer::Flyer;
use crate::plan::{Msg, MsgHook, MsgList, Plan, PlanChain, RunEngine, RunSummary};
use crate::status::OperationStatus;

/// Clears the engine hook and the plan flags when dropped.
struct HookGuard<'a> {
    engine: &'a RunEngine,
    daq: &'a Daq,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.engine.clear_msg_hook();
        self.daq.bound.store(false, Ordering::SeqCst);
        self.daq.in_run.store(false, Ordering::SeqCst);
        debug!(daq = %self.daq.name, "Message hook cleared");
    }
}

impl Daq {
    fn mode(&self) -> DaqMode {
        self.config
            .read()
            .as_ref()
            .map_or(self.default_mode, |config| config.mode)
    }

    /// Run `plan` with the DAQ flying alongside it.
    ///
    /// The plan is wrapped as
    /// `stage, open_run, kickoff, <plan>, complete, collect, close_run, unstage`
    /// and the DAQ follows its messages while it runs. The plan must not open
    /// a run itself.
    pub async fn wrap_plan(
        self: &Arc<Self>,
        engine: &RunEngine,
        plan: impl Plan + 'static,
    ) -> DaqResult<RunSummary> {
        let flyer: Arc<dyn Flyer> = Arc::clone(self) as Arc<dyn Flyer>;
        let mut wrapped = PlanChain::new()
            .then(MsgList::from(vec![
                Msg::Stage(Arc::clone(&flyer)),
                Msg::OpenRun,
                Msg::Kickoff(Arc::clone(&flyer)),
            ]))
            .then(plan)
            .then(MsgList::from(vec![
                Msg::Complete(Arc::clone(&flyer)),
                Msg::Collect(Arc::clone(&flyer)),
                Msg::CloseRun,
                Msg::Unstage(flyer),
            ]));

        if engine.set_msg_hook(Arc::clone(self) as Arc<dyn MsgHook>).is_some() {
            warn!(daq = %self.name, "Replaced an existing message hook");
        }
        self.bound.store(true, Ordering::SeqCst);
        let _guard = HookGuard { engine, daq: self };

        let result = engine.run(&mut wrapped).await;
        if let Err(e) = &result {
            warn!(daq = %self.name, error = %e, "Wrapped plan failed, ending run");
            if let Err(end_err) = self.end_run().await {
                warn!(daq = %self.name, error = %end_err, "Could not end run after plan failure");
            }
        }
        result
    }

    /// Plan fragment acquiring one bounded window inside a wrapped plan.
    ///
    /// Fails before touching the endpoint when called outside
    /// [`Daq::wrap_plan`], or when neither `args` nor the stored
    /// configuration says how long the window lasts.
    pub fn calib_cycle(self: &Arc<Self>, args: RunArgs) -> DaqResult<MsgList> {
        if !self.bound.load(Ordering::SeqCst) {
            return Err(DaqError::OutsidePlan("calib_cycle"));
        }
        let stored_bounded = self.config().is_some_and(|config| config.bounded());
        if args.events.is_none() && args.duration.is_none() && !stored_bounded {
            return Err(DaqError::Validation(
                "calib_cycle needs events or duration, either given or configured".to_string(),
            ));
        }
        let window: Arc<dyn Flyer> = Arc::new(CalibWindow {
            name: format!("{}_calib_cycle", self.name),
            daq: Arc::clone(self),
            args,
        });
        Ok(MsgList::from(vec![
            Msg::Kickoff(Arc::clone(&window)),
            Msg::Complete(window),
        ]))
    }
}

#[async_trait]
impl MsgHook for Daq {
    async fn on_msg(&self, msg: &Msg) -> DaqResult<()> {
        match msg {
            Msg::OpenRun => {
                debug!(daq = %self.name, "Plan opened a run");
                self.in_run.store(true, Ordering::SeqCst);
            }
            Msg::CloseRun => {
                debug!(daq = %self.name, "Plan closed its run");
                self.in_run.store(false, Ordering::SeqCst);
            }
            Msg::Create { .. } if self.mode() == DaqMode::Auto => {
                self.pause().await?;
                self.resume().await?;
            }
            Msg::Save if self.mode() == DaqMode::Auto => {
                if self.config().is_some_and(|config| config.bounded()) {
                    self.wait(None, false).await?;
                } else {
                    self.pause().await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// One explicit acquisition window of the DAQ, as a flyer.
pub struct CalibWindow {
    name: String,
    daq: Arc<Daq>,
    args: RunArgs,
}

#[async_trait]
impl Flyer for CalibWindow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> DaqResult<OperationStatus> {
        Daq::kickoff(&self.daq, self.args.clone()).await
    }

    async fn complete(&self) -> DaqResult<OperationStatus> {
        // explicit window lengths end on their own even when the stored
        // configuration is open-ended
        let bounded = match (self.args.events, self.args.duration) {
            (None, None) => self.daq.config().is_some_and(|config| config.bounded()),
            (events, duration) => events.is_some_and(|n| n > 0) || duration.is_some(),
        };
        self.daq.complete_with(bounded).await
    }

    async fn collect(&self) -> DaqResult<Vec<Value>> {
        Ok(Vec::new())
    }

    fn describe_collect(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::sim::SimControl;

    #[tokio::test]
    async fn test_calib_cycle_outside_plan() {
        let daq = Arc::new(Daq::new("daq", 0, SimControl::factory()));
        let err = daq.calib_cycle(RunArgs::events(10)).unwrap_err();
        assert!(matches!(err, DaqError::OutsidePlan("calib_cycle")));
    }

    #[tokio::test]
    async fn test_calib_cycle_needs_length() {
        let daq = Arc::new(Daq::new("daq", 0, SimControl::factory()));
        daq.bound.store(true, Ordering::SeqCst);
        assert!(matches!(
            daq.calib_cycle(RunArgs::default()),
            Err(DaqError::Validation(_))
        ));
        assert_eq!(daq.calib_cycle(RunArgs::duration(1.0)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hook_tracks_run_flags() {
        let daq = Daq::new("daq", 0, SimControl::factory());
        daq.on_msg(&Msg::OpenRun).await.unwrap();
        assert!(daq.in_run.load(Ordering::SeqCst));
        daq.on_msg(&Msg::CloseRun).await.unwrap();
        assert!(!daq.in_run.load(Ordering::SeqCst));
    }
}
