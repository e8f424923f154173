//! Plan messages and a minimal run engine.
//!
//! Plans are sequences of [`Msg`] values; the [`RunEngine`] pulls them one at
//! a time and executes them. Before executing a message the engine hands it
//! to the installed [`MsgHook`], which is how the DAQ follows the structure
//! of a scan (runs, events) without the plan knowing about it.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = RunEngine::new();
//! let plan = MsgList::from(vec![
//!     Msg::OpenRun,
//!     Msg::Create { stream: "primary".into() },
//!     Msg::Read { device: "ipm2".into() },
//!     Msg::Save,
//!     Msg::CloseRun,
//! ]);
//! let summary = daq.wrap_plan(&engine, plan).await?;
//! assert_eq!(summary.events, 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DaqError, DaqResult};
use crate::flyer::Flyer;

/// One instruction of a plan.
#[derive(Clone)]
pub enum Msg {
    /// Start a run
    OpenRun,
    /// Finish the run
    CloseRun,
    /// Start bundling readings into an event
    Create {
        /// Event stream name
        stream: String,
    },
    /// Read a device into the current event
    Read {
        /// Device name
        device: String,
    },
    /// Emit the bundled event
    Save,
    /// Sleep for a fixed time
    Sleep(Duration),
    /// Stage a device
    Stage(Arc<dyn Flyer>),
    /// Unstage a device
    Unstage(Arc<dyn Flyer>),
    /// Kick off a flyer and wait until it is acquiring
    Kickoff(Arc<dyn Flyer>),
    /// Wait for a flyer to finish
    Complete(Arc<dyn Flyer>),
    /// Collect a flyer's records
    Collect(Arc<dyn Flyer>),
}

impl Msg {
    /// Command name of the message.
    pub fn command(&self) -> &'static str {
        match self {
            Msg::OpenRun => "open_run",
            Msg::CloseRun => "close_run",
            Msg::Create { .. } => "create",
            Msg::Read { .. } => "read",
            Msg::Save => "save",
            Msg::Sleep(_) => "sleep",
            Msg::Stage(_) => "stage",
            Msg::Unstage(_) => "unstage",
            Msg::Kickoff(_) => "kickoff",
            Msg::Complete(_) => "complete",
            Msg::Collect(_) => "collect",
        }
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Msg::Create { stream } => write!(f, "Msg(create, {})", stream),
            Msg::Read { device } => write!(f, "Msg(read, {})", device),
            Msg::Sleep(duration) => write!(f, "Msg(sleep, {:?})", duration),
            Msg::Stage(obj)
            | Msg::Unstage(obj)
            | Msg::Kickoff(obj)
            | Msg::Complete(obj)
            | Msg::Collect(obj) => write!(f, "Msg({}, {})", self.command(), obj.name()),
            _ => write!(f, "Msg({})", self.command()),
        }
    }
}

/// Source of plan messages.
#[async_trait]
pub trait Plan: Send {
    /// Next message, `Ok(None)` when the plan is finished.
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>>;
}

/// Fixed list of messages.
#[derive(Debug, Clone, Default)]
pub struct MsgList {
    msgs: VecDeque<Msg>,
}

impl MsgList {
    /// Number of messages left.
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    /// True when no messages are left.
    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

impl From<Vec<Msg>> for MsgList {
    fn from(msgs: Vec<Msg>) -> Self {
        Self { msgs: msgs.into() }
    }
}

#[async_trait]
impl Plan for MsgList {
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>> {
        Ok(self.msgs.pop_front())
    }
}

/// Plans run back to back.
#[derive(Default)]
pub struct PlanChain {
    parts: VecDeque<Box<dyn Plan>>,
}

impl PlanChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plan.
    pub fn then(mut self, plan: impl Plan + 'static) -> Self {
        self.parts.push_back(Box::new(plan));
        self
    }
}

#[async_trait]
impl Plan for PlanChain {
    async fn next_msg(&mut self) -> anyhow::Result<Option<Msg>> {
        while let Some(part) = self.parts.front_mut() {
            if let Some(msg) = part.next_msg().await? {
                return Ok(Some(msg));
            }
            self.parts.pop_front();
        }
        Ok(None)
    }
}

/// Observer that sees every message before the engine executes it.
#[async_trait]
pub trait MsgHook: Send + Sync {
    /// Called with each message; an error aborts the plan.
    async fn on_msg(&self, msg: &Msg) -> DaqResult<()>;
}

/// Counts from a finished plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Messages executed
    pub messages: usize,
    /// Events saved
    pub events: u32,
}

#[derive(Default)]
struct Bundle {
    run_open: bool,
    bundling: bool,
}

/// Executes plans, passing each message to the installed hook first.
#[derive(Default)]
pub struct RunEngine {
    msg_hook: Mutex<Option<Arc<dyn MsgHook>>>,
}

impl RunEngine {
    /// Engine with no hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `hook`, returning the previous one.
    pub fn set_msg_hook(&self, hook: Arc<dyn MsgHook>) -> Option<Arc<dyn MsgHook>> {
        self.msg_hook.lock().replace(hook)
    }

    /// Remove the hook.
    pub fn clear_msg_hook(&self) {
        self.msg_hook.lock().take();
    }

    /// True while a hook is installed.
    pub fn has_msg_hook(&self) -> bool {
        self.msg_hook.lock().is_some()
    }

    /// Run `plan` to completion.
    pub async fn run(&self, plan: &mut dyn Plan) -> DaqResult<RunSummary> {
        let mut summary = RunSummary::default();
        let mut bundle = Bundle::default();

        loop {
            let msg = match plan.next_msg().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Plan raised");
                    return Err(DaqError::Plan(e.to_string()));
                }
            };

            let hook = self.msg_hook.lock().clone();
            if let Some(hook) = hook {
                hook.on_msg(&msg).await?;
            }

            self.execute(&msg, &mut bundle, &mut summary).await?;
            summary.messages += 1;
        }

        if bundle.run_open {
            warn!("Plan finished with its run still open");
        }
        info!(
            messages = summary.messages,
            events = summary.events,
            "Plan complete"
        );
        Ok(summary)
    }

    async fn execute(
        &self,
        msg: &Msg,
        bundle: &mut Bundle,
        summary: &mut RunSummary,
    ) -> DaqResult<()> {
        debug!(?msg, "Executing");
        match msg {
            Msg::OpenRun => {
                if bundle.run_open {
                    return Err(DaqError::Plan("a run is already open".to_string()));
                }
                bundle.run_open = true;
            }
            Msg::CloseRun => {
                if !bundle.run_open {
                    return Err(DaqError::Plan("close_run without open_run".to_string()));
                }
                bundle.run_open = false;
            }
            Msg::Create { .. } => {
                if !bundle.run_open || bundle.bundling {
                    return Err(DaqError::Plan(
                        "create needs an open run and no pending event".to_string(),
                    ));
                }
                bundle.bundling = true;
            }
            Msg::Read { device } => {
                debug!(device = %device, "Read");
            }
            Msg::Save => {
                if !bundle.bundling {
                    return Err(DaqError::Plan("save without create".to_string()));
                }
                bundle.bundling = false;
                summary.events += 1;
            }
            Msg::Sleep(duration) => tokio::time::sleep(*duration).await,
            Msg::Stage(obj) => {
                obj.stage().await?;
            }
            Msg::Unstage(obj) => {
                obj.unstage().await?;
            }
            Msg::Kickoff(obj) => {
                let status = obj.kickoff().await?;
                if !status.wait().await {
                    return Err(DaqError::Plan(format!("kickoff of {} failed", obj.name())));
                }
            }
            Msg::Complete(obj) => {
                let status = obj.complete().await?;
                if !status.wait().await {
                    return Err(DaqError::Plan(format!("complete of {} failed", obj.name())));
                }
            }
            Msg::Collect(obj) => {
                let records = obj.collect().await?;
                debug!(flyer = obj.name(), records = records.len(), "Collected");
            }
        }
        Ok(())
    }
}
