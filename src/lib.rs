//! # Beamline DAQ Control Library
//!
//! Coordinates a data acquisition system with experiment plans. The DAQ runs
//! as a separate process; this crate only drives its control session and
//! decides when acquisition windows open and close. Event data never passes
//! through here.
//!
//! ## Crate Structure
//!
//! - **`control`**: the `DaqControl` endpoint trait, run-length resolution, the
//!   endpoint state machine (`control::state`) and two simulated endpoints
//!   (`control::sim`).
//! - **`daq`**: the `Daq` run coordinator: connection and configuration
//!   lifecycle, the flyer protocol, and plan-message interception.
//! - **`plan`**: plan messages and a minimal `RunEngine` that hands every
//!   message to an installed hook before executing it.
//! - **`flyer`**: the kickoff/complete/collect protocol.
//! - **`status`**: `OperationStatus`, the single-resolution completion handle
//!   returned by non-blocking operations.
//! - **`config`**: figment-based settings loading.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `DaqError` enum shared by all of the above.

pub mod config;
pub mod control;
pub mod daq;
pub mod error;
pub mod flyer;
pub mod logging;
pub mod plan;
pub mod status;

pub use control::state::{ControllerState, StateMachine, Transition, TransitionOutcome};
pub use control::sim::{SimControl, StrictSimControl};
pub use control::{BeginRequest, ConfigureRequest, ControlFactory, DaqControl};
pub use daq::{BeginOptions, ConfigureArgs, Controls, Daq, DaqMode, RunArgs};
pub use error::{DaqError, DaqResult};
pub use flyer::Flyer;
pub use plan::{Msg, MsgList, Plan, RunEngine};
pub use status::OperationStatus;
