//! Validating simulated controller.
//!
//! Behaves like [`SimControl`](super::SimControl) but fails fast on every
//! input that hangs or crashes a live DAQ: negative event counts, durations
//! that do not add up to a positive time, configure without a length, and
//! `end` with nothing running.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::SimCore;
use crate::control::state::{ControllerState, Transition};
use crate::control::{BeginRequest, ConfigureRequest, ControlFactory, DaqControl};
use crate::error::{DaqError, DaqResult};

/// Simulated controller with the real controller's argument checks.
#[derive(Clone)]
pub struct StrictSimControl {
    core: Arc<SimCore>,
}

impl StrictSimControl {
    /// New simulator in `Disconnected`.
    pub fn new() -> Self {
        Self {
            core: SimCore::new("StrictSimControl"),
        }
    }

    /// Factory producing a fresh simulator per connection.
    pub fn factory() -> impl ControlFactory {
        |_host: &str, _platform: u32| -> DaqResult<Arc<dyn DaqControl>> {
            Ok(Arc::new(StrictSimControl::new()))
        }
    }

    /// Current state without going through the trait.
    pub fn current_state(&self) -> ControllerState {
        self.core.state()
    }

    /// Overwrite the state, as if the DAQ changed it on its own.
    pub fn force_state(&self, state: ControllerState) {
        self.core.force_state(state);
    }
}

impl Default for StrictSimControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaqControl for StrictSimControl {
    async fn connect(&self) -> DaqResult<()> {
        debug!("StrictSimControl.connect()");
        self.core.transition(Transition::Connect).map(|_| ())
    }

    async fn disconnect(&self) -> DaqResult<()> {
        debug!("StrictSimControl.disconnect()");
        self.core.transition(Transition::Disconnect).map(|_| ())
    }

    async fn configure(&self, request: ConfigureRequest) -> DaqResult<()> {
        debug!(
            record = request.record,
            key = request.key,
            length = ?request.length,
            controls = ?request.controls,
            partition = ?request.partition,
            "StrictSimControl.configure()"
        );
        let length = request.length.resolve()?.ok_or_else(|| {
            DaqError::Validation("configure requires events or duration".to_string())
        })?;
        if self.core.transition(Transition::Configure)?.applied() {
            self.core.set_configured_length(length);
        }
        Ok(())
    }

    async fn begin(&self, request: BeginRequest) -> DaqResult<()> {
        debug!(
            length = ?request.length,
            controls = ?request.controls,
            monitors = ?request.monitors,
            "StrictSimControl.begin()"
        );
        let length = request
            .length
            .resolve()?
            .or_else(|| self.core.configured_length())
            .ok_or_else(|| DaqError::Validation("no run length configured".to_string()))?;
        if self.core.transition(Transition::Begin)?.applied() {
            self.core.start_run(length);
        }
        Ok(())
    }

    async fn stop(&self) -> DaqResult<()> {
        debug!("StrictSimControl.stop()");
        self.core.stop().map(|_| ())
    }

    async fn endrun(&self) -> DaqResult<()> {
        debug!("StrictSimControl.endrun()");
        self.core.endrun().map(|_| ())
    }

    async fn end(&self) -> DaqResult<()> {
        debug!("StrictSimControl.end()");
        if self.core.state() != ControllerState::Running {
            return Err(DaqError::NotRunning);
        }
        self.core.wait_run_done().await;
        Ok(())
    }

    async fn state_index(&self) -> DaqResult<usize> {
        Ok(self.core.state().index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::LengthSelector;

    async fn connected() -> StrictSimControl {
        let sim = StrictSimControl::new();
        sim.connect().await.unwrap();
        sim
    }

    #[tokio::test]
    async fn test_configure_without_length_fails() {
        let sim = connected().await;
        let err = sim.configure(ConfigureRequest::default()).await.unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
        assert_eq!(sim.current_state(), ControllerState::Connected);
    }

    #[tokio::test]
    async fn test_configure_zero_duration_fails() {
        let sim = connected().await;
        let request = ConfigureRequest {
            length: LengthSelector {
                duration: Some([0, 0]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            sim.configure(request).await,
            Err(DaqError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_zero_events_runs_forever() {
        let sim = connected().await;
        sim.configure(ConfigureRequest::events(0)).await.unwrap();
        sim.begin(BeginRequest::events(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(sim.current_state(), ControllerState::Running);
        sim.stop().await.unwrap();
        assert_eq!(sim.current_state(), ControllerState::Open);
    }

    #[tokio::test]
    async fn test_begin_negative_events_leaves_state() {
        let sim = connected().await;
        sim.configure(ConfigureRequest::events(0)).await.unwrap();
        assert!(sim.begin(BeginRequest::events(-1)).await.is_err());
        assert_eq!(sim.current_state(), ControllerState::Configured);
    }

    #[tokio::test]
    async fn test_begin_without_length_leaves_state() {
        let sim = StrictSimControl::new();
        sim.force_state(ControllerState::Configured);
        let err = sim.begin(BeginRequest::default()).await.unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
        assert_eq!(sim.current_state(), ControllerState::Configured);
        assert!(matches!(sim.end().await, Err(DaqError::NotRunning)));
    }

    #[tokio::test]
    async fn test_end_requires_running() {
        let sim = connected().await;
        assert!(matches!(sim.end().await, Err(DaqError::NotRunning)));
    }
}
