//! Permissive simulated controller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::SimCore;
use crate::control::state::{ControllerState, Transition};
use crate::control::{BeginRequest, ConfigureRequest, ControlFactory, DaqControl, RunLength};
use crate::error::{DaqError, DaqResult};

/// Simulated controller that accepts any run length.
///
/// Negative or malformed lengths are clamped rather than refused, and a
/// `begin` without a length reuses the configured one (or runs forever).
#[derive(Clone)]
pub struct SimControl {
    core: Arc<SimCore>,
}

impl SimControl {
    /// New simulator in `Disconnected`.
    pub fn new() -> Self {
        Self {
            core: SimCore::new("SimControl"),
        }
    }

    /// Factory producing a fresh simulator per connection.
    pub fn factory() -> impl ControlFactory {
        |_host: &str, _platform: u32| -> DaqResult<Arc<dyn DaqControl>> {
            Ok(Arc::new(SimControl::new()))
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

impl Default for SimControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaqControl for SimControl {
    async fn connect(&self) -> DaqResult<()> {
        self.core.transition(Transition::Connect).map(|_| ())
    }

    async fn disconnect(&self) -> DaqResult<()> {
        self.core.transition(Transition::Disconnect).map(|_| ())
    }

    async fn configure(&self, request: ConfigureRequest) -> DaqResult<()> {
        debug!(?request, "SimControl.configure");
        if self.core.transition(Transition::Configure)?.applied() {
            let length = request.length.resolve_lenient().ok_or_else(|| {
                DaqError::Validation("configure requires events or duration".to_string())
            })?;
            self.core.set_configured_length(length);
        }
        Ok(())
    }

    async fn begin(&self, request: BeginRequest) -> DaqResult<()> {
        debug!(?request, "SimControl.begin");
        if self.core.transition(Transition::Begin)?.applied() {
            let length = request
                .length
                .resolve_lenient()
                .or_else(|| self.core.configured_length())
                .unwrap_or(RunLength::Forever);
            self.core.start_run(length);
        }
        Ok(())
    }

    async fn stop(&self) -> DaqResult<()> {
        self.core.stop().map(|_| ())
    }

    async fn endrun(&self) -> DaqResult<()> {
        self.core.endrun().map(|_| ())
    }

    async fn end(&self) -> DaqResult<()> {
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
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_begin_reuses_configured_length() {
        let sim = SimControl::new();
        sim.connect().await.unwrap();
        sim.configure(ConfigureRequest::events(24)).await.unwrap();

        let start = Instant::now();
        sim.begin(BeginRequest::default()).await.unwrap();
        assert_eq!(sim.current_state(), ControllerState::Running);
        sim.end().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(sim.current_state(), ControllerState::Open);
    }

    #[tokio::test]
    async fn test_negative_events_clamped() {
        let sim = SimControl::new();
        sim.connect().await.unwrap();
        sim.configure(ConfigureRequest::events(-5)).await.unwrap();
        assert_eq!(sim.current_state(), ControllerState::Configured);
    }

    #[tokio::test]
    async fn test_end_when_idle_returns() {
        let sim = SimControl::new();
        sim.connect().await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), sim.end())
            .await
            .expect("end should not block without a run")
            .unwrap();
    }
}
