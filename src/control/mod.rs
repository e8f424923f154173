//! Remote DAQ control endpoints.
//!
//! A [`DaqControl`] is one control session with the acquisition process. The
//! coordinator never changes the controller state itself; it only issues
//! transition-triggering calls and reads the state back.
//!
//! Both `configure` and `begin` carry a [`LengthSelector`]: four optional run
//! length inputs resolved in fixed priority order (`events`, `l1t_events`,
//! `l3t_events`, `duration`). The first one present wins.
//!
//! # Example
//!
//! ```rust,ignore
//! let control = SimControl::new();
//! control.connect().await?;
//! control.configure(ConfigureRequest::events(0)).await?;
//! control.begin(BeginRequest::events(120)).await?;   // one second of beam
//! control.end().await?;
//! assert_eq!(control.state().await?, ControllerState::Open);
//! ```

pub mod sim;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DaqError, DaqResult};
use state::ControllerState;

/// Machine event rate used to turn event counts into wall-clock time.
pub const EVENT_RATE_HZ: f64 = 120.0;

/// Optional run-length inputs, in priority order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LengthSelector {
    /// Number of events to take
    pub events: Option<i64>,
    /// Number of level-1-accepted events to take
    pub l1t_events: Option<i64>,
    /// Number of level-3-accepted events to take
    pub l3t_events: Option<i64>,
    /// Run time as `[seconds, nanoseconds]`
    pub duration: Option<[i64; 2]>,
}

/// How long a run lasts once it starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunLength {
    /// Until stopped explicitly
    Forever,
    /// Fixed wall-clock time
    For(Duration),
}

impl LengthSelector {
    /// True when no input is present.
    pub fn is_empty(&self) -> bool {
        self.events.is_none()
            && self.l1t_events.is_none()
            && self.l3t_events.is_none()
            && self.duration.is_none()
    }

    /// Resolve the selector, checking every value the real controller chokes on.
    ///
    /// Event counts must be non-negative; zero means "run forever". A
    /// duration must add up to a strictly positive time. Returns `None` when
    /// the selector is empty.
    pub fn resolve(&self) -> DaqResult<Option<RunLength>> {
        let count = self.events.or(self.l1t_events).or(self.l3t_events);
        if let Some(count) = count {
            return match count {
                n if n < 0 => Err(DaqError::Validation(format!(
                    "event count must not be negative, got {}",
                    n
                ))),
                0 => Ok(Some(RunLength::Forever)),
                n => Ok(Some(RunLength::For(Duration::from_secs_f64(
                    n as f64 / EVENT_RATE_HZ,
                )))),
            };
        }
        match self.duration {
            Some([secs, nsec]) => {
                let total = secs as f64 + nsec as f64 * 1e-9;
                if total <= 0.0 {
                    return Err(DaqError::Validation(format!(
                        "duration [{}, {}] must be positive",
                        secs, nsec
                    )));
                }
                Ok(Some(RunLength::For(Duration::from_secs_f64(total))))
            }
            None => Ok(None),
        }
    }

    /// Resolve without validation, clamping anything odd to zero length.
    pub fn resolve_lenient(&self) -> Option<RunLength> {
        let count = self.events.or(self.l1t_events).or(self.l3t_events);
        if let Some(count) = count {
            return Some(match count {
                0 => RunLength::Forever,
                n => RunLength::For(Duration::from_secs_f64(n.max(0) as f64 / EVENT_RATE_HZ)),
            });
        }
        self.duration.map(|[secs, nsec]| {
            let total = (secs as f64 + nsec as f64 * 1e-9).max(0.0);
            RunLength::For(Duration::from_secs_f64(total))
        })
    }
}

/// Arguments of the remote `configure` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigureRequest {
    /// Persist data to disk
    pub record: bool,
    /// DAQ configuration database key
    pub key: u32,
    /// Default run length for later `begin` calls
    pub length: LengthSelector,
    /// Scan variables recorded with the run
    pub controls: Vec<(String, f64)>,
    /// PVs monitored during the run
    pub monitors: Vec<String>,
    /// Partition selection
    pub partition: Option<String>,
}

impl ConfigureRequest {
    /// Configure with a plain event count.
    pub fn events(events: i64) -> Self {
        Self {
            length: LengthSelector {
                events: Some(events),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Arguments of the remote `begin` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeginRequest {
    /// Length of this acquisition window
    pub length: LengthSelector,
    /// Scan variables recorded with this window
    pub controls: Vec<(String, f64)>,
    /// PVs monitored during this window
    pub monitors: Vec<String>,
}

impl BeginRequest {
    /// Begin with a plain event count.
    pub fn events(events: i64) -> Self {
        Self {
            length: LengthSelector {
                events: Some(events),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Begin with a `[seconds, nanoseconds]` duration.
    pub fn duration(secs: i64, nsec: i64) -> Self {
        Self {
            length: LengthSelector {
                duration: Some([secs, nsec]),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// One control session with the DAQ process.
///
/// Calls may block on the network; they are only ever issued by the single
/// coordinator that owns the session.
#[async_trait]
pub trait DaqControl: Send + Sync {
    /// Open the control session.
    async fn connect(&self) -> DaqResult<()>;

    /// Close the control session.
    async fn disconnect(&self) -> DaqResult<()>;

    /// Apply run parameters for subsequent runs.
    async fn configure(&self, request: ConfigureRequest) -> DaqResult<()>;

    /// Start acquiring. Returns as soon as acquisition has started.
    async fn begin(&self, request: BeginRequest) -> DaqResult<()>;

    /// Stop acquiring; the run stays open.
    async fn stop(&self) -> DaqResult<()>;

    /// Close the open run.
    async fn endrun(&self) -> DaqResult<()>;

    /// Block until the current acquisition finishes.
    async fn end(&self) -> DaqResult<()>;

    /// Raw state index as reported by the controller.
    async fn state_index(&self) -> DaqResult<usize>;

    /// Controller state.
    async fn state(&self) -> DaqResult<ControllerState> {
        let index = self.state_index().await?;
        ControllerState::from_index(index)
            .ok_or_else(|| DaqError::remote("state", format!("unknown state index {}", index)))
    }
}

/// Builds control sessions bound to a host and DAQ platform.
pub trait ControlFactory: Send + Sync {
    /// Create an unconnected session.
    fn create(&self, host: &str, platform: u32) -> DaqResult<Arc<dyn DaqControl>>;
}

impl<F> ControlFactory for F
where
    F: Fn(&str, u32) -> DaqResult<Arc<dyn DaqControl>> + Send + Sync,
{
    fn create(&self, host: &str, platform: u32) -> DaqResult<Arc<dyn DaqControl>> {
        self(host, platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(events: Option<i64>, duration: Option<[i64; 2]>) -> LengthSelector {
        LengthSelector {
            events,
            duration,
            ..Default::default()
        }
    }

    #[test]
    fn test_events_win_over_duration() {
        let length = selector(Some(240), Some([10, 0])).resolve().unwrap();
        assert_eq!(length, Some(RunLength::For(Duration::from_secs(2))));
    }

    #[test]
    fn test_priority_order() {
        let sel = LengthSelector {
            l1t_events: Some(120),
            l3t_events: Some(0),
            ..Default::default()
        };
        assert_eq!(
            sel.resolve().unwrap(),
            Some(RunLength::For(Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_zero_events_run_forever() {
        assert_eq!(
            selector(Some(0), None).resolve().unwrap(),
            Some(RunLength::Forever)
        );
    }

    #[test]
    fn test_negative_events_rejected() {
        assert!(matches!(
            selector(Some(-1), None).resolve(),
            Err(DaqError::Validation(_))
        ));
    }

    #[test]
    fn test_duration_pair() {
        assert_eq!(
            selector(None, Some([1, 500_000_000])).resolve().unwrap(),
            Some(RunLength::For(Duration::from_millis(1500)))
        );
        assert!(selector(None, Some([0, 0])).resolve().is_err());
        assert!(selector(None, Some([-1, 0])).resolve().is_err());
    }

    #[test]
    fn test_empty_selector() {
        assert!(LengthSelector::default().is_empty());
        assert_eq!(LengthSelector::default().resolve().unwrap(), None);
        assert_eq!(LengthSelector::default().resolve_lenient(), None);
    }
}
