//! Run coordinator.
//!
//! [`Daq`] owns at most one control session and drives it through the
//! connect/configure/begin/end lifecycle on behalf of a plan runner or an
//! operator. It never sets the controller state itself: every decision is
//! taken from the state the endpoint reports.
//!
//! # Lifecycle
//!
//! ```text
//! connect -> configure -> kickoff/begin -> complete -> collect (end_run)
//! ```
//!
//! `kickoff` and `complete` return an [`OperationStatus`] immediately and do
//! the waiting on a background task. `begin` and `wait` block the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! let daq = Daq::new("daq", 0, SimControl::factory());
//! daq.connect().await?;
//! daq.configure(ConfigureArgs::default().with_events(120)).await?;
//! daq.begin_with(RunArgs::default(), BeginOptions { wait: true, end_run: true }).await?;
//! assert_eq!(daq.state().await, ControllerState::Configured);
//! ```

mod intercept;
pub mod run_config;

pub use intercept::CalibWindow;
pub use run_config::{
    ConfigEntry, ConfigReading, ConfigureArgs, ControlSource, ControlValue, Controls,
    DaqMode, RunArgs, RunConfig,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DaqSettings;
use crate::control::state::ControllerState;
use crate::control::{BeginRequest, ConfigureRequest, ControlFactory, DaqControl, LengthSelector};
use crate::error::{DaqError, DaqResult};
use crate::flyer::Flyer;
use crate::status::OperationStatus;
use run_config::{describe_fields, ConfigTimestamps};

/// Default readiness budget for `kickoff`.
pub const DEFAULT_BEGIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default readiness polling increment.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Blocking options of [`Daq::begin_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeginOptions {
    /// Block until acquisition ends
    pub wait: bool,
    /// Close the run once acquisition ends
    pub end_run: bool,
}

/// Coordinator between a plan runner and one DAQ control session.
pub struct Daq {
    name: String,
    host: String,
    platform: u32,
    begin_timeout: Duration,
    poll_interval: Duration,
    default_mode: DaqMode,
    factory: Arc<dyn ControlFactory>,
    control: RwLock<Option<Arc<dyn DaqControl>>>,
    config: RwLock<Option<RunConfig>>,
    timestamps: RwLock<ConfigTimestamps>,
    /// Set while a plan is wrapped by [`Daq::wrap_plan`]
    bound: AtomicBool,
    /// Set between `open_run` and `close_run` of the wrapped plan
    in_run: AtomicBool,
}

impl Daq {
    /// Coordinator for DAQ `platform`, creating sessions with `factory`.
    pub fn new(
        name: impl Into<String>,
        platform: u32,
        factory: impl ControlFactory + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            host: local_host(),
            platform,
            begin_timeout: DEFAULT_BEGIN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_mode: DaqMode::On,
            factory: Arc::new(factory),
            control: RwLock::new(None),
            config: RwLock::new(None),
            timestamps: RwLock::new(ConfigTimestamps::default()),
            bound: AtomicBool::new(false),
            in_run: AtomicBool::new(false),
        }
    }

    /// Coordinator built from loaded settings.
    pub fn from_settings(settings: &DaqSettings, factory: impl ControlFactory + 'static) -> Self {
        let mut daq = Self::new(settings.name.clone(), settings.platform, factory)
            .with_begin_timeout(Duration::from_millis(settings.begin_timeout_ms))
            .with_poll_interval(Duration::from_millis(settings.poll_interval_ms));
        if let Some(host) = &settings.host {
            daq = daq.with_host(host.clone());
        }
        daq.default_mode = settings.default_mode;
        daq
    }

    /// Override the host the session is bound to.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Override the readiness budget of `kickoff`.
    pub fn with_begin_timeout(mut self, timeout: Duration) -> Self {
        self.begin_timeout = timeout;
        self
    }

    /// Override the readiness polling increment.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host the session is bound to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// DAQ platform number.
    pub fn platform(&self) -> u32 {
        self.platform
    }

    /// True while a control session exists.
    pub fn connected(&self) -> bool {
        self.control.read().is_some()
    }

    /// True while a configuration is stored.
    pub fn configured(&self) -> bool {
        self.config.read().is_some()
    }

    /// Stored configuration, if any.
    pub fn config(&self) -> Option<RunConfig> {
        self.config.read().clone()
    }

    /// Configuration used when `kickoff` has to configure on its own.
    pub fn default_config(&self) -> RunConfig {
        RunConfig {
            mode: self.default_mode,
            ..Default::default()
        }
    }

    fn control(&self) -> Option<Arc<dyn DaqControl>> {
        self.control.read().clone()
    }

    /// Controller state as reported by the endpoint.
    ///
    /// `Disconnected` without a session, or when the endpoint cannot be read.
    pub async fn state(&self) -> ControllerState {
        let Some(control) = self.control() else {
            return ControllerState::Disconnected;
        };
        match control.state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(daq = %self.name, error = %e, "Could not read DAQ state");
                ControllerState::Disconnected
            }
        }
    }

    /// Open a control session. No-op when one exists.
    ///
    /// On failure the half-built session is dropped, leaving the coordinator
    /// disconnected.
    pub async fn connect(&self) -> DaqResult<()> {
        if self.connected() {
            debug!(daq = %self.name, "Already connected");
            return Ok(());
        }
        info!(daq = %self.name, host = %self.host, platform = self.platform, "Connecting to DAQ");
        let control = self
            .factory
            .create(&self.host, self.platform)
            .map_err(|e| remote_failure("connect", e))?;
        if let Err(e) = control.connect().await {
            warn!(daq = %self.name, error = %e, "DAQ connect failed");
            return Err(remote_failure("connect", e));
        }
        *self.control.write() = Some(control);
        info!(daq = %self.name, "Connected to DAQ");
        Ok(())
    }

    /// Drop the control session and the stored configuration. Idempotent.
    pub async fn disconnect(&self) -> DaqResult<()> {
        let control = self.control.write().take();
        if let Some(control) = control {
            if let Err(e) = control.disconnect().await {
                warn!(
                    daq = %self.name,
                    error = %e,
                    "DAQ disconnect failed, dropping session anyway"
                );
            }
            info!(daq = %self.name, "Disconnected from DAQ");
        }
        self.clear_config();
        Ok(())
    }

    fn clear_config(&self) {
        *self.config.write() = None;
        self.timestamps.write().clear();
    }

    /// Apply a run configuration.
    ///
    /// Returns the configuration reading before and after the change.
    pub async fn configure(
        &self,
        args: ConfigureArgs,
    ) -> DaqResult<(ConfigReading, ConfigReading)> {
        let state = self.state().await;
        if !matches!(state, ControllerState::Connected | ControllerState::Configured) {
            return Err(DaqError::StateConflict {
                operation: "configure",
                state,
            });
        }
        if args.events.is_some() && args.duration.is_some() {
            return Err(DaqError::Validation(
                "events and duration are mutually exclusive, give one of them".to_string(),
            ));
        }
        if args.events == Some(0) {
            return Err(DaqError::Validation(
                "events must be positive, leave it unset for an open-ended run".to_string(),
            ));
        }
        if let Some(duration) = args.duration {
            if duration.is_nan() || duration < 1.0 {
                return Err(DaqError::Validation(format!(
                    "duration {}s is too short to be reliable, use events instead",
                    duration
                )));
            }
        }
        let mode = args
            .mode
            .or_else(|| self.config.read().as_ref().map(|config| config.mode))
            .unwrap_or(self.default_mode);
        let controls = match &args.controls {
            Some(controls) => controls.sample().await?,
            None => Vec::new(),
        };
        let control = self.control().ok_or(DaqError::NotConnected)?;

        // Run length is given per begin; configure only ever asks for an
        // open-ended placeholder.
        let length = if args.use_l3t {
            LengthSelector {
                l3t_events: Some(0),
                ..Default::default()
            }
        } else {
            LengthSelector {
                events: Some(0),
                ..Default::default()
            }
        };
        let request = ConfigureRequest {
            record: args.record,
            length,
            controls,
            ..Default::default()
        };

        let old = self.read_configuration();
        if let Err(e) = control.configure(request).await {
            warn!(daq = %self.name, error = %e, "DAQ configure failed, clearing configuration");
            self.clear_config();
            return Err(remote_failure("configure", e));
        }

        let config = RunConfig {
            events: args.events,
            duration: args.duration,
            use_l3t: args.use_l3t,
            record: args.record,
            controls: args.controls,
            mode,
        };
        info!(
            daq = %self.name,
            events = ?config.events,
            duration = ?config.duration,
            record = config.record,
            mode = %config.mode,
            "DAQ configured"
        );
        self.timestamps.write().refresh(&config);
        *self.config.write() = Some(config);
        Ok((old, self.read_configuration()))
    }

    /// Stored configuration with per-field change times.
    pub fn read_configuration(&self) -> ConfigReading {
        self.timestamps.read().reading()
    }

    /// Metadata of every configuration field.
    pub fn describe_configuration(&self) -> BTreeMap<String, Value> {
        describe_fields()
    }

    /// Start acquiring in the background.
    ///
    /// Connects and configures with defaults when needed. The returned status
    /// resolves successfully once `begin` was issued, or as failed when the
    /// endpoint did not become ready within the begin timeout.
    pub async fn kickoff(&self, args: RunArgs) -> DaqResult<OperationStatus> {
        if let Some(duration) = args.duration {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(DaqError::Validation(format!(
                    "duration {}s must be a positive number of seconds",
                    duration
                )));
            }
        }
        if let Err(e) = self.connect().await {
            warn!(daq = %self.name, error = %e, "Kickoff could not connect");
            return Err(DaqError::NotConnected);
        }
        if !self.configured() {
            debug!(daq = %self.name, "Kickoff configuring with defaults");
            self.configure(ConfigureArgs::default()).await?;
        }
        let control = self.control().ok_or(DaqError::NotConnected)?;
        let config = self.config().unwrap_or_else(|| self.default_config());
        let controls = match args.controls.as_ref().or(config.controls.as_ref()) {
            Some(controls) => controls.sample().await?,
            None => Vec::new(),
        };
        let in_plan = self.bound.load(Ordering::SeqCst) && self.in_run.load(Ordering::SeqCst);

        let name = self.name.clone();
        let begin_timeout = self.begin_timeout;
        let poll_interval = self.poll_interval;
        Ok(OperationStatus::spawn("kickoff", async move {
            let ready = wait_ready(control.as_ref(), begin_timeout, poll_interval).await;
            let Some(state) = ready else {
                warn!(daq = %name, timeout = ?begin_timeout, "DAQ not ready to begin");
                return false;
            };
            let force_unit_run =
                in_plan && config.mode != DaqMode::On && state != ControllerState::Open;
            let request = begin_request(&args, &config, force_unit_run, controls);
            debug!(daq = %name, length = ?request.length, force_unit_run, "Beginning run");
            match control.begin(request).await {
                Ok(()) => {
                    info!(daq = %name, "DAQ acquiring");
                    true
                }
                Err(e) => {
                    warn!(daq = %name, error = %e, "DAQ begin failed");
                    false
                }
            }
        }))
    }

    /// Start acquiring and wait for acquisition to start.
    pub async fn begin(&self, args: RunArgs) -> DaqResult<()> {
        self.begin_with(args, BeginOptions::default()).await
    }

    /// Start acquiring, optionally waiting for the end of acquisition and
    /// closing the run afterwards.
    pub async fn begin_with(&self, args: RunArgs, options: BeginOptions) -> DaqResult<()> {
        let status = self.kickoff(args).await?;
        let started = status
            .wait_timeout(self.begin_timeout + self.poll_interval)
            .await?;
        if !started {
            return Err(DaqError::remote("begin", "acquisition did not start"));
        }
        if options.wait {
            return self.wait(None, options.end_run).await;
        }
        if options.end_run {
            if let Some(control) = self.control() {
                let name = self.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = end_of_acquisition(control.as_ref()).await {
                        warn!(daq = %name, error = %e, "Waiting for end of acquisition failed");
                    }
                    if let Err(e) = end_run(control.as_ref()).await {
                        warn!(daq = %name, error = %e, "Closing the run failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Block until the current acquisition ends. Returns at once when
    /// nothing is running.
    pub async fn wait(&self, timeout: Option<Duration>, end_run: bool) -> DaqResult<()> {
        let Some(control) = self.control() else {
            return Ok(());
        };
        if control.state().await? == ControllerState::Running {
            let status = self.end_status(Arc::clone(&control));
            let finished = match timeout {
                Some(limit) => status.wait_timeout(limit).await?,
                None => status.wait().await,
            };
            if !finished {
                return Err(DaqError::remote("end", "waiting for the end of the run failed"));
            }
        }
        if end_run {
            self.end_run().await?;
        }
        Ok(())
    }

    fn end_status(&self, control: Arc<dyn DaqControl>) -> OperationStatus {
        let name = self.name.clone();
        OperationStatus::spawn("end", async move {
            match end_of_acquisition(control.as_ref()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(daq = %name, error = %e, "DAQ end failed");
                    false
                }
            }
        })
    }

    /// Status resolved once the current acquisition ends.
    ///
    /// When the stored configuration gives neither events nor duration the
    /// acquisition is stopped first.
    pub async fn complete(&self) -> DaqResult<OperationStatus> {
        let bounded = self.config().is_some_and(|config| config.bounded());
        self.complete_with(bounded).await
    }

    /// `complete` for an acquisition whose length is known to the caller.
    pub(crate) async fn complete_with(&self, bounded: bool) -> DaqResult<OperationStatus> {
        let control = self.control().ok_or(DaqError::NotConnected)?;
        if !bounded {
            debug!(daq = %self.name, "Open-ended run, stopping on complete");
            control.stop().await?;
        }
        Ok(self.end_status(control))
    }

    /// Close the run. Event data never passes through here, so there is
    /// nothing to return.
    pub async fn collect(&self) -> DaqResult<Vec<Value>> {
        self.end_run().await?;
        Ok(Vec::new())
    }

    /// Schema of `collect`, always empty.
    pub fn describe_collect(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Stop acquiring; the run stays open.
    pub async fn stop(&self) -> DaqResult<()> {
        if let Some(control) = self.control() {
            control.stop().await?;
        }
        Ok(())
    }

    /// Stop acquiring and close the run.
    pub async fn end_run(&self) -> DaqResult<()> {
        if let Some(control) = self.control() {
            end_run(control.as_ref()).await?;
            info!(daq = %self.name, "Run ended");
        }
        Ok(())
    }

    /// Stop acquiring if running.
    pub async fn pause(&self) -> DaqResult<()> {
        if self.state().await == ControllerState::Running {
            debug!(daq = %self.name, "Pausing");
            self.stop().await?;
        }
        Ok(())
    }

    /// Restart acquiring if a run is open.
    pub async fn resume(&self) -> DaqResult<()> {
        if self.state().await == ControllerState::Open {
            debug!(daq = %self.name, "Resuming");
            self.begin(RunArgs::default()).await?;
        }
        Ok(())
    }

    /// Names of the devices staged for a plan.
    pub async fn stage(&self) -> DaqResult<Vec<String>> {
        Ok(vec![self.name.clone()])
    }

    /// Close any open run and return the unstaged device names.
    pub async fn unstage(&self) -> DaqResult<Vec<String>> {
        if matches!(
            self.state().await,
            ControllerState::Open | ControllerState::Running
        ) {
            self.end_run().await?;
        }
        Ok(vec![self.name.clone()])
    }
}

#[async_trait]
impl Flyer for Daq {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> DaqResult<OperationStatus> {
        Daq::kickoff(self, RunArgs::default()).await
    }

    async fn complete(&self) -> DaqResult<OperationStatus> {
        Daq::complete(self).await
    }

    async fn collect(&self) -> DaqResult<Vec<Value>> {
        Daq::collect(self).await
    }

    fn describe_collect(&self) -> BTreeMap<String, Value> {
        Daq::describe_collect(self)
    }

    async fn stage(&self) -> DaqResult<Vec<String>> {
        Daq::stage(self).await
    }

    async fn unstage(&self) -> DaqResult<Vec<String>> {
        Daq::unstage(self).await
    }
}

fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|host| host.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Keep an endpoint's own remote failure as is, wrap anything else.
fn remote_failure(operation: &'static str, error: DaqError) -> DaqError {
    match error {
        DaqError::Remote { .. } => error,
        other => DaqError::remote(operation, other),
    }
}

/// Poll until the endpoint can begin. `None` once `limit` elapsed.
async fn wait_ready(
    control: &dyn DaqControl,
    limit: Duration,
    interval: Duration,
) -> Option<ControllerState> {
    let deadline = Instant::now() + limit;
    loop {
        match control.state().await {
            Ok(state @ (ControllerState::Configured | ControllerState::Open)) => return Some(state),
            Ok(state) => debug!(%state, "Waiting for DAQ to become ready"),
            Err(e) => debug!(error = %e, "DAQ state unreadable while waiting"),
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for the endpoint's `end`, treating "nothing running" as finished.
async fn end_of_acquisition(control: &dyn DaqControl) -> DaqResult<()> {
    match control.end().await {
        Err(e) if e.is_benign_end() => Ok(()),
        other => other,
    }
}

async fn end_run(control: &dyn DaqControl) -> DaqResult<()> {
    control.stop().await?;
    control.endrun().await
}

/// Arguments of the remote `begin` call.
///
/// `force_unit_run` opens a run with a single event so that acquisition
/// inside the run is left to explicit windows.
fn begin_request(
    args: &RunArgs,
    config: &RunConfig,
    force_unit_run: bool,
    controls: Vec<(String, f64)>,
) -> BeginRequest {
    let mut length = LengthSelector::default();
    if force_unit_run {
        length.events = Some(1);
    } else {
        let (events, duration) = if args.events.is_none() && args.duration.is_none() {
            (config.events, config.duration)
        } else {
            (args.events, args.duration)
        };
        if let Some(events) = events {
            let events = i64::try_from(events).unwrap_or(i64::MAX);
            if args.use_l3t.unwrap_or(config.use_l3t) {
                length.l3t_events = Some(events);
            } else {
                length.events = Some(events);
            }
        } else if let Some(duration) = duration {
            let secs = duration.trunc();
            length.duration = Some([secs as i64, ((duration - secs) * 1e9) as i64]);
        } else {
            length.events = Some(0);
        }
    }
    BeginRequest {
        length,
        controls,
        monitors: Vec::new(),
    }
}
