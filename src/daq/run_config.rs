//! Run configuration: acquisition mode, scan controls and the stored
//! configuration with its per-field change timestamps.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{DaqError, DaqResult};

/// How the DAQ follows a wrapped plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaqMode {
    /// Acquire for the whole run
    #[default]
    On,
    /// Acquire only in explicit calib cycles
    Manual,
    /// Acquire once per event (`create` .. `save`)
    Auto,
}

impl DaqMode {
    const ALL: [DaqMode; 3] = [DaqMode::On, DaqMode::Manual, DaqMode::Auto];

    /// Mode name.
    pub fn as_str(self) -> &'static str {
        match self {
            DaqMode::On => "on",
            DaqMode::Manual => "manual",
            DaqMode::Auto => "auto",
        }
    }

    /// Parse a mode given by name (`"auto"`) or by number (`"2"`).
    pub fn parse(input: &str) -> DaqResult<Self> {
        let input = input.trim();
        if let Some(mode) = Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(input))
        {
            return Ok(mode);
        }
        input
            .parse::<i64>()
            .ok()
            .and_then(Self::from_number)
            .ok_or_else(|| {
                DaqError::Validation(format!(
                    "unknown DAQ mode '{}', expected on, manual or auto",
                    input
                ))
            })
    }

    fn from_number(number: i64) -> Option<Self> {
        usize::try_from(number)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }
}

impl fmt::Display for DaqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DaqMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<i64> for DaqMode {
    type Error = DaqError;

    fn try_from(number: i64) -> Result<Self, Self::Error> {
        Self::parse(&number.to_string())
    }
}

/// Device whose current reading is recorded as a scan variable.
///
/// Sampling reads `position` first and falls back to `value`.
#[async_trait]
pub trait ControlSource: Send + Sync {
    /// Name recorded with the run.
    fn name(&self) -> &str;

    /// Position of a positioner-like device.
    async fn position(&self) -> Option<f64> {
        None
    }

    /// Value of a signal-like device.
    async fn value(&self) -> Option<f64> {
        None
    }
}

/// Where a control's value comes from.
#[derive(Clone)]
pub enum ControlValue {
    /// Sampled from a device at begin time
    Device(Arc<dyn ControlSource>),
    /// Fixed value
    Fixed(f64),
}

/// Named scan variables attached to a run.
#[derive(Clone, Default)]
pub struct Controls {
    entries: Vec<(String, ControlValue)>,
}

impl Controls {
    /// Controls from a sequence of devices, named after the devices.
    pub fn from_devices<I>(devices: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ControlSource>>,
    {
        let entries = devices
            .into_iter()
            .map(|device| (device.name().to_string(), ControlValue::Device(device)))
            .collect();
        Self { entries }
    }

    /// Controls from a name -> device mapping.
    pub fn from_map<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn ControlSource>)>,
        S: Into<String>,
    {
        let entries = devices
            .into_iter()
            .map(|(name, device)| (name.into(), ControlValue::Device(device)))
            .collect();
        Self { entries }
    }

    /// Controls with fixed values.
    pub fn fixed<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let entries = values
            .into_iter()
            .map(|(name, value)| (name.into(), ControlValue::Fixed(value)))
            .collect();
        Self { entries }
    }

    /// Control names in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// True when there are no controls.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read every control into `(name, value)` pairs.
    pub async fn sample(&self) -> DaqResult<Vec<(String, f64)>> {
        let mut sampled = Vec::with_capacity(self.entries.len());
        for (name, source) in &self.entries {
            let value = match source {
                ControlValue::Fixed(value) => *value,
                ControlValue::Device(device) => match device.position().await {
                    Some(position) => position,
                    None => device.value().await.ok_or_else(|| {
                        DaqError::Validation(format!(
                            "control '{}' has neither a position nor a value",
                            name
                        ))
                    })?,
                },
            };
            sampled.push((name.clone(), value));
        }
        Ok(sampled)
    }
}

impl fmt::Debug for Controls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Arguments of [`Daq::configure`](super::Daq::configure).
#[derive(Debug, Clone, Default)]
pub struct ConfigureArgs {
    /// Events per acquisition window
    pub events: Option<u64>,
    /// Seconds per acquisition window
    pub duration: Option<f64>,
    /// Persist data
    pub record: bool,
    /// Count only level-3-accepted events
    pub use_l3t: bool,
    /// Scan variables
    pub controls: Option<Controls>,
    /// Acquisition mode; keeps the previous mode when unset
    pub mode: Option<DaqMode>,
}

impl ConfigureArgs {
    /// Set the event count.
    pub fn with_events(mut self, events: u64) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the duration in seconds.
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Set the record flag.
    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Set the level-3-trigger flag.
    pub fn with_use_l3t(mut self, use_l3t: bool) -> Self {
        self.use_l3t = use_l3t;
        self
    }

    /// Set the controls.
    pub fn with_controls(mut self, controls: Controls) -> Self {
        self.controls = Some(controls);
        self
    }

    /// Set the mode.
    pub fn with_mode(mut self, mode: DaqMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Per-run arguments of kickoff/begin. Unset fields fall back to the
/// stored configuration.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    /// Events for this window
    pub events: Option<u64>,
    /// Seconds for this window
    pub duration: Option<f64>,
    /// Count only level-3-accepted events
    pub use_l3t: Option<bool>,
    /// Scan variables for this window
    pub controls: Option<Controls>,
}

impl RunArgs {
    /// Run for `events` events.
    pub fn events(events: u64) -> Self {
        Self {
            events: Some(events),
            ..Default::default()
        }
    }

    /// Run for `seconds` seconds.
    pub fn duration(seconds: f64) -> Self {
        Self {
            duration: Some(seconds),
            ..Default::default()
        }
    }

    /// Set the level-3-trigger flag.
    pub fn with_use_l3t(mut self, use_l3t: bool) -> Self {
        self.use_l3t = Some(use_l3t);
        self
    }

    /// Set the controls.
    pub fn with_controls(mut self, controls: Controls) -> Self {
        self.controls = Some(controls);
        self
    }
}

/// Configuration applied by the last successful `configure`.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Events per acquisition window
    pub events: Option<u64>,
    /// Seconds per acquisition window
    pub duration: Option<f64>,
    /// Count only level-3-accepted events
    pub use_l3t: bool,
    /// Persist data
    pub record: bool,
    /// Scan variables
    pub controls: Option<Controls>,
    /// Acquisition mode
    pub mode: DaqMode,
}

/// Configuration keys in reporting order.
pub const CONFIG_FIELDS: [&str; 6] = [
    "events", "duration", "use_l3t", "record", "controls", "mode",
];

impl RunConfig {
    /// True when runs end by themselves.
    pub fn bounded(&self) -> bool {
        self.events.is_some() || self.duration.is_some()
    }

    /// Value of each configuration key.
    pub fn field_values(&self) -> [(&'static str, Value); 6] {
        [
            ("events", json!(self.events)),
            ("duration", json!(self.duration)),
            ("use_l3t", json!(self.use_l3t)),
            ("record", json!(self.record)),
            ("controls", json!(self.controls.as_ref().map(Controls::names))),
            ("mode", json!(self.mode.as_str())),
        ]
    }
}

/// A configuration value and when it last changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    /// Current value
    pub value: Value,
    /// Time the value last changed
    pub timestamp: DateTime<Utc>,
}

/// Configuration keyed by field name.
pub type ConfigReading = BTreeMap<String, ConfigEntry>;

/// Per-field change timestamps.
#[derive(Debug, Default)]
pub(crate) struct ConfigTimestamps {
    entries: HashMap<&'static str, ConfigEntry>,
}

impl ConfigTimestamps {
    /// Record `config`, stamping only fields whose value changed.
    pub(crate) fn refresh(&mut self, config: &RunConfig) {
        let now = Utc::now();
        for (field, value) in config.field_values() {
            match self.entries.get_mut(field) {
                Some(entry) if entry.value == value => {}
                Some(entry) => {
                    entry.value = value;
                    entry.timestamp = now;
                }
                None => {
                    self.entries.insert(
                        field,
                        ConfigEntry {
                            value,
                            timestamp: now,
                        },
                    );
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn reading(&self) -> ConfigReading {
        self.entries
            .iter()
            .map(|(field, entry)| (field.to_string(), entry.clone()))
            .collect()
    }
}

/// Field metadata for every configuration key.
pub fn describe_fields() -> BTreeMap<String, Value> {
    let dtype = |field: &str| match field {
        "events" => "integer",
        "duration" => "number",
        "use_l3t" | "record" => "boolean",
        "controls" => "array",
        _ => "string",
    };
    CONFIG_FIELDS
        .iter()
        .map(|&field| {
            (
                field.to_string(),
                json!({ "source": "daq", "dtype": dtype(field), "shape": [] }),
            )
        })
        .collect()
}
