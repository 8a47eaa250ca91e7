//! Per-entry resource state: the filter/buffer/transform engine behind
//! inputs, outputs, and observations.
//!
//! A `Resource` holds everything an entry carries besides its place in the
//! tree: the current value, admin settings (default, override, routing),
//! and, for observations, the acceptance filters and the FIFO sample
//! buffer. Route links are stored as entry ids on both ends; the [`Hub`]
//! keeps the two sides consistent.
//!
//! [`Hub`]: crate::hub::Hub

use std::collections::VecDeque;
use std::io::{self, Write};

use serde_derive::Serialize;

use crate::sample::{self, DataType, SampleRef};
use crate::tree::{EntryId, NodeFlags};

/// Timestamps past this many seconds are absolute (seconds since the
/// epoch); smaller ones are relative to now. Nobody runs a hub for thirty
/// years without a reboot.
const THIRTY_YEARS: f64 = 30.0 * 365.25 * 86_400.0;

/// Normalise a query start time: `NaN` means "the whole buffer".
pub(crate) fn window_start(start: f64) -> Option<f64> {
    if start.is_nan() {
        None
    } else if start < THIRTY_YEARS {
        Some(sample::wall_clock_seconds() - start)
    } else {
        Some(start)
    }
}

/// Which flavor a resource was created as.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceKind {
    Io,
    Observation,
}

/// Transform applied over an observation's buffered data; the observation's
/// value becomes the transform's output.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TransformType {
    #[default]
    None,
    Mean,
    StdDev,
    Max,
    Min,
}

/// Handle for removing a registered push handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HandlerId(u32);

pub(crate) type PushHandler = Box<dyn FnMut(DataType, &SampleRef)>;

#[derive(Serialize)]
struct Point {
    t: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<serde_json::Value>,
}

pub struct Resource {
    kind: ResourceKind,
    units: String,
    data_type: DataType,
    current: Option<SampleRef>,

    /// Where we expect samples from, and who expects ours.
    source: Option<EntryId>,
    dests: Vec<EntryId>,

    handlers: Vec<(HandlerId, PushHandler)>,
    next_handler: u32,

    default_value: Option<(DataType, SampleRef)>,
    override_value: Option<(DataType, SampleRef)>,

    // Observation settings.
    min_period: f64,
    high_limit: f64,
    low_limit: f64,
    change_by: f64,
    transform: TransformType,
    transform_params: Vec<f64>,
    json_extraction: String,
    destination: String,
    is_config: bool,

    buffer_max: u32,
    backup_period: u32,
    buffer: VecDeque<(DataType, SampleRef)>,

    json_example: Option<SampleRef>,
    json_example_changed: bool,

    /// Mandatory-before-start marking; meaningful for outputs.
    mandatory: bool,

    /// Mirror of the namespace snapshot flags.
    flags: NodeFlags,

    /// Timestamp of the last accepted sample, for the min-period throttle.
    last_accepted: Option<f64>,
    /// Newest sample stashed while an admin update window is open.
    pending: Option<(DataType, SampleRef)>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind)
            .field("data_type", &self.data_type)
            .field("units", &self.units)
            .field("current", &self.current)
            .field("source", &self.source)
            .field("dests", &self.dests)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Resource {
    fn placeholder(kind: ResourceKind) -> Resource {
        Resource {
            kind,
            units: String::new(),
            data_type: DataType::Trigger,
            current: None,
            source: None,
            dests: Vec::new(),
            handlers: Vec::new(),
            next_handler: 0,
            default_value: None,
            override_value: None,
            min_period: 0.0,
            high_limit: f64::NAN,
            low_limit: f64::NAN,
            change_by: 0.0,
            transform: TransformType::None,
            transform_params: Vec::new(),
            json_extraction: String::new(),
            destination: String::new(),
            is_config: false,
            buffer_max: 0,
            backup_period: 0,
            buffer: VecDeque::new(),
            json_example: None,
            json_example_changed: false,
            mandatory: false,
            flags: NodeFlags::new_entry(),
            last_accepted: None,
            pending: None,
        }
    }

    /// Placeholder for a future input or output.
    pub(crate) fn io_placeholder() -> Resource {
        Self::placeholder(ResourceKind::Io)
    }

    /// Placeholder for a future observation.
    pub(crate) fn observation_placeholder() -> Resource {
        Self::placeholder(ResourceKind::Observation)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub(crate) fn convert_placeholder_to_input(&mut self, data_type: DataType, units: &str) {
        self.data_type = data_type;
        self.units = units.to_owned();
    }

    pub(crate) fn convert_placeholder_to_output(&mut self, data_type: DataType, units: &str) {
        self.data_type = data_type;
        self.units = units.to_owned();
        // Outputs start out mandatory.
        self.mandatory = true;
    }

    pub(crate) fn convert_placeholder_to_observation(&mut self) {
        self.kind = ResourceKind::Observation;
    }

    /// Strip the I/O-ness off a resource, leaving the admin settings for
    /// whoever re-creates it.
    pub(crate) fn convert_io_to_placeholder(&mut self) {
        self.handlers.clear();
        self.current = None;
        self.mandatory = false;
        self.last_accepted = None;
        self.pending = None;
    }

    /// Settings worth preserving across deletion: a default, an override,
    /// or configured routing.
    pub(crate) fn has_admin_settings(&self) -> bool {
        self.default_value.is_some()
            || self.override_value.is_some()
            || self.source.is_some()
            || !self.dests.is_empty()
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn current_value(&self) -> Option<SampleRef> {
        self.current.clone()
    }

    // Route links. The hub keeps both ends consistent.

    pub(crate) fn source_link(&self) -> Option<EntryId> {
        self.source
    }

    pub(crate) fn set_source_link(&mut self, source: Option<EntryId>) {
        self.source = source;
    }

    pub(crate) fn dest_links(&self) -> &[EntryId] {
        &self.dests
    }

    pub(crate) fn add_dest_link(&mut self, dest: EntryId) {
        if !self.dests.contains(&dest) {
            self.dests.push(dest);
        }
    }

    pub(crate) fn remove_dest_link(&mut self, dest: EntryId) {
        self.dests.retain(|&d| d != dest);
    }

    // Push handlers.

    pub(crate) fn add_push_handler(&mut self, handler: PushHandler) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push((id, handler));
        id
    }

    pub(crate) fn remove_push_handler(&mut self, id: HandlerId) {
        self.handlers.retain(|(h, _)| *h != id);
    }

    pub(crate) fn take_handlers(&mut self) -> Vec<(HandlerId, PushHandler)> {
        std::mem::take(&mut self.handlers)
    }

    pub(crate) fn restore_handlers(&mut self, handlers: Vec<(HandlerId, PushHandler)>) {
        // Handlers can't touch the hub, so nothing can have re-registered
        // while the set was out on loan.
        debug_assert!(self.handlers.is_empty());
        self.handlers = handlers;
    }

    // Default and override.

    pub(crate) fn set_default(&mut self, data_type: DataType, value: SampleRef) {
        // A default is the value a resource has before anyone pushes.
        if self.current.is_none() {
            self.current = Some(value.clone());
            self.data_type = data_type;
        }
        self.default_value = Some((data_type, value));
    }

    pub fn has_default(&self) -> bool {
        self.default_value.is_some()
    }

    pub fn default_data_type(&self) -> DataType {
        self.default_value
            .as_ref()
            .map(|(t, _)| *t)
            .unwrap_or(DataType::Trigger)
    }

    pub fn default_value(&self) -> Option<SampleRef> {
        self.default_value.as_ref().map(|(_, v)| v.clone())
    }

    pub(crate) fn remove_default(&mut self) {
        self.default_value = None;
    }

    pub(crate) fn set_override(&mut self, data_type: DataType, value: SampleRef) {
        self.override_value = Some((data_type, value));
    }

    pub fn has_override(&self) -> bool {
        self.override_value.is_some()
    }

    pub fn override_data_type(&self) -> DataType {
        self.override_value
            .as_ref()
            .map(|(t, _)| *t)
            .unwrap_or(DataType::Trigger)
    }

    pub fn override_value(&self) -> Option<SampleRef> {
        self.override_value.as_ref().map(|(_, v)| v.clone())
    }

    pub(crate) fn override_pair(&self) -> Option<(DataType, SampleRef)> {
        self.override_value.clone()
    }

    pub(crate) fn remove_override(&mut self) {
        self.override_value = None;
    }

    // Observation filter settings.

    pub(crate) fn set_min_period(&mut self, period: f64) {
        self.min_period = period;
    }

    pub fn min_period(&self) -> f64 {
        self.min_period
    }

    pub(crate) fn set_high_limit(&mut self, limit: f64) {
        self.high_limit = limit;
    }

    pub fn high_limit(&self) -> f64 {
        self.high_limit
    }

    pub(crate) fn set_low_limit(&mut self, limit: f64) {
        self.low_limit = limit;
    }

    pub fn low_limit(&self) -> f64 {
        self.low_limit
    }

    pub(crate) fn set_change_by(&mut self, change: f64) {
        self.change_by = change;
    }

    pub fn change_by(&self) -> f64 {
        self.change_by
    }

    pub(crate) fn set_transform(&mut self, transform: TransformType, params: &[f64]) {
        self.transform = transform;
        self.transform_params = params.to_vec();
    }

    pub fn transform(&self) -> TransformType {
        self.transform
    }

    pub fn transform_params(&self) -> &[f64] {
        &self.transform_params
    }

    pub(crate) fn set_json_extraction(&mut self, spec: &str) {
        self.json_extraction = spec.to_owned();
    }

    pub fn json_extraction(&self) -> &str {
        &self.json_extraction
    }

    pub(crate) fn set_destination(&mut self, destination: &str) {
        self.destination = destination.to_owned();
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub(crate) fn mark_as_config(&mut self) {
        self.is_config = true;
    }

    pub fn is_config(&self) -> bool {
        self.is_config
    }

    // Buffering.

    pub(crate) fn set_buffer_max_count(&mut self, count: u32) {
        self.buffer_max = count;
        while self.buffer.len() > count as usize {
            self.buffer.pop_front();
        }
    }

    pub fn buffer_max_count(&self) -> u32 {
        self.buffer_max
    }

    pub(crate) fn set_backup_period(&mut self, seconds: u32) {
        self.backup_period = seconds;
    }

    pub fn backup_period(&self) -> u32 {
        self.backup_period
    }

    // Mandatory marking (outputs).

    pub(crate) fn mark_optional(&mut self) {
        self.mandatory = false;
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    // JSON example.

    pub(crate) fn set_json_example(&mut self, example: SampleRef) {
        self.json_example = Some(example);
        self.json_example_changed = true;
    }

    pub fn json_example(&self) -> Option<SampleRef> {
        self.json_example.clone()
    }

    pub fn is_json_example_changed(&self) -> bool {
        self.json_example_changed
    }

    pub(crate) fn clear_json_example_changed(&mut self) {
        self.json_example_changed = false;
    }

    pub(crate) fn snapshot_flags(&self) -> &NodeFlags {
        &self.flags
    }

    pub(crate) fn snapshot_flags_mut(&mut self) -> &mut NodeFlags {
        &mut self.flags
    }

    // The update-window stash.

    pub(crate) fn stash_pending(&mut self, data_type: DataType, sample: SampleRef) {
        // Only the newest survives the window.
        self.pending = Some((data_type, sample));
    }

    pub(crate) fn take_pending(&mut self) -> Option<(DataType, SampleRef)> {
        self.pending.take()
    }

    /// Run the observation filter chain against an incoming sample.
    /// I/O resources and placeholders accept everything.
    pub(crate) fn should_accept(&self, data_type: DataType, sample: &SampleRef) -> bool {
        if self.kind != ResourceKind::Observation {
            return true;
        }

        if self.min_period > 0.0 {
            if let Some(last) = self.last_accepted {
                if sample.timestamp() - last < self.min_period {
                    return false;
                }
            }
        }

        // Range limits apply to numbers, and to Booleans as 0/1.
        let comparable = match data_type {
            DataType::Numeric => Some(sample.as_numeric()),
            DataType::Boolean => Some(if sample.as_bool() { 1.0 } else { 0.0 }),
            _ => None,
        };
        if let Some(v) = comparable {
            if !self.high_limit.is_nan() && v > self.high_limit {
                return false;
            }
            if !self.low_limit.is_nan() && v < self.low_limit {
                return false;
            }
        }

        if self.change_by > 0.0 && data_type != DataType::Trigger {
            if let Some(current) = &self.current {
                let unchanged = match (data_type, self.data_type) {
                    (DataType::Numeric, DataType::Numeric) => {
                        (sample.as_numeric() - current.as_numeric()).abs() < self.change_by
                    }
                    (DataType::Boolean, DataType::Boolean) => {
                        sample.as_bool() == current.as_bool()
                    }
                    (DataType::String, DataType::String)
                    | (DataType::Json, DataType::Json) => {
                        sample.as_string() == current.as_string()
                    }
                    // A type change is a change.
                    _ => false,
                };
                if unchanged {
                    return false;
                }
            }
        }

        true
    }

    /// Take an accepted sample: update the current value (and type), buffer
    /// it, and apply any transform. Returns the effective value to fan out.
    pub(crate) fn accept(
        &mut self,
        data_type: DataType,
        sample: SampleRef,
    ) -> (DataType, SampleRef) {
        self.last_accepted = Some(sample.timestamp());
        self.data_type = data_type;
        self.current = Some(sample.clone());

        if self.kind == ResourceKind::Observation && self.buffer_max > 0 {
            self.buffer.push_back((data_type, sample.clone()));
            while self.buffer.len() > self.buffer_max as usize {
                self.buffer.pop_front();
            }
        }

        if self.kind == ResourceKind::Observation
            && self.transform != TransformType::None
            && data_type == DataType::Numeric
        {
            let out = self.apply_transform();
            if !out.is_nan() {
                let transformed = sample::Sample::numeric(sample.timestamp(), out);
                self.current = Some(transformed.clone());
                return (DataType::Numeric, transformed);
            }
        }

        (data_type, sample)
    }

    fn apply_transform(&self) -> f64 {
        match self.transform {
            TransformType::None => f64::NAN,
            TransformType::Mean => self.query_mean(f64::NAN),
            TransformType::StdDev => self.query_stddev(f64::NAN),
            TransformType::Max => self.query_max(f64::NAN),
            TransformType::Min => self.query_min(f64::NAN),
        }
    }

    /// Numeric values buffered after the (normalised) start time.
    fn numbers_after(&self, start: f64) -> impl Iterator<Item = f64> + '_ {
        let cutoff = window_start(start);
        self.buffer
            .iter()
            .filter(move |(t, s)| {
                *t == DataType::Numeric && cutoff.is_none_or(|c| s.timestamp() > c)
            })
            .map(|(_, s)| s.as_numeric())
    }

    pub fn query_min(&self, start: f64) -> f64 {
        self.numbers_after(start).fold(f64::NAN, f64::min)
    }

    pub fn query_max(&self, start: f64) -> f64 {
        self.numbers_after(start).fold(f64::NAN, f64::max)
    }

    pub fn query_mean(&self, start: f64) -> f64 {
        let (count, sum) = self
            .numbers_after(start)
            .fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
        if count == 0 { f64::NAN } else { sum / count as f64 }
    }

    pub fn query_stddev(&self, start: f64) -> f64 {
        let values: Vec<f64> = self.numbers_after(start).collect();
        if values.is_empty() {
            return f64::NAN;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    }

    /// The oldest buffered sample newer than the (normalised) start time.
    pub fn find_buffered_sample_after(&self, start: f64) -> Option<SampleRef> {
        let cutoff = window_start(start);
        self.buffer
            .iter()
            .find(|(_, s)| cutoff.is_none_or(|c| s.timestamp() > c))
            .map(|(_, s)| s.clone())
    }

    /// Dump the buffer as a JSON array of `{"t":…,"v":…}` objects
    /// (just `{"t":…}` for triggers).
    pub fn read_buffer_json(&self, start: f64, out: &mut dyn Write) -> io::Result<()> {
        let cutoff = window_start(start);
        let mut first = true;
        out.write_all(b"[")?;
        for (data_type, s) in &self.buffer {
            if cutoff.is_some_and(|c| s.timestamp() <= c) {
                continue;
            }
            if !first {
                out.write_all(b",")?;
            }
            first = false;

            let v = match data_type {
                DataType::Trigger => None,
                DataType::Boolean => Some(serde_json::Value::Bool(s.as_bool())),
                DataType::Numeric => Some(serde_json::json!(s.as_numeric())),
                DataType::String => Some(serde_json::Value::String(s.as_string().to_owned())),
                DataType::Json => Some(
                    serde_json::from_str(s.as_json())
                        .unwrap_or_else(|_| serde_json::Value::String(s.as_json().to_owned())),
                ),
            };
            let point = Point { t: s.timestamp(), v };
            serde_json::to_writer(&mut *out, &point)?;
        }
        out.write_all(b"]")?;
        Ok(())
    }
}
