//! The hub: the single-threaded context every sample flows through.
//!
//! A [`Hub`] owns the resource tree and fronts the resource engine. Admin
//! surfaces call through it to shape the tree (create inputs/outputs, get
//! observations, wire routes, open update windows); producers call
//! [`Hub::push`]; the snapshotter drives the flag protocol through the
//! delegated accessors.
//!
//! Everything here runs on one event loop. Handlers fire synchronously,
//! before the mutating call returns, and receive the event data only; a
//! handler that wants to mutate the hub queues work for after the call.

use std::io::Write;

use tracing::{debug, error, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::path;
use crate::res::{HandlerId, Resource, ResourceKind, TransformType};
use crate::sample::{DataType, SampleRef};
use crate::snapshot;
use crate::tree::{Entry, EntryId, EntryType, Tree};

/// Did a resource appear or disappear?
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceOp {
    Added,
    Removed,
}

/// Handle for removing a resource-tree-change handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChangeHandlerId(u32);

type ChangeHandler = Box<dyn FnMut(&str, EntryType, ResourceOp)>;

pub struct Hub {
    tree: Tree,
    max_resources: Option<usize>,
    live_resources: usize,
    change_handlers: Vec<(ChangeHandlerId, ChangeHandler)>,
    next_change_handler: u32,
    updating: bool,
}

impl Hub {
    /// A hub with no capacity limits.
    pub fn new() -> Self {
        Self::with_config(&Configuration::default())
    }

    pub fn with_config(config: &Configuration) -> Self {
        Hub {
            tree: Tree::new(config.max_entries),
            max_resources: config.max_resources,
            live_resources: 0,
            change_handlers: Vec::new(),
            next_change_handler: 0,
            updating: false,
        }
    }

    pub fn root(&self) -> EntryId {
        self.tree.root()
    }

    /// Read access to the tree, for traversal and the snapshotter's scan.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutable tree access for the snapshotter's phases.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    // Entry inspection.

    pub fn is_resource(&self, entry: EntryId) -> bool {
        self.tree.entry(entry).is_resource()
    }

    pub fn entry_name(&self, entry: EntryId) -> &str {
        self.tree.entry(entry).name()
    }

    pub fn entry_type(&self, entry: EntryId) -> EntryType {
        self.tree.entry(entry).entry_type()
    }

    pub fn units(&self, entry: EntryId) -> &str {
        assert!(self.is_resource(entry));
        self.tree.entry(entry).resource().units()
    }

    /// The data type a resource currently carries. Inputs and Outputs are
    /// typed by whoever created them; everything else re-types as values
    /// are pushed.
    pub fn data_type(&self, entry: EntryId) -> DataType {
        assert!(self.is_resource(entry));
        self.tree.entry(entry).resource().data_type()
    }

    pub fn parent(&self, entry: EntryId) -> Option<EntryId> {
        self.tree.entry(entry).parent()
    }

    pub fn first_child(&self, entry: EntryId) -> Option<EntryId> {
        self.tree.first_child(entry)
    }

    pub fn first_child_with_zombies(&self, entry: EntryId) -> Option<EntryId> {
        self.tree.first_child_ex(entry, true)
    }

    pub fn next_sibling(&self, entry: EntryId) -> Option<EntryId> {
        self.tree.next_sibling(entry)
    }

    pub fn next_sibling_with_zombies(&self, entry: EntryId) -> Option<EntryId> {
        self.tree.next_sibling_ex(entry, true)
    }

    pub fn path_of(&self, base: EntryId, entry: EntryId) -> Result<String> {
        self.tree.path_of(base, entry)
    }

    pub fn for_each_resource(&self, f: impl FnMut(EntryId, &Entry)) {
        self.tree.for_each_resource(f);
    }

    // Lookup and creation.

    pub fn find_entry(&self, base: EntryId, path: &str) -> Option<EntryId> {
        path::validate(path).ok()?;
        self.tree.find(base, path)
    }

    pub fn find_entry_at_absolute_path(&self, path: &str) -> Option<EntryId> {
        let Some(relative) = path.strip_prefix('/') else {
            error!("Path not absolute.");
            return None;
        };
        self.find_entry(self.tree.root(), relative)
    }

    /// Gets the entry at the given path, creating namespaces (and missing
    /// ancestors) as needed.
    pub fn get_entry(&mut self, base: EntryId, path: &str) -> Result<EntryId> {
        self.tree.get_entry(base, path)
    }

    /// The `/obs` namespace, created on demand. `NoMemory` if the tree is
    /// at capacity and it doesn't exist yet.
    pub fn obs_namespace(&mut self) -> Result<EntryId> {
        let root = self.tree.root();
        self.tree.get_entry(root, "obs")
    }

    /// Gets the resource at the given path, creating it (and any missing
    /// ancestors) as needed. A bare namespace at the path is promoted to a
    /// placeholder: an observation placeholder under `/obs`, an I/O
    /// placeholder anywhere else.
    pub fn get_resource(&mut self, base: EntryId, path: &str) -> Result<EntryId> {
        path::validate(path)?;

        let (entry, first_new) = match self.tree.find(base, path) {
            Some(found) => (found, None),
            None => self.tree.create(base, path)?,
        };

        if self.tree.entry(entry).entry_type() == EntryType::Namespace {
            if self
                .max_resources
                .is_some_and(|max| self.live_resources >= max)
            {
                error!("Failed to allocate a placeholder for {path}");
                // Unwind whatever this call materialised.
                self.tree.rollback_chain(entry, first_new);
                return Err(Error::NoMemory);
            }

            let for_observation = match self.obs_namespace() {
                Ok(obs_ns) => base == obs_ns || path::is_observation_path(path),
                Err(_) => {
                    error!("Failed to allocate a placeholder for {path}");
                    self.tree.rollback_chain(entry, first_new);
                    return Err(Error::NoMemory);
                }
            };
            let placeholder = if for_observation {
                Resource::observation_placeholder()
            } else {
                Resource::io_placeholder()
            };
            self.live_resources += 1;
            self.tree.entry_mut(entry).promote_to_placeholder(placeholder);
        }

        Ok(entry)
    }

    /// Creates an Input resource at the given path.
    ///
    /// A namespace or placeholder already there is converted. Callers must
    /// have ensured no live input/output/observation occupies the path.
    pub fn create_input(
        &mut self,
        base: EntryId,
        path: &str,
        data_type: DataType,
        units: &str,
    ) -> Result<EntryId> {
        let entry = self.get_resource(base, path)?;
        assert_eq!(
            self.tree.entry(entry).entry_type(),
            EntryType::Placeholder,
            "create_input over a live resource"
        );

        self.tree.entry_mut(entry).set_kind(EntryType::Input);
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .convert_placeholder_to_input(data_type, units);
        self.call_change_handlers(entry, EntryType::Input, ResourceOp::Added);
        Ok(entry)
    }

    /// Creates an Output resource at the given path. Same contract as
    /// [`Self::create_input`].
    pub fn create_output(
        &mut self,
        base: EntryId,
        path: &str,
        data_type: DataType,
        units: &str,
    ) -> Result<EntryId> {
        let entry = self.get_resource(base, path)?;
        assert_eq!(
            self.tree.entry(entry).entry_type(),
            EntryType::Placeholder,
            "create_output over a live resource"
        );

        self.tree.entry_mut(entry).set_kind(EntryType::Output);
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .convert_placeholder_to_output(data_type, units);
        self.call_change_handlers(entry, EntryType::Output, ResourceOp::Added);
        Ok(entry)
    }

    /// Gets the Observation at the given path, creating it if needed.
    /// An existing input or output there is refused with `BadParameter`.
    pub fn get_observation(&mut self, base: EntryId, path: &str) -> Result<EntryId> {
        let entry = self.get_resource(base, path)?;

        match self.tree.entry(entry).entry_type() {
            EntryType::Placeholder => {
                self.tree.entry_mut(entry).set_kind(EntryType::Observation);
                self.tree
                    .entry_mut(entry)
                    .resource_mut()
                    .convert_placeholder_to_observation();
                self.call_change_handlers(entry, EntryType::Observation, ResourceOp::Added);
                Ok(entry)
            }
            EntryType::Observation => Ok(entry),
            other => {
                error!("Attempt to replace a {other} with an Observation.");
                Err(Error::BadParameter)
            }
        }
    }

    // Data flow.

    /// Push a sample to a resource. The hub takes the sample; on a pure
    /// namespace it is dropped and `BadParameter` comes back.
    pub fn push(&mut self, entry: EntryId, data_type: DataType, sample: SampleRef) -> Result<()> {
        match self.tree.entry(entry).entry_type() {
            EntryType::Namespace => {
                drop(sample);
                Err(Error::BadParameter)
            }
            _ => self.process_push(entry, data_type, sample),
        }
    }

    fn process_push(
        &mut self,
        entry: EntryId,
        data_type: DataType,
        sample: SampleRef,
    ) -> Result<()> {
        if self.updating {
            self.tree
                .entry_mut(entry)
                .resource_mut()
                .stash_pending(data_type, sample);
            return Err(Error::InProgress);
        }

        // Observations with an extraction spec accept only JSON, and work
        // on the extracted (re-typed) value.
        let (data_type, sample) = {
            let res = self.tree.entry(entry).resource();
            if res.kind() == ResourceKind::Observation && !res.json_extraction().is_empty() {
                if data_type != DataType::Json {
                    debug!("Non-JSON sample dropped by extracting observation");
                    return Ok(());
                }
                match sample.extract_json(res.json_extraction()) {
                    Some(extracted) => extracted,
                    None => return Ok(()),
                }
            } else {
                (data_type, sample)
            }
        };

        // An override replaces the accepted value, keeping the push's
        // timestamp.
        let (data_type, sample) = match self.tree.entry(entry).resource().override_pair() {
            Some((odt, oval)) => (odt, oval.with_timestamp(sample.timestamp())),
            None => (data_type, sample),
        };

        if !self
            .tree
            .entry(entry)
            .resource()
            .should_accept(data_type, &sample)
        {
            return Ok(());
        }
        let (data_type, sample) = self
            .tree
            .entry_mut(entry)
            .resource_mut()
            .accept(data_type, sample);

        // Fan out before returning: handlers in registration order, then
        // destinations in configuration order.
        let mut handlers = self.tree.entry_mut(entry).resource_mut().take_handlers();
        for (_, handler) in handlers.iter_mut() {
            handler(data_type, &sample);
        }
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .restore_handlers(handlers);

        let dests: Vec<EntryId> = self.tree.entry(entry).resource().dest_links().to_vec();
        for dest in dests {
            self.process_push(dest, data_type, sample.clone())?;
        }
        Ok(())
    }

    /// Register a push handler on a resource. Handlers fire synchronously,
    /// after the resource accepts a sample.
    pub fn add_push_handler(
        &mut self,
        entry: EntryId,
        handler: impl FnMut(DataType, &SampleRef) + 'static,
    ) -> HandlerId {
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .add_push_handler(Box::new(handler))
    }

    pub fn remove_push_handler(&mut self, entry: EntryId, id: HandlerId) {
        self.tree.entry_mut(entry).resource_mut().remove_push_handler(id);
    }

    /// The resource's current value, or `None` (also for namespaces).
    pub fn current_value(&self, entry: EntryId) -> Option<SampleRef> {
        if !self.is_resource(entry) {
            return None;
        }
        self.tree.entry(entry).resource().current_value()
    }

    /// Timestamp of the current value, or -1 if there isn't one.
    pub fn last_modified(&self, entry: EntryId) -> f64 {
        self.current_value(entry)
            .map(|s| s.timestamp())
            .unwrap_or(-1.0)
    }

    /// Route samples from `source` into `dest` (`None` clears the route).
    /// Refuses a route that would close a loop.
    pub fn set_source(&mut self, dest: EntryId, source: Option<EntryId>) -> Result<()> {
        assert_ne!(self.entry_type(dest), EntryType::Namespace);

        if let Some(source) = source {
            assert!(self.is_resource(source));
            // Follow the chain feeding `source`; meeting `dest` there means
            // this route would loop.
            let mut upstream = Some(source);
            while let Some(at) = upstream {
                if at == dest {
                    warn!("Route from source would create a loop");
                    return Err(Error::BadParameter);
                }
                upstream = self.tree.entry(at).resource().source_link();
            }
        }

        let old = self.tree.entry(dest).resource().source_link();
        if old == source {
            return Ok(());
        }
        if let Some(old) = old {
            self.tree
                .entry_mut(old)
                .resource_mut()
                .remove_dest_link(dest);
        }
        self.tree.entry_mut(dest).resource_mut().set_source_link(source);
        if let Some(source) = source {
            self.tree
                .entry_mut(source)
                .resource_mut()
                .add_dest_link(dest);
        }
        Ok(())
    }

    /// Where a resource expects its samples from.
    pub fn source(&self, dest: EntryId) -> Option<EntryId> {
        if !self.is_resource(dest) {
            return None;
        }
        self.tree.entry(dest).resource().source_link()
    }

    /// Delete an Input or Output.
    ///
    /// If admin settings remain (default, override, routing) the entry
    /// becomes a placeholder that preserves them; otherwise the entry is
    /// released outright, leaving a tombstone for the snapshotter if the
    /// node had already been scanned.
    pub fn delete_io(&mut self, entry: EntryId) {
        let entry_type = self.entry_type(entry);
        assert!(matches!(entry_type, EntryType::Input | EntryType::Output));

        // Handlers run before the resource goes away. Demotion to a
        // placeholder still counts as a removal; the placeholder merely
        // preserves admin settings until the resource is re-created.
        self.call_change_handlers(entry, entry_type, ResourceOp::Removed);

        if self.tree.entry(entry).resource().has_admin_settings() {
            self.tree.entry_mut(entry).set_kind(EntryType::Placeholder);
            self.tree
                .entry_mut(entry)
                .resource_mut()
                .convert_io_to_placeholder();
        } else {
            self.remove_entry(entry);
        }
    }

    /// Delete an Observation.
    pub fn delete_observation(&mut self, entry: EntryId) {
        assert_eq!(self.entry_type(entry), EntryType::Observation);
        self.call_change_handlers(entry, EntryType::Observation, ResourceOp::Removed);
        self.remove_entry(entry);
    }

    fn remove_entry(&mut self, entry: EntryId) {
        self.drop_routes(entry);
        let resource = self.tree.entry_mut(entry).demote_to_namespace();
        drop(resource);
        self.live_resources -= 1;
        snapshot::record_node_deletion(&mut self.tree, entry);
        self.tree.release(entry);
    }

    /// Unhook a resource from both ends of its routes.
    fn drop_routes(&mut self, entry: EntryId) {
        if let Some(source) = self.tree.entry(entry).resource().source_link() {
            self.tree
                .entry_mut(source)
                .resource_mut()
                .remove_dest_link(entry);
        }
        let dests: Vec<EntryId> = self.tree.entry(entry).resource().dest_links().to_vec();
        for dest in dests {
            self.tree.entry_mut(dest).resource_mut().set_source_link(None);
        }
    }

    // Observation settings. Each checks the entry actually is an
    // observation; setters log and do nothing otherwise, getters hand back
    // a sentinel.

    fn observation_mut(&mut self, entry: EntryId) -> Option<&mut Resource> {
        if self.entry_type(entry) != EntryType::Observation {
            error!(
                "Not an observation (actually a {}).",
                self.entry_type(entry)
            );
            return None;
        }
        Some(self.tree.entry_mut(entry).resource_mut())
    }

    fn observation(&self, entry: EntryId) -> Option<&Resource> {
        if self.entry_type(entry) != EntryType::Observation {
            return None;
        }
        Some(self.tree.entry(entry).resource())
    }

    /// Throttle: the minimum period between samples an observation accepts.
    pub fn set_min_period(&mut self, entry: EntryId, period: f64) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_min_period(period);
        }
    }

    pub fn min_period(&self, entry: EntryId) -> f64 {
        self.observation(entry).map_or(0.0, |r| r.min_period())
    }

    /// Highest value an observation accepts. Applies to numbers, and to
    /// Booleans as 0/1; other types pass untouched.
    pub fn set_high_limit(&mut self, entry: EntryId, limit: f64) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_high_limit(limit);
        }
    }

    pub fn high_limit(&self, entry: EntryId) -> f64 {
        self.observation(entry).map_or(f64::NAN, |r| r.high_limit())
    }

    pub fn set_low_limit(&mut self, entry: EntryId, limit: f64) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_low_limit(limit);
        }
    }

    pub fn low_limit(&self, entry: EntryId) -> f64 {
        self.observation(entry).map_or(f64::NAN, |r| r.low_limit())
    }

    /// Dead-band: how much a value must move from the current one to be
    /// accepted. For non-numeric types any non-zero setting means "drop
    /// exact repeats". Triggers ignore it.
    pub fn set_change_by(&mut self, entry: EntryId, change: f64) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_change_by(change);
        }
    }

    pub fn change_by(&self, entry: EntryId) -> f64 {
        self.observation(entry).map_or(0.0, |r| r.change_by())
    }

    pub fn set_transform(
        &mut self,
        entry: EntryId,
        transform: TransformType,
        params: &[f64],
    ) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_transform(transform, params);
        }
    }

    pub fn transform(&self, entry: EntryId) -> TransformType {
        self.observation(entry)
            .map_or(TransformType::None, |r| r.transform())
    }

    /// FIFO buffer size; when full the oldest sample is dropped.
    pub fn set_buffer_max_count(&mut self, entry: EntryId, count: u32) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_buffer_max_count(count);
        }
    }

    pub fn buffer_max_count(&self, entry: EntryId) -> u32 {
        self.observation(entry).map_or(0, |r| r.buffer_max_count())
    }

    /// Floor on the time between buffer backups. The backup engine itself
    /// lives elsewhere; the hub just keeps the setting.
    pub fn set_buffer_backup_period(&mut self, entry: EntryId, seconds: u32) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_backup_period(seconds);
        }
    }

    pub fn buffer_backup_period(&self, entry: EntryId) -> u32 {
        self.observation(entry).map_or(0, |r| r.backup_period())
    }

    /// Member/element to extract from JSON samples arriving at an
    /// observation. While set, non-JSON samples (and JSON without the
    /// member) are ignored.
    pub fn set_json_extraction(&mut self, entry: EntryId, spec: &str) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_json_extraction(spec);
        }
    }

    pub fn json_extraction(&self, entry: EntryId) -> &str {
        match self.observation(entry) {
            Some(res) => res.json_extraction(),
            None => {
                debug!(
                    "Not an observation (actually a {}).",
                    self.entry_type(entry)
                );
                ""
            }
        }
    }

    pub fn mark_observation_as_config(&mut self, entry: EntryId) {
        if let Some(res) = self.observation_mut(entry) {
            res.mark_as_config();
        }
    }

    pub fn is_observation_config(&self, entry: EntryId) -> bool {
        match self.observation(entry) {
            Some(res) => res.is_config(),
            None => {
                error!(
                    "Not an observation (actually a {}).",
                    self.entry_type(entry)
                );
                false
            }
        }
    }

    pub fn set_destination(&mut self, entry: EntryId, destination: &str) {
        if let Some(res) = self.observation_mut(entry) {
            res.set_destination(destination);
        }
    }

    pub fn destination(&self, entry: EntryId) -> &str {
        self.observation(entry).map_or("", |r| r.destination())
    }

    // Buffer queries.

    /// Smallest numeric value buffered since `start` (relative seconds-ago
    /// under thirty years, absolute otherwise, NaN for everything), or NaN.
    pub fn query_min(&self, entry: EntryId, start: f64) -> f64 {
        self.observation(entry).map_or(f64::NAN, |r| r.query_min(start))
    }

    pub fn query_max(&self, entry: EntryId, start: f64) -> f64 {
        self.observation(entry).map_or(f64::NAN, |r| r.query_max(start))
    }

    pub fn query_mean(&self, entry: EntryId, start: f64) -> f64 {
        self.observation(entry).map_or(f64::NAN, |r| r.query_mean(start))
    }

    pub fn query_stddev(&self, entry: EntryId, start: f64) -> f64 {
        self.observation(entry)
            .map_or(f64::NAN, |r| r.query_stddev(start))
    }

    /// Oldest buffered sample newer than `start`.
    pub fn find_buffered_sample_after(&self, entry: EntryId, start: f64) -> Option<SampleRef> {
        assert_eq!(self.entry_type(entry), EntryType::Observation);
        self.tree.entry(entry).resource().find_buffered_sample_after(start)
    }

    /// Dump an observation's buffer to `out` as a JSON array; the
    /// completion callback reports how it went.
    pub fn read_buffer_json(
        &self,
        entry: EntryId,
        start: f64,
        out: &mut dyn Write,
        completion: impl FnOnce(Result<()>),
    ) {
        assert_eq!(self.entry_type(entry), EntryType::Observation);
        let result = self
            .tree
            .entry(entry)
            .resource()
            .read_buffer_json(start, out)
            .map_err(|_| Error::Fault);
        completion(result);
    }

    // Defaults, overrides, and output marking.

    /// Set a resource's default value. On Inputs and Outputs the type must
    /// match the declared one.
    pub fn set_default(
        &mut self,
        entry: EntryId,
        data_type: DataType,
        value: SampleRef,
    ) -> Result<()> {
        self.check_value_type(entry, data_type)?;
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .set_default(data_type, value);
        Ok(())
    }

    pub fn has_default(&self, entry: EntryId) -> bool {
        self.tree.entry(entry).resource().has_default()
    }

    pub fn default_data_type(&self, entry: EntryId) -> DataType {
        self.tree.entry(entry).resource().default_data_type()
    }

    pub fn default_value(&self, entry: EntryId) -> Option<SampleRef> {
        self.tree.entry(entry).resource().default_value()
    }

    pub fn remove_default(&mut self, entry: EntryId) {
        self.tree.entry_mut(entry).resource_mut().remove_default();
    }

    /// Force a resource's value: while set, accepted pushes adopt the
    /// override's value (with the push's timestamp).
    pub fn set_override(
        &mut self,
        entry: EntryId,
        data_type: DataType,
        value: SampleRef,
    ) -> Result<()> {
        self.check_value_type(entry, data_type)?;
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .set_override(data_type, value);
        Ok(())
    }

    pub fn has_override(&self, entry: EntryId) -> bool {
        self.tree.entry(entry).resource().has_override()
    }

    pub fn override_data_type(&self, entry: EntryId) -> DataType {
        self.tree.entry(entry).resource().override_data_type()
    }

    pub fn override_value(&self, entry: EntryId) -> Option<SampleRef> {
        self.tree.entry(entry).resource().override_value()
    }

    pub fn remove_override(&mut self, entry: EntryId) {
        self.tree.entry_mut(entry).resource_mut().remove_override();
    }

    fn check_value_type(&self, entry: EntryId, data_type: DataType) -> Result<()> {
        let entry_type = self.entry_type(entry);
        if matches!(entry_type, EntryType::Input | EntryType::Output)
            && data_type != self.tree.entry(entry).resource().data_type()
        {
            error!(
                "{data_type} value doesn't match the {} type of this {entry_type}",
                self.tree.entry(entry).resource().data_type()
            );
            return Err(Error::BadParameter);
        }
        Ok(())
    }

    /// Outputs start out mandatory; this clears the marking.
    pub fn mark_optional(&mut self, entry: EntryId) {
        self.tree.entry_mut(entry).resource_mut().mark_optional();
    }

    /// Is this a mandatory Output? Anything else answers no.
    pub fn is_mandatory(&self, entry: EntryId) -> bool {
        self.entry_type(entry) == EntryType::Output
            && self.tree.entry(entry).resource().is_mandatory()
    }

    // JSON example documents.

    pub fn set_json_example(&mut self, entry: EntryId, example: SampleRef) {
        assert!(self.is_resource(entry));
        self.tree.entry_mut(entry).resource_mut().set_json_example(example);
    }

    pub fn json_example(&self, entry: EntryId) -> Option<SampleRef> {
        assert!(self.is_resource(entry));
        self.tree.entry(entry).resource().json_example()
    }

    pub fn is_json_example_changed(&self, entry: EntryId) -> bool {
        assert!(self.is_resource(entry));
        self.tree.entry(entry).resource().is_json_example_changed()
    }

    pub fn clear_json_example_changed(&mut self, entry: EntryId) {
        assert!(self.is_resource(entry));
        self.tree
            .entry_mut(entry)
            .resource_mut()
            .clear_json_example_changed();
    }

    // The admin update window.

    /// Open the update window: pushes coalesce to the newest sample per
    /// resource until [`Self::end_update`].
    pub fn start_update(&mut self) {
        self.updating = true;
    }

    /// Close the update window and replay the coalesced samples, in tree
    /// order.
    pub fn end_update(&mut self) {
        self.updating = false;
        let mut ids = Vec::new();
        self.tree.for_each_resource(|id, _| ids.push(id));
        for id in ids {
            if let Some((data_type, sample)) =
                self.tree.entry_mut(id).resource_mut().take_pending()
            {
                let _ = self.process_push(id, data_type, sample);
            }
        }
    }

    // Snapshot flag delegation.

    pub fn set_relevance(&mut self, entry: EntryId, relevant: bool) {
        self.tree.set_relevance(entry, relevant);
    }

    pub fn is_relevant(&self, entry: EntryId) -> bool {
        self.tree.is_relevant(entry)
    }

    pub fn set_clear_newness(&mut self, entry: EntryId) {
        self.tree.set_clear_newness(entry);
    }

    pub fn is_newness_clear_required(&self, entry: EntryId) -> bool {
        self.tree.is_newness_clear_required(entry)
    }

    pub fn clear_newness(&mut self, entry: EntryId) {
        self.tree.clear_newness(entry);
    }

    pub fn is_new(&self, entry: EntryId) -> bool {
        self.tree.is_new(entry)
    }

    pub fn is_deleted(&self, entry: EntryId) -> bool {
        self.tree.is_deleted(entry)
    }

    /// Run the snapshotter's flush phase.
    pub fn flush_snapshot(&mut self) {
        snapshot::flush(&mut self.tree);
    }

    // Change notification.

    /// Watch resources appear and disappear. The handler gets the absolute
    /// path, the entry type, and the operation, before the mutating call
    /// returns.
    pub fn add_resource_tree_change_handler(
        &mut self,
        handler: impl FnMut(&str, EntryType, ResourceOp) + 'static,
    ) -> ChangeHandlerId {
        let id = ChangeHandlerId(self.next_change_handler);
        self.next_change_handler += 1;
        self.change_handlers.push((id, Box::new(handler)));
        id
    }

    pub fn remove_resource_tree_change_handler(&mut self, id: ChangeHandlerId) {
        self.change_handlers.retain(|(h, _)| *h != id);
    }

    fn call_change_handlers(&mut self, entry: EntryId, entry_type: EntryType, op: ResourceOp) {
        let path = self
            .tree
            .path_of(self.tree.root(), entry)
            .unwrap_or_default();
        for (_, handler) in &mut self.change_handlers {
            handler(&path, entry_type, op);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sample::{NOW, Sample};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn get_resource_promotes_namespaces() {
        init();
        let mut hub = Hub::new();
        let root = hub.root();

        let b = hub.get_resource(root, "a/b").unwrap();
        assert_eq!(hub.entry_type(b), EntryType::Placeholder);
        let a = hub.parent(b).unwrap();
        assert_eq!(hub.entry_type(a), EntryType::Namespace);

        // And again: same entry, still a placeholder.
        assert_eq!(hub.get_resource(root, "a/b").unwrap(), b);
    }

    #[test]
    fn observation_rule_picks_the_placeholder_flavor() {
        let mut hub = Hub::new();
        let root = hub.root();

        let under_obs = hub.get_resource(root, "/obs/x").unwrap();
        assert_eq!(
            hub.tree().entry(under_obs).resource().kind(),
            ResourceKind::Observation
        );

        let obs_ns = hub.obs_namespace().unwrap();
        let by_base = hub.get_resource(obs_ns, "y").unwrap();
        assert_eq!(
            hub.tree().entry(by_base).resource().kind(),
            ResourceKind::Observation
        );

        let elsewhere = hub.get_resource(root, "sensors/temp").unwrap();
        assert_eq!(hub.tree().entry(elsewhere).resource().kind(), ResourceKind::Io);
    }

    #[test]
    fn input_lifecycle() {
        let mut hub = Hub::new();
        let root = hub.root();

        let temp = hub
            .create_input(root, "sensors/temp", DataType::Numeric, "degC")
            .unwrap();
        assert_eq!(hub.entry_type(temp), EntryType::Input);
        assert!(hub.is_resource(temp));
        assert_eq!(hub.units(temp), "degC");
        assert_eq!(hub.data_type(temp), DataType::Numeric);
        assert_eq!(hub.path_of(root, temp).unwrap(), "/sensors/temp");
        assert_eq!(hub.find_entry(root, "sensors/temp"), Some(temp));
        assert_eq!(hub.find_entry_at_absolute_path("/sensors/temp"), Some(temp));
    }

    #[test]
    fn get_observation_refuses_io_paths() {
        init();
        let mut hub = Hub::new();
        let root = hub.root();
        hub.create_input(root, "in", DataType::Boolean, "").unwrap();

        assert_eq!(hub.get_observation(root, "in"), Err(Error::BadParameter));
    }

    #[test]
    fn get_observation_is_idempotent() {
        let mut hub = Hub::new();
        let root = hub.root();
        let first = hub.get_observation(root, "obs/x").unwrap();
        assert_eq!(hub.entry_type(first), EntryType::Observation);
        let second = hub.get_observation(root, "obs/x").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn push_to_namespace_is_refused() {
        let mut hub = Hub::new();
        let root = hub.root();
        let ns = hub.get_entry(root, "plain").unwrap();
        let sample = Sample::numeric(NOW, 1.0);
        assert_eq!(
            hub.push(ns, DataType::Numeric, sample),
            Err(Error::BadParameter)
        );
    }

    #[test]
    fn push_updates_current_value_and_last_modified() {
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub
            .create_input(root, "in", DataType::Numeric, "")
            .unwrap();
        assert_eq!(hub.last_modified(input), -1.0);

        hub.push(input, DataType::Numeric, Sample::numeric(12.0, 42.0))
            .unwrap();
        let current = hub.current_value(input).unwrap();
        assert_eq!(current.as_numeric(), 42.0);
        assert_eq!(hub.last_modified(input), 12.0);
    }

    #[test]
    fn routes_deliver_in_configuration_order() {
        let mut hub = Hub::new();
        let root = hub.root();
        let src = hub.create_input(root, "src", DataType::Numeric, "").unwrap();
        let d1 = hub.get_observation(root, "obs/first").unwrap();
        let d2 = hub.get_observation(root, "obs/second").unwrap();
        hub.set_source(d1, Some(src)).unwrap();
        hub.set_source(d2, Some(src)).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        for (tag, dest) in [("first", d1), ("second", d2)] {
            let seen = seen.clone();
            hub.add_push_handler(dest, move |_, s| {
                seen.borrow_mut().push((tag, s.as_numeric()));
            });
        }

        hub.push(src, DataType::Numeric, Sample::numeric(1.0, 5.0))
            .unwrap();
        assert_eq!(*seen.borrow(), vec![("first", 5.0), ("second", 5.0)]);
        assert_eq!(hub.current_value(d2).unwrap().as_numeric(), 5.0);
    }

    #[test]
    fn handlers_fire_in_registration_order_before_push_returns() {
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub.create_input(root, "in", DataType::Numeric, "").unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in [1, 2, 3] {
            let order = order.clone();
            hub.add_push_handler(input, move |_, _| order.borrow_mut().push(tag));
        }
        hub.push(input, DataType::Numeric, Sample::numeric(1.0, 0.0))
            .unwrap();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn removed_handlers_stay_quiet() {
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub.create_input(root, "in", DataType::Numeric, "").unwrap();

        let count = Rc::new(RefCell::new(0));
        let counted = count.clone();
        let id = hub.add_push_handler(input, move |_, _| *counted.borrow_mut() += 1);
        hub.push(input, DataType::Numeric, Sample::numeric(1.0, 0.0))
            .unwrap();
        hub.remove_push_handler(input, id);
        hub.push(input, DataType::Numeric, Sample::numeric(2.0, 0.0))
            .unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn route_loops_are_refused() {
        let mut hub = Hub::new();
        let root = hub.root();
        let a = hub.get_observation(root, "obs/a").unwrap();
        let b = hub.get_observation(root, "obs/b").unwrap();
        let c = hub.get_observation(root, "obs/c").unwrap();

        hub.set_source(b, Some(a)).unwrap();
        hub.set_source(c, Some(b)).unwrap();
        assert_eq!(hub.set_source(a, Some(c)), Err(Error::BadParameter));
        assert_eq!(hub.set_source(a, Some(a)), Err(Error::BadParameter));

        // Replacing a source detaches the old link.
        hub.set_source(c, Some(a)).unwrap();
        assert_eq!(hub.source(c), Some(a));
        hub.push(b, DataType::Numeric, Sample::numeric(1.0, 2.0)).unwrap();
        assert!(hub.current_value(c).is_none());
    }

    #[test]
    fn delete_io_with_settings_demotes_to_placeholder() {
        let mut hub = Hub::new();
        let root = hub.root();
        let a = hub.create_input(root, "a", DataType::Numeric, "").unwrap();
        hub.set_default(a, DataType::Numeric, Sample::numeric(1.0, 7.0))
            .unwrap();
        hub.push(a, DataType::Numeric, Sample::numeric(2.0, 1.0)).unwrap();

        hub.delete_io(a);
        assert_eq!(hub.entry_type(a), EntryType::Placeholder);
        assert!(hub.has_default(a));

        // Re-creating reuses the entry, settings intact.
        let again = hub.create_input(root, "a", DataType::Numeric, "").unwrap();
        assert_eq!(again, a);
        assert!(hub.has_default(again));
    }

    #[test]
    fn delete_io_without_settings_releases_the_entry() {
        let mut hub = Hub::new();
        let root = hub.root();
        let a = hub.create_input(root, "a", DataType::Numeric, "").unwrap();
        let before = hub.tree().len();

        hub.delete_io(a);
        // Never scanned, so no tombstone either.
        assert!(hub.find_entry(root, "a").is_none());
        assert_eq!(hub.tree().len(), before - 1);
    }

    #[test]
    fn deleting_a_scanned_resource_leaves_a_zombie() {
        let mut hub = Hub::new();
        let root = hub.root();
        let a = hub.create_input(root, "a", DataType::Numeric, "").unwrap();
        hub.set_clear_newness(a);
        hub.clear_newness(a);

        hub.delete_io(a);
        assert!(hub.find_entry(root, "a").is_none());
        let zombie = hub.tree().find_child_ex(root, "a", true).unwrap();
        assert!(hub.is_deleted(zombie));

        hub.flush_snapshot();
        assert!(hub.tree().find_child_ex(root, "a", true).is_none());
    }

    #[test]
    fn deleting_a_routed_resource_clears_both_ends() {
        let mut hub = Hub::new();
        let root = hub.root();
        let src = hub.create_input(root, "src", DataType::Numeric, "").unwrap();
        let obs = hub.get_observation(root, "obs/x").unwrap();
        hub.set_source(obs, Some(src)).unwrap();

        hub.delete_observation(obs);
        // The source no longer fans out to the dead entry.
        hub.push(src, DataType::Numeric, Sample::numeric(1.0, 1.0)).unwrap();
        assert_eq!(hub.current_value(src).unwrap().as_numeric(), 1.0);
    }

    #[test]
    fn change_handlers_see_adds_and_removes() {
        let mut hub = Hub::new();
        let root = hub.root();

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        hub.add_resource_tree_change_handler(move |path, t, op| {
            sink.borrow_mut().push((path.to_owned(), t, op));
        });

        let input = hub
            .create_input(root, "sensors/temp", DataType::Numeric, "degC")
            .unwrap();
        hub.delete_io(input);

        assert_eq!(
            *events.borrow(),
            vec![
                (
                    "/sensors/temp".to_owned(),
                    EntryType::Input,
                    ResourceOp::Added
                ),
                (
                    "/sensors/temp".to_owned(),
                    EntryType::Input,
                    ResourceOp::Removed
                ),
            ]
        );
    }

    #[test]
    fn update_window_coalesces_to_newest() {
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub.create_input(root, "in", DataType::Numeric, "").unwrap();

        hub.start_update();
        assert_eq!(
            hub.push(input, DataType::Numeric, Sample::numeric(1.0, 1.0)),
            Err(Error::InProgress)
        );
        assert_eq!(
            hub.push(input, DataType::Numeric, Sample::numeric(2.0, 2.0)),
            Err(Error::InProgress)
        );
        assert!(hub.current_value(input).is_none());

        hub.end_update();
        assert_eq!(hub.current_value(input).unwrap().as_numeric(), 2.0);
    }

    #[test]
    fn override_replaces_accepted_values() {
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub.create_input(root, "in", DataType::Numeric, "").unwrap();
        hub.set_override(input, DataType::Numeric, Sample::numeric(1.0, 99.0))
            .unwrap();

        hub.push(input, DataType::Numeric, Sample::numeric(5.0, 1.0)).unwrap();
        let current = hub.current_value(input).unwrap();
        assert_eq!(current.as_numeric(), 99.0);
        assert_eq!(current.timestamp(), 5.0);

        hub.remove_override(input);
        hub.push(input, DataType::Numeric, Sample::numeric(6.0, 1.0)).unwrap();
        assert_eq!(hub.current_value(input).unwrap().as_numeric(), 1.0);
    }

    #[test]
    fn default_and_override_type_checks() {
        init();
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub.create_input(root, "in", DataType::Numeric, "").unwrap();

        assert_eq!(
            hub.set_default(input, DataType::Boolean, Sample::boolean(1.0, true)),
            Err(Error::BadParameter)
        );
        assert_eq!(
            hub.set_override(input, DataType::String, Sample::string(1.0, "x")),
            Err(Error::BadParameter)
        );

        // Observations re-type freely.
        let obs = hub.get_observation(root, "obs/x").unwrap();
        hub.set_default(obs, DataType::String, Sample::string(1.0, "x"))
            .unwrap();
    }

    #[test]
    fn observation_settings_on_non_observations_are_noops() {
        init();
        let mut hub = Hub::new();
        let root = hub.root();
        let input = hub.create_input(root, "in", DataType::Numeric, "").unwrap();

        hub.set_min_period(input, 10.0);
        assert_eq!(hub.min_period(input), 0.0);
        assert!(hub.high_limit(input).is_nan());
        assert_eq!(hub.json_extraction(input), "");
        assert!(hub.query_mean(input, f64::NAN).is_nan());
        assert!(!hub.is_observation_config(input));
    }

    #[test]
    fn outputs_are_mandatory_until_marked_optional() {
        let mut hub = Hub::new();
        let root = hub.root();
        let out = hub.create_output(root, "out", DataType::Boolean, "").unwrap();
        assert!(hub.is_mandatory(out));
        hub.mark_optional(out);
        assert!(!hub.is_mandatory(out));

        let input = hub.create_input(root, "in", DataType::Boolean, "").unwrap();
        assert!(!hub.is_mandatory(input));
    }

    #[test]
    fn resource_capacity_rolls_back_created_entries() {
        init();
        let config = Configuration {
            max_entries: None,
            max_resources: Some(1),
        };
        let mut hub = Hub::with_config(&config);
        let root = hub.root();
        hub.create_input(root, "a", DataType::Numeric, "").unwrap();
        let before = hub.tree().len();

        assert_eq!(hub.get_resource(root, "b/c"), Err(Error::NoMemory));
        assert_eq!(hub.tree().len(), before);
        assert!(hub.find_entry(root, "b").is_none());
    }

    #[test]
    fn entry_capacity_during_promotion_rolls_back_too() {
        init();
        // Room for the root and one more: the entry itself fits, but the
        // on-demand /obs namespace doesn't.
        let config = Configuration {
            max_entries: Some(2),
            max_resources: None,
        };
        let mut hub = Hub::with_config(&config);
        let root = hub.root();

        assert_eq!(hub.get_resource(root, "a"), Err(Error::NoMemory));
        assert_eq!(hub.tree().len(), 1);
        assert!(hub.find_entry(root, "a").is_none());
    }

    #[test]
    fn json_extracting_observation_retypes_samples() {
        let mut hub = Hub::new();
        let root = hub.root();
        let obs = hub.get_observation(root, "obs/depth").unwrap();
        hub.set_json_extraction(obs, "a.b[1]");

        hub.push(
            obs,
            DataType::Json,
            Sample::json(3.0, r#"{"a":{"b":[10,20,30]}}"#),
        )
        .unwrap();
        let current = hub.current_value(obs).unwrap();
        assert_eq!(current.as_numeric(), 20.0);
        assert_eq!(current.timestamp(), 3.0);
        assert_eq!(hub.data_type(obs), DataType::Numeric);

        // Non-JSON and non-matching JSON are ignored, not errors.
        hub.push(obs, DataType::Numeric, Sample::numeric(4.0, 7.0)).unwrap();
        hub.push(obs, DataType::Json, Sample::json(5.0, r#"{"x":1}"#))
            .unwrap();
        assert_eq!(hub.current_value(obs).unwrap().as_numeric(), 20.0);
    }
}
