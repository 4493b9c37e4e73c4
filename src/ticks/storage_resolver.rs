//! Storage access for the simulation, independent of the execution mode.
//!
//! Loads complete by age: the values for a request are carried by exactly one tick, either a
//! generated one (Active) or a fetched one (Passive). Whichever of "loader attached" and
//! "values arrived" happens second completes the load.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::FlowResult;
use crate::flow::messages::FlowRequest;
use crate::storage::{
    LoaderId, StorageEntry, StorageKey, StorageLoaded, StoragePutOption, StorageValue,
    StorageValueStore,
};
use crate::ticks::tick_buffer::TickBuffer;
use crate::ticks::tick_generator::TickGenerator;
use crate::{Age, ExecutionMode};

/// Correlates storage loads with the ticks that carry their values.
#[derive(Debug)]
pub struct StorageResolver {
    execution_mode: ExecutionMode,
    pending_loaders: BTreeMap<Age, Vec<LoaderId>>,
    pending_storage: BTreeMap<Age, Vec<StorageEntry>>,
    requested_from_log: BTreeSet<Age>,
    completed: BTreeSet<Age>,
    cursor: Age,
    completions: VecDeque<StorageLoaded>,
    next_loader: u64,
    outbox: VecDeque<FlowRequest>,
}

impl StorageResolver {
    /// Creates a resolver for the given role.
    #[must_use]
    pub fn new(execution_mode: ExecutionMode) -> Self {
        Self {
            execution_mode,
            pending_loaders: BTreeMap::new(),
            pending_storage: BTreeMap::new(),
            requested_from_log: BTreeSet::new(),
            completed: BTreeSet::new(),
            cursor: Age::new(0),
            completions: VecDeque::new(),
            next_loader: 0,
            outbox: VecDeque::new(),
        }
    }

    /// Current role.
    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Switches the source of storage values. A no-op if the mode is unchanged.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        if self.execution_mode == mode {
            return;
        }
        tracing::debug!(?mode, "storage resolver switching source");
        self.execution_mode = mode;
        self.pending_storage.clear();
    }

    /// Follows the consumption cursor. Values parked for earlier ages can no longer be loaded
    /// and are dropped.
    pub fn set_cursor(&mut self, age: Age) {
        self.cursor = age;
        self.pending_storage = self.pending_storage.split_off(&age);
        self.completed = self.completed.split_off(&age);
    }

    /// Starts a load of `keys`.
    ///
    /// With `serialization` (the age of an earlier load), the same age is re-read from the tick
    /// log. Otherwise the Active role requests a storage tick from the generator and the Passive
    /// role reads the storage carried by the tick at the cursor.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`](crate::FlowError::StorageRequestPending) if
    /// the generator already awaits storage.
    pub fn get(
        &mut self,
        keys: Vec<StorageKey>,
        serialization: Option<Age>,
        generator: &mut TickGenerator,
        buffer: &mut TickBuffer,
    ) -> FlowResult<LoaderId> {
        let age = match serialization {
            Some(age) => {
                self.requested_from_log.insert(age);
                buffer.request_non_ignorable_ticks(age, 1);
                age
            },
            None => match self.execution_mode {
                ExecutionMode::Active => generator.request_storage_tick(keys)?,
                ExecutionMode::Passive => {
                    let age = buffer.current_age();
                    if !self.pending_storage.contains_key(&age) {
                        buffer.request_ticks(age, 1);
                    }
                    age
                },
            },
        };

        let loader = LoaderId(self.next_loader);
        self.next_loader += 1;
        match self.pending_storage.remove(&age) {
            Some(storage) => self.complete(loader, age, storage),
            None => self.pending_loaders.entry(age).or_default().push(loader),
        }
        tracing::trace!(%age, ?loader, "storage load attached");
        Ok(loader)
    }

    /// Writes a value. Only takes effect in [`ExecutionMode::Active`].
    pub fn put(&mut self, key: StorageKey, value: StorageValue, option: StoragePutOption) {
        if self.execution_mode != ExecutionMode::Active {
            tracing::trace!(?key, "ignoring storage write from a passive instance");
            return;
        }
        self.outbox
            .push_back(FlowRequest::PutStorage { key, value, option });
    }

    /// Storage values embedded by the generator at `age`.
    pub fn on_generator_storage(&mut self, age: Age, storage: Vec<StorageEntry>) {
        if self.execution_mode == ExecutionMode::Active {
            self.on_storage(age, storage);
        }
    }

    /// Storage values carried by a tick that arrived in the tick log at `age`.
    pub fn on_buffer_storage(&mut self, age: Age, storage: Vec<StorageEntry>) {
        let re_requested = self.requested_from_log.remove(&age);
        if self.execution_mode == ExecutionMode::Passive || re_requested {
            self.on_storage(age, storage);
        }
    }

    /// Number of ages whose values arrived before any loader asked for them.
    #[must_use]
    pub fn pending_storage_len(&self) -> usize {
        self.pending_storage.len()
    }

    /// Number of loaders waiting for values.
    #[must_use]
    pub fn pending_loader_count(&self) -> usize {
        self.pending_loaders.values().map(Vec::len).sum()
    }

    /// Drains completed loads.
    pub fn drain_completions(&mut self) -> std::collections::vec_deque::Drain<'_, StorageLoaded> {
        self.completions.drain(..)
    }

    /// Drains requests for the remote channel.
    pub fn drain_requests(&mut self) -> std::collections::vec_deque::Drain<'_, FlowRequest> {
        self.outbox.drain(..)
    }

    fn on_storage(&mut self, age: Age, storage: Vec<StorageEntry>) {
        match self.pending_loaders.remove(&age) {
            Some(loaders) => {
                for loader in loaders {
                    self.complete(loader, age, storage.clone());
                }
            },
            None if age >= self.cursor && !self.completed.contains(&age) => {
                self.pending_storage.insert(age, storage);
            },
            None => {
                tracing::trace!(%age, cursor = %self.cursor, "dropping storage nobody can load");
            },
        }
    }

    fn complete(&mut self, loader: LoaderId, age: Age, storage: Vec<StorageEntry>) {
        tracing::debug!(%age, ?loader, "storage load completed");
        self.completed.insert(age);
        self.completions.push_back(StorageLoaded {
            loader,
            age,
            values: StorageValueStore::new(storage),
        });
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::config::TickBufferConfig;
    use crate::error::FlowError;
    use crate::storage::StorageRegion;

    fn key() -> StorageKey {
        StorageKey::new(StorageRegion::Counts, "plays")
    }

    fn entry(n: f64) -> StorageEntry {
        StorageEntry {
            key: key(),
            values: vec![StorageValue::Number(n)],
        }
    }

    fn parts(mode: ExecutionMode) -> (StorageResolver, TickGenerator, TickBuffer) {
        (
            StorageResolver::new(mode),
            TickGenerator::new(),
            TickBuffer::new(TickBufferConfig::default(), mode),
        )
    }

    #[test]
    fn active_get_goes_through_the_generator() {
        let (mut resolver, mut generator, mut buffer) = parts(ExecutionMode::Active);
        let loader = resolver
            .get(vec![key()], None, &mut generator, &mut buffer)
            .unwrap();
        assert!(generator.is_awaiting_storage());
        assert_eq!(resolver.pending_loader_count(), 1);

        resolver.on_buffer_storage(Age::new(0), vec![entry(1.0)]);
        assert_eq!(resolver.drain_completions().count(), 0);

        resolver.on_generator_storage(Age::new(0), vec![entry(1.0)]);
        let loaded: Vec<_> = resolver.drain_completions().collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].loader, loader);
        assert_eq!(loaded[0].values.get(&key()), Some(&[StorageValue::Number(1.0)][..]));
    }

    #[test]
    fn active_second_get_is_rejected() {
        let (mut resolver, mut generator, mut buffer) = parts(ExecutionMode::Active);
        resolver
            .get(vec![key()], None, &mut generator, &mut buffer)
            .unwrap();
        assert_eq!(
            resolver.get(vec![key()], None, &mut generator, &mut buffer),
            Err(FlowError::StorageRequestPending)
        );
    }

    #[test]
    fn passive_get_completes_from_values_that_arrived_first() {
        let (mut resolver, mut generator, mut buffer) = parts(ExecutionMode::Passive);
        resolver.on_buffer_storage(Age::new(0), vec![entry(2.0)]);
        let loader = resolver
            .get(vec![key()], None, &mut generator, &mut buffer)
            .unwrap();
        let loaded: Vec<_> = resolver.drain_completions().collect();
        assert_eq!(loaded[0].loader, loader);
        assert_eq!(loaded[0].age, Age::new(0));
        assert_eq!(resolver.pending_loader_count(), 0);
        assert_eq!(buffer.drain_requests().count(), 0);
    }

    #[test]
    fn passive_get_fetches_the_cursor_tick_when_nothing_is_parked() {
        let (mut resolver, mut generator, mut buffer) = parts(ExecutionMode::Passive);
        resolver
            .get(vec![key()], None, &mut generator, &mut buffer)
            .unwrap();
        assert_eq!(buffer.drain_requests().count(), 1);
        assert_eq!(resolver.pending_loader_count(), 1);
    }

    #[test]
    fn parked_storage_stays_bounded() {
        let (mut resolver, mut generator, mut buffer) = parts(ExecutionMode::Passive);
        resolver.on_buffer_storage(Age::new(0), vec![entry(1.0)]);
        resolver
            .get(vec![key()], None, &mut generator, &mut buffer)
            .unwrap();
        assert_eq!(resolver.drain_completions().count(), 1);

        // the same tick fetched again must not be parked a second time
        resolver.on_buffer_storage(Age::new(0), vec![entry(1.0)]);
        assert_eq!(resolver.pending_storage_len(), 0);

        for age in 1..1000 {
            resolver.on_buffer_storage(Age::new(age), vec![entry(1.0)]);
        }
        assert_eq!(resolver.pending_storage_len(), 999);
        resolver.set_cursor(Age::new(5000));
        assert_eq!(resolver.pending_storage_len(), 0);

        resolver.on_buffer_storage(Age::new(10), vec![entry(1.0)]);
        assert_eq!(resolver.pending_storage_len(), 0);
        resolver.on_buffer_storage(Age::new(5000), vec![entry(1.0)]);
        assert_eq!(resolver.pending_storage_len(), 1);
    }

    #[test]
    fn role_switch_forgets_parked_storage() {
        let (mut resolver, _, _) = parts(ExecutionMode::Passive);
        resolver.on_buffer_storage(Age::new(3), vec![entry(1.0)]);
        assert_eq!(resolver.pending_storage_len(), 1);
        resolver.set_execution_mode(ExecutionMode::Active);
        assert_eq!(resolver.pending_storage_len(), 0);
    }

    #[test]
    fn serialization_re_reads_the_tick_log_in_any_mode() {
        let (mut resolver, mut generator, mut buffer) = parts(ExecutionMode::Active);
        resolver
            .get(vec![key()], Some(Age::new(42)), &mut generator, &mut buffer)
            .unwrap();
        assert!(!generator.is_awaiting_storage());
        assert_eq!(
            buffer.drain_requests().collect::<Vec<_>>(),
            vec![FlowRequest::FetchTicks {
                begin: Age::new(42),
                end: Age::new(43),
                exclude_ignorable: true
            }]
        );

        resolver.on_buffer_storage(Age::new(42), vec![entry(3.0)]);
        assert_eq!(resolver.drain_completions().count(), 1);
    }

    #[test]
    fn passive_put_is_a_no_op() {
        let (mut resolver, _, _) = parts(ExecutionMode::Passive);
        resolver.put(key(), StorageValue::Number(1.0), StoragePutOption::Increment);
        assert_eq!(resolver.drain_requests().count(), 0);

        resolver.set_execution_mode(ExecutionMode::Active);
        resolver.put(key(), StorageValue::Number(1.0), StoragePutOption::Increment);
        assert_eq!(resolver.drain_requests().count(), 1);
    }
}
