use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use lockstep_flow::prelude::*;
use lockstep_flow::{StorageEntry, StoragePutOption};

#[derive(Default)]
struct ServerState {
    ticks: BTreeMap<Age, Tick>,
    latest: Option<Age>,
    start_points: Vec<StartPoint>,
    storage: BTreeMap<StorageKey, StorageValue>,
    inboxes: Vec<Vec<FlowMessage>>,
    sent: Vec<Vec<FlowRequest>>,
}

impl ServerState {
    fn store_tick(&mut self, tick: Tick) {
        self.latest = Some(self.latest.map_or(tick.age, |latest| latest.max(tick.age)));
        self.ticks.insert(tick.age, tick);
    }

    fn broadcast(&mut self, from: Option<usize>, message: &FlowMessage) {
        for (id, inbox) in self.inboxes.iter_mut().enumerate() {
            if Some(id) != from {
                inbox.push(message.clone());
            }
        }
    }

    fn fetch(&self, begin: Age, end: Age, exclude_ignorable: bool) -> Option<TickList> {
        let latest = self.latest?;
        let end = end.min(latest + 1);
        if begin >= end {
            return None;
        }
        let ticks = self
            .ticks
            .range(begin..end)
            .map(|(_, tick)| {
                if exclude_ignorable {
                    tick.without_ignorable()
                } else {
                    tick.clone()
                }
            })
            .filter(Tick::has_payload)
            .collect();
        Some(TickList::new(begin, end, ticks))
    }

    fn start_point(&self, query: StartPointQuery) -> Option<StartPoint> {
        match query {
            StartPointQuery::Age(age) => self
                .start_points
                .iter()
                .filter(|start_point| start_point.frame <= age)
                .max_by_key(|start_point| start_point.frame)
                .cloned(),
            StartPointQuery::Timestamp(time) => self
                .start_points
                .iter()
                .filter(|start_point| start_point.timestamp <= time)
                .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
                .cloned(),
        }
    }

    fn put_storage(&mut self, key: StorageKey, value: StorageValue, option: StoragePutOption) {
        let current = self.storage.get(&key).cloned();
        let combined = match (option, current, value) {
            (StoragePutOption::Overwrite, _, value) | (_, None, value) => value,
            (
                StoragePutOption::Increment,
                Some(StorageValue::Number(a)),
                StorageValue::Number(b),
            ) => StorageValue::Number(a + b),
            (
                StoragePutOption::Decrement,
                Some(StorageValue::Number(a)),
                StorageValue::Number(b),
            ) => StorageValue::Number(a - b),
            (StoragePutOption::Max, Some(StorageValue::Number(a)), StorageValue::Number(b)) => {
                StorageValue::Number(a.max(b))
            },
            (StoragePutOption::Min, Some(StorageValue::Number(a)), StorageValue::Number(b)) => {
                StorageValue::Number(a.min(b))
            },
            (_, Some(_), value) => value,
        };
        self.storage.insert(key, combined);
    }

    fn handle(&mut self, from: usize, request: FlowRequest) {
        let reply = match request {
            FlowRequest::PushTick(tick) => {
                self.store_tick(tick.clone());
                self.broadcast(Some(from), &FlowMessage::Tick(tick));
                None
            },
            FlowRequest::SendEvent(event) => {
                self.broadcast(Some(from), &FlowMessage::Event(event));
                None
            },
            FlowRequest::FetchTicks {
                begin,
                end,
                exclude_ignorable,
            } => Some(FlowMessage::TickList {
                begin,
                end,
                result: Ok(self.fetch(begin, end, exclude_ignorable)),
            }),
            FlowRequest::GetStorage { ticket, keys } => {
                let entries = keys
                    .into_iter()
                    .map(|key| StorageEntry {
                        values: self.storage.get(&key).cloned().into_iter().collect(),
                        key,
                    })
                    .collect();
                Some(FlowMessage::Storage {
                    ticket,
                    result: Ok(entries),
                })
            },
            FlowRequest::PutStorage { key, value, option } => {
                self.put_storage(key, value, option);
                None
            },
            FlowRequest::GetStartPoint { query } => Some(FlowMessage::StartPoint {
                query,
                result: Ok(self.start_point(query)),
            }),
            FlowRequest::PutStartPoint(start_point) => {
                self.start_points.push(start_point);
                None
            },
        };
        if let Some(reply) = reply {
            self.inboxes[from].push(reply);
        }
    }
}

/// An in-memory stand-in for the remote tick server.
///
/// Every connection answers its own requests on its next `receive_all`, the way a real
/// transport would deliver them a round trip later. Published ticks and events are broadcast
/// to every other connection.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Rc<RefCell<ServerState>>,
}

#[allow(dead_code)]
impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryFlow {
        let mut state = self.state.borrow_mut();
        state.inboxes.push(Vec::new());
        state.sent.push(Vec::new());
        MemoryFlow {
            server: self.state.clone(),
            id: state.inboxes.len() - 1,
        }
    }

    /// Stores a tick without notifying anyone, as if it was recorded earlier.
    pub fn store_tick(&self, tick: Tick) {
        self.state.borrow_mut().store_tick(tick);
    }

    /// Stores ticks `[0, end)`, empty unless `with_payload` returns one.
    pub fn store_ticks(&self, end: i64, mut with_payload: impl FnMut(Age) -> Option<Vec<Event>>) {
        for age in 0..end {
            let age = Age::new(age);
            let tick = match with_payload(age) {
                Some(events) => Tick::new(age).with_events(events),
                None => Tick::new(age),
            };
            self.store_tick(tick);
        }
    }

    /// Stores a tick and broadcasts it to every connection.
    pub fn publish(&self, tick: Tick) {
        let mut state = self.state.borrow_mut();
        state.store_tick(tick.clone());
        state.broadcast(None, &FlowMessage::Tick(tick));
    }

    pub fn put_start_point(&self, start_point: StartPoint) {
        self.state.borrow_mut().start_points.push(start_point);
    }

    pub fn start_points(&self) -> Vec<StartPoint> {
        self.state.borrow().start_points.clone()
    }

    pub fn put_storage(&self, key: StorageKey, value: StorageValue) {
        self.state
            .borrow_mut()
            .put_storage(key, value, StoragePutOption::Overwrite);
    }

    pub fn storage(&self, key: &StorageKey) -> Option<StorageValue> {
        self.state.borrow().storage.get(key).cloned()
    }

    pub fn tick(&self, age: Age) -> Option<Tick> {
        self.state.borrow().ticks.get(&age).cloned()
    }

    pub fn latest_age(&self) -> Option<Age> {
        self.state.borrow().latest
    }
}

/// One participant's connection to a [`MemoryServer`].
pub struct MemoryFlow {
    server: Rc<RefCell<ServerState>>,
    id: usize,
}

#[allow(dead_code)]
impl MemoryFlow {
    /// Every request this connection sent so far.
    pub fn sent(&self) -> Vec<FlowRequest> {
        self.server.borrow().sent[self.id].clone()
    }

    /// Drains the record of sent requests.
    pub fn take_sent(&mut self) -> Vec<FlowRequest> {
        std::mem::take(&mut self.server.borrow_mut().sent[self.id])
    }

    /// Number of tick fetches among the drained requests.
    pub fn take_fetch_count(&mut self) -> usize {
        self.take_sent()
            .iter()
            .filter(|request| matches!(request, FlowRequest::FetchTicks { .. }))
            .count()
    }

    /// Queues a message for the next `receive_all`.
    pub fn deliver(&mut self, message: FlowMessage) {
        self.server.borrow_mut().inboxes[self.id].push(message);
    }
}

impl NonBlockingFlow for MemoryFlow {
    fn send(&mut self, request: FlowRequest) {
        let mut state = self.server.borrow_mut();
        state.sent[self.id].push(request.clone());
        state.handle(self.id, request);
    }

    fn receive_all(&mut self) -> Vec<FlowMessage> {
        std::mem::take(&mut self.server.borrow_mut().inboxes[self.id])
    }
}

/// What a [`StubSimulation`] does at a given age.
#[allow(dead_code)]
pub enum Action {
    /// Switch to this scene mode; the step reports a scene change.
    ChangeScene(SceneMode),
    /// Load these keys.
    LoadStorage(Vec<StorageKey>),
    /// Write this value.
    PutStorage(StorageKey, StorageValue, StoragePutOption),
    /// Publish a snapshot.
    SaveSnapshot,
}

/// A simulation that records everything the loop hands it.
pub struct StubSimulation {
    pub age: i64,
    pub scene: SceneMode,
    /// `(age, events)` for every age-advancing step.
    pub applied: Vec<(Age, Vec<Event>)>,
    /// Number of local steps.
    pub local_steps: usize,
    /// Wall-clock time of every age-advancing step.
    pub step_times: Vec<f64>,
    /// Sum of `omitted_step_count` over all steps.
    pub omitted_steps: u32,
    pub restored: Vec<Age>,
    pub loaded: Vec<StorageLoaded>,
    /// Simulation age at each storage delivery.
    pub loaded_at: Vec<i64>,
    pub errors: Vec<FlowError>,
    /// Makes every `restore` fail.
    pub fail_restore: bool,
    actions: BTreeMap<i64, Action>,
}

impl Default for StubSimulation {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl StubSimulation {
    pub fn new() -> Self {
        Self {
            age: 0,
            scene: SceneMode::default(),
            applied: Vec::new(),
            local_steps: 0,
            step_times: Vec::new(),
            omitted_steps: 0,
            restored: Vec::new(),
            loaded: Vec::new(),
            loaded_at: Vec::new(),
            errors: Vec::new(),
            fail_restore: false,
            actions: BTreeMap::new(),
        }
    }

    /// Performs `action` during the step that applies the tick at `age`.
    pub fn at(&mut self, age: i64, action: Action) {
        self.actions.insert(age, action);
    }

    /// Events applied at `age`.
    pub fn events_at(&self, age: i64) -> Option<&[Event]> {
        self.applied
            .iter()
            .find(|(applied, _)| *applied == Age::new(age))
            .map(|(_, events)| events.as_slice())
    }
}

impl Simulation for StubSimulation {
    fn tick(&mut self, ctx: &mut StepContext<'_>, step: Step) -> bool {
        self.omitted_steps += step.omitted_step_count;
        if !step.advances_age {
            self.local_steps += 1;
            return false;
        }
        let age = self.age;
        self.applied
            .push((Age::new(age), step.events.unwrap_or_default()));
        self.step_times.push(ctx.time());
        self.age += 1;

        match self.actions.remove(&age) {
            Some(Action::ChangeScene(scene)) => {
                self.scene = scene;
                return true;
            },
            Some(Action::LoadStorage(keys)) => {
                if let Err(err) = ctx.storage_get(keys, None) {
                    self.errors.push(err);
                }
            },
            Some(Action::PutStorage(key, value, option)) => ctx.storage_put(key, value, option),
            Some(Action::SaveSnapshot) => ctx.save_snapshot(SnapshotData {
                random_generator: vec![1, 2, 3],
                next_entity_id: 7,
                snapshot: age.to_le_bytes().to_vec(),
            }),
            None => {},
        }
        false
    }

    fn restore(&mut self, start_point: &StartPoint) -> FlowResult<()> {
        if self.fail_restore {
            return Err(FlowError::RestoreFailed {
                age: start_point.frame,
                context: "corrupt snapshot".into(),
            });
        }
        self.age = start_point.frame.as_i64();
        self.restored.push(start_point.frame);
        Ok(())
    }

    fn scene_mode(&self) -> SceneMode {
        self.scene
    }

    fn age(&self) -> Age {
        Age::new(self.age)
    }

    fn fps(&self) -> f64 {
        50.0
    }

    fn on_storage_loaded(&mut self, loaded: StorageLoaded) {
        self.loaded_at.push(self.age);
        self.loaded.push(loaded);
    }
}
