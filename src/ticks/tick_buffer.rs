//! Consumer-side sparse tick log with gap tracking.
//!
//! The log is an ordered list of half-open [`TickRange`]s of known ages. Ranges never overlap
//! and are merged as soon as they touch, so every age strictly between two ranges is unknown.
//! Only ages carrying a payload are stored as [`Tick`]s; the rest of a range is implicitly
//! empty.

use std::collections::VecDeque;

use crate::config::TickBufferConfig;
use crate::error::FlowError;
use crate::event::Event;
use crate::flow::messages::FlowRequest;
use crate::storage::StorageEntry;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::tick::{Tick, TickList};
use crate::{Age, ExecutionMode};

/// Timestamps below this (about 1973 in epoch milliseconds) were recorded relative to the
/// session origin.
const RELATIVE_TIMESTAMP_LIMIT: f64 = 1.0e11;

/// A contiguous span `[start, end)` of known ages.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRange {
    /// First known age.
    pub start: Age,
    /// One past the last known age.
    pub end: Age,
    /// Ticks with payload inside the span, in increasing age order.
    pub ticks: VecDeque<Tick>,
}

impl TickRange {
    fn contains(&self, age: Age) -> bool {
        self.start <= age && age < self.end
    }
}

/// Notifications produced by the [`TickBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickBufferEvent {
    /// The tick at the cursor just became available.
    GotNextTick,
    /// A fetch returned no ticks at all.
    GotNoTick,
    /// A tick carrying storage values arrived.
    GotStorage {
        /// Age of the carrying tick.
        age: Age,
        /// The values.
        storage: Vec<StorageEntry>,
    },
    /// A fetch failed.
    FetchFailed(FlowError),
}

/// The consumer-side tick log and its consumption cursor.
#[derive(Debug)]
pub struct TickBuffer {
    current_age: Age,
    known_latest_age: Age,
    nearest_absent_age: Age,
    ranges: Vec<TickRange>,
    execution_mode: ExecutionMode,
    prefetch_threshold: i64,
    fetch_batch_size: i64,
    time_origin: f64,
    next_tick_time_cache: Option<Option<f64>>,
    event_queue: VecDeque<TickBufferEvent>,
    outbox: VecDeque<FlowRequest>,
}

impl TickBuffer {
    /// Creates an empty log with the cursor at age 0.
    #[must_use]
    pub fn new(config: TickBufferConfig, execution_mode: ExecutionMode) -> Self {
        Self {
            current_age: Age::new(0),
            known_latest_age: Age::NULL,
            nearest_absent_age: Age::new(0),
            ranges: Vec::new(),
            execution_mode,
            prefetch_threshold: i64::from(config.prefetch_threshold),
            fetch_batch_size: i64::from(config.fetch_batch_size),
            time_origin: 0.0,
            next_tick_time_cache: None,
            event_queue: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    /// The age the next [`consume`](Self::consume) returns.
    #[must_use]
    pub fn current_age(&self) -> Age {
        self.current_age
    }

    /// Highest age ever observed; [`Age::NULL`] before anything arrived.
    #[must_use]
    pub fn known_latest_age(&self) -> Age {
        self.known_latest_age
    }

    /// Smallest unknown age at or after the cursor.
    #[must_use]
    pub fn nearest_absent_age(&self) -> Age {
        self.nearest_absent_age
    }

    /// Whether [`consume`](Self::consume) would return a tick.
    #[must_use]
    pub fn has_next_tick(&self) -> bool {
        self.current_age != self.nearest_absent_age
    }

    /// The known ranges.
    #[must_use]
    pub fn ranges(&self) -> &[TickRange] {
        &self.ranges
    }

    /// Current role.
    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Absolute time added to timestamps recorded relative to the session origin.
    pub fn set_time_origin(&mut self, origin: f64) {
        self.time_origin = origin;
        self.next_tick_time_cache = None;
    }

    /// Inserts one tick. Ages before the cursor and already known ages are ignored, but their
    /// storage is still announced, as for [`add_tick_list`](Self::add_tick_list).
    pub fn add_tick(&mut self, tick: Tick) {
        let age = tick.age;
        if age > self.known_latest_age {
            self.known_latest_age = age;
        }
        if let Some(storage) = &tick.storage {
            self.event_queue.push_back(TickBufferEvent::GotStorage {
                age,
                storage: storage.clone(),
            });
        }
        if age < self.current_age {
            tracing::trace!(%age, current = %self.current_age, "ignoring tick before cursor");
            return;
        }

        let may_get_next = self.current_age == self.nearest_absent_age;
        let has_payload = tick.has_payload();
        let idx = self.ranges.partition_point(|range| range.start <= age);
        let mut merged = false;

        if idx > 0 && age < self.ranges[idx - 1].end {
            tracing::trace!(%age, "ignoring duplicate tick");
            return;
        }
        if idx > 0 && self.ranges[idx - 1].end == age {
            let prev = &mut self.ranges[idx - 1];
            prev.end += 1;
            if has_payload {
                prev.ticks.push_back(tick);
            }
            if idx < self.ranges.len() && self.ranges[idx].start == age + 1 {
                let next = self.ranges.remove(idx);
                let prev = &mut self.ranges[idx - 1];
                prev.end = next.end;
                prev.ticks.extend(next.ticks);
                merged = true;
            }
        } else if idx < self.ranges.len() && self.ranges[idx].start == age + 1 {
            let next = &mut self.ranges[idx];
            next.start = age;
            if has_payload {
                next.ticks.push_front(tick);
            }
        } else {
            let mut ticks = VecDeque::new();
            if has_payload {
                ticks.push_back(tick);
            }
            self.ranges.insert(
                idx,
                TickRange {
                    start: age,
                    end: age + 1,
                    ticks,
                },
            );
        }

        if merged || age == self.nearest_absent_age {
            self.nearest_absent_age = self.find_nearest_absent_age();
        }
        if age == self.current_age {
            self.next_tick_time_cache = None;
            if may_get_next {
                self.event_queue.push_back(TickBufferEvent::GotNextTick);
            }
        }
        crate::debug_check_invariants!(self, "add_tick");
    }

    /// Inserts a fetched span. Only the part not already known (and not before the cursor) is
    /// taken; overlapping and touching ranges are replaced by one merged range in a single
    /// splice. Returns the clamped span, or `None` if nothing remained.
    ///
    /// Storage notifications fire for every carried storage tick, including ones the log already
    /// had or no longer keeps, so that re-requested storage reaches its loader.
    pub fn add_tick_list(&mut self, list: TickList) -> Option<(Age, Age)> {
        let TickList { start, end, ticks } = list;
        for tick in &ticks {
            if let Some(storage) = &tick.storage {
                self.event_queue.push_back(TickBufferEvent::GotStorage {
                    age: tick.age,
                    storage: storage.clone(),
                });
            }
        }
        if end > start && end - 1 > self.known_latest_age {
            self.known_latest_age = end - 1;
        }

        let start = start.max(self.current_age);
        if start >= end {
            return None;
        }
        let may_get_next = self.current_age == self.nearest_absent_age;

        let lo = self.ranges.partition_point(|range| range.end < start);
        let hi = self.ranges.partition_point(|range| range.start <= end);
        let existing: Vec<TickRange> = self.ranges.drain(lo..hi).collect();
        let spans: Vec<(Age, Age)> =
            existing.iter().map(|range| (range.start, range.end)).collect();

        let merged_start = existing.first().map_or(start, |range| range.start.min(start));
        let merged_end = existing.last().map_or(end, |range| range.end.max(end));
        let mut merged_ticks: Vec<Tick> =
            existing.into_iter().flat_map(|range| range.ticks).collect();
        merged_ticks.extend(ticks.into_iter().filter(|tick| {
            start <= tick.age
                && tick.age < end
                && tick.has_payload()
                && !spans.iter().any(|&(s, e)| s <= tick.age && tick.age < e)
        }));
        merged_ticks.sort_by_key(|tick| tick.age);
        merged_ticks.dedup_by_key(|tick| tick.age);

        self.ranges.insert(
            lo,
            TickRange {
                start: merged_start,
                end: merged_end,
                ticks: merged_ticks.into(),
            },
        );
        self.nearest_absent_age = self.find_nearest_absent_age();
        self.next_tick_time_cache = None;
        if may_get_next && self.has_next_tick() {
            self.event_queue.push_back(TickBufferEvent::GotNextTick);
        }
        crate::debug_check_invariants!(self, "add_tick_list");
        Some((start, end))
    }

    /// Handles the response to a tick fetch.
    pub fn on_tick_list(
        &mut self,
        begin: Age,
        end: Age,
        result: Result<Option<TickList>, FlowError>,
    ) {
        match result {
            Ok(Some(list)) => {
                self.add_tick_list(list);
            },
            Ok(None) => {
                tracing::debug!(%begin, %end, "tick fetch returned nothing");
                self.event_queue.push_back(TickBufferEvent::GotNoTick);
            },
            Err(err) => {
                crate::report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::TickLog,
                    "tick fetch [{}, {}) failed: {}",
                    begin,
                    end,
                    err
                );
                self.event_queue.push_back(TickBufferEvent::FetchFailed(err));
            },
        }
    }

    /// Advances the cursor by one age and returns its tick (a payload-less tick for empty ages),
    /// or `None` if the cursor's age is unknown.
    ///
    /// In [`ExecutionMode::Passive`], when the cursor gets within the prefetch threshold of the
    /// nearest gap, the next batch is requested.
    pub fn consume(&mut self) -> Option<Tick> {
        if self.current_age == self.nearest_absent_age {
            return None;
        }
        let age = self.current_age;
        let Some(range) = self.ranges.first_mut() else {
            crate::report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "cursor {} before nearest gap {} but no ranges",
                age,
                self.nearest_absent_age
            );
            return None;
        };
        if range.start != age {
            crate::report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InternalError,
                "first range starts at {} but cursor is {}",
                range.start,
                age
            );
            return None;
        }

        range.start += 1;
        let tick = if range.ticks.front().is_some_and(|tick| tick.age == age) {
            range.ticks.pop_front()
        } else {
            None
        };
        if range.start == range.end {
            self.ranges.remove(0);
        }
        self.current_age += 1;
        self.next_tick_time_cache = None;

        if age + self.prefetch_threshold == self.nearest_absent_age {
            self.request_ticks(self.nearest_absent_age, self.fetch_batch_size);
        }
        tracing::trace!(%age, "consumed tick");
        Some(tick.unwrap_or_else(|| Tick::new(age)))
    }

    /// Moves the cursor to `age`, dropping everything before it. Every age before the new cursor
    /// counts as known.
    pub fn set_current_age(&mut self, age: Age) {
        self.drop_until(age);
        self.current_age = age;
        if age - 1 > self.known_latest_age {
            self.known_latest_age = age - 1;
        }
        self.nearest_absent_age = self.find_nearest_absent_age();
        self.next_tick_time_cache = None;
        crate::debug_check_invariants!(self, "set_current_age");
    }

    /// Switches role. Drops all buffered data; a no-op if the mode is unchanged.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        if self.execution_mode == mode {
            return;
        }
        self.drop_until(self.known_latest_age + 1);
        self.nearest_absent_age = self.find_nearest_absent_age();
        self.next_tick_time_cache = None;
        self.execution_mode = mode;
    }

    /// Timestamp carried by a Timestamp event in the tick at the cursor, if any.
    ///
    /// Timestamps recorded relative to the session origin are shifted by the time origin.
    pub fn read_next_tick_time(&mut self) -> Option<f64> {
        if let Some(cached) = self.next_tick_time_cache {
            return cached;
        }
        let age = self.current_age;
        let value = if self.has_next_tick() {
            self.ranges
                .first()
                .and_then(|range| range.ticks.front())
                .filter(|tick| tick.age == age)
                .and_then(|tick| tick.events.iter().flatten().find_map(Event::timestamp_value))
                .map(|timestamp| {
                    if timestamp < RELATIVE_TIMESTAMP_LIMIT {
                        timestamp + self.time_origin
                    } else {
                        timestamp
                    }
                })
        } else {
            None
        };
        self.next_tick_time_cache = Some(value);
        value
    }

    /// Requests `len` ages starting at `from`. Only in [`ExecutionMode::Passive`].
    pub fn request_ticks(&mut self, from: Age, len: i64) {
        if self.execution_mode != ExecutionMode::Passive {
            return;
        }
        self.outbox.push_back(FlowRequest::FetchTicks {
            begin: from,
            end: from + len,
            exclude_ignorable: false,
        });
    }

    /// Requests a batch starting at the cursor.
    pub fn request_next_ticks(&mut self) {
        self.request_ticks(self.current_age, self.fetch_batch_size);
    }

    /// Requests `len` ages starting at `from` without ignorable events, in any mode.
    pub fn request_non_ignorable_ticks(&mut self, from: Age, len: i64) {
        self.outbox.push_back(FlowRequest::FetchTicks {
            begin: from,
            end: from + len,
            exclude_ignorable: true,
        });
    }

    /// Drains notifications.
    pub fn drain_events(&mut self) -> std::collections::vec_deque::Drain<'_, TickBufferEvent> {
        self.event_queue.drain(..)
    }

    /// Drains requests for the remote channel.
    pub fn drain_requests(&mut self) -> std::collections::vec_deque::Drain<'_, FlowRequest> {
        self.outbox.drain(..)
    }

    fn range_index_containing(&self, age: Age) -> Option<usize> {
        let idx = self.ranges.partition_point(|range| range.start <= age);
        (idx > 0 && self.ranges[idx - 1].contains(age)).then(|| idx - 1)
    }

    fn find_nearest_absent_age(&self) -> Age {
        match self.range_index_containing(self.current_age) {
            Some(idx) => self.ranges[idx].end,
            None => self.current_age,
        }
    }

    fn drop_until(&mut self, age: Age) {
        let idx = self.ranges.partition_point(|range| range.end <= age);
        self.ranges.drain(..idx);
        if let Some(first) = self.ranges.first_mut() {
            if first.start < age {
                first.start = age;
                while first.ticks.front().is_some_and(|tick| tick.age < age) {
                    first.ticks.pop_front();
                }
            }
        }
    }
}

impl InvariantChecker for TickBuffer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.nearest_absent_age < self.current_age {
            return Err(InvariantViolation::new("TickBuffer", "nearest gap before cursor")
                .with_details(format!(
                    "current={}, nearest={}",
                    self.current_age, self.nearest_absent_age
                )));
        }
        if self.nearest_absent_age != self.find_nearest_absent_age() {
            return Err(InvariantViolation::new("TickBuffer", "stale nearest gap"));
        }
        if self.ranges.first().is_some_and(|range| range.start < self.current_age) {
            return Err(InvariantViolation::new("TickBuffer", "data kept before cursor"));
        }
        for (i, range) in self.ranges.iter().enumerate() {
            if range.start >= range.end {
                return Err(InvariantViolation::new("TickBuffer", "empty range")
                    .with_details(format!("index {i}")));
            }
            if let Some(next) = self.ranges.get(i + 1) {
                if range.end >= next.start {
                    return Err(InvariantViolation::new(
                        "TickBuffer",
                        "ranges overlap or touch",
                    )
                    .with_details(format!(
                        "[{}, {}) then [{}, {})",
                        range.start, range.end, next.start, next.end
                    )));
                }
            }
            let mut previous: Option<Age> = None;
            for tick in &range.ticks {
                if !range.contains(tick.age)
                    || previous.is_some_and(|prev| prev >= tick.age)
                    || !tick.has_payload()
                {
                    return Err(InvariantViolation::new(
                        "TickBuffer",
                        "range ticks out of span, unsorted or empty",
                    )
                    .with_details(format!("age {}", tick.age)));
                }
                previous = Some(tick.age);
            }
        }
        Ok(())
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
    use crate::event::EventKind;
    use crate::storage::{StorageKey, StorageRegion};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn age(n: i64) -> Age {
        Age::new(n)
    }

    fn pd(tag: u8) -> Event {
        Event::new(EventKind::Message { data: vec![tag] })
    }

    fn empty(n: i64) -> Tick {
        Tick::new(age(n))
    }

    fn with(n: i64, tag: u8) -> Tick {
        Tick::new(age(n)).with_events(vec![pd(tag)])
    }

    fn passive() -> TickBuffer {
        TickBuffer::new(TickBufferConfig::default(), ExecutionMode::Passive)
    }

    fn spans(buffer: &TickBuffer) -> Vec<(i64, i64)> {
        buffer
            .ranges()
            .iter()
            .map(|range| (range.start.as_i64(), range.end.as_i64()))
            .collect()
    }

    fn events(buffer: &mut TickBuffer) -> Vec<TickBufferEvent> {
        buffer.drain_events().collect()
    }

    #[test]
    fn sequential_ticks_form_one_range_and_consume_in_order() {
        let mut buffer = passive();
        assert_eq!(buffer.known_latest_age(), Age::NULL);
        buffer.add_tick(empty(0));
        buffer.add_tick(empty(1));
        buffer.add_tick(with(2, 0));
        buffer.add_tick(empty(3));
        buffer.add_tick(with(4, 0));

        assert_eq!(spans(&buffer), vec![(0, 5)]);
        let ticks: Vec<_> = buffer.ranges()[0].ticks.iter().cloned().collect();
        assert_eq!(ticks, vec![with(2, 0), with(4, 0)]);

        assert_eq!(buffer.consume(), Some(empty(0)));
        assert_eq!(buffer.consume(), Some(empty(1)));
        assert_eq!(buffer.consume(), Some(with(2, 0)));
        assert_eq!(buffer.consume(), Some(empty(3)));
        assert_eq!(buffer.current_age(), age(4));
    }

    #[test]
    fn duplicate_tick_keeps_first_writer() {
        let mut buffer = passive();
        buffer.add_tick(empty(0));
        buffer.add_tick(empty(1));
        buffer.add_tick(empty(2));
        buffer.add_tick(with(2, 9));
        assert_eq!(spans(&buffer), vec![(0, 3)]);
        buffer.consume();
        buffer.consume();
        assert_eq!(buffer.consume(), Some(empty(2)));
    }

    #[test]
    fn gap_filling_tick_merges_ranges() {
        let mut buffer = passive();
        buffer.add_tick(empty(0));
        buffer.add_tick(with(2, 1));
        buffer.add_tick(empty(3));
        assert_eq!(spans(&buffer), vec![(0, 1), (2, 4)]);
        assert_eq!(buffer.nearest_absent_age(), age(1));

        buffer.add_tick(empty(1));
        assert_eq!(spans(&buffer), vec![(0, 4)]);
        assert_eq!(buffer.nearest_absent_age(), age(4));
        assert!(buffer.check_invariants().is_ok());
    }

    #[test]
    fn tick_before_a_range_extends_its_start() {
        let mut buffer = passive();
        buffer.add_tick(empty(3));
        buffer.add_tick(with(2, 1));
        assert_eq!(spans(&buffer), vec![(2, 4)]);
        assert_eq!(buffer.ranges()[0].ticks.front(), Some(&with(2, 1)));
        assert_eq!(buffer.nearest_absent_age(), age(0));
    }

    #[test]
    fn got_next_tick_only_for_the_cursor_age() {
        let mut buffer = passive();
        buffer.add_tick(empty(1));
        assert!(events(&mut buffer).is_empty());
        buffer.add_tick(empty(0));
        assert_eq!(events(&mut buffer), vec![TickBufferEvent::GotNextTick]);
        assert_eq!(buffer.nearest_absent_age(), age(2));
        buffer.add_tick(empty(2));
        assert!(events(&mut buffer).is_empty());
    }

    #[test]
    fn ticks_before_the_cursor_are_ignored() {
        let mut buffer = passive();
        buffer.set_current_age(age(10));
        buffer.add_tick(with(5, 1));
        assert!(buffer.ranges().is_empty());
        assert_eq!(buffer.known_latest_age(), age(5));
    }

    #[test]
    fn storage_behind_the_cursor_is_still_announced() {
        let mut buffer = passive();
        buffer.set_current_age(age(10));
        let entry = StorageEntry {
            key: StorageKey::new(StorageRegion::Values, "k"),
            values: vec![],
        };
        buffer.add_tick(Tick::new(age(4)).with_storage(vec![entry.clone()]));
        assert!(buffer.ranges().is_empty());
        assert_eq!(
            events(&mut buffer),
            vec![TickBufferEvent::GotStorage {
                age: age(4),
                storage: vec![entry],
            }]
        );
    }

    #[test]
    fn storage_ticks_are_announced() {
        let mut buffer = passive();
        let entry = StorageEntry {
            key: StorageKey::new(StorageRegion::Values, "k"),
            values: vec![],
        };
        buffer.add_tick(Tick::new(age(3)).with_storage(vec![entry.clone()]));
        assert_eq!(
            events(&mut buffer),
            vec![TickBufferEvent::GotStorage {
                age: age(3),
                storage: vec![entry]
            }]
        );
    }

    #[test]
    fn tick_list_fills_only_the_unknown_remainder() {
        let mut buffer = passive();
        buffer.add_tick(empty(2));
        buffer.add_tick(with(3, 1));
        buffer.add_tick(empty(8));

        let inserted = buffer.add_tick_list(TickList::new(
            age(0),
            age(6),
            vec![with(1, 5), with(3, 7), with(5, 5)],
        ));
        assert_eq!(inserted, Some((age(0), age(6))));
        assert_eq!(spans(&buffer), vec![(0, 6), (8, 9)]);
        let ticks: Vec<_> = buffer.ranges()[0].ticks.iter().cloned().collect();
        assert_eq!(ticks, vec![with(1, 5), with(3, 1), with(5, 5)]);
        assert_eq!(buffer.known_latest_age(), age(8));
        assert!(buffer.check_invariants().is_ok());
    }

    #[test]
    fn tick_list_touching_ranges_merge_into_one() {
        let mut buffer = passive();
        buffer.add_tick(empty(0));
        buffer.add_tick(empty(6));
        buffer.add_tick_list(TickList::new(age(1), age(6), vec![]));
        assert_eq!(spans(&buffer), vec![(0, 7)]);
        assert_eq!(buffer.nearest_absent_age(), age(7));
    }

    #[test]
    fn tick_list_is_clamped_to_the_cursor() {
        let mut buffer = passive();
        buffer.set_current_age(age(4));
        assert_eq!(
            buffer.add_tick_list(TickList::new(age(0), age(3), vec![with(1, 1)])),
            None
        );
        assert_eq!(
            buffer.add_tick_list(TickList::new(age(0), age(6), vec![with(1, 1), with(5, 2)])),
            Some((age(4), age(6)))
        );
        assert_eq!(spans(&buffer), vec![(4, 6)]);
        assert_eq!(events(&mut buffer), vec![TickBufferEvent::GotNextTick]);
    }

    #[test]
    fn fetch_results_are_reported() {
        let mut buffer = passive();
        buffer.on_tick_list(age(0), age(10), Ok(None));
        buffer.on_tick_list(
            age(0),
            age(10),
            Err(FlowError::FetchFailed {
                resource: "ticks",
                context: "timeout".into(),
            }),
        );
        let got = events(&mut buffer);
        assert_eq!(got[0], TickBufferEvent::GotNoTick);
        assert!(matches!(got[1], TickBufferEvent::FetchFailed(_)));

        buffer.on_tick_list(
            age(0),
            age(2),
            Ok(Some(TickList::new(age(0), age(2), vec![]))),
        );
        assert_eq!(events(&mut buffer), vec![TickBufferEvent::GotNextTick]);
    }

    #[test]
    fn consume_prefetches_near_the_gap_when_passive() {
        let config = TickBufferConfig {
            prefetch_threshold: 2,
            fetch_batch_size: 10,
        };
        let mut buffer = TickBuffer::new(config, ExecutionMode::Passive);
        buffer.add_tick_list(TickList::new(age(0), age(5), vec![]));
        for _ in 0..3 {
            buffer.consume();
        }
        assert_eq!(buffer.drain_requests().count(), 0);
        buffer.consume();
        let requests: Vec<_> = buffer.drain_requests().collect();
        assert_eq!(
            requests,
            vec![FlowRequest::FetchTicks {
                begin: age(5),
                end: age(15),
                exclude_ignorable: false
            }]
        );
    }

    #[test]
    fn active_mode_never_fetches() {
        let mut buffer = TickBuffer::new(TickBufferConfig::default(), ExecutionMode::Active);
        buffer.request_next_ticks();
        assert_eq!(buffer.drain_requests().count(), 0);
        buffer.request_non_ignorable_ticks(age(3), 1);
        assert_eq!(buffer.drain_requests().count(), 1);
    }

    #[test]
    fn consume_at_gap_returns_none() {
        let mut buffer = passive();
        assert_eq!(buffer.consume(), None);
        buffer.add_tick(empty(1));
        assert_eq!(buffer.consume(), None);
        assert_eq!(buffer.current_age(), age(0));
    }

    #[test]
    fn set_current_age_drops_older_data() {
        let mut buffer = passive();
        buffer.add_tick_list(TickList::new(age(0), age(10), vec![with(2, 1), with(7, 2)]));
        buffer.set_current_age(age(5));
        assert_eq!(spans(&buffer), vec![(5, 10)]);
        assert_eq!(buffer.ranges()[0].ticks.len(), 1);
        assert_eq!(buffer.nearest_absent_age(), age(10));

        buffer.set_current_age(age(20));
        assert!(buffer.ranges().is_empty());
        assert!(!buffer.has_next_tick());
    }

    #[test]
    fn set_current_age_counts_skipped_ages_as_known() {
        let mut buffer = passive();
        assert_eq!(buffer.known_latest_age(), Age::NULL);
        buffer.set_current_age(age(40));
        assert_eq!(buffer.known_latest_age(), age(39));

        buffer.add_tick(empty(45));
        buffer.set_current_age(age(42));
        assert_eq!(buffer.known_latest_age(), age(45));
    }

    #[test]
    fn execution_mode_switch_drops_data_once() {
        let mut buffer = passive();
        buffer.add_tick_list(TickList::new(age(0), age(10), vec![]));
        buffer.set_execution_mode(ExecutionMode::Passive);
        assert_eq!(spans(&buffer), vec![(0, 10)]);

        buffer.set_execution_mode(ExecutionMode::Active);
        assert!(buffer.ranges().is_empty());
        assert_eq!(buffer.current_age(), age(0));
        assert!(!buffer.has_next_tick());
    }

    #[test]
    fn next_tick_time_is_cached_and_corrected() {
        let mut buffer = passive();
        buffer.set_time_origin(1_000_000_000_000.0);
        buffer.add_tick(Tick::new(age(0)).with_events(vec![pd(1), Event::timestamp(500.0)]));
        buffer.add_tick(Tick::new(age(1)).with_events(vec![Event::timestamp(2_000_000_000_000.0)]));
        assert_eq!(buffer.read_next_tick_time(), Some(1_000_000_000_500.0));
        assert_eq!(buffer.read_next_tick_time(), Some(1_000_000_000_500.0));
        buffer.consume();
        assert_eq!(buffer.read_next_tick_time(), Some(2_000_000_000_000.0));
        buffer.consume();
        assert_eq!(buffer.read_next_tick_time(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(i64, Option<u8>),
        AddList(i64, i64, Vec<(i64, u8)>),
        Consume,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0i64..48, prop::option::of(any::<u8>())).prop_map(|(a, t)| Op::Add(a, t)),
            2 => (0i64..48, 1i64..12, prop::collection::vec((0i64..12, any::<u8>()), 0..4))
                .prop_map(|(s, len, ticks)| {
                    let ticks = ticks.into_iter().map(|(o, t)| (s + o % len, t)).collect();
                    Op::AddList(s, s + len, ticks)
                }),
            3 => Just(Op::Consume),
        ]
    }

    fn tick_of(age_value: i64, tag: Option<u8>) -> Tick {
        match tag {
            Some(tag) => with(age_value, tag),
            None => empty(age_value),
        }
    }

    proptest! {
        #[test]
        fn prop_log_matches_received_ages(ops in prop::collection::vec(op(), 1..80)) {
            let mut buffer = passive();
            // age -> payload tag of the first accepted writer
            let mut model: BTreeMap<i64, Option<u8>> = BTreeMap::new();
            let mut cursor = 0i64;

            for op in ops {
                match op {
                    Op::Add(a, tag) => {
                        if a >= cursor {
                            model.entry(a).or_insert(tag);
                        }
                        buffer.add_tick(tick_of(a, tag));
                    },
                    Op::AddList(s, e, ticks) => {
                        let mut incoming: BTreeMap<i64, u8> = BTreeMap::new();
                        for (a, t) in &ticks {
                            incoming.entry(*a).or_insert(*t);
                        }
                        for a in s.max(cursor)..e {
                            model.entry(a).or_insert(incoming.get(&a).copied());
                        }
                        let mut list: Vec<Tick> =
                            incoming.iter().map(|(a, t)| with(*a, *t)).collect();
                        list.sort_by_key(|tick| tick.age);
                        buffer.add_tick_list(TickList::new(age(s), age(e), list));
                    },
                    Op::Consume => {
                        let before = buffer.current_age();
                        let consumed = buffer.consume();
                        match model.remove(&cursor) {
                            Some(tag) => {
                                let tick = consumed.expect("known age must be consumable");
                                prop_assert_eq!(tick.age, before);
                                prop_assert_eq!(tick, tick_of(cursor, tag));
                                cursor += 1;
                            },
                            None => prop_assert!(consumed.is_none()),
                        }
                        prop_assert!(buffer.current_age() >= before);
                    },
                }

                prop_assert!(buffer.check_invariants().is_ok(), "{:?}", buffer.check_invariants());
                prop_assert_eq!(buffer.current_age().as_i64(), cursor);

                let covered: Vec<i64> = buffer
                    .ranges()
                    .iter()
                    .flat_map(|range| range.start.as_i64()..range.end.as_i64())
                    .collect();
                let expected: Vec<i64> = model.keys().copied().collect();
                prop_assert_eq!(covered, expected);

                let stored: Vec<(i64, u8)> = buffer
                    .ranges()
                    .iter()
                    .flat_map(|range| range.ticks.iter())
                    .map(|tick| match &tick.events.as_ref().unwrap()[0].kind {
                        EventKind::Message { data } => (tick.age.as_i64(), data[0]),
                        other => panic!("unexpected {other:?}"),
                    })
                    .collect();
                let expected_payloads: Vec<(i64, u8)> = model
                    .iter()
                    .filter_map(|(a, t)| t.map(|t| (*a, t)))
                    .collect();
                prop_assert_eq!(stored, expected_payloads);
            }
        }
    }
}
