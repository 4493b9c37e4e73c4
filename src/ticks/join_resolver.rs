//! Ordered resolution of Join/Leave events whose storage values are fetched asynchronously.

use std::collections::VecDeque;

use crate::error::FlowError;
use crate::event::{Event, EventKind};
use crate::flow::messages::{FlowRequest, StorageTicket};
use crate::storage::{StorageEntry, StorageKey};
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};

#[derive(Debug)]
struct JoinLeaveRequest {
    sequence: u64,
    event: Event,
    resolved: bool,
}

/// A FIFO of Join/Leave events, released strictly in submission order.
///
/// A Leave, or a Join while no storage keys are configured, resolves immediately. A Join with
/// configured keys issues a storage fetch and resolves when its response arrives, carrying the
/// fetched values in [`EventKind::Join::storage`].
#[derive(Debug, Default)]
pub struct JoinResolver {
    requests: VecDeque<JoinLeaveRequest>,
    keys: Option<Vec<StorageKey>>,
    next_sequence: u64,
    outbox: VecDeque<FlowRequest>,
    errors: VecDeque<FlowError>,
}

impl JoinResolver {
    /// Creates an empty resolver with no join keys configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the keys every future Join resolves. `None` or an empty list disables fetching.
    pub fn request_values_for_join(&mut self, keys: Option<Vec<StorageKey>>) {
        self.keys = keys.filter(|keys| !keys.is_empty());
    }

    /// Enqueues a Join or Leave event.
    pub fn request(&mut self, event: Event) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let keys = match (&event.kind, &self.keys) {
            (EventKind::Join { .. }, Some(keys)) => Some(
                keys.iter()
                    .map(|key| key.resolve_for(event.player_id.as_ref()))
                    .collect::<Vec<_>>(),
            ),
            (EventKind::Join { .. } | EventKind::Leave, _) => None,
            _ => {
                crate::report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::JoinResolution,
                    "non join/leave event {:?} passed to the join resolver",
                    event.code()
                );
                None
            },
        };

        let resolved = keys.is_none();
        if let Some(keys) = keys {
            self.outbox.push_back(FlowRequest::GetStorage {
                ticket: StorageTicket::Join { sequence },
                keys,
            });
        }
        self.requests.push_back(JoinLeaveRequest {
            sequence,
            event,
            resolved,
        });
    }

    /// Completes the fetch for the request with `sequence`. Unknown sequences are ignored.
    ///
    /// On error the Join is released without storage values and the error is queued for
    /// [`drain_errors`](Self::drain_errors).
    pub fn on_storage(&mut self, sequence: u64, result: Result<Vec<StorageEntry>, FlowError>) {
        let Some(request) = self
            .requests
            .iter_mut()
            .find(|request| request.sequence == sequence && !request.resolved)
        else {
            tracing::trace!(sequence, "storage response for unknown join request");
            return;
        };
        match result {
            Ok(values) => {
                if let EventKind::Join { storage, .. } = &mut request.event.kind {
                    *storage = Some(values);
                }
            },
            Err(err) => {
                crate::report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::JoinResolution,
                    "storage fetch for join {} failed: {}",
                    sequence,
                    err
                );
                self.errors.push_back(err);
            },
        }
        request.resolved = true;
    }

    /// Removes and returns the longest resolved prefix, or `None` if the head is unresolved.
    pub fn read_resolved(&mut self) -> Option<Vec<Event>> {
        let count = self
            .requests
            .iter()
            .take_while(|request| request.resolved)
            .count();
        if count == 0 {
            return None;
        }
        Some(
            self.requests
                .drain(..count)
                .map(|request| request.event)
                .collect(),
        )
    }

    /// Number of queued requests, resolved or not.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.requests.len()
    }

    /// Drains requests for the remote channel.
    pub fn drain_requests(&mut self) -> std::collections::vec_deque::Drain<'_, FlowRequest> {
        self.outbox.drain(..)
    }

    /// Drains fetch failures.
    pub fn drain_errors(&mut self) -> std::collections::vec_deque::Drain<'_, FlowError> {
        self.errors.drain(..)
    }
}

impl InvariantChecker for JoinResolver {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut previous: Option<u64> = None;
        for request in &self.requests {
            if previous.is_some_and(|prev| prev >= request.sequence) {
                return Err(InvariantViolation::new(
                    "JoinResolver",
                    "requests out of submission order",
                )
                .with_details(format!("sequence {}", request.sequence)));
            }
            if !request.event.is_join_or_leave() && !request.resolved {
                return Err(InvariantViolation::new(
                    "JoinResolver",
                    "unresolved request for a non join/leave event",
                ));
            }
            previous = Some(request.sequence);
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
    use crate::storage::{StorageRegion, StorageValue};
    use crate::PlayerId;
    use proptest::prelude::*;

    fn join(name: &str) -> Event {
        Event::join(PlayerId::from(name), None)
    }

    fn leave(name: &str) -> Event {
        Event::leave(PlayerId::from(name))
    }

    fn key() -> StorageKey {
        StorageKey::new(StorageRegion::Values, "coins").for_user(StorageKey::JOINED_PLAYER)
    }

    fn sequences(resolver: &mut JoinResolver) -> Vec<u64> {
        resolver
            .drain_requests()
            .map(|request| match request {
                FlowRequest::GetStorage {
                    ticket: StorageTicket::Join { sequence },
                    ..
                } => sequence,
                other => panic!("unexpected request {other:?}"),
            })
            .collect()
    }

    #[test]
    fn resolves_immediately_without_keys() {
        let mut resolver = JoinResolver::new();
        resolver.request(join("a"));
        resolver.request(leave("b"));
        assert_eq!(resolver.drain_requests().count(), 0);
        assert_eq!(resolver.read_resolved(), Some(vec![join("a"), leave("b")]));
        assert!(resolver.read_resolved().is_none());
    }

    #[test]
    fn join_with_keys_fetches_with_player_substitution() {
        let mut resolver = JoinResolver::new();
        resolver.request_values_for_join(Some(vec![key()]));
        resolver.request(join("alice"));

        let requests: Vec<_> = resolver.drain_requests().collect();
        let FlowRequest::GetStorage { keys, .. } = &requests[0] else {
            panic!("expected GetStorage");
        };
        assert_eq!(keys[0].user_id.as_deref(), Some("alice"));
        assert!(resolver.read_resolved().is_none());
    }

    #[test]
    fn completed_join_carries_storage() {
        let mut resolver = JoinResolver::new();
        resolver.request_values_for_join(Some(vec![key()]));
        resolver.request(join("a"));
        let seq = sequences(&mut resolver)[0];
        let entry = StorageEntry {
            key: key(),
            values: vec![StorageValue::Number(3.0)],
        };
        resolver.on_storage(seq, Ok(vec![entry.clone()]));

        let resolved = resolver.read_resolved().unwrap();
        assert_eq!(
            resolved[0].kind,
            EventKind::Join {
                name: None,
                storage: Some(vec![entry])
            }
        );
    }

    #[test]
    fn leave_behind_unresolved_join_waits() {
        let mut resolver = JoinResolver::new();
        resolver.request_values_for_join(Some(vec![key()]));
        resolver.request(join("a"));
        resolver.request(leave("a"));
        assert!(resolver.read_resolved().is_none());

        let seq = sequences(&mut resolver)[0];
        resolver.on_storage(seq, Ok(vec![]));
        let resolved = resolver.read_resolved().unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(matches!(resolved[1].kind, EventKind::Leave));
    }

    #[test]
    fn failed_fetch_releases_join_without_values() {
        let mut resolver = JoinResolver::new();
        resolver.request_values_for_join(Some(vec![key()]));
        resolver.request(join("a"));
        let seq = sequences(&mut resolver)[0];
        resolver.on_storage(
            seq,
            Err(FlowError::FetchFailed {
                resource: "storage",
                context: "offline".into(),
            }),
        );
        assert_eq!(resolver.drain_errors().count(), 1);
        assert_eq!(resolver.read_resolved(), Some(vec![join("a")]));
    }

    #[test]
    fn unknown_sequence_is_ignored() {
        let mut resolver = JoinResolver::new();
        resolver.on_storage(42, Ok(vec![]));
        assert!(resolver.read_resolved().is_none());
        assert!(resolver.check_invariants().is_ok());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join,
        Leave,
        Complete(usize),
        Read,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Join),
            Just(Op::Leave),
            (0usize..16).prop_map(Op::Complete),
            Just(Op::Read),
        ]
    }

    proptest! {
        #[test]
        fn prop_resolved_in_submission_order(ops in prop::collection::vec(op(), 1..64)) {
            let mut resolver = JoinResolver::new();
            resolver.request_values_for_join(Some(vec![key()]));
            let mut submitted = 0u32;
            let mut outstanding: Vec<u64> = Vec::new();
            let mut released: Vec<String> = Vec::new();

            for op in ops {
                match op {
                    Op::Join | Op::Leave => {
                        let name = submitted.to_string();
                        submitted += 1;
                        let request =
                            if matches!(op, Op::Join) { join(&name) } else { leave(&name) };
                        resolver.request(request);
                        outstanding.extend(sequences(&mut resolver));
                    },
                    Op::Complete(i) => {
                        if !outstanding.is_empty() {
                            let seq = outstanding.remove(i % outstanding.len());
                            resolver.on_storage(seq, Ok(vec![]));
                        }
                    },
                    Op::Read => {
                        for event in resolver.read_resolved().unwrap_or_default() {
                            released.push(event.player_id.unwrap().as_str().to_owned());
                        }
                    },
                }
                prop_assert!(resolver.check_invariants().is_ok());
            }

            let expected: Vec<String> = (0..released.len()).map(|i| i.to_string()).collect();
            prop_assert_eq!(released, expected);
        }
    }
}
