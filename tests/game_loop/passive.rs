use std::cell::RefCell;
use std::rc::Rc;

use crate::common::stubs::{MemoryServer, StubSimulation};
use crate::common::{build_loop, passive_loop, run_frames, FRAME_MS};
use lockstep_flow::prelude::*;

fn message(tag: u8) -> Event {
    Event::new(EventKind::Message { data: vec![tag] })
}

#[test]
fn empty_log_waits_and_polls_once_per_interval() {
    let server = MemoryServer::new();
    let config = LoopConfig {
        polling_interval: web_time::Duration::from_millis(90),
        ..LoopConfig::default()
    };
    let mut game_loop = passive_loop(&server, config, TickBufferConfig::default());

    game_loop.on_looper_call(FRAME_MS);
    assert!(game_loop.is_waiting_next_tick());
    assert!(!game_loop.controller().has_next_tick());
    assert_eq!(game_loop.flow_mut().take_fetch_count(), 1);

    // 20, 40, 60 and 80ms of waiting stay below the interval.
    run_frames(&mut game_loop, 4);
    assert_eq!(game_loop.flow_mut().take_fetch_count(), 0);
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.flow_mut().take_fetch_count(), 1);
    assert_eq!(game_loop.simulation().age, 0);

    server.publish(Tick::new(Age::new(0)).with_events(vec![message(1)]));
    game_loop.on_looper_call(FRAME_MS);
    assert!(!game_loop.is_waiting_next_tick());
    assert_eq!(game_loop.simulation().age, 1);
    assert_eq!(game_loop.simulation().events_at(0), Some(&[message(1)][..]));
}

#[test]
fn fetched_history_is_replayed_in_order() {
    let server = MemoryServer::new();
    server.store_ticks(5, |age| (age == Age::new(2)).then(|| vec![message(2)]));
    let mut game_loop = passive_loop(&server, LoopConfig::default(), TickBufferConfig::default());

    game_loop.on_looper_call(FRAME_MS);
    // A duplicate of an age the fetch also covers.
    game_loop
        .flow_mut()
        .deliver(FlowMessage::Tick(Tick::new(Age::new(2))));
    game_loop.on_looper_call(FRAME_MS);

    let simulation = game_loop.simulation();
    assert_eq!(simulation.age, 5);
    let ages: Vec<Age> = simulation.applied.iter().map(|(age, _)| *age).collect();
    assert_eq!(ages, (0..5).map(Age::new).collect::<Vec<_>>());
    assert_eq!(simulation.events_at(2), Some(&[message(2)][..]));
    assert_eq!(simulation.events_at(3), Some(&[][..]));
}

#[test]
fn passive_replays_what_active_generates() {
    let server = MemoryServer::new();
    let mut active = build_loop(
        &server,
        StubSimulation::new(),
        ExecutionMode::Active,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );
    let mut passive = passive_loop(&server, LoopConfig::default(), TickBufferConfig::default());

    passive.on_event(message(7));
    passive.on_looper_call(FRAME_MS);
    assert!(passive.flow().sent().iter().any(|request| {
        matches!(request, FlowRequest::SendEvent(event) if event.kind == message(7).kind)
    }));

    active.on_looper_call(FRAME_MS);
    passive.on_looper_call(FRAME_MS);

    assert_eq!(active.simulation().age, 1);
    assert_eq!(passive.simulation().age, 1);
    assert_eq!(active.simulation().applied, passive.simulation().applied);
    let events = passive.simulation().events_at(0).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, message(7).kind);
}

#[test]
fn local_events_never_reach_the_flow() {
    let server = MemoryServer::new();
    let mut game_loop = passive_loop(&server, LoopConfig::default(), TickBufferConfig::default());

    game_loop.on_event(message(1).into_local());
    run_frames(&mut game_loop, 3);
    assert!(!game_loop
        .flow()
        .sent()
        .iter()
        .any(|request| matches!(request, FlowRequest::SendEvent(_))));

    game_loop.on_event(message(2));
    game_loop.on_looper_call(FRAME_MS);
    let sent: Vec<Event> = game_loop
        .flow_mut()
        .take_sent()
        .into_iter()
        .filter_map(|request| match request {
            FlowRequest::SendEvent(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(sent, vec![message(2).with_priority(0)]);
}

#[test]
fn interpolating_scene_steps_locally_while_waiting() {
    let server = MemoryServer::new();
    let mut simulation = StubSimulation::new();
    simulation.scene =
        SceneMode::new(SceneLocalMode::InterpolateLocal, TickGenerationMode::ByClock);
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().local_steps, 3);
    assert_eq!(game_loop.simulation().age, 0);
}

#[test]
fn full_local_scene_ignores_the_log() {
    let server = MemoryServer::new();
    server.store_ticks(10, |_| None);
    let mut simulation = StubSimulation::new();
    simulation.scene = SceneMode::new(SceneLocalMode::FullLocal, TickGenerationMode::ByClock);
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().local_steps, 3);
    assert_eq!(game_loop.simulation().age, 0);
    assert_eq!(game_loop.flow_mut().take_fetch_count(), 0);
}

#[test]
fn failed_fetch_is_reported_and_the_loop_keeps_polling() {
    let server = MemoryServer::new();
    let mut game_loop = passive_loop(&server, LoopConfig::default(), TickBufferConfig::default());
    let errors = Rc::new(RefCell::new(Vec::new()));
    let reported = errors.clone();
    game_loop
        .error_mut()
        .subscribe(move |err: &FlowError| reported.borrow_mut().push(err.clone()));
    let failure = FlowError::FetchFailed {
        resource: "ticks",
        context: "connection reset".into(),
    };

    game_loop.on_looper_call(FRAME_MS);
    assert!(errors.borrow().is_empty());
    game_loop.flow_mut().deliver(FlowMessage::TickList {
        begin: Age::new(0),
        end: Age::new(600),
        result: Err(failure.clone()),
    });
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(*errors.borrow(), vec![failure]);
    assert!(game_loop.is_waiting_next_tick());

    server.publish(Tick::new(Age::new(0)));
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 1);
    assert_eq!(errors.borrow().len(), 1);
}
