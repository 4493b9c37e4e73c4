use crate::common::stubs::{Action, MemoryServer, StubSimulation};
use crate::common::{active_loop, build_loop, run_frames};
use lockstep_flow::prelude::*;

fn message(tag: u8) -> Event {
    Event::new(EventKind::Message { data: vec![tag] })
}

#[test]
fn every_frame_generates_publishes_and_applies_one_tick() {
    let server = MemoryServer::new();
    let mut game_loop = active_loop(&server, LoopConfig::default());

    run_frames(&mut game_loop, 5);
    assert_eq!(game_loop.simulation().age, 5);
    assert_eq!(game_loop.current_age(), Age::new(5));
    assert_eq!(server.latest_age(), Some(Age::new(4)));
    assert_eq!(game_loop.controller().generator().next_age(), Age::new(5));
}

#[test]
fn local_events_are_applied_but_never_published() {
    let server = MemoryServer::new();
    let mut game_loop = active_loop(&server, LoopConfig::default());

    game_loop.on_event(message(1).into_local());
    game_loop.on_event(message(2));
    run_frames(&mut game_loop, 1);

    let published = server.tick(Age::new(0)).unwrap();
    assert_eq!(published.events, Some(vec![message(2)]));
    assert_eq!(
        game_loop.simulation().events_at(0),
        Some(&[message(2), message(1).into_local()][..])
    );
    assert!(!game_loop
        .flow()
        .sent()
        .iter()
        .any(|request| matches!(request, FlowRequest::SendEvent(_))));
}

#[test]
fn stopped_loop_neither_generates_nor_steps() {
    let server = MemoryServer::new();
    let mut game_loop = active_loop(&server, LoopConfig::default());
    run_frames(&mut game_loop, 2);
    game_loop.stop();
    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().age, 2);
    assert_eq!(server.latest_age(), Some(Age::new(1)));

    game_loop.start();
    run_frames(&mut game_loop, 1);
    assert_eq!(game_loop.simulation().age, 3);
}

#[test]
fn snapshot_is_published_at_the_next_age() {
    let server = MemoryServer::new();
    let mut simulation = StubSimulation::new();
    simulation.at(2, Action::SaveSnapshot);
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Active,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    run_frames(&mut game_loop, 3);
    let start_points = server.start_points();
    assert_eq!(start_points.len(), 1);
    assert_eq!(start_points[0].frame, Age::new(3));
    match &start_points[0].data {
        StartPointData::Snapshot(snapshot) => assert_eq!(snapshot.next_entity_id, 7),
        StartPointData::Root { .. } => panic!("expected a snapshot"),
    }
}

#[test]
fn passive_snapshot_is_ignored() {
    let server = MemoryServer::new();
    server.store_ticks(5, |_| None);
    let mut simulation = StubSimulation::new();
    simulation.at(2, Action::SaveSnapshot);
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    run_frames(&mut game_loop, 2);
    assert_eq!(game_loop.simulation().age, 5);
    assert!(server.start_points().is_empty());
}

#[test]
fn manual_scene_only_advances_on_raised_ticks() {
    let server = MemoryServer::new();
    let mut simulation = StubSimulation::new();
    simulation.scene = SceneMode::new(SceneLocalMode::NonLocal, TickGenerationMode::Manual);
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Active,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().age, 0);
    assert_eq!(server.latest_age(), None);
}

#[test]
fn switching_roles_keeps_the_position() {
    let server = MemoryServer::new();
    let mut game_loop = active_loop(&server, LoopConfig::default());
    run_frames(&mut game_loop, 3);

    game_loop.set_execution_mode(ExecutionMode::Passive).unwrap();
    assert!(!game_loop.controller().is_generating());
    run_frames(&mut game_loop, 2);
    assert_eq!(game_loop.simulation().age, 3);

    game_loop.set_execution_mode(ExecutionMode::Active).unwrap();
    assert_eq!(game_loop.controller().generator().next_age(), Age::new(3));
    run_frames(&mut game_loop, 1);
    assert_eq!(game_loop.simulation().age, 4);
}
