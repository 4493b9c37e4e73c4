use std::cell::Cell;
use std::rc::Rc;

use crate::common::stubs::{MemoryServer, StubSimulation};
use crate::common::{active_loop, build_loop, passive_loop, run_frames, FRAME_MS};
use lockstep_flow::prelude::*;

fn replay_config() -> LoopConfig {
    LoopConfig {
        loop_mode: LoopMode::Replay,
        ..LoopConfig::default()
    }
}

/// Ten ticks one frame apart, stamped relative to the session origin.
fn stamped_server() -> MemoryServer {
    let server = MemoryServer::new();
    server.store_ticks(10, |age| Some(vec![Event::timestamp(20.0 * age.as_i64() as f64)]));
    server
}

#[test]
fn replay_catches_up_to_the_target_time() {
    let server = stamped_server();
    let mut game_loop = passive_loop(&server, replay_config(), TickBufferConfig::default());
    game_loop.reset(StartPoint::root(0, 1_000.0)).unwrap();

    let target = Rc::new(Cell::new(1_100.0));
    let func_target = target.clone();
    game_loop.set_target_time_func(Some(Box::new(move || func_target.get())));
    let reached = Rc::new(Cell::new(Vec::new()));
    let reached_by_signal = reached.clone();
    game_loop.target_time_reached_mut().subscribe(move |time: &f64| {
        let mut times = reached_by_signal.take();
        times.push(*time);
        reached_by_signal.set(times);
    });

    // Relative stamps are shifted by the root's timestamp.
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 6);
    assert_eq!(
        game_loop.simulation().step_times,
        vec![1_000.0, 1_020.0, 1_040.0, 1_060.0, 1_080.0, 1_100.0]
    );
    assert_eq!(game_loop.current_time(), 1_100.0);
    assert_eq!(reached.take(), vec![1_100.0]);

    // Reaching the same target again is not reported twice.
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 6);
    assert!(reached.take().is_empty());

    target.set(1_160.0);
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 9);
    assert_eq!(reached.take(), vec![1_160.0]);
}

#[test]
fn end_of_log_moves_time_to_the_target() {
    let server = stamped_server();
    let mut game_loop = passive_loop(&server, replay_config(), TickBufferConfig::default());
    game_loop.reset(StartPoint::root(0, 1_000.0)).unwrap();
    game_loop.set_target_time_func(Some(Box::new(|| 1_300.0)));

    // All ten ticks are due; the fetch past the end finds nothing.
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 10);
    assert!(game_loop.is_waiting_next_tick());

    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.current_time(), 1_300.0);
    assert_eq!(game_loop.simulation().age, 10);
}

#[test]
fn replay_stops_at_the_target_age() {
    let server = MemoryServer::new();
    server.store_ticks(10, |_| None);
    let config = LoopConfig {
        target_age: Some(Age::new(5)),
        ..replay_config()
    };
    let mut game_loop = passive_loop(&server, config, TickBufferConfig::default());

    run_frames(&mut game_loop, 2);
    assert_eq!(game_loop.simulation().age, 5);
    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().age, 5);

    // A nearby target is approached one tick per frame.
    game_loop.set_target_age(Some(Age::new(8)));
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 6);
    run_frames(&mut game_loop, 2);
    assert_eq!(game_loop.simulation().age, 8);
    run_frames(&mut game_loop, 2);
    assert_eq!(game_loop.simulation().age, 8);
}

#[test]
fn replay_without_target_holds_position() {
    let server = MemoryServer::new();
    server.store_ticks(10, |_| None);
    let mut game_loop = passive_loop(&server, replay_config(), TickBufferConfig::default());

    run_frames(&mut game_loop, 5);
    assert_eq!(game_loop.simulation().age, 0);
    assert!(!game_loop.is_skipping());
}

#[test]
fn playback_rate_scales_frames_per_callback() {
    let server = MemoryServer::new();
    let mut game_loop = active_loop(&server, LoopConfig::default());
    game_loop.set_playback_rate(2.0).unwrap();

    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 2);
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 4);
}

#[test]
fn timed_replay_far_behind_jumps_by_timestamp() {
    let server = MemoryServer::new();
    server.store_ticks(500, |age| Some(vec![Event::timestamp(20.0 * age.as_i64() as f64)]));
    server.put_start_point(StartPoint {
        frame: Age::new(400),
        timestamp: 8_000.0,
        data: StartPointData::Snapshot(SnapshotData {
            random_generator: vec![],
            next_entity_id: 0,
            snapshot: vec![],
        }),
    });
    let config = LoopConfig {
        jump_try_threshold: 50,
        jump_ignore_threshold: 20,
        ..replay_config()
    };
    let mut game_loop = passive_loop(&server, config, TickBufferConfig::default());
    game_loop.set_target_time_func(Some(Box::new(|| 9_000.0)));

    // 450 frames behind: ask for the latest start point at or before the target time.
    game_loop.on_looper_call(FRAME_MS);
    assert!(game_loop.is_awaiting_start_point());
    assert!(game_loop.flow().sent().iter().any(|request| matches!(
        request,
        FlowRequest::GetStartPoint { query: StartPointQuery::Timestamp(time) } if *time == 9_000.0
    )));
    assert_eq!(game_loop.simulation().age, 0);

    // Restored at 8000ms, then stepped tick by tick up to the target time.
    game_loop.on_looper_call(FRAME_MS);
    assert!(!game_loop.is_awaiting_start_point());
    assert_eq!(game_loop.simulation().restored, vec![Age::new(400)]);
    assert_eq!(game_loop.simulation().age, 451);
    assert_eq!(game_loop.current_time(), 9_000.0);
}

#[test]
fn timed_replay_at_the_target_still_interpolates() {
    let server = stamped_server();
    let mut simulation = StubSimulation::new();
    simulation.scene =
        SceneMode::new(SceneLocalMode::InterpolateLocal, TickGenerationMode::ByClock);
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        replay_config(),
        TickBufferConfig::default(),
    );
    game_loop.reset(StartPoint::root(0, 1_000.0)).unwrap();
    game_loop.set_target_time_func(Some(Box::new(|| 1_000.0)));

    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().local_steps, 3);
    assert_eq!(game_loop.simulation().age, 0);
}
