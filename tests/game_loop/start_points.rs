use std::cell::RefCell;
use std::rc::Rc;

use crate::common::stubs::{MemoryServer, StubSimulation};
use crate::common::FRAME_MS;
use crate::common::{build_loop, passive_loop, run_frames};
use lockstep_flow::prelude::*;

fn snapshot_at(frame: i64, timestamp: f64) -> StartPoint {
    StartPoint {
        frame: Age::new(frame),
        timestamp,
        data: StartPointData::Snapshot(SnapshotData {
            random_generator: vec![],
            next_entity_id: 0,
            snapshot: vec![],
        }),
    }
}

fn jumpy_config() -> LoopConfig {
    LoopConfig {
        jump_try_threshold: 50,
        jump_ignore_threshold: 20,
        ..LoopConfig::default()
    }
}

#[test]
fn start_point_just_behind_the_cursor_is_discarded() {
    let server = MemoryServer::new();
    server.store_ticks(100, |_| None);
    server.put_start_point(snapshot_at(90, 1_800.0));
    let mut game_loop = passive_loop(
        &server,
        jumpy_config(),
        TickBufferConfig {
            prefetch_threshold: 5,
            fetch_batch_size: 200,
        },
    );

    // Fetch, then catch up through all 100 ticks while asking for a start point.
    game_loop.on_looper_call(FRAME_MS);
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.current_age(), Age::new(100));
    assert!(game_loop.is_awaiting_start_point());

    game_loop.on_looper_call(FRAME_MS);
    assert!(!game_loop.is_awaiting_start_point());
    assert_eq!(game_loop.current_age(), Age::new(100));
    assert_eq!(game_loop.simulation().age, 100);
    assert!(game_loop.simulation().restored.is_empty());
}

#[test]
fn far_behind_loop_jumps_to_the_start_point() {
    let server = MemoryServer::new();
    server.store_ticks(500, |_| None);
    server.put_start_point(snapshot_at(400, 8_000.0));
    let mut game_loop = passive_loop(
        &server,
        jumpy_config(),
        TickBufferConfig {
            prefetch_threshold: 5,
            fetch_batch_size: 10,
        },
    );
    server.publish(Tick::new(Age::new(500)));

    game_loop.on_looper_call(FRAME_MS);
    assert!(game_loop.is_awaiting_start_point());
    assert_eq!(game_loop.simulation().age, 0);

    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().restored, vec![Age::new(400)]);
    assert_eq!(game_loop.current_age(), Age::new(400));
    assert_eq!(game_loop.current_time(), 8_000.0);

    // The repeated request for the same target finds nothing worth jumping to.
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().restored, vec![Age::new(400)]);
    assert_eq!(game_loop.simulation().age, 410);
    assert!(game_loop.is_skipping());
}

#[test]
fn missing_start_point_leaves_the_position_alone() {
    let server = MemoryServer::new();
    server.store_ticks(200, |_| None);
    let mut game_loop = passive_loop(&server, jumpy_config(), TickBufferConfig::default());
    server.publish(Tick::new(Age::new(200)));

    game_loop.on_looper_call(FRAME_MS);
    assert!(game_loop.is_awaiting_start_point());

    // No start point comes back, so the loop catches up tick by tick instead.
    game_loop.on_looper_call(FRAME_MS);
    assert!(!game_loop.is_awaiting_start_point());
    assert!(game_loop.simulation().restored.is_empty());
    assert_eq!(game_loop.simulation().age, 100);
    assert!(game_loop.is_skipping());
}

#[test]
fn reset_to_root_restarts_from_age_zero() {
    let server = MemoryServer::new();
    server.store_ticks(3, |_| None);
    let mut game_loop = passive_loop(&server, LoopConfig::default(), TickBufferConfig::default());
    game_loop.on_looper_call(FRAME_MS);
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 3);

    game_loop.reset(StartPoint::root(42, 5_000.0)).unwrap();
    assert_eq!(game_loop.current_age(), Age::new(0));
    assert_eq!(game_loop.current_time(), 5_000.0);
    assert_eq!(game_loop.simulation().restored, vec![Age::new(0)]);

    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 3);
}

#[test]
fn failed_restore_keeps_the_position() {
    let server = MemoryServer::new();
    server.store_ticks(500, |_| None);
    server.put_start_point(snapshot_at(400, 8_000.0));
    let mut simulation = StubSimulation::new();
    simulation.fail_restore = true;
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        jumpy_config(),
        TickBufferConfig {
            prefetch_threshold: 5,
            fetch_batch_size: 10,
        },
    );
    let errors = Rc::new(RefCell::new(Vec::new()));
    let reported = errors.clone();
    game_loop
        .error_mut()
        .subscribe(move |err: &FlowError| reported.borrow_mut().push(err.clone()));
    server.publish(Tick::new(Age::new(500)));

    game_loop.on_looper_call(FRAME_MS);
    assert!(game_loop.is_awaiting_start_point());

    // The jump is abandoned and the loop keeps stepping from where it was.
    game_loop.on_looper_call(FRAME_MS);
    assert!(!game_loop.is_awaiting_start_point());
    assert!(game_loop.simulation().restored.is_empty());
    assert_eq!(game_loop.current_age(), Age::new(10));
    assert_eq!(game_loop.simulation().age, 10);
    assert_eq!(
        *errors.borrow(),
        vec![FlowError::RestoreFailed {
            age: Age::new(400),
            context: "corrupt snapshot".into(),
        }]
    );
}

#[test]
fn reset_past_the_known_log_waits_instead_of_jumping_back() {
    let server = MemoryServer::new();
    server.store_ticks(40, |_| None);
    server.put_start_point(StartPoint::root(7, 0.0));
    server.put_start_point(snapshot_at(40, 800.0));
    let mut game_loop = passive_loop(&server, LoopConfig::default(), TickBufferConfig::default());

    game_loop.reset(snapshot_at(40, 800.0)).unwrap();
    run_frames(&mut game_loop, 3);
    assert_eq!(game_loop.simulation().restored, vec![Age::new(40)]);
    assert_eq!(game_loop.current_age(), Age::new(40));
    assert!(game_loop.is_waiting_next_tick());
    assert!(!game_loop.is_awaiting_start_point());
    assert!(!game_loop
        .flow()
        .sent()
        .iter()
        .any(|request| matches!(request, FlowRequest::GetStartPoint { .. })));

    server.publish(Tick::new(Age::new(40)));
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 41);
    assert_eq!(game_loop.simulation().restored, vec![Age::new(40)]);
}
