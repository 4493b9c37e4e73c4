use crate::common::stubs::{Action, MemoryServer, StubSimulation};
use crate::common::{build_loop, FRAME_MS};
use lockstep_flow::prelude::*;
use lockstep_flow::{StorageEntry, StoragePutOption};

fn plays() -> StorageKey {
    StorageKey::new(StorageRegion::Counts, "plays")
}

#[test]
fn active_load_is_bound_to_the_next_generated_tick() {
    let server = MemoryServer::new();
    server.put_storage(plays(), StorageValue::Number(5.0));
    let mut simulation = StubSimulation::new();
    simulation.at(1, Action::LoadStorage(vec![plays()]));
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Active,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    game_loop.on_looper_call(FRAME_MS);
    game_loop.on_looper_call(FRAME_MS);
    assert!(game_loop.controller().generator().is_awaiting_storage());
    assert!(game_loop.simulation().loaded.is_empty());

    game_loop.on_looper_call(FRAME_MS);
    let simulation = game_loop.simulation();
    assert_eq!(simulation.loaded.len(), 1);
    let loaded = &simulation.loaded[0];
    assert_eq!(loaded.age, Age::new(2));
    assert_eq!(
        loaded.values.get(&plays()),
        Some(&[StorageValue::Number(5.0)][..])
    );
    assert_eq!(simulation.age, 3);

    // Passive instances replaying the log see the values in the carrying tick.
    let published = server.tick(Age::new(2)).unwrap();
    assert_eq!(
        published.storage,
        Some(vec![StorageEntry {
            key: plays(),
            values: vec![StorageValue::Number(5.0)],
        }])
    );
}

#[test]
fn active_put_reaches_the_server() {
    let server = MemoryServer::new();
    server.put_storage(plays(), StorageValue::Number(4.0));
    let mut simulation = StubSimulation::new();
    simulation.at(
        0,
        Action::PutStorage(plays(), StorageValue::Number(3.0), StoragePutOption::Increment),
    );
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Active,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(server.storage(&plays()), Some(StorageValue::Number(7.0)));
}

#[test]
fn passive_put_is_ignored() {
    let server = MemoryServer::new();
    server.store_ticks(3, |_| None);
    server.put_storage(plays(), StorageValue::Number(4.0));
    let mut simulation = StubSimulation::new();
    simulation.at(
        0,
        Action::PutStorage(plays(), StorageValue::Number(3.0), StoragePutOption::Overwrite),
    );
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    game_loop.on_looper_call(FRAME_MS);
    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().age, 3);
    assert_eq!(server.storage(&plays()), Some(StorageValue::Number(4.0)));
    assert!(!game_loop
        .flow()
        .sent()
        .iter()
        .any(|request| matches!(request, FlowRequest::PutStorage { .. })));
}

#[test]
fn passive_load_reads_the_tick_at_the_cursor() {
    let server = MemoryServer::new();
    server.store_ticks(4, |_| None);
    server.store_tick(Tick::new(Age::new(2)).with_storage(vec![StorageEntry {
        key: plays(),
        values: vec![StorageValue::Number(11.0)],
    }]));
    let mut simulation = StubSimulation::new();
    simulation.at(1, Action::LoadStorage(vec![plays()]));
    let mut game_loop = build_loop(
        &server,
        simulation,
        ExecutionMode::Passive,
        LoopConfig::default(),
        TickBufferConfig::default(),
    );

    game_loop.on_looper_call(FRAME_MS);
    game_loop.on_looper_call(FRAME_MS);

    // The values were already in the log, so the load completes within the same step.
    let simulation = game_loop.simulation();
    assert_eq!(simulation.loaded_at, vec![2]);
    assert_eq!(simulation.loaded[0].age, Age::new(2));
    assert_eq!(
        simulation.loaded[0].values.get(&plays()),
        Some(&[StorageValue::Number(11.0)][..])
    );
    assert!(simulation.errors.is_empty());

    game_loop.on_looper_call(FRAME_MS);
    assert_eq!(game_loop.simulation().loaded.len(), 1);
}
