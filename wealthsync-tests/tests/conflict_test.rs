/// Conflict detection and resolution flows

use serde_json::{json, Value};
use std::sync::Arc;
use wealthsync_core::{
    ConflictAnalysis, EntityKind, Error, FieldMergeAnalyzer, MemoryStore, OperationType,
    ResolutionChoice, SuggestedResolution, SyncEngine, SyncEngineBuilder, SyncEvent,
};
use wealthsync_test_utils::{drain_events, remote_op, ManualAnalyzer, ScriptedAnalyzer};

fn engine() -> SyncEngine {
    SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .build()
}

/// Advance the local clock for an entity by applying clean remote
/// operations from a background device.
fn seed_clock(engine: &SyncEngine, entity: EntityKind, entity_id: &str, up_to: u64) {
    for v in 1..=up_to {
        engine.handle_remote_update(remote_op(entity, entity_id, v, "seed", json!({"v": v})));
    }
    assert_eq!(engine.entity_version(entity_id), Some(up_to));
}

#[tokio::test]
async fn test_stale_remote_auto_resolves_remote_wins() {
    let engine = engine();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Account, "acc1", 3);
    drain_events(&mut events);

    // Same version, remote edit is newer.
    let mut op = remote_op(EntityKind::Account, "acc1", 3, "device-a", json!({"balance": 99}));
    op.timestamp += 10_000;
    engine.handle_remote_update(op);

    let seen = drain_events(&mut events);
    let detected = seen
        .iter()
        .position(|e| matches!(e, SyncEvent::ConflictDetected { .. }));
    let resolved = seen.iter().position(
        |e| matches!(e, SyncEvent::ConflictAutoResolved { resolution, .. } if *resolution == ResolutionChoice::Remote),
    );
    // Detection is always announced before the automatic resolution.
    assert!(detected.unwrap() < resolved.unwrap());
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::RemoteUpdate { entity_id, .. } if entity_id == "acc1")));
    assert!(engine.get_conflicts().is_empty());
}

#[tokio::test]
async fn test_stale_remote_auto_resolves_local_wins() {
    let engine = engine();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Account, "acc1", 3);

    // A genuine local edit still awaiting acknowledgement.
    engine
        .queue_operation(
            OperationType::Update,
            EntityKind::Account,
            "acc1",
            json!({"balance": 50}),
        )
        .unwrap();
    drain_events(&mut events);

    // Remote edit at the disputed version is older than the local edit,
    // so the local side is re-enqueued to fight again.
    let mut op = remote_op(EntityKind::Account, "acc1", 3, "device-a", json!({"balance": 99}));
    op.timestamp -= 10_000;
    engine.handle_remote_update(op);

    let seen = drain_events(&mut events);
    assert!(seen.iter().any(
        |e| matches!(e, SyncEvent::ConflictAutoResolved { resolution, .. } if *resolution == ResolutionChoice::Local),
    ));
    assert!(engine.get_conflicts().is_empty());

    // The original edit plus its re-minted successor, minted past the
    // disputed version.
    assert_eq!(engine.get_status().pending_operations, 2);
    let requeued = engine
        .queue_operation(OperationType::Update, EntityKind::Account, "acc1", json!({}))
        .unwrap();
    assert_eq!(requeued.version, 6);
}

#[tokio::test]
async fn test_conflict_without_local_intent_prefers_remote() {
    let engine = engine();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Account, "acc1", 1);
    drain_events(&mut events);

    // No queued local edit; the remote push carries a realistic,
    // slightly old creation time.
    let mut op = remote_op(EntityKind::Account, "acc1", 1, "device-a", json!({"balance": 99}));
    op.timestamp -= 2_000;
    engine.handle_remote_update(op);

    // With nothing local to defend, the remote side wins; no fabricated
    // operation is queued for delivery.
    assert_eq!(engine.get_status().pending_operations, 0);
    assert!(engine.get_conflicts().is_empty());
    let seen = drain_events(&mut events);
    assert!(seen.iter().any(
        |e| matches!(e, SyncEvent::ConflictAutoResolved { resolution, .. } if *resolution == ResolutionChoice::Remote),
    ));
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::RemoteUpdate { data, .. } if data == &json!({"balance": 99}))));
}

#[tokio::test]
async fn test_manual_conflict_surfaces_until_resolved() {
    let engine = SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(ManualAnalyzer))
        .build();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Budget, "bud1", 1);
    drain_events(&mut events);

    engine.handle_remote_update(remote_op(
        EntityKind::Budget,
        "bud1",
        1,
        "device-a",
        json!({"limit": 500}),
    ));

    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);
    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::ConflictDetected { .. })));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, SyncEvent::ConflictAutoResolved { .. })));

    engine
        .resolve_conflict(&conflicts[0].id, ResolutionChoice::Remote, None)
        .unwrap();
    assert!(engine.get_conflicts().is_empty());
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::RemoteUpdate { entity_id, .. } if entity_id == "bud1")));
}

#[tokio::test]
async fn test_resolve_local_requeues_local_operation() {
    let engine = SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(ManualAnalyzer))
        .build();
    seed_clock(&engine, EntityKind::Goal, "g1", 2);
    engine
        .queue_operation(
            OperationType::Update,
            EntityKind::Goal,
            "g1",
            json!({"target": 1000}),
        )
        .unwrap();

    engine.handle_remote_update(remote_op(EntityKind::Goal, "g1", 2, "device-a", json!({})));
    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);

    engine
        .resolve_conflict(&conflicts[0].id, ResolutionChoice::Local, None)
        .unwrap();
    assert!(engine.get_conflicts().is_empty());
    assert_eq!(engine.get_status().pending_operations, 2);
}

#[tokio::test]
async fn test_resolve_local_without_local_intent_is_rejected() {
    let engine = SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(ManualAnalyzer))
        .build();
    seed_clock(&engine, EntityKind::Budget, "bud1", 1);

    engine.handle_remote_update(remote_op(
        EntityKind::Budget,
        "bud1",
        1,
        "device-a",
        json!({"limit": 5}),
    ));
    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);

    // There is no local edit behind this conflict, so there is nothing
    // to re-enqueue.
    let result = engine.resolve_conflict(&conflicts[0].id, ResolutionChoice::Local, None);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(engine.get_conflicts().len(), 1);
    assert_eq!(engine.get_status().pending_operations, 0);
}

#[tokio::test]
async fn test_resolve_merge_requires_data() {
    let engine = SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(ManualAnalyzer))
        .build();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Category, "cat1", 1);
    drain_events(&mut events);

    engine.handle_remote_update(remote_op(
        EntityKind::Category,
        "cat1",
        1,
        "device-a",
        json!({"name": "Food"}),
    ));
    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);
    let id = conflicts[0].id.clone();

    let result = engine.resolve_conflict(&id, ResolutionChoice::Merge, None);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    // A failed resolution leaves the conflict pending.
    assert_eq!(engine.get_conflicts().len(), 1);

    engine
        .resolve_conflict(&id, ResolutionChoice::Merge, Some(json!({"name": "Food & Drink"})))
        .unwrap();
    assert!(engine.get_conflicts().is_empty());
    assert!(drain_events(&mut events).iter().any(
        |e| matches!(e, SyncEvent::RemoteMerge { data, .. } if data == &json!({"name": "Food & Drink"})),
    ));
    // The merged result advances past both disputed versions.
    assert_eq!(engine.entity_version("cat1"), Some(2));
}

#[tokio::test]
async fn test_mid_confidence_suggestion_is_pre_applied_but_pending() {
    let engine = SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(ScriptedAnalyzer(ConflictAnalysis {
            confidence: 60,
            can_auto_resolve: true,
            suggested: SuggestedResolution::Server,
            merged_data: None,
        })))
        .build();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Account, "acc1", 1);
    drain_events(&mut events);

    engine.handle_remote_update(remote_op(
        EntityKind::Account,
        "acc1",
        1,
        "device-a",
        json!({"balance": 7}),
    ));

    // Below the auto-resolve bar but above the pre-apply bar: the
    // suggestion's effects land, the conflict stays visible.
    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].suggested.is_some());

    let updates_before = drain_events(&mut events)
        .iter()
        .filter(|e| matches!(e, SyncEvent::RemoteUpdate { .. }))
        .count();
    assert_eq!(updates_before, 1);

    // Confirming the same choice does not re-apply the effects.
    engine
        .resolve_conflict(&conflicts[0].id, ResolutionChoice::Remote, None)
        .unwrap();
    assert!(engine.get_conflicts().is_empty());
    let updates_after = drain_events(&mut events)
        .iter()
        .filter(|e| matches!(e, SyncEvent::RemoteUpdate { .. }))
        .count();
    assert_eq!(updates_after, 0);
}

fn merge_payloads(events: &[SyncEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::RemoteMerge { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn preapply_merge_engine() -> SyncEngine {
    SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(ScriptedAnalyzer(ConflictAnalysis {
            confidence: 60,
            can_auto_resolve: true,
            suggested: SuggestedResolution::Merge,
            merged_data: Some(json!({"balance": 1})),
        })))
        .build()
}

#[tokio::test]
async fn test_preapplied_merge_overridden_by_user_payload() {
    let engine = preapply_merge_engine();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Account, "acc1", 1);
    drain_events(&mut events);

    engine.handle_remote_update(remote_op(
        EntityKind::Account,
        "acc1",
        1,
        "device-a",
        json!({"balance": 2}),
    ));

    // Pre-applied with the analyzer's payload, still pending.
    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        merge_payloads(&drain_events(&mut events)),
        vec![json!({"balance": 1})]
    );

    // The user's own merge payload replaces the suggestion.
    engine
        .resolve_conflict(
            &conflicts[0].id,
            ResolutionChoice::Merge,
            Some(json!({"balance": 999})),
        )
        .unwrap();
    assert!(engine.get_conflicts().is_empty());
    assert_eq!(
        merge_payloads(&drain_events(&mut events)),
        vec![json!({"balance": 999})]
    );
}

#[tokio::test]
async fn test_preapplied_merge_confirmed_without_data_not_reapplied() {
    let engine = preapply_merge_engine();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Account, "acc1", 1);
    drain_events(&mut events);

    engine.handle_remote_update(remote_op(
        EntityKind::Account,
        "acc1",
        1,
        "device-a",
        json!({"balance": 2}),
    ));
    let conflicts = engine.get_conflicts();
    assert_eq!(conflicts.len(), 1);
    drain_events(&mut events);

    // Confirming the suggestion without a payload is a plain ack.
    engine
        .resolve_conflict(&conflicts[0].id, ResolutionChoice::Merge, None)
        .unwrap();
    assert!(engine.get_conflicts().is_empty());
    assert!(merge_payloads(&drain_events(&mut events)).is_empty());
}

#[tokio::test]
async fn test_field_merge_auto_resolves_disjoint_edits() {
    let engine = SyncEngineBuilder::new()
        .store(Box::new(MemoryStore::new()))
        .analyzer(Arc::new(FieldMergeAnalyzer::new()))
        .build();
    let mut events = engine.subscribe();
    seed_clock(&engine, EntityKind::Transaction, "txn1", 1);

    // Local edit queued but not yet acknowledged.
    engine
        .queue_operation(
            OperationType::Update,
            EntityKind::Transaction,
            "txn1",
            json!({"amount": 42, "note": "groceries"}),
        )
        .unwrap();
    drain_events(&mut events);

    // A concurrent remote edit at the same confirmed version, touching
    // a different field.
    let mut op = remote_op(
        EntityKind::Transaction,
        "txn1",
        1,
        "device-a",
        json!({"amount": 42, "category": "food"}),
    );
    op.timestamp += 10_000;
    engine.handle_remote_update(op);

    assert!(engine.get_conflicts().is_empty());
    let seen = drain_events(&mut events);
    assert!(seen.iter().any(
        |e| matches!(e, SyncEvent::ConflictAutoResolved { resolution, .. } if *resolution == ResolutionChoice::Merge),
    ));
    assert!(seen.iter().any(|e| matches!(
        e,
        SyncEvent::RemoteMerge { data, .. }
            if data == &json!({"amount": 42, "note": "groceries", "category": "food"})
    )));
}

#[tokio::test]
async fn test_resolve_unknown_conflict_fails() {
    let engine = engine();
    let result = engine.resolve_conflict("missing", ResolutionChoice::Remote, None);
    assert!(matches!(result, Err(Error::ConflictNotFound(_))));
}
