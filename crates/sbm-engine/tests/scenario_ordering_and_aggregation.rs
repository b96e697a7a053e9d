mod common;

use common::*;
use sbm_engine::EngineConfig;
use sbm_events::{info, EventKind, EventPayload};

#[tokio::test]
async fn scenario_update_before_snapshot_creates_item_lazily() {
    let mut h = harness(EngineConfig::default()).await;

    // No SNAPSHOT seen yet: the UPDATE itself creates auction and item with
    // the payload description.
    let ev = info(EventKind::Update, "early update").with_payload(EventPayload::Update(
        update_for("7", "$ 1.000,00", Some(1_000.0), Some(990.0)),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:00")).await;

    let auction_id = sbm_db::get_auction_id_by_ext(&h.pool, "22053")
        .await
        .unwrap()
        .expect("auction lazily created");
    let item_id = sbm_db::get_item_id_by_keys(&h.pool, auction_id, "7")
        .await
        .unwrap()
        .expect("item lazily created");

    let state = sbm_db::get_item_state(&h.pool, item_id).await.unwrap().unwrap();
    assert_eq!(state.best_offer, Some(1_000.0));

    // Degraded but valid: no quantity/reference until the SNAPSHOT lands.
    let commercial = sbm_db::get_item_commercial(&h.pool, item_id).await.unwrap();
    assert!(commercial.map(|c| c.quantity.is_none()).unwrap_or(true));
}

#[tokio::test]
async fn scenario_aggregate_window_warms_up_then_reports() {
    let cfg = EngineConfig {
        agg_window_seconds: 30,
        ..Default::default()
    };
    let mut h = harness(cfg).await;
    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    let snap = info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;

    let is_summary = |e: &sbm_events::Event| {
        e.kind == EventKind::Heartbeat && e.message.starts_with("summary")
    };

    // Nothing counted yet -> nothing emitted.
    h.engine.maybe_emit_aggregate(at("2026-02-04T10:00:00"));

    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_for("1", "$ 1.000,00", Some(1_000.0), Some(990.0)),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:01")).await;

    // First window is warm-up: the first call only arms the timer.
    h.engine.maybe_emit_aggregate(at("2026-02-04T10:00:01"));
    h.engine.maybe_emit_aggregate(at("2026-02-04T10:00:20"));
    assert!(!drain_events(&mut h.out_rx).iter().any(is_summary));

    // Window elapsed: one summary with the counters.
    h.engine.maybe_emit_aggregate(at("2026-02-04T10:00:32"));
    let events = drain_events(&mut h.out_rx);
    let summary = events.iter().find(|e| is_summary(e)).expect("summary emitted");
    assert!(summary.message.contains("updates=1"), "{}", summary.message);
    assert!(summary.message.contains("changed=1"), "{}", summary.message);

    // Counters reset after emission; an empty window stays silent.
    h.engine.maybe_emit_aggregate(at("2026-02-04T10:01:10"));
    assert!(!drain_events(&mut h.out_rx).iter().any(is_summary));
}

#[tokio::test]
async fn scenario_passthrough_kinds_are_forwarded_and_logged() {
    let mut h = harness(EngineConfig::default()).await;

    h.engine
        .handle_at(info(EventKind::Start, "runtime started"), at("2026-02-04T10:00:00"))
        .await;
    h.engine
        .handle_at(info(EventKind::Heartbeat, "tick"), at("2026-02-04T10:00:01"))
        .await;

    let events = drain_events(&mut h.out_rx);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Start);
    assert_eq!(events[1].kind, EventKind::Heartbeat);

    assert_eq!(sbm_db::count_events(&h.pool).await.unwrap(), 2);
}
