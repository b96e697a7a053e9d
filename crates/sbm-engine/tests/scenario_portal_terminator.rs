mod common;

use common::*;
use sbm_engine::EngineConfig;
use sbm_events::{info, ControlAction, EventKind, EventPayload, UpdatePayload};

#[tokio::test]
async fn scenario_portal_terminator() {
    let mut h = harness(EngineConfig::default()).await;

    let snap = info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;

    let auction_id = sbm_db::get_auction_id_by_ext(&h.pool, "22053").await.unwrap().unwrap();
    let item_id = sbm_db::get_item_id_by_keys(&h.pool, auction_id, "1").await.unwrap().unwrap();

    // Establish a baseline state.
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_for("1", "$ 1.000,00", Some(1_000.0), Some(990.0)),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:01")).await;
    drain_controls(&mut h.control_rx);

    // Terminator message inside an UPDATE.
    let finished = UpdatePayload {
        portal_message: "Subasta Finalizada".into(),
        ..update_for("1", "$ 1.000,00", Some(1_000.0), Some(990.0))
    };
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(finished));
    h.engine.handle_at(ev, at("2026-02-04T10:00:02")).await;

    // END produced, auction ENDED, exactly one STOP control action.
    let auction = sbm_db::fetch_auction(&h.pool, auction_id).await.unwrap();
    assert_eq!(auction.state, "ENDED");
    assert!(auction.ended_at.is_some());

    let controls = drain_controls(&mut h.control_rx);
    let stops = controls
        .iter()
        .filter(|c| matches!(c, ControlAction::Stop { .. }))
        .count();
    assert_eq!(stops, 1);

    let events = drain_events(&mut h.out_rx);
    assert!(events.iter().any(|e| e.kind == EventKind::End));

    // Subsequent UPDATEs for the ended auction do not change item state...
    let state_before = sbm_db::get_item_state(&h.pool, item_id).await.unwrap().unwrap();
    let log_before = sbm_db::count_events(&h.pool).await.unwrap();

    let ev = info(EventKind::Update, "late update").with_payload(EventPayload::Update(
        update_for("1", "$ 500,00", Some(500.0), Some(490.0)),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:03")).await;

    let state_after = sbm_db::get_item_state(&h.pool, item_id).await.unwrap().unwrap();
    assert_eq!(state_after.best_offer, state_before.best_offer);
    assert_eq!(state_after.updated_at, state_before.updated_at);

    // ...but the event itself still lands in the log.
    assert_eq!(sbm_db::count_events(&h.pool).await.unwrap(), log_before + 1);

    // And no second STOP goes out.
    assert!(drain_controls(&mut h.control_rx).is_empty());
}

#[tokio::test]
async fn scenario_end_is_idempotent() {
    let mut h = harness(EngineConfig::default()).await;
    let snap = info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;
    drain_events(&mut h.out_rx);

    let end_ev = || {
        info(EventKind::End, "finished").with_payload(EventPayload::End(sbm_events::EndPayload {
            auction_ext_id: "22053".into(),
            local_id: Some("1".into()),
            reason: None,
        }))
    };

    h.engine.handle_at(end_ev(), at("2026-02-04T10:00:01")).await;
    let first = drain_events(&mut h.out_rx);
    assert!(first.iter().any(|e| e.kind == EventKind::End));

    // A duplicate END for the same (auction, item) is suppressed.
    h.engine.handle_at(end_ev(), at("2026-02-04T10:00:02")).await;
    let second = drain_events(&mut h.out_rx);
    assert!(
        second.iter().all(|e| e.kind != EventKind::End),
        "duplicate END must not re-emit"
    );

    let controls = drain_controls(&mut h.control_rx);
    let stops = controls
        .iter()
        .filter(|c| matches!(c, ControlAction::Stop { .. }))
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn scenario_recapture_rearms_ended_auction() {
    let mut h = harness(EngineConfig::default()).await;
    let snap = || {
        info(EventKind::Snapshot, "cap").with_payload(EventPayload::Snapshot(snapshot_22053()))
    };
    h.engine.handle_at(snap(), at("2026-02-04T10:00:00")).await;

    let end = info(EventKind::End, "finished").with_payload(EventPayload::End(
        sbm_events::EndPayload {
            auction_ext_id: "22053".into(),
            local_id: None,
            reason: None,
        },
    ));
    h.engine.handle_at(end, at("2026-02-04T10:00:01")).await;

    // New capture of the same auction resumes monitoring.
    h.engine.handle_at(snap(), at("2026-02-04T11:00:00")).await;

    let auction_id = sbm_db::get_auction_id_by_ext(&h.pool, "22053").await.unwrap().unwrap();
    let auction = sbm_db::fetch_auction(&h.pool, auction_id).await.unwrap();
    assert_eq!(auction.state, "RUNNING");

    let item_id = sbm_db::get_item_id_by_keys(&h.pool, auction_id, "1").await.unwrap().unwrap();
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_for("1", "$ 2.000,00", Some(2_000.0), Some(1_990.0)),
    ));
    h.engine.handle_at(ev, at("2026-02-04T11:00:01")).await;

    let state = sbm_db::get_item_state(&h.pool, item_id).await.unwrap().unwrap();
    assert_eq!(state.best_offer, Some(2_000.0));
}
