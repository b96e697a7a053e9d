mod common;

use common::*;
use sbm_engine::EngineConfig;
use sbm_events::{info, EventKind, EventPayload, UpdatePayload};

fn update_with_provider(best_text: &str, provider: &str) -> UpdatePayload {
    UpdatePayload {
        best_provider_id: Some(provider.into()),
        ..update_for("1", best_text, Some(1_000.0), Some(990.0))
    }
}

#[tokio::test]
async fn scenario_outbid_detection() {
    let mut h = harness(EngineConfig::default()).await;

    let auction_id = sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    sbm_db::set_mi_id_proveedor(&h.pool, auction_id, Some("P1"))
        .await
        .unwrap();

    // Tick 1: our provider holds the best offer.
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_with_provider("$ 1.000,00", "P1"),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:00")).await;

    let events = drain_events(&mut h.out_rx);
    let derived = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Derived(d) => Some(d.as_ref()),
            _ => None,
        })
        .expect("derived update");
    assert!(derived.operator_is_best);
    assert!(!derived.outbid);
    assert_eq!(derived.alert_style, "MY_OFFER");

    // Tick 2: someone else takes the lead with a real change.
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_with_provider("$ 995,00", "P2"),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:01")).await;

    let events = drain_events(&mut h.out_rx);
    let derived = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Derived(d) => Some(d.as_ref()),
            _ => None,
        })
        .expect("derived update");
    assert!(!derived.operator_is_best);
    assert!(derived.outbid, "losing the lead on a change is an outbid");
    assert_eq!(derived.sound, "ALERT");
    assert!(derived.highlight);

    // The outbid is journaled for audit.
    let log = sbm_db::fetch_recent_events(&h.pool, 20).await.unwrap();
    assert!(
        log.iter().any(|r| r.kind == "OUTBID"),
        "OUTBID row missing from event log"
    );

    // Tick 3: still P2, no change -> no repeated outbid.
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_with_provider("$ 995,00", "P2"),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:02")).await;

    let events = drain_events(&mut h.out_rx);
    let derived = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Derived(d) => Some(d.as_ref()),
            _ => None,
        })
        .unwrap();
    assert!(!derived.outbid);
}

#[tokio::test]
async fn scenario_no_outbid_without_known_provider_id() {
    let mut h = harness(EngineConfig::default()).await;
    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();

    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_with_provider("$ 1.000,00", "P1"),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:00")).await;
    let ev = info(EventKind::Update, "update").with_payload(EventPayload::Update(
        update_with_provider("$ 995,00", "P2"),
    ));
    h.engine.handle_at(ev, at("2026-02-04T10:00:01")).await;

    let events = drain_events(&mut h.out_rx);
    for derived in events.iter().filter_map(|e| match &e.payload {
        EventPayload::Derived(d) => Some(d.as_ref()),
        _ => None,
    }) {
        assert!(!derived.operator_is_best);
        assert!(!derived.outbid);
    }
    let log = sbm_db::fetch_recent_events(&h.pool, 20).await.unwrap();
    assert!(log.iter().all(|r| r.kind != "OUTBID"));
}
