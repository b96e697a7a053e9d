mod common;

use common::*;
use sbm_engine::EngineConfig;
use sbm_events::{warn, ControlAction, EventKind, EventPayload, HttpErrorPayload, TransportErrorKind};

fn http_error(status: u16) -> sbm_events::Event {
    warn(EventKind::HttpError, format!("HTTP {status}")).with_payload(EventPayload::HttpError(
        HttpErrorPayload {
            auction_ext_id: "22053".into(),
            local_id: Some("1".into()),
            transport_status: status,
            error_kind: TransportErrorKind::Http,
            message: format!("HTTP {status}"),
        },
    ))
}

#[tokio::test]
async fn scenario_backoff_then_recovery() {
    // Back off from the very first error step so three errors walk the
    // cadence 2 -> 4 -> 8.
    let cfg = EngineConfig {
        security: sbm_security::SecurityConfig {
            min_streak_for_backoff: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = harness(cfg).await;
    h.engine.set_base_cadence(1.0);
    h.engine.set_current_cadence(1.0);

    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    // Seed the ext-id cache.
    let snap = sbm_events::info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;
    drain_controls(&mut h.control_rx);

    // Three errors spaced beyond the coalescing window.
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:02")).await;
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:04")).await;
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:06")).await;

    let controls = drain_controls(&mut h.control_rx);
    let cadences: Vec<f64> = controls
        .iter()
        .filter_map(|c| match c {
            ControlAction::Backoff { seconds } => Some(*seconds),
            _ => None,
        })
        .collect();
    assert_eq!(cadences, vec![2.0, 4.0, 8.0]);
    assert_eq!(h.engine.current_cadence(), 8.0);

    // Next valid UPDATE: cadence snaps back to base and a BACKOFF(base)
    // control action recovers the collector.
    let update = sbm_events::info(EventKind::Update, "update").with_payload(
        EventPayload::Update(update_for("1", "$ 1,00", Some(1.0), Some(1.0))),
    );
    h.engine.handle_at(update, at("2026-02-04T10:00:08")).await;

    let controls = drain_controls(&mut h.control_rx);
    assert_eq!(controls, vec![ControlAction::Backoff { seconds: 1.0 }]);
    assert_eq!(h.engine.current_cadence(), 1.0);

    // Streak reset persisted.
    let auction_id = sbm_db::get_auction_id_by_ext(&h.pool, "22053").await.unwrap().unwrap();
    let auction = sbm_db::fetch_auction(&h.pool, auction_id).await.unwrap();
    assert_eq!(auction.err_streak, 0);
    assert_eq!(auction.state, "RUNNING");
}

#[tokio::test]
async fn scenario_isolated_error_does_not_back_off_by_default() {
    let mut h = harness(EngineConfig::default()).await;
    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    let snap = sbm_events::info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;
    drain_controls(&mut h.control_rx);

    // Streak 1 < min_streak_for_backoff (2): alert only.
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:02")).await;
    assert!(drain_controls(&mut h.control_rx).is_empty());
    assert_eq!(h.engine.current_cadence(), 1.0);

    // Second error starts the backoff chain.
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:04")).await;
    let controls = drain_controls(&mut h.control_rx);
    assert_eq!(controls, vec![ControlAction::Backoff { seconds: 2.0 }]);
}

#[tokio::test]
async fn scenario_error_bursts_coalesce_into_one_step() {
    let cfg = EngineConfig {
        security: sbm_security::SecurityConfig {
            min_streak_for_backoff: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = harness(cfg).await;
    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    let snap = sbm_events::info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;
    drain_controls(&mut h.control_rx);

    // A parallel cycle fails all requests within the same 1.5 s window:
    // one streak step, one backoff.
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:02")).await;
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:02")).await;
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:03")).await;

    let controls = drain_controls(&mut h.control_rx);
    assert_eq!(controls, vec![ControlAction::Backoff { seconds: 2.0 }]);

    let auction_id = sbm_db::get_auction_id_by_ext(&h.pool, "22053").await.unwrap().unwrap();
    let auction = sbm_db::fetch_auction(&h.pool, auction_id).await.unwrap();
    assert_eq!(auction.err_streak, 1);
}

#[tokio::test]
async fn scenario_max_streak_stops_exactly_once() {
    let cfg = EngineConfig {
        security: sbm_security::SecurityConfig {
            min_streak_for_backoff: 1,
            max_streak: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = harness(cfg).await;
    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    let snap = sbm_events::info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;
    drain_controls(&mut h.control_rx);

    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:02")).await;
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:04")).await;
    // Streak hits max_streak exactly: STOP.
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:06")).await;
    // Further errors must not produce a second STOP.
    h.engine.handle_at(http_error(500), at("2026-02-04T10:00:08")).await;

    let controls = drain_controls(&mut h.control_rx);
    let stops = controls
        .iter()
        .filter(|c| matches!(c, ControlAction::Stop { .. }))
        .count();
    assert_eq!(stops, 1, "at most one STOP per auction");

    let auction_id = sbm_db::get_auction_id_by_ext(&h.pool, "22053").await.unwrap().unwrap();
    let auction = sbm_db::fetch_auction(&h.pool, auction_id).await.unwrap();
    assert_eq!(auction.state, "ENDED");
    assert!(auction.ended_at.is_some());
}

#[tokio::test]
async fn scenario_transient_timeout_keeps_cadence() {
    let mut h = harness(EngineConfig::default()).await;
    sbm_db::upsert_auction(&h.pool, "22053", "u").await.unwrap();
    let snap = sbm_events::info(EventKind::Snapshot, "cap")
        .with_payload(EventPayload::Snapshot(snapshot_22053()));
    h.engine.handle_at(snap, at("2026-02-04T10:00:00")).await;
    drain_controls(&mut h.control_rx);

    for i in 0..4 {
        let ev = warn(EventKind::HttpError, "timeout").with_payload(EventPayload::HttpError(
            HttpErrorPayload {
                auction_ext_id: "22053".into(),
                local_id: None,
                transport_status: 0,
                error_kind: TransportErrorKind::Timeout,
                message: "timeout".into(),
            },
        ));
        h.engine
            .handle_at(ev, at(&format!("2026-02-04T10:00:{:02}", 2 + 2 * i)))
            .await;
    }

    // Tolerated status-0 timeouts: alert only, no cadence change.
    assert!(drain_controls(&mut h.control_rx).is_empty());
    assert_eq!(h.engine.current_cadence(), 1.0);
}
