use std::time::Duration;

use httpmock::prelude::*;

use sbm_collector::http::{HttpCollector, HttpCollectorConfig};
use sbm_collector::{CapturedItem, CapturedSession, Collector};
use sbm_events::{EventKind, EventPayload};

const D_WITH_OFFERS: &str = r#"[{"monto_a_mostrar":"$ 21.000.000,0000","monto":21000000.0,"hora":"10:31:02","id_proveedor":"P7"}]@@$ 21.696.480,0000@@$ 20.015.101,6000@@"#;

fn session_for(server: &MockServer) -> CapturedSession {
    CapturedSession {
        id_cot: "22053".into(),
        margin: "0,0050".into(),
        auction_url: server.url("/VistaPublica/Subasta.aspx?token=abc"),
        items: vec![
            CapturedItem {
                local_id: "1".into(),
                text: "RENGLON 1".into(),
            },
            CapturedItem {
                local_id: "2".into(),
                text: "RENGLON 2".into(),
            },
        ],
        cookies: vec![("ASP.NET_SessionId".into(), "live".into())],
    }
}

#[tokio::test]
async fn scenario_direct_monitor_emits_parsed_updates() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/VistaPublica/Subasta.aspx/BuscarOfertas")
                .header("x-requested-with", "XMLHttpRequest")
                .header("cookie", "ASP.NET_SessionId=live");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({ "d": D_WITH_OFFERS }));
        })
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let collector = HttpCollector::new(
        HttpCollectorConfig {
            base_cadence_s: 0.2,
            ..Default::default()
        },
        session_for(&server),
        tx,
    );
    collector.start().unwrap();

    // Intensive mode polls both items per cycle.
    let mut updates = Vec::new();
    while updates.len() < 2 {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("updates should arrive")
            .expect("channel open");
        if ev.kind == EventKind::Update {
            if let EventPayload::Update(p) = ev.payload {
                updates.push(p);
            }
        }
    }

    let first = &updates[0];
    assert_eq!(first.auction_ext_id, "22053");
    assert_eq!(first.best_offer_value, Some(21_000_000.0));
    assert_eq!(first.offer_to_beat_value, Some(20_015_101.6));
    assert_eq!(first.budget_value, Some(21_696_480.0));
    assert_eq!(first.best_provider_id.as_deref(), Some("P7"));
    assert_eq!(first.transport_status, 200);
    assert!(first.changed, "first observation counts as change");

    assert!(mock.hits_async().await >= 2);
    collector.stop();

    // Collector is restartable after a full stop.
    let mut waited = 0;
    while collector.is_running() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += 1;
    }
    assert!(!collector.is_running());
    collector.start().unwrap();
    assert!(collector.is_running());
    collector.stop();
}

#[tokio::test]
async fn scenario_terminator_message_ends_monitoring() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/VistaPublica/Subasta.aspx/BuscarOfertas");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({ "d": "[]@@@@@@Subasta Finalizada" }));
        })
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let collector = HttpCollector::new(
        HttpCollectorConfig {
            base_cadence_s: 0.2,
            ..Default::default()
        },
        session_for(&server),
        tx,
    );
    collector.start().unwrap();

    let mut saw_end = false;
    let mut saw_stop = false;
    while !(saw_end && saw_stop) {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("end should arrive")
            .expect("channel open");
        match ev.kind {
            EventKind::End => {
                if let EventPayload::End(p) = &ev.payload {
                    assert_eq!(p.auction_ext_id, "22053");
                    assert!(p.reason.as_deref().unwrap_or("").to_lowercase().contains("finalizada"));
                }
                saw_end = true;
            }
            EventKind::Stop => saw_stop = true,
            _ => {}
        }
    }
    assert!(!collector.is_running());
}
