use std::time::Duration;

use httpmock::prelude::*;

use sbm_collector::http::{HttpCollector, HttpCollectorConfig};
use sbm_collector::{CapturedItem, CapturedSession, Collector};
use sbm_events::{EventKind, EventPayload, TransportErrorKind};

fn session_for(server: &MockServer) -> CapturedSession {
    CapturedSession {
        id_cot: "22053".into(),
        margin: "0,0050".into(),
        auction_url: server.url("/VistaPublica/Subasta.aspx"),
        items: vec![CapturedItem {
            local_id: "1".into(),
            text: "RENGLON 1".into(),
        }],
        cookies: vec![("ASP.NET_SessionId".into(), "expired".into())],
    }
}

#[tokio::test]
async fn scenario_session_expired_after_five_auth_failures() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/VistaPublica/Subasta.aspx/BuscarOfertas");
            then.status(401);
        })
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let collector = HttpCollector::new(
        HttpCollectorConfig {
            base_cadence_s: 0.2,
            auth_failures_max: 5,
            ..Default::default()
        },
        session_for(&server),
        tx,
    );
    collector.start().unwrap();

    let mut auth_errors = 0usize;
    let mut session_expired = false;
    let mut stopped = false;

    while !(session_expired && stopped) {
        let ev = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("collector should expire the session")
            .expect("channel open");

        match ev.kind {
            EventKind::HttpError => {
                if let EventPayload::HttpError(p) = &ev.payload {
                    assert_eq!(p.transport_status, 401);
                    assert_eq!(p.error_kind, TransportErrorKind::Auth);
                    auth_errors += 1;
                }
            }
            EventKind::Exception => {
                assert!(
                    ev.message.contains("session expired"),
                    "unexpected exception: {}",
                    ev.message
                );
                session_expired = true;
            }
            EventKind::Stop => stopped = true,
            _ => {}
        }
    }

    // One HTTP_ERROR per failure, including the fifth.
    assert_eq!(auth_errors, 5);
    assert_eq!(mock.hits_async().await, 5);
    assert!(!collector.is_running());
}

#[tokio::test]
async fn scenario_ok_response_resets_auth_streak() {
    let server = MockServer::start_async().await;
    // A few 401s, then permanent 200s: the monitor must keep running. The
    // generous threshold leaves room for cycles that fire while the mock is
    // being swapped; the exact reset arithmetic is covered by the
    // AuthTracker unit tests.
    let fail = server
        .mock_async(|when, then| {
            when.method(POST).path("/VistaPublica/Subasta.aspx/BuscarOfertas");
            then.status(401);
        })
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let collector = HttpCollector::new(
        HttpCollectorConfig {
            base_cadence_s: 0.2,
            auth_failures_max: 10,
            ..Default::default()
        },
        session_for(&server),
        tx,
    );
    collector.start().unwrap();

    // Wait for the two auth failures.
    let mut seen = 0;
    while seen < 2 {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if ev.kind == EventKind::HttpError {
            seen += 1;
        }
    }

    fail.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/VistaPublica/Subasta.aspx/BuscarOfertas");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({ "d": "[]@@@@@@" }));
        })
        .await;

    // Several OK updates in a row, with no session-expired exception.
    let mut updates = 0;
    while updates < 4 {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(ev.kind, EventKind::Exception, "streak should have reset");
        if ev.kind == EventKind::Update {
            updates += 1;
        }
    }

    assert!(collector.is_running());
    collector.stop();
}
