#![allow(dead_code)] // not every scenario uses every helper

use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use sbm_engine::{Engine, EngineConfig};
use sbm_events::{ControlAction, Event, SnapshotItem, SnapshotPayload, UpdatePayload};

pub struct Harness {
    pub pool: SqlitePool,
    pub engine: Engine,
    pub out_rx: UnboundedReceiver<Event>,
    pub control_rx: UnboundedReceiver<ControlAction>,
}

pub async fn harness(cfg: EngineConfig) -> Harness {
    let pool = sbm_db::open_in_memory().await.unwrap();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let engine = Engine::new(pool.clone(), out_tx, control_tx, cfg);
    Harness {
        pool,
        engine,
        out_rx,
        control_rx,
    }
}

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
}

pub fn drain_events(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

pub fn drain_controls(rx: &mut UnboundedReceiver<ControlAction>) -> Vec<ControlAction> {
    let mut out = Vec::new();
    while let Ok(a) = rx.try_recv() {
        out.push(a);
    }
    out
}

pub fn snapshot_22053() -> SnapshotPayload {
    SnapshotPayload {
        auction_ext_id: "22053".into(),
        margin_string: "0,0050".into(),
        url: "https://portal/subasta?token=x".into(),
        items: vec![SnapshotItem {
            local_id: "1".into(),
            text: "RENGLON 1".into(),
            quantity: Some(293_700.0),
            reference_total: Some(2_320_230_000.0),
            reference_unit: None,
            budget: None,
        }],
    }
}

pub fn update_for(
    local_id: &str,
    best_text: &str,
    best_value: Option<f64>,
    offer_to_beat: Option<f64>,
) -> UpdatePayload {
    UpdatePayload {
        auction_ext_id: "22053".into(),
        local_id: local_id.into(),
        description: "RENGLON 1".into(),
        best_offer_text: best_text.into(),
        best_offer_value: best_value,
        offer_to_beat_text: offer_to_beat
            .map(|v| format!("$ {v}"))
            .unwrap_or_default(),
        offer_to_beat_value: offer_to_beat,
        transport_status: 200,
        ..Default::default()
    }
}
