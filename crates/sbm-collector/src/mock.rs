//! Scenario-driven mock collector.
//!
//! Replays a JSON scenario tick by tick, emitting exactly the event stream
//! the real collectors produce. No hardcoded data: portal responses live in
//! the scenario file as raw `d` strings, so captures from the real portal
//! can be replayed verbatim.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;

use sbm_events::{
    info, warn, EndPayload, Event, EventKind, EventPayload, HttpErrorPayload, SnapshotItem,
    SnapshotPayload, TransportErrorKind, END_TOKEN,
};

use crate::protocol::{self, ChangeTracker};
use crate::{Collector, CollectorSignals};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub scenario_name: String,
    #[serde(default)]
    pub description: String,
    pub auction: ScenarioAuction,
    pub config: ScenarioTiming,
    pub timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioAuction {
    pub id_cot: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioTiming {
    pub tick_duration_seconds: f64,
    pub max_ticks: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineEntry {
    pub tick: u32,
    pub status: u16,
    #[serde(default)]
    pub items: Vec<ScenarioItem>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// `"end_auction"` finishes the whole scenario at this tick.
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioItem {
    pub local_id: String,
    #[serde(default)]
    pub description: String,
    /// Raw portal response (`d` field) for this item at this tick.
    pub d: String,
}

const VALID_STATUSES: &[u16] = &[0, 200, 401, 403, 500, 502, 503, 504];

/// Parse and validate a scenario document.
pub fn parse_scenario(json: &str) -> Result<Scenario> {
    let scenario: Scenario = serde_json::from_str(json).context("parse scenario json")?;

    if scenario.timeline.is_empty() {
        bail!("scenario timeline cannot be empty");
    }
    if scenario.auction.id_cot.is_empty() {
        bail!("scenario auction.id_cot cannot be empty");
    }
    for (i, entry) in scenario.timeline.iter().enumerate() {
        if !VALID_STATUSES.contains(&entry.status) {
            bail!(
                "timeline[{i}]: invalid status {} (valid: {VALID_STATUSES:?})",
                entry.status
            );
        }
    }
    Ok(scenario)
}

pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read scenario {}", path.display()))?;
    parse_scenario(&raw).with_context(|| format!("scenario {}", path.display()))
}

pub struct MockCollector {
    scenario: Scenario,
    out: UnboundedSender<Event>,
    signals: Arc<CollectorSignals>,
}

impl MockCollector {
    pub fn new(scenario: Scenario, out: UnboundedSender<Event>) -> Self {
        let cadence = scenario.config.tick_duration_seconds;
        let signals = Arc::new(CollectorSignals::new(cadence, cadence.max(1.0), true));
        Self {
            scenario,
            out,
            signals,
        }
    }

    fn emit(out: &UnboundedSender<Event>, ev: Event) {
        let _ = out.send(ev);
    }

    fn snapshot_payload(scenario: &Scenario) -> SnapshotPayload {
        // Seed the snapshot from the first data-bearing tick so the item
        // list and budgets come from the scenario, not from code.
        let items = scenario
            .timeline
            .iter()
            .find(|e| !e.items.is_empty())
            .map(|entry| {
                entry
                    .items
                    .iter()
                    .map(|it| {
                        let parsed = protocol::parse_d_field(&it.d);
                        SnapshotItem {
                            local_id: it.local_id.clone(),
                            text: it.description.clone(),
                            quantity: None,
                            reference_total: parsed.budget_value,
                            reference_unit: None,
                            budget: parsed.budget_value,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        SnapshotPayload {
            auction_ext_id: scenario.auction.id_cot.clone(),
            margin_string: "0,0050".into(),
            url: scenario.auction.url.clone(),
            items,
        }
    }

    async fn run(scenario: Scenario, out: UnboundedSender<Event>, signals: Arc<CollectorSignals>) {
        let id_cot = scenario.auction.id_cot.clone();
        let mut tracker = ChangeTracker::default();

        Self::emit(
            &out,
            info(
                EventKind::Snapshot,
                format!("scenario snapshot ({})", scenario.scenario_name),
            )
            .with_payload(EventPayload::Snapshot(Self::snapshot_payload(&scenario))),
        );

        let mut ticks = 0u32;
        'timeline: for entry in &scenario.timeline {
            if signals.stop_requested() || ticks >= scenario.config.max_ticks {
                break;
            }
            ticks += 1;

            if entry.status != 200 {
                let message = entry
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {}", entry.status));
                let kind = match entry.status {
                    401 | 403 => TransportErrorKind::Auth,
                    0 => TransportErrorKind::Timeout,
                    _ => TransportErrorKind::Http,
                };
                Self::emit(
                    &out,
                    warn(EventKind::HttpError, format!("HTTP {} - {message}", entry.status))
                        .with_payload(EventPayload::HttpError(HttpErrorPayload {
                            auction_ext_id: id_cot.clone(),
                            local_id: None,
                            transport_status: entry.status,
                            error_kind: kind,
                            message,
                        })),
                );
                Self::sleep_tick(&signals).await;
                continue;
            }

            if entry.event.as_deref() == Some("end_auction") {
                Self::emit(
                    &out,
                    info(EventKind::End, "auction finished (scenario event)").with_payload(
                        EventPayload::End(EndPayload {
                            auction_ext_id: id_cot.clone(),
                            local_id: None,
                            reason: entry.message.clone(),
                        }),
                    ),
                );
                break;
            }

            for it in &entry.items {
                if signals.stop_requested() {
                    break 'timeline;
                }
                let parsed = protocol::parse_d_field(&it.d);
                let changed = tracker.observe(&it.local_id, &parsed);
                let finished = parsed.message.to_lowercase().contains(END_TOKEN);

                let payload = protocol::update_payload(
                    &id_cot,
                    &it.local_id,
                    &it.description,
                    &parsed,
                    changed,
                    200,
                );
                Self::emit(
                    &out,
                    info(EventKind::Update, format!("update item {}", it.local_id))
                        .with_payload(EventPayload::Update(payload)),
                );

                if finished {
                    Self::emit(
                        &out,
                        info(EventKind::End, format!("auction finished (item={})", it.local_id))
                            .with_payload(EventPayload::End(EndPayload {
                                auction_ext_id: id_cot.clone(),
                                local_id: Some(it.local_id.clone()),
                                reason: Some(parsed.message.clone()),
                            })),
                    );
                    break 'timeline;
                }
            }

            Self::sleep_tick(&signals).await;
        }

        signals.set_running(false);
        Self::emit(&out, info(EventKind::Stop, "scenario finished"));
    }

    async fn sleep_tick(signals: &CollectorSignals) {
        tokio::time::sleep(Duration::from_secs_f64(signals.effective_cadence_s())).await;
    }
}

impl Collector for MockCollector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn start(&self) -> Result<()> {
        if self.signals.is_running() {
            return Ok(());
        }
        self.signals.reset_for_start();
        Self::emit(
            &self.out,
            info(
                EventKind::Start,
                format!("mock collector ({})", self.scenario.scenario_name),
            ),
        );
        tokio::spawn(Self::run(
            self.scenario.clone(),
            self.out.clone(),
            Arc::clone(&self.signals),
        ));
        Ok(())
    }

    fn stop(&self) {
        if !self.signals.is_running() {
            return;
        }
        self.signals.request_stop();
    }

    fn set_cadence(&self, seconds: f64) {
        self.signals.set_cadence(seconds);
    }

    fn set_intensive(&self, enabled: bool) {
        self.signals.set_intensive(enabled);
    }

    fn is_running(&self) -> bool {
        self.signals.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "scenario_name": "two-ticks",
        "description": "one change then end",
        "auction": {"id_cot": "22053", "url": "mock://auction"},
        "config": {"tick_duration_seconds": 0.2, "max_ticks": 10},
        "timeline": [
            {"tick": 0, "status": 200, "items": [
                {"local_id": "1", "description": "RENGLON 1",
                 "d": "[{\"monto_a_mostrar\":\"$ 1.000,00\",\"id_proveedor\":\"P1\"}]@@$ 2.000,00@@$ 990,00@@"}
            ]},
            {"tick": 1, "status": 500, "error_message": "boom"},
            {"tick": 2, "status": 200, "items": [
                {"local_id": "1", "description": "RENGLON 1",
                 "d": "[]@@$ 2.000,00@@$ 990,00@@Subasta Finalizada"}
            ]}
        ]
    }"#;

    #[test]
    fn parses_and_validates() {
        let s = parse_scenario(SCENARIO).unwrap();
        assert_eq!(s.auction.id_cot, "22053");
        assert_eq!(s.timeline.len(), 3);
    }

    #[test]
    fn rejects_empty_timeline_and_bad_status() {
        let empty = r#"{"scenario_name":"x","auction":{"id_cot":"1","url":"u"},
            "config":{"tick_duration_seconds":1.0,"max_ticks":1},"timeline":[]}"#;
        assert!(parse_scenario(empty).is_err());

        let bad = r#"{"scenario_name":"x","auction":{"id_cot":"1","url":"u"},
            "config":{"tick_duration_seconds":1.0,"max_ticks":1},
            "timeline":[{"tick":0,"status":418}]}"#;
        let err = parse_scenario(bad).unwrap_err().to_string();
        assert!(err.contains("418"), "got: {err}");
    }

    #[tokio::test]
    async fn replays_snapshot_updates_errors_and_end() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let collector = MockCollector::new(parse_scenario(SCENARIO).unwrap(), tx);
        collector.set_cadence(0.2);
        collector.start().unwrap();

        let mut kinds = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("scenario should finish")
                .expect("channel open");
            let kind = ev.kind;
            kinds.push(kind);
            if kind == EventKind::Stop && kinds.contains(&EventKind::End) {
                break;
            }
        }

        assert!(kinds.contains(&EventKind::Start));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Snapshot).count(), 1);
        assert!(kinds.contains(&EventKind::Update));
        assert!(kinds.contains(&EventKind::HttpError));
        assert!(kinds.contains(&EventKind::End));
        assert!(!collector.is_running());
    }
}
