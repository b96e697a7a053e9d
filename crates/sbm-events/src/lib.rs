//! Event vocabulary shared by collectors, engine and consumers.
//!
//! An event is data plus metadata, no behavior. Collectors emit them, the
//! engine consumes and re-emits enriched ones, downstream consumers render
//! them. This channel (plus the control-action channel in the opposite
//! direction) is the only communication path between the components.

use serde::{Deserialize, Serialize};

/// Portal message fragment that marks an auction as finished.
///
/// The portal writes it into the free-text message slot of the offers
/// response; both the security policy and the alert engine key off it.
pub const END_TOKEN: &str = "finalizada";

// ---------------------------------------------------------------------------
// Level / kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Heartbeat,
    Update,
    Snapshot,
    Alert,
    Security,
    HttpError,
    Exception,
    Start,
    Stop,
    End,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Heartbeat => "HEARTBEAT",
            EventKind::Update => "UPDATE",
            EventKind::Snapshot => "SNAPSHOT",
            EventKind::Alert => "ALERT",
            EventKind::Security => "SECURITY",
            EventKind::HttpError => "HTTP_ERROR",
            EventKind::Exception => "EXCEPTION",
            EventKind::Start => "START",
            EventKind::Stop => "STOP",
            EventKind::End => "END",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// One captured item inside a [`SnapshotPayload`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    /// Item id local to the auction (the select option value).
    pub local_id: String,
    /// Option text as shown by the portal.
    pub text: String,
    pub quantity: Option<f64>,
    /// Official budget total for the item (a.k.a. "Presupuesto Oficial").
    pub reference_total: Option<f64>,
    /// Unit reference price as published in the detail table.
    pub reference_unit: Option<f64>,
    pub budget: Option<f64>,
}

/// Emitted once per capture: auction identity plus the item list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub auction_ext_id: String,
    /// Minimum-improvement margin exactly as the portal renders it.
    pub margin_string: String,
    pub url: String,
    pub items: Vec<SnapshotItem>,
}

/// One poll result for one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub auction_ext_id: String,
    pub local_id: String,
    pub description: String,
    pub best_offer_text: String,
    pub best_offer_value: Option<f64>,
    pub offer_to_beat_text: String,
    pub offer_to_beat_value: Option<f64>,
    pub budget_text: String,
    pub budget_value: Option<f64>,
    pub portal_message: String,
    pub last_offer_time: Option<String>,
    pub best_provider_id: Option<String>,
    /// Raw offers array from the portal, kept opaque for audit/export.
    pub raw_offers: serde_json::Value,
    pub transport_status: u16,
    /// Collector-side change detection against the previous signature.
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Auth,
    Timeout,
    Network,
    Http,
    Unknown,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Auth => "auth",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Network => "network",
            TransportErrorKind::Http => "http",
            TransportErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorPayload {
    pub auction_ext_id: String,
    pub local_id: Option<String>,
    /// 0 means the request never produced an HTTP status (timeout, abort).
    pub transport_status: u16,
    pub error_kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndPayload {
    pub auction_ext_id: String,
    pub local_id: Option<String>,
    pub reason: Option<String>,
}

/// Engine output for one item tick: the collector payload passthrough plus
/// every derived commercial figure and the alert decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedUpdate {
    pub update: UpdatePayload,

    // Commercial inputs after resolution.
    pub unit: Option<String>,
    pub quantity: Option<f64>,
    pub brand: Option<String>,
    pub notes: Option<String>,
    pub usd_rate: Option<f64>,
    pub unit_cost_usd: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub unit_cost_ars: Option<f64>,
    pub total_cost_ars: Option<f64>,
    /// Canonical fraction in [0, 1].
    pub min_margin: Option<f64>,

    // Derived outputs.
    pub reference_total: Option<f64>,
    pub reference_unit_price: Option<f64>,
    pub reference_margin: Option<f64>,
    pub acceptable_unit_price: Option<f64>,
    pub acceptable_total_price: Option<f64>,
    pub unit_improvement_price: Option<f64>,
    pub improvement_margin: Option<f64>,
    pub margin_pct: Option<f64>,
    pub change_note: Option<String>,

    // Flags.
    pub follow: bool,
    pub my_bid: bool,
    pub operator_is_best: bool,
    pub outbid: bool,
    pub min_margin_pct: f64,
    pub hide_below_threshold: bool,

    // Alert decision.
    pub alert_style: String,
    pub sound: String,
    pub highlight: bool,
    pub hide: bool,
    pub decision_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    None,
    Snapshot(SnapshotPayload),
    Update(UpdatePayload),
    HttpError(HttpErrorPayload),
    End(EndPayload),
    Derived(Box<DerivedUpdate>),
}

impl Default for EventPayload {
    fn default() -> Self {
        EventPayload::None
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub level: EventLevel,
    pub kind: EventKind,
    pub message: String,
    /// Store primary key, filled in by the engine once resolved.
    pub auction_id: Option<i64>,
    pub item_id: Option<i64>,
    #[serde(default)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(level: EventLevel, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            auction_id: None,
            item_id: None,
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_keys(mut self, auction_id: Option<i64>, item_id: Option<i64>) -> Self {
        self.auction_id = auction_id;
        self.item_id = item_id;
        self
    }
}

pub fn debug(kind: EventKind, message: impl Into<String>) -> Event {
    Event::new(EventLevel::Debug, kind, message)
}

pub fn info(kind: EventKind, message: impl Into<String>) -> Event {
    Event::new(EventLevel::Info, kind, message)
}

pub fn warn(kind: EventKind, message: impl Into<String>) -> Event {
    Event::new(EventLevel::Warn, kind, message)
}

pub fn error(kind: EventKind, message: impl Into<String>) -> Event {
    Event::new(EventLevel::Error, kind, message)
}

// ---------------------------------------------------------------------------
// Control actions (engine -> runtime -> collector)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    /// Collector must set its cadence to `seconds` on the next tick.
    Backoff { seconds: f64 },
    /// Collector must stop. Sent at most once per auction.
    Stop { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_log_vocabulary() {
        assert_eq!(EventKind::HttpError.as_str(), "HTTP_ERROR");
        assert_eq!(EventKind::Snapshot.as_str(), "SNAPSHOT");
        assert_eq!(EventLevel::Warn.as_str(), "WARN");
    }

    #[test]
    fn event_builder_sets_keys() {
        let ev = info(EventKind::Update, "update").with_keys(Some(3), Some(9));
        assert_eq!(ev.auction_id, Some(3));
        assert_eq!(ev.item_id, Some(9));
        assert_eq!(ev.payload, EventPayload::None);
    }

    #[test]
    fn control_action_serializes_tagged() {
        let json = serde_json::to_value(ControlAction::Backoff { seconds: 2.0 }).unwrap();
        assert_eq!(json["action"], "BACKOFF");
        assert_eq!(json["seconds"], 2.0);
    }

    #[test]
    fn update_payload_round_trips() {
        let payload = UpdatePayload {
            auction_ext_id: "22053".into(),
            local_id: "1".into(),
            best_offer_text: "$ 1.000,00".into(),
            best_offer_value: Some(1000.0),
            transport_status: 200,
            ..Default::default()
        };
        let ev = info(EventKind::Update, "update")
            .with_payload(EventPayload::Update(payload.clone()));
        let back: Event = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        match back.payload {
            EventPayload::Update(p) => assert_eq!(p, payload),
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
