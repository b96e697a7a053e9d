//! Portal wire contract for the "best offer" endpoint.
//!
//! The XHR answers `{"d": "<json_array>@@<budget>@@<offer_to_beat>@@<message>"}`.
//! The array holds offer objects (`monto_a_mostrar`, `monto`, `hora`,
//! `id_proveedor`, ...); the first element is the current best. Everything
//! here parses defensively: an empty array, the literal `"null"` or broken
//! JSON all mean "no offers, no best"; zeros are never invented.

use std::collections::HashMap;

use serde_json::{json, Value};

use sbm_events::UpdatePayload;
use sbm_util::money_to_f64;

/// Path of the offers XHR, relative to the auction page.
pub const OFFERS_ENDPOINT_PATH: &str = "BuscarOfertas";

/// Fully parsed portal response for one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    /// Raw offers array, kept opaque for audit/export.
    pub offers: Value,
    pub budget_text: String,
    pub budget_value: Option<f64>,
    pub offer_to_beat_text: String,
    pub offer_to_beat_value: Option<f64>,
    pub message: String,
    pub best_text: String,
    pub best_value: Option<f64>,
    pub best_provider_id: Option<String>,
    pub last_offer_time: Option<String>,
}

/// Split and parse the `d` field.
pub fn parse_d_field(d: &str) -> ParsedResponse {
    let mut parts = d.splitn(4, "@@");
    let grid = parts.next().unwrap_or("");
    let budget_text = parts.next().unwrap_or("").trim().to_string();
    let offer_to_beat_text = parts.next().unwrap_or("").trim().to_string();
    let message = parts.next().unwrap_or("").trim().to_string();

    let offers: Value = if grid.is_empty() || grid == "null" {
        Value::Array(vec![])
    } else {
        serde_json::from_str::<Value>(grid)
            .ok()
            .filter(Value::is_array)
            .unwrap_or_else(|| Value::Array(vec![]))
    };

    let best = offers.as_array().and_then(|a| a.first());
    let best_text = best
        .and_then(|o| o.get("monto_a_mostrar"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let best_value = money_to_f64(&best_text);
    let last_offer_time = best
        .and_then(|o| o.get("hora"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let best_provider_id = best.and_then(|o| o.get("id_proveedor")).and_then(|v| match v {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    ParsedResponse {
        budget_value: money_to_f64(&budget_text),
        budget_text,
        offer_to_beat_value: money_to_f64(&offer_to_beat_text),
        offer_to_beat_text,
        message,
        best_text,
        best_value,
        best_provider_id,
        last_offer_time,
        offers,
    }
}

/// Request body of the offers XHR.
pub fn offers_request_body(id_cot: &str, local_id: &str, margin: &str) -> Value {
    json!({
        "id_Cotizacion": id_cot,
        "id_Item_Renglon": local_id,
        "Margen_Minimo": margin,
    })
}

/// Build the normalized UPDATE payload both collectors emit.
pub fn update_payload(
    id_cot: &str,
    local_id: &str,
    description: &str,
    parsed: &ParsedResponse,
    changed: bool,
    transport_status: u16,
) -> UpdatePayload {
    UpdatePayload {
        auction_ext_id: id_cot.to_string(),
        local_id: local_id.to_string(),
        description: description.to_string(),
        best_offer_text: parsed.best_text.clone(),
        best_offer_value: parsed.best_value,
        offer_to_beat_text: parsed.offer_to_beat_text.clone(),
        offer_to_beat_value: parsed.offer_to_beat_value,
        budget_text: parsed.budget_text.clone(),
        budget_value: parsed.budget_value,
        portal_message: parsed.message.clone(),
        last_offer_time: parsed.last_offer_time.clone(),
        best_provider_id: parsed.best_provider_id.clone(),
        raw_offers: parsed.offers.clone(),
        transport_status,
        changed,
    }
}

/// Collector-side change detection: one signature per item, compared across
/// consecutive polls.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last_sig: HashMap<String, String>,
}

impl ChangeTracker {
    /// Record this poll's signature; returns whether it differs from the
    /// previous one (first observation counts as a change).
    pub fn observe(&mut self, local_id: &str, parsed: &ParsedResponse) -> bool {
        let sig = format!(
            "{}|{}|{}",
            parsed.best_text, parsed.offer_to_beat_text, parsed.message
        );
        let changed = self.last_sig.get(local_id) != Some(&sig);
        self.last_sig.insert(local_id.to_string(), sig);
        changed
    }
}
