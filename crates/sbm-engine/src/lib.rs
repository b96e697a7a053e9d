//! Central runtime of the monitor.
//!
//! Consumes collector events one at a time, persists state, derives the
//! commercial figures, applies the security policy and the alert rules, and
//! re-emits enriched events downstream. Control actions (BACKOFF, STOP) flow
//! back to the collector through the runtime.
//!
//! Observability without spam: immediate log lines on change/error/end, one
//! aggregate heartbeat per window with the counters.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;

use sbm_db as db;
use sbm_events::{
    info, warn, ControlAction, DerivedUpdate, EndPayload, Event, EventKind, EventPayload,
    HttpErrorPayload, SnapshotPayload, UpdatePayload, END_TOKEN,
};
use sbm_security::{SecurityAction, SecurityConfig, SecurityInput};
use sbm_util::now_naive;

pub mod costs;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Alert threshold used when an item has no margin of its own.
    pub default_min_margin_pct: f64,
    pub default_hide_below_threshold: bool,
    pub agg_window_seconds: i64,
    pub security: SecurityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_min_margin_pct: 10.0,
            default_hide_below_threshold: false,
            agg_window_seconds: 30,
            security: SecurityConfig::default(),
        }
    }
}

/// Seconds below which repeated transport errors of one auction count as the
/// same failure step (a parallel cycle fails as a burst, not a streak).
const ERROR_COALESCE_WINDOW_S: f64 = 1.5;

#[derive(Debug, Default)]
struct AggCounters {
    updates: u64,
    changed: u64,
    http_error: u64,
    end: u64,
    last_emit: Option<NaiveDateTime>,
}

impl AggCounters {
    fn total(&self) -> u64 {
        self.updates + self.changed + self.http_error + self.end
    }

    fn reset(&mut self) {
        self.updates = 0;
        self.changed = 0;
        self.http_error = 0;
        self.end = 0;
    }
}

pub struct Engine {
    pool: SqlitePool,
    out: UnboundedSender<Event>,
    control: UnboundedSender<ControlAction>,
    cfg: EngineConfig,

    base_cadence: f64,
    current_cadence: f64,

    // ext id -> auction pk, (auction pk, local id) -> item pk.
    auction_pk_by_ext: HashMap<String, i64>,
    item_pk_by_keys: HashMap<(i64, String), i64>,

    // Per-auction operational state.
    provider_id_cache: HashMap<i64, Option<String>>,
    err_streak: HashMap<i64, u32>,
    last_ok_at: HashMap<i64, NaiveDateTime>,
    last_error_at: HashMap<i64, NaiveDateTime>,
    ended_auctions: HashSet<i64>,
    stop_sent: HashSet<i64>,

    // Per-item state.
    prev_best_auto: HashMap<i64, bool>,
    last_sig: HashMap<i64, String>,
    ended_keys: HashSet<(i64, String)>,

    agg: AggCounters,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        out: UnboundedSender<Event>,
        control: UnboundedSender<ControlAction>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            pool,
            out,
            control,
            cfg,
            base_cadence: 1.0,
            current_cadence: 1.0,
            auction_pk_by_ext: HashMap::new(),
            item_pk_by_keys: HashMap::new(),
            provider_id_cache: HashMap::new(),
            err_streak: HashMap::new(),
            last_ok_at: HashMap::new(),
            last_error_at: HashMap::new(),
            ended_auctions: HashSet::new(),
            stop_sent: HashSet::new(),
            prev_best_auto: HashMap::new(),
            last_sig: HashMap::new(),
            ended_keys: HashSet::new(),
            agg: AggCounters::default(),
        }
    }

    pub fn set_base_cadence(&mut self, seconds: f64) {
        self.base_cadence = seconds.max(0.2);
    }

    pub fn set_current_cadence(&mut self, seconds: f64) {
        self.current_cadence = seconds.max(0.2);
    }

    pub fn current_cadence(&self) -> f64 {
        self.current_cadence
    }

    /// Invalidate the cached provider id so the next tick reloads it.
    pub fn refresh_provider_id(&mut self, auction_pk: i64) {
        self.provider_id_cache.remove(&auction_pk);
    }

    fn emit(&self, ev: Event) {
        let _ = self.out.send(ev);
    }

    fn send_control(&self, action: ControlAction) {
        let _ = self.control.send(action);
    }

    fn iso(ts: NaiveDateTime) -> String {
        ts.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    // -----------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------

    pub async fn handle(&mut self, ev: Event) {
        self.handle_at(ev, now_naive()).await;
    }

    /// Deterministic entry point: the wall clock is an argument.
    pub async fn handle_at(&mut self, ev: Event, now: NaiveDateTime) {
        self.persist_event(&ev).await;

        match ev.kind {
            EventKind::Snapshot => {
                if let EventPayload::Snapshot(payload) = ev.payload.clone() {
                    self.handle_snapshot(ev, payload, now).await;
                } else {
                    self.emit(warn(EventKind::Exception, "SNAPSHOT without payload"));
                }
            }
            EventKind::Update => {
                if let EventPayload::Update(payload) = ev.payload.clone() {
                    self.handle_update(ev, payload, now).await;
                } else {
                    self.emit(warn(EventKind::Exception, "UPDATE without payload"));
                }
            }
            EventKind::HttpError => {
                let payload = match &ev.payload {
                    EventPayload::HttpError(p) => Some(p.clone()),
                    _ => None,
                };
                self.handle_http_error(ev, payload, now).await;
            }
            EventKind::End => {
                let payload = match &ev.payload {
                    EventPayload::End(p) => p.clone(),
                    _ => EndPayload::default(),
                };
                self.handle_end(ev, payload, now).await;
            }
            _ => self.emit(ev),
        }
    }

    /// Best-effort observability; a failed log write never breaks handling.
    async fn persist_event(&self, ev: &Event) {
        if let Err(e) = db::append_event(
            &self.pool,
            ev.level.as_str(),
            ev.kind.as_str(),
            &ev.message,
            ev.auction_id,
            ev.item_id,
        )
        .await
        {
            tracing::debug!("event log append failed: {e:#}");
        }
    }

    // -----------------------------------------------------------------
    // Auction / item resolution
    // -----------------------------------------------------------------

    async fn resolve_auction(&mut self, ext_id: &str, create: bool) -> Option<i64> {
        if !ext_id.is_empty() {
            if let Some(pk) = self.auction_pk_by_ext.get(ext_id) {
                return Some(*pk);
            }
            if let Ok(Some(pk)) = db::get_auction_id_by_ext(&self.pool, ext_id).await {
                self.auction_pk_by_ext.insert(ext_id.to_string(), pk);
                // A restarted engine must honor terminal state persisted by
                // a previous session.
                if let Ok(row) = db::fetch_auction(&self.pool, pk).await {
                    if row.state == "ENDED" {
                        self.ended_auctions.insert(pk);
                        self.stop_sent.insert(pk);
                    }
                }
                return Some(pk);
            }
            if create {
                if let Ok(pk) = db::upsert_auction(&self.pool, ext_id, "").await {
                    self.auction_pk_by_ext.insert(ext_id.to_string(), pk);
                    return Some(pk);
                }
            }
            return None;
        }

        // Events without an auction key: unambiguous only while exactly one
        // auction is being watched.
        if self.auction_pk_by_ext.len() == 1 {
            return self.auction_pk_by_ext.values().next().copied();
        }
        None
    }

    async fn resolve_item(
        &mut self,
        auction_pk: i64,
        local_id: &str,
        description: &str,
    ) -> Option<i64> {
        let key = (auction_pk, local_id.to_string());
        if let Some(pk) = self.item_pk_by_keys.get(&key) {
            return Some(*pk);
        }
        // Lazy creation covers UPDATEs that raced ahead of their SNAPSHOT.
        let desc = if description.is_empty() {
            "item without description"
        } else {
            description
        };
        match db::upsert_item(&self.pool, auction_pk, local_id, desc, None).await {
            Ok(pk) => {
                self.item_pk_by_keys.insert(key, pk);
                Some(pk)
            }
            Err(e) => {
                tracing::warn!("item upsert failed: {e:#}");
                None
            }
        }
    }

    async fn provider_id_for(&mut self, auction_pk: i64) -> Option<String> {
        if let Some(cached) = self.provider_id_cache.get(&auction_pk) {
            return cached.clone();
        }
        let loaded = db::get_mi_id_proveedor(&self.pool, auction_pk)
            .await
            .unwrap_or(None);
        self.provider_id_cache.insert(auction_pk, loaded.clone());
        loaded
    }

    // -----------------------------------------------------------------
    // SNAPSHOT
    // -----------------------------------------------------------------

    async fn handle_snapshot(&mut self, ev: Event, payload: SnapshotPayload, now: NaiveDateTime) {
        if payload.auction_ext_id.is_empty() {
            self.emit(warn(EventKind::Exception, "invalid SNAPSHOT: missing auction id"));
            return;
        }

        let auction_pk =
            match db::upsert_auction(&self.pool, &payload.auction_ext_id, &payload.url).await {
                Ok(pk) => pk,
                Err(e) => {
                    self.emit(warn(EventKind::Exception, format!("snapshot persist failed: {e:#}")));
                    return;
                }
            };
        self.auction_pk_by_ext
            .insert(payload.auction_ext_id.clone(), auction_pk);

        for item in &payload.items {
            if item.local_id.is_empty() {
                continue;
            }
            let text = item.text.trim();
            let pk = match db::upsert_item(
                &self.pool,
                auction_pk,
                &item.local_id,
                text,
                Some(payload.margin_string.as_str()),
            )
            .await
            {
                Ok(pk) => pk,
                Err(e) => {
                    tracing::warn!("snapshot item upsert failed: {e:#}");
                    continue;
                }
            };
            self.item_pk_by_keys
                .insert((auction_pk, item.local_id.clone()), pk);

            // Portal-sourced commercial inputs; a legacy capture may carry
            // the budget only in the `budget` slot.
            let reference_total = item.reference_total.or(item.budget);
            let reference_unit =
                costs::resolve_reference_unit(item.quantity, item.reference_unit, reference_total);

            if item.quantity.is_some() || reference_total.is_some() || reference_unit.is_some() {
                let patch = db::CommercialPatch {
                    quantity: item.quantity,
                    reference_total,
                    reference_unit,
                    updated_at: Self::iso(now),
                    ..Default::default()
                };
                if let Err(e) = db::upsert_item_commercial(&self.pool, pk, &patch).await {
                    tracing::warn!("snapshot commercial upsert failed: {e:#}");
                }
            }
        }

        let _ = db::set_auction_state(&self.pool, auction_pk, "RUNNING", None, None, Some(0), None)
            .await;
        self.err_streak.insert(auction_pk, 0);
        self.last_ok_at.remove(&auction_pk);
        // A fresh capture re-arms an auction that was previously cut.
        self.ended_auctions.remove(&auction_pk);
        self.stop_sent.remove(&auction_pk);

        self.emit(info(
            EventKind::Heartbeat,
            format!(
                "snapshot applied (auction_id={auction_pk}, items={})",
                payload.items.len()
            ),
        ));
        self.emit(ev.with_keys(Some(auction_pk), None));
    }

    // -----------------------------------------------------------------
    // UPDATE
    // -----------------------------------------------------------------

    async fn handle_update(&mut self, ev: Event, payload: UpdatePayload, now: NaiveDateTime) {
        if payload.local_id.is_empty() {
            self.emit(warn(EventKind::Exception, "invalid UPDATE: missing item id"));
            return;
        }

        let Some(auction_pk) = self
            .resolve_auction(&payload.auction_ext_id, true)
            .await
        else {
            self.agg.updates += 1;
            return;
        };

        // ENDED is terminal: the event stays in the log (already appended)
        // but no state transition happens.
        if self.ended_auctions.contains(&auction_pk) {
            self.agg.updates += 1;
            return;
        }

        let Some(item_pk) = self
            .resolve_item(auction_pk, &payload.local_id, &payload.description)
            .await
        else {
            return;
        };

        let ts = Self::iso(now);
        let _ = db::upsert_item_state(
            &self.pool,
            item_pk,
            &db::ItemStateWrite {
                best_offer_text: payload.best_offer_text.clone(),
                best_offer: payload.best_offer_value,
                offer_to_beat_text: payload.offer_to_beat_text.clone(),
                offer_to_beat: payload.offer_to_beat_value,
                budget_text: payload.budget_text.clone(),
                budget: payload.budget_value,
                portal_message: payload.portal_message.clone(),
                updated_at: ts.clone(),
            },
        )
        .await;

        self.last_ok_at.insert(auction_pk, now);
        self.err_streak.insert(auction_pk, 0);
        self.last_error_at.remove(&auction_pk);
        let _ = db::set_auction_state(
            &self.pool,
            auction_pk,
            "RUNNING",
            Some(&ts),
            Some(payload.transport_status as i64),
            Some(0),
            None,
        )
        .await;

        // Valid data again: fall back to the base cadence.
        if self.current_cadence > self.base_cadence {
            self.current_cadence = self.base_cadence;
            self.send_control(ControlAction::Backoff {
                seconds: self.base_cadence,
            });
        }

        let sig = format!(
            "{}|{}|{}",
            payload.best_offer_text, payload.offer_to_beat_text, payload.portal_message
        );
        let changed = self.last_sig.get(&item_pk) != Some(&sig);
        self.last_sig.insert(item_pk, sig);

        self.agg.updates += 1;
        if changed {
            self.agg.changed += 1;
        }

        // ---- derived commercial values --------------------------------
        let commercial = db::get_item_commercial(&self.pool, item_pk)
            .await
            .unwrap_or(None)
            .unwrap_or_default();

        let derived = costs::derive(&costs::DeriveInput {
            quantity: commercial.quantity,
            unit_cost_ars: commercial.unit_cost_ars,
            total_cost_ars: commercial.total_cost_ars,
            usd_rate: commercial.usd_rate,
            min_margin: commercial.min_margin,
            reference_total: commercial.reference_total,
            reference_unit: commercial.reference_unit,
            offer_to_beat_value: payload.offer_to_beat_value,
        });

        let config = db::get_item_config(&self.pool, item_pk)
            .await
            .unwrap_or(None);
        let follow = config.as_ref().map(|c| c.follow).unwrap_or(false);
        let my_bid_manual = config.as_ref().map(|c| c.my_bid).unwrap_or(false);
        let hide_below_threshold = config
            .as_ref()
            .map(|c| c.hide_below_threshold)
            .unwrap_or(self.cfg.default_hide_below_threshold);

        // The item's own margin drives the threshold; the per-item override
        // and the engine default only apply when no margin is loaded.
        let min_margin_pct = match commercial.min_margin {
            Some(m) => m * 100.0,
            None => config
                .as_ref()
                .and_then(|c| c.min_margin_pct)
                .unwrap_or(self.cfg.default_min_margin_pct),
        };

        // ---- auto-attribution and outbid edge -------------------------
        let provider_id = self.provider_id_for(auction_pk).await;
        let operator_is_best = match (&payload.best_provider_id, &provider_id) {
            (Some(best), Some(mine)) => best.trim() == mine.trim(),
            _ => false,
        };
        let my_bid = my_bid_manual || operator_is_best;

        let prev_auto = self.prev_best_auto.get(&item_pk).copied().unwrap_or(false);
        let outbid = prev_auto && !operator_is_best && changed && provider_id.is_some();
        self.prev_best_auto.insert(item_pk, operator_is_best);

        if outbid {
            let _ = db::append_event(
                &self.pool,
                "WARN",
                "OUTBID",
                &format!(
                    "outbid: item {} - your offer was beaten (best_id={})",
                    payload.local_id,
                    payload.best_provider_id.as_deref().unwrap_or("?")
                ),
                Some(auction_pk),
                Some(item_pk),
            )
            .await;
        }

        let tracked =
            follow || derived.total_cost_ars.is_some() || derived.unit_cost_ars.is_some();

        let decision = sbm_alerts::decide(&sbm_alerts::AlertInput {
            tracked,
            my_bid,
            my_bid_auto: operator_is_best,
            outbid,
            margin_pct: derived.margin_pct,
            min_margin_pct,
            hide_below_threshold,
            changed,
            transport_status: payload.transport_status,
            portal_message: &payload.portal_message,
        });

        let change_note = payload
            .last_offer_time
            .as_ref()
            .map(|t| format!("last offer: {t}"))
            .or_else(|| {
                (!payload.portal_message.is_empty()).then(|| payload.portal_message.clone())
            });

        let patch = db::CommercialPatch {
            unit_cost_ars: derived.unit_cost_ars,
            total_cost_ars: derived.total_cost_ars,
            unit_cost_usd: derived.unit_cost_usd,
            total_cost_usd: derived.total_cost_usd,
            acceptable_unit_price: derived.acceptable_unit_price,
            acceptable_total_price: derived.acceptable_total_price,
            reference_unit: derived.reference_unit_price,
            reference_margin: derived.reference_margin,
            unit_improvement_price: derived.unit_improvement_price,
            improvement_margin: derived.improvement_margin,
            offer_to_beat: payload.offer_to_beat_value,
            best_offer_text: (!payload.best_offer_text.is_empty())
                .then(|| payload.best_offer_text.clone()),
            change_note,
            updated_at: ts,
            ..Default::default()
        };
        if let Err(e) = db::upsert_item_commercial(&self.pool, item_pk, &patch).await {
            tracing::warn!("commercial upsert failed: {e:#}");
        }

        if changed {
            self.emit(info(
                EventKind::Heartbeat,
                format!(
                    "change item={} best={} to_beat={}",
                    payload.local_id, payload.best_offer_text, payload.offer_to_beat_text
                ),
            ));
        }

        let finished = payload.portal_message.to_lowercase().contains(END_TOKEN);
        let derived_update = DerivedUpdate {
            unit: commercial.unit.clone(),
            quantity: commercial.quantity,
            brand: commercial.brand.clone(),
            notes: commercial.notes.clone(),
            usd_rate: commercial.usd_rate,
            unit_cost_usd: derived.unit_cost_usd,
            total_cost_usd: derived.total_cost_usd,
            unit_cost_ars: derived.unit_cost_ars,
            total_cost_ars: derived.total_cost_ars,
            min_margin: commercial.min_margin,
            reference_total: commercial.reference_total,
            reference_unit_price: derived.reference_unit_price,
            reference_margin: derived.reference_margin,
            acceptable_unit_price: derived.acceptable_unit_price,
            acceptable_total_price: derived.acceptable_total_price,
            unit_improvement_price: derived.unit_improvement_price,
            improvement_margin: derived.improvement_margin,
            margin_pct: derived.margin_pct,
            change_note: patch.change_note.clone(),
            follow,
            my_bid,
            operator_is_best,
            outbid,
            min_margin_pct,
            hide_below_threshold,
            alert_style: decision.style.as_str().to_string(),
            sound: decision.sound.as_str().to_string(),
            highlight: decision.highlight,
            hide: decision.hide,
            decision_msg: decision.message,
            update: payload.clone(),
        };
        self.emit(
            Event::new(ev.level, EventKind::Update, ev.message.clone())
                .with_keys(Some(auction_pk), Some(item_pk))
                .with_payload(EventPayload::Derived(Box::new(derived_update))),
        );

        if finished {
            let end_ev = info(EventKind::End, "auction finished detected by message").with_payload(
                EventPayload::End(EndPayload {
                    auction_ext_id: payload.auction_ext_id.clone(),
                    local_id: Some(payload.local_id.clone()),
                    reason: Some(payload.portal_message.clone()),
                }),
            );
            let end_payload = EndPayload {
                auction_ext_id: payload.auction_ext_id,
                local_id: Some(payload.local_id),
                reason: Some(payload.portal_message),
            };
            self.handle_end(end_ev, end_payload, now).await;
        }
    }

    // -----------------------------------------------------------------
    // HTTP_ERROR
    // -----------------------------------------------------------------

    async fn handle_http_error(
        &mut self,
        ev: Event,
        payload: Option<HttpErrorPayload>,
        now: NaiveDateTime,
    ) {
        self.agg.http_error += 1;

        let (ext_id, status) = match &payload {
            Some(p) => (p.auction_ext_id.clone(), p.transport_status),
            None => (String::new(), 0),
        };

        let Some(auction_pk) = self.resolve_auction(&ext_id, false).await else {
            self.emit(ev);
            return;
        };

        // A parallel cycle can fail many requests at once; advance the
        // streak only once per coalescing window.
        let prev = self.err_streak.get(&auction_pk).copied().unwrap_or(0);
        let streak = match self.last_error_at.get(&auction_pk) {
            Some(last) if ((now - *last).num_milliseconds() as f64)
                < ERROR_COALESCE_WINDOW_S * 1000.0 =>
            {
                prev
            }
            _ => {
                self.last_error_at.insert(auction_pk, now);
                prev + 1
            }
        };
        self.err_streak.insert(auction_pk, streak);

        let last_ok = self.last_ok_at.get(&auction_pk).copied();
        let _ = db::set_auction_state(
            &self.pool,
            auction_pk,
            "ERROR",
            last_ok.map(Self::iso).as_deref(),
            Some(status as i64),
            Some(streak as i64),
            None,
        )
        .await;

        let decision = sbm_security::evaluate(
            &self.cfg.security,
            &SecurityInput {
                current_cadence: self.current_cadence,
                error_streak: streak,
                last_ok_at: last_ok,
                now,
                transport_status: status,
                message: &ev.message,
            },
        );

        let mut detail = format!(
            "HTTP={status} streak={streak} -> {:?} ({})",
            decision.action, decision.message
        );
        if decision.action == SecurityAction::Backoff {
            if let Some(new_cadence) = decision.new_cadence {
                detail = format!(
                    "{detail} cadence={:.2}s->{new_cadence:.2}s",
                    self.current_cadence
                );
            }
        }
        self.emit(
            warn(EventKind::HttpError, detail).with_keys(Some(auction_pk), None),
        );

        match decision.action {
            SecurityAction::Backoff => {
                if let Some(new_cadence) = decision.new_cadence {
                    if new_cadence > self.current_cadence {
                        self.current_cadence = new_cadence;
                        self.send_control(ControlAction::Backoff {
                            seconds: new_cadence,
                        });
                    }
                }
                self.emit(ev);
            }
            SecurityAction::Stop => {
                // The first cut transitions the auction; repeats are no-ops.
                if self.ended_auctions.insert(auction_pk) {
                    let _ = db::set_auction_state(
                        &self.pool,
                        auction_pk,
                        "ENDED",
                        None,
                        None,
                        None,
                        Some(&Self::iso(now)),
                    )
                    .await;
                    self.emit(
                        info(EventKind::End, "monitoring cut by security policy")
                            .with_keys(Some(auction_pk), None)
                            .with_payload(EventPayload::End(EndPayload {
                                auction_ext_id: ext_id,
                                local_id: payload.and_then(|p| p.local_id),
                                reason: Some(decision.message.clone()),
                            })),
                    );
                }
                if self.stop_sent.insert(auction_pk) {
                    self.send_control(ControlAction::Stop {
                        reason: decision.message,
                    });
                }
            }
            SecurityAction::Pause | SecurityAction::Alert => {
                self.emit(
                    warn(EventKind::Security, decision.message).with_keys(Some(auction_pk), None),
                );
                self.emit(ev);
            }
            SecurityAction::Continue => self.emit(ev),
        }
    }

    // -----------------------------------------------------------------
    // END
    // -----------------------------------------------------------------

    async fn handle_end(&mut self, ev: Event, payload: EndPayload, now: NaiveDateTime) {
        self.agg.end += 1;

        let Some(auction_pk) = self.resolve_auction(&payload.auction_ext_id, false).await else {
            self.emit(ev);
            return;
        };

        let key = (auction_pk, payload.local_id.clone().unwrap_or_default());
        if !self.ended_keys.insert(key) {
            return;
        }

        let _ = db::set_auction_state(
            &self.pool,
            auction_pk,
            "ENDED",
            None,
            None,
            None,
            Some(&Self::iso(now)),
        )
        .await;
        self.ended_auctions.insert(auction_pk);

        self.emit(info(
            EventKind::End,
            format!("auction marked ENDED (auction_id={auction_pk})"),
        ));
        if self.stop_sent.insert(auction_pk) {
            self.send_control(ControlAction::Stop {
                reason: payload.reason.clone().unwrap_or_else(|| "auction ended".into()),
            });
        }
        self.emit(ev.with_keys(Some(auction_pk), None));
    }

    // -----------------------------------------------------------------
    // Aggregated telemetry
    // -----------------------------------------------------------------

    /// Emit one aggregate heartbeat per window when anything happened. The
    /// first window after activity begins is warm-up and emits nothing.
    pub fn maybe_emit_aggregate(&mut self, now: NaiveDateTime) {
        if self.agg.total() == 0 {
            return;
        }
        let Some(last) = self.agg.last_emit else {
            self.agg.last_emit = Some(now);
            return;
        };
        if (now - last).num_seconds() < self.cfg.agg_window_seconds {
            return;
        }

        self.emit(info(
            EventKind::Heartbeat,
            format!(
                "summary {}s | updates={} | changed={} | http_error={} | end={}",
                self.cfg.agg_window_seconds,
                self.agg.updates,
                self.agg.changed,
                self.agg.http_error,
                self.agg.end
            ),
        ));
        self.agg.reset();
        self.agg.last_emit = Some(now);
    }
}
