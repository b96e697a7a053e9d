//! Browser-driven collector.
//!
//! Phase 1 (capture) is operator-triggered: the operator logs in and opens
//! the auction in the driven browser, then asks for a capture. The collector
//! waits for the item selector to populate, reads the minimum-margin field,
//! enriches the item list from the detail grid, extracts `id_cot` from the
//! page HTML and emits a SNAPSHOT.
//!
//! Phase 2 (monitor) polls the offers XHR from inside the page, batched and
//! parallel within each batch, so the ASP.NET session and anti-forgery
//! tokens of the live document are reused. The captured cookie jar is also
//! published for the direct-HTTP collector to take over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fantoccini::{Client, ClientBuilder, Locator};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use sbm_events::{
    error, info, warn, EndPayload, Event, EventKind, EventPayload, HttpErrorPayload,
    SnapshotPayload, TransportErrorKind, END_TOKEN,
};

use crate::matching::{self, SelectOption};
use crate::protocol::{self, ChangeTracker};
use crate::{CapturedItem, CapturedSession, Collector, CollectorSignals, SessionSlot};

const SEL_ITEM_SELECT: &str = "#ddlItemRenglon";
const SEL_MIN_MARGIN: &str = "#txtMargenMinimo";

/// Runs all fetches of one batch in parallel inside the page. WebDriver
/// awaits the returned promise.
const JS_FETCH_BATCH: &str = r#"
const batch = arguments[0];
const endpoint = arguments[1];
const run = async () => {
    const tasks = batch.map(async (p) => {
        try {
            const r = await fetch(endpoint, {
                method: "POST",
                headers: {
                    "Content-Type": "application/json; charset=UTF-8",
                    "X-Requested-With": "XMLHttpRequest"
                },
                body: JSON.stringify(p)
            });
            let j = null;
            try { j = await r.json(); } catch (_e) { j = null; }
            return { status: r.status, json: j };
        } catch (e) {
            return { status: 0, json: null, error: String(e || "fetch_error") };
        }
    });
    return await Promise.all(tasks);
};
return run();
"#;

const JS_OPTION_COUNT: &str =
    "return document.querySelectorAll('#ddlItemRenglon option').length;";

const JS_READ_OPTIONS: &str = "return Array.from(document.querySelectorAll('#ddlItemRenglon option'))\
     .map(o => ({value: o.value, text: (o.textContent || '').trim()}));";

const JS_READ_DETAIL_CELLS: &str = "return Array.from(document.querySelectorAll(\
     '#gvDetalleCotizacion tr.Renglon, #gvDetalleCotizacion tr.RenglonAlternativo'))\
     .map(r => Array.from(r.querySelectorAll('td')).map(td => (td.textContent || '').trim()));";

#[derive(Debug, Clone)]
pub struct BrowserCollectorConfig {
    /// WebDriver endpoint (chromedriver/geckodriver) the operator runs.
    pub webdriver_url: String,
    /// Opportunity listing opened at startup so the operator can navigate.
    pub listing_url: String,
    /// URL fragment that identifies an open auction page.
    pub auction_url_part: String,
    pub base_cadence_s: f64,
    pub relaxed_cadence_s: f64,
    pub intensive: bool,
    /// Seconds to wait for the operator to be on an auction page.
    pub capture_wait_s: u64,
    /// Seconds to wait for the item selector to populate.
    pub selector_wait_s: u64,
}

impl Default for BrowserCollectorConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".into(),
            listing_url:
                "https://webecommerce.cba.gov.ar/VistaPublica/OportunidadProveedores.aspx".into(),
            auction_url_part: "SubastaVivoAccesoPublico.aspx".into(),
            base_cadence_s: 1.0,
            relaxed_cadence_s: 10.0,
            intensive: true,
            capture_wait_s: 60,
            selector_wait_s: 30,
        }
    }
}

#[derive(Debug)]
enum BrowserCommand {
    CaptureCurrent,
    OpenListing,
    StopMonitor,
}

pub struct BrowserCollector {
    cfg: BrowserCollectorConfig,
    out: UnboundedSender<Event>,
    signals: Arc<CollectorSignals>,
    session_slot: Arc<SessionSlot>,
    cmd_tx: UnboundedSender<BrowserCommand>,
    cmd_rx: Arc<Mutex<Option<UnboundedReceiver<BrowserCommand>>>>,
}

#[derive(Debug, Deserialize)]
struct RawOption {
    #[serde(default)]
    value: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct BatchResult {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    json: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl BrowserCollector {
    pub fn new(cfg: BrowserCollectorConfig, out: UnboundedSender<Event>) -> Self {
        let signals = Arc::new(CollectorSignals::new(
            cfg.base_cadence_s.max(crate::MIN_CADENCE_S),
            cfg.relaxed_cadence_s,
            cfg.intensive,
        ));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            out,
            signals,
            session_slot: Arc::new(SessionSlot::default()),
            cmd_tx,
            cmd_rx: Arc::new(Mutex::new(Some(cmd_rx))),
        }
    }

    /// Operator command: capture the auction currently open in the browser.
    pub fn capture_current(&self) {
        let _ = self.cmd_tx.send(BrowserCommand::CaptureCurrent);
    }

    /// Operator command: navigate back to the opportunity listing.
    pub fn open_listing(&self) {
        let _ = self.cmd_tx.send(BrowserCommand::OpenListing);
    }

    /// Operator command: pause monitoring without tearing the browser down.
    pub fn stop_monitor(&self) {
        let _ = self.cmd_tx.send(BrowserCommand::StopMonitor);
    }

    /// Cookie jar + identity captured by the last successful capture, for
    /// the direct-HTTP takeover.
    pub fn captured_session(&self) -> Option<CapturedSession> {
        self.session_slot.get()
    }

    fn emit(out: &UnboundedSender<Event>, ev: Event) {
        let _ = out.send(ev);
    }

    async fn connect(cfg: &BrowserCollectorConfig) -> Result<Client> {
        let mut caps = serde_json::Map::new();
        // The portal frequently serves a self-signed certificate.
        caps.insert("acceptInsecureCerts".into(), Value::Bool(true));

        ClientBuilder::native()
            .capabilities(caps)
            .connect(&cfg.webdriver_url)
            .await
            .with_context(|| format!("webdriver connect {}", cfg.webdriver_url))
    }

    async fn run(
        cfg: BrowserCollectorConfig,
        out: UnboundedSender<Event>,
        signals: Arc<CollectorSignals>,
        session_slot: Arc<SessionSlot>,
        cmd_slot: Arc<Mutex<Option<UnboundedReceiver<BrowserCommand>>>>,
        mut cmd_rx: UnboundedReceiver<BrowserCommand>,
    ) {
        let client = match Self::connect(&cfg).await {
            Ok(c) => c,
            Err(e) => {
                Self::emit(&out, error(EventKind::Exception, format!("browser session failed: {e:#}")));
                signals.set_running(false);
                *cmd_slot.lock().expect("cmd slot poisoned") = Some(cmd_rx);
                return;
            }
        };

        match client.goto(&cfg.listing_url).await {
            Ok(()) => Self::emit(
                &out,
                info(EventKind::Heartbeat, format!("listing open: {}", cfg.listing_url)),
            ),
            Err(e) => Self::emit(
                &out,
                error(EventKind::Exception, format!("could not open listing: {e}")),
            ),
        }

        let mut monitor: Option<(JoinHandle<()>, Arc<AtomicBool>)> = None;
        let mut tick = 0u64;

        while !signals.stop_requested() {
            tick += 1;
            let cmd = tokio::time::timeout(Duration::from_millis(100), cmd_rx.recv()).await;
            let cmd = match cmd {
                Err(_) => {
                    if tick % 100 == 1 {
                        Self::emit(&out, info(EventKind::Heartbeat, "collector alive (idle)"));
                    }
                    continue;
                }
                Ok(None) => break,
                Ok(Some(cmd)) => cmd,
            };

            match cmd {
                BrowserCommand::OpenListing => {
                    if let Err(e) = client.goto(&cfg.listing_url).await {
                        Self::emit(
                            &out,
                            error(EventKind::Exception, format!("error opening listing: {e}")),
                        );
                    }
                }
                BrowserCommand::StopMonitor => {
                    Self::halt_monitor(&mut monitor).await;
                    Self::emit(&out, info(EventKind::Stop, "monitoring paused by operator"));
                }
                BrowserCommand::CaptureCurrent => {
                    Self::halt_monitor(&mut monitor).await;

                    match Self::capture(&client, &cfg, &signals).await {
                        Ok((session, snapshot)) => {
                            Self::emit(
                                &out,
                                info(EventKind::Snapshot, "auction captured")
                                    .with_payload(EventPayload::Snapshot(snapshot)),
                            );
                            session_slot.put(session.clone());

                            let flag = Arc::new(AtomicBool::new(false));
                            let handle = tokio::spawn(Self::monitor_loop(
                                client.clone(),
                                out.clone(),
                                Arc::clone(&signals),
                                Arc::clone(&flag),
                                session,
                            ));
                            monitor = Some((handle, flag));
                            Self::emit(&out, info(EventKind::Heartbeat, "monitoring started"));
                        }
                        Err(e) => {
                            Self::emit(
                                &out,
                                warn(EventKind::Exception, format!("capture failed: {e:#}")),
                            );
                        }
                    }
                }
            }
        }

        Self::halt_monitor(&mut monitor).await;
        let _ = client.close().await;
        signals.set_running(false);
        // Hand the command queue back so a later start() can relaunch.
        *cmd_slot.lock().expect("cmd slot poisoned") = Some(cmd_rx);
        Self::emit(&out, info(EventKind::Stop, "browser collector stopped"));
    }

    async fn halt_monitor(monitor: &mut Option<(JoinHandle<()>, Arc<AtomicBool>)>) {
        if let Some((handle, flag)) = monitor.take() {
            flag.store(true, Ordering::SeqCst);
            let _ = handle.await;
        }
    }

    // -----------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------

    async fn capture(
        client: &Client,
        cfg: &BrowserCollectorConfig,
        signals: &CollectorSignals,
    ) -> Result<(CapturedSession, SnapshotPayload)> {
        // The operator may still be navigating; give them up to a minute.
        let mut on_auction = false;
        for _ in 0..cfg.capture_wait_s * 10 {
            if signals.stop_requested() {
                return Err(anyhow!("stopped during capture"));
            }
            let url = client.current_url().await.context("current_url")?;
            if url.as_str().contains(&cfg.auction_url_part) {
                on_auction = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !on_auction {
            return Err(anyhow!("not on an auction page (URL mismatch)"));
        }

        // Item selector must exist and have options.
        let mut populated = false;
        for _ in 0..cfg.selector_wait_s * 10 {
            let count = client
                .execute(JS_OPTION_COUNT, vec![])
                .await
                .ok()
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            if count > 0 {
                populated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !populated {
            return Err(anyhow!("item selector {SEL_ITEM_SELECT} never populated"));
        }

        let margin = match client.find(Locator::Css(SEL_MIN_MARGIN)).await {
            Ok(el) => el.prop("value").await.ok().flatten().unwrap_or_default(),
            Err(_) => String::new(),
        };

        let raw_options: Vec<RawOption> = serde_json::from_value(
            client
                .execute(JS_READ_OPTIONS, vec![])
                .await
                .context("read selector options")?,
        )
        .context("decode selector options")?;
        let options: Vec<SelectOption> = raw_options
            .into_iter()
            .filter(|o| !o.value.is_empty())
            .map(|o| SelectOption {
                value: o.value,
                text: o.text,
            })
            .collect();

        let detail_cells: Vec<Vec<String>> = client
            .execute(JS_READ_DETAIL_CELLS, vec![])
            .await
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let detail_rows = matching::parse_detail_rows(&detail_cells);
        let items = matching::enrich_options(&options, &detail_rows);

        let html = client.source().await.context("page source")?;
        let id_cot = extract_id_cotizacion(&html)
            .ok_or_else(|| anyhow!("could not find id_Cotizacion in page HTML"))?;

        let url = client.current_url().await.context("current_url")?;
        let cookies = client
            .get_all_cookies()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();

        let session = CapturedSession {
            id_cot: id_cot.clone(),
            margin: margin.clone(),
            auction_url: url.to_string(),
            items: items
                .iter()
                .map(|i| CapturedItem {
                    local_id: i.local_id.clone(),
                    text: i.text.clone(),
                })
                .collect(),
            cookies,
        };
        let snapshot = SnapshotPayload {
            auction_ext_id: id_cot,
            margin_string: margin,
            url: url.to_string(),
            items,
        };
        Ok((session, snapshot))
    }

    // -----------------------------------------------------------------
    // Monitor (in-page fetch)
    // -----------------------------------------------------------------

    async fn monitor_loop(
        client: Client,
        out: UnboundedSender<Event>,
        signals: Arc<CollectorSignals>,
        halt: Arc<AtomicBool>,
        session: CapturedSession,
    ) {
        if session.id_cot.is_empty() || session.items.is_empty() {
            Self::emit(
                &out,
                error(EventKind::Exception, "monitor cannot start: nothing captured"),
            );
            return;
        }

        // Large auctions poll in big in-page batches instead of sequential
        // rounds; the endpoint is relative so the page context resolves it.
        let batch_size = session.items.len().clamp(10, 80);
        let endpoint = format!(
            "{}/{}",
            session
                .auction_url
                .split('?')
                .next()
                .unwrap_or(&session.auction_url)
                .rsplit('/')
                .next()
                .unwrap_or_default(),
            protocol::OFFERS_ENDPOINT_PATH
        );

        let mut tracker = ChangeTracker::default();
        let mut cursor = 0usize;
        let mut tick = 0u64;

        Self::emit(
            &out,
            info(
                EventKind::Heartbeat,
                format!(
                    "monitor active: id_cot={} cadence={:.2}s",
                    session.id_cot,
                    signals.cadence_s()
                ),
            ),
        );

        let stopping = || signals.stop_requested() || halt.load(Ordering::SeqCst);

        'outer: while !stopping() {
            let cycle_start = Instant::now();
            tick += 1;

            if tick % 10 == 1 {
                Self::emit(
                    &out,
                    info(
                        EventKind::Heartbeat,
                        format!("monitor tick={tick} items={}", session.items.len()),
                    ),
                );
            }

            let cycle_items: Vec<&CapturedItem> = if signals.intensive() {
                session.items.iter().collect()
            } else {
                let item = &session.items[cursor % session.items.len()];
                cursor += 1;
                vec![item]
            };

            let mut updates = 0usize;
            let mut batches = 0usize;

            for chunk in cycle_items.chunks(batch_size) {
                if stopping() {
                    break 'outer;
                }
                batches += 1;

                let payloads: Vec<Value> = chunk
                    .iter()
                    .map(|item| {
                        protocol::offers_request_body(
                            &session.id_cot,
                            &item.local_id,
                            &session.margin,
                        )
                    })
                    .collect();

                let raw = match client
                    .execute(JS_FETCH_BATCH, vec![Value::Array(payloads), json!(endpoint)])
                    .await
                {
                    Ok(v) => v,
                    Err(e) => {
                        let msg = e.to_string().to_lowercase();
                        if msg.contains("closed") || msg.contains("no such window") {
                            Self::emit(
                                &out,
                                warn(
                                    EventKind::Stop,
                                    "page closed during monitoring; reopen and re-capture",
                                ),
                            );
                            return;
                        }
                        Self::emit(
                            &out,
                            error(EventKind::Exception, format!("batch fetch failed: {e}")),
                        );
                        continue;
                    }
                };
                let results: Vec<BatchResult> =
                    serde_json::from_value(raw).unwrap_or_default();

                for (item, res) in chunk.iter().zip(results) {
                    if res.status != 200 {
                        let (kind, message) = if res.status == 0 {
                            let text = res.error.unwrap_or_else(|| "fetch error".into());
                            let lowered = text.to_lowercase();
                            let kind = if lowered.contains("timeout") || lowered.contains("abort") {
                                TransportErrorKind::Timeout
                            } else {
                                TransportErrorKind::Unknown
                            };
                            (kind, text)
                        } else if res.status == 401 || res.status == 403 {
                            (TransportErrorKind::Auth, format!("HTTP {}", res.status))
                        } else {
                            (TransportErrorKind::Http, format!("HTTP {}", res.status))
                        };
                        Self::emit(
                            &out,
                            warn(
                                EventKind::HttpError,
                                format!(
                                    "offers fetch {} item={} ({})",
                                    res.status,
                                    item.local_id,
                                    kind.as_str()
                                ),
                            )
                            .with_payload(EventPayload::HttpError(HttpErrorPayload {
                                auction_ext_id: session.id_cot.clone(),
                                local_id: Some(item.local_id.clone()),
                                transport_status: res.status,
                                error_kind: kind,
                                message,
                            })),
                        );
                        continue;
                    }

                    let d = res
                        .json
                        .as_ref()
                        .and_then(|j| j.get("d"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let parsed = protocol::parse_d_field(d);
                    let changed = tracker.observe(&item.local_id, &parsed);

                    if changed {
                        Self::emit(
                            &out,
                            info(
                                EventKind::Heartbeat,
                                format!(
                                    "change item={} best={} to_beat={}",
                                    item.local_id, parsed.best_text, parsed.offer_to_beat_text
                                ),
                            ),
                        );
                    }

                    let finished = parsed.message.to_lowercase().contains(END_TOKEN);
                    let payload = protocol::update_payload(
                        &session.id_cot,
                        &item.local_id,
                        &item.text,
                        &parsed,
                        changed,
                        200,
                    );
                    Self::emit(
                        &out,
                        info(EventKind::Update, format!("update item {}", item.local_id))
                            .with_payload(EventPayload::Update(payload)),
                    );
                    updates += 1;

                    if finished {
                        Self::emit(
                            &out,
                            info(
                                EventKind::End,
                                format!("auction finished (item={})", item.local_id),
                            )
                            .with_payload(EventPayload::End(EndPayload {
                                auction_ext_id: session.id_cot.clone(),
                                local_id: Some(item.local_id.clone()),
                                reason: Some(parsed.message.clone()),
                            })),
                        );
                        return;
                    }
                }
            }

            let elapsed = cycle_start.elapsed().as_secs_f64();
            let effective = signals.effective_cadence_s();
            let sleep_for = (effective - elapsed).max(0.0);

            Self::emit(
                &out,
                info(
                    EventKind::Heartbeat,
                    format!(
                        "cycle={tick} items={} updates={updates} batches={batches} \
                         dur={elapsed:.3}s cadence={effective:.2}s mode={}",
                        session.items.len(),
                        if signals.intensive() { "intensive" } else { "relaxed" }
                    ),
                ),
            );

            // Sliced sleep so pause/stop requests take effect promptly even
            // in relaxed mode.
            let mut remaining = sleep_for;
            while remaining > 0.0 && !stopping() {
                let step = remaining.min(0.1);
                tokio::time::sleep(Duration::from_secs_f64(step)).await;
                remaining -= step;
            }
        }

        Self::emit(&out, info(EventKind::Stop, "monitoring stopped"));
    }
}

/// Extract `id_Cotizacion` from the page HTML. Historic shape:
/// `Cargar_Parametro("id_Cotizacion",'21941'`.
pub fn extract_id_cotizacion(html: &str) -> Option<String> {
    let re = Regex::new(r#"Cargar_Parametro\(\s*"id_Cotizacion"\s*,\s*'(\d+)'"#).ok()?;
    re.captures(html).map(|c| c[1].to_string())
}

impl Collector for BrowserCollector {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn start(&self) -> Result<()> {
        if self.signals.is_running() {
            return Ok(());
        }
        let cmd_rx = self
            .cmd_rx
            .lock()
            .expect("cmd_rx poisoned")
            .take()
            .ok_or_else(|| anyhow!("browser worker still shutting down; retry start"))?;

        self.signals.reset_for_start();
        Self::emit(&self.out, info(EventKind::Start, "browser collector starting"));

        tokio::spawn(Self::run(
            self.cfg.clone(),
            self.out.clone(),
            Arc::clone(&self.signals),
            Arc::clone(&self.session_slot),
            Arc::clone(&self.cmd_rx),
            cmd_rx,
        ));
        Ok(())
    }

    fn stop(&self) {
        if !self.signals.is_running() {
            return;
        }
        self.signals.request_stop();
        Self::emit(&self.out, info(EventKind::Stop, "stop requested"));
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

    #[test]
    fn extracts_id_cotizacion_from_html() {
        let html = r#"<script>Cargar_Parametro("id_Cotizacion",'21941');</script>"#;
        assert_eq!(extract_id_cotizacion(html).as_deref(), Some("21941"));

        let spaced = r#"Cargar_Parametro( "id_Cotizacion" , '22053'"#;
        assert_eq!(extract_id_cotizacion(spaced).as_deref(), Some("22053"));

        assert_eq!(extract_id_cotizacion("<html></html>"), None);
    }

    #[test]
    fn restart_needs_fresh_queue_only_once() {
        // The command receiver is taken on first start; the facade keeps
        // accepting commands across monitor restarts without a new queue.
        let (tx, _rx) = mpsc::unbounded_channel();
        let c = BrowserCollector::new(BrowserCollectorConfig::default(), tx);
        assert!(!c.is_running());
        c.capture_current();
        c.stop_monitor();
        assert!(c.captured_session().is_none());
    }
}
