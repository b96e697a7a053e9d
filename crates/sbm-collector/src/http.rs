//! Direct-HTTP monitor.
//!
//! Takes over the polling loop from the browser collector: same endpoint,
//! same events, but issued with a pooled HTTP/2 client that reuses the
//! session cookies the browser captured. An order of magnitude faster per
//! cycle than driving requests through the page.
//!
//! Re-authentication: after `auth_failures_max` consecutive 401/403/status-0
//! responses it emits a WARN EXCEPTION ("session expired") and stops itself
//! so the browser collector can re-capture.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use sbm_events::{
    info, warn, Event, EventKind, EventPayload, HttpErrorPayload, TransportErrorKind,
};

use crate::protocol::{self, ChangeTracker, OFFERS_ENDPOINT_PATH};
use crate::{CapturedSession, Collector, CollectorSignals};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpCollectorConfig {
    pub base_cadence_s: f64,
    pub relaxed_cadence_s: f64,
    pub intensive: bool,
    /// Parallel requests per cycle in intensive mode (1..=30).
    pub concurrent_requests: usize,
    pub timeout_intensive_s: f64,
    pub timeout_relaxed_s: f64,
    pub auth_failures_max: u32,
}

impl Default for HttpCollectorConfig {
    fn default() -> Self {
        Self {
            base_cadence_s: 1.0,
            relaxed_cadence_s: 1.0,
            intensive: true,
            concurrent_requests: 5,
            timeout_intensive_s: 2.5,
            timeout_relaxed_s: 5.0,
            auth_failures_max: 5,
        }
    }
}

impl HttpCollectorConfig {
    fn clamped(mut self) -> Self {
        self.base_cadence_s = self.base_cadence_s.max(crate::MIN_CADENCE_S);
        self.relaxed_cadence_s = self.relaxed_cadence_s.max(1.0);
        self.concurrent_requests = self.concurrent_requests.clamp(1, 30);
        self.timeout_intensive_s = self.timeout_intensive_s.max(0.5);
        self.timeout_relaxed_s = self.timeout_relaxed_s.max(1.0);
        self
    }
}

// ---------------------------------------------------------------------------
// Auth-failure tracking
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum AuthObservation {
    /// Valid response; counter reset.
    Reset,
    /// Auth-relevant failure counted, threshold not reached yet.
    Counted(u32),
    /// Threshold reached: the session is gone.
    Expired,
    /// Unrelated status; counter untouched.
    Ignored,
}

/// Counts consecutive 401/403/status-0 responses. Any 200 resets it.
#[derive(Debug)]
pub struct AuthTracker {
    consecutive: u32,
    max: u32,
}

impl AuthTracker {
    pub fn new(max: u32) -> Self {
        Self {
            consecutive: 0,
            max: max.max(1),
        }
    }

    pub fn observe_status(&mut self, status: u16) -> AuthObservation {
        match status {
            200 => {
                self.consecutive = 0;
                AuthObservation::Reset
            }
            401 | 403 | 0 => {
                self.consecutive += 1;
                if self.consecutive >= self.max {
                    AuthObservation::Expired
                } else {
                    AuthObservation::Counted(self.consecutive)
                }
            }
            _ => AuthObservation::Ignored,
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

pub struct HttpCollector {
    cfg: HttpCollectorConfig,
    session: CapturedSession,
    out: UnboundedSender<Event>,
    signals: Arc<CollectorSignals>,
}

enum FetchOutcome {
    Ok { d: String },
    Err { status: u16, kind: TransportErrorKind, message: String },
}

impl HttpCollector {
    pub fn new(
        cfg: HttpCollectorConfig,
        session: CapturedSession,
        out: UnboundedSender<Event>,
    ) -> Self {
        let cfg = cfg.clamped();
        let signals = Arc::new(CollectorSignals::new(
            cfg.base_cadence_s,
            cfg.relaxed_cadence_s,
            cfg.intensive,
        ));
        Self {
            cfg,
            session,
            out,
            signals,
        }
    }

    fn emit(out: &UnboundedSender<Event>, ev: Event) {
        let _ = out.send(ev);
    }

    /// `POST <auction_url>/BuscarOfertas`, auction URL sans query.
    fn endpoint_url(auction_url: &str) -> String {
        let base = auction_url.split('?').next().unwrap_or(auction_url);
        format!("{}/{}", base.trim_end_matches('/'), OFFERS_ENDPOINT_PATH)
    }

    fn origin_of(auction_url: &str) -> Option<String> {
        let url = reqwest::Url::parse(auction_url).ok()?;
        let host = url.host_str()?;
        Some(format!("{}://{}", url.scheme(), host))
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("es-AR,es;q=0.9"),
        );
        headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(
            reqwest::header::REFERER,
            HeaderValue::from_str(&self.session.auction_url).context("referer header")?,
        );
        if let Some(origin) = Self::origin_of(&self.session.auction_url) {
            headers.insert(
                reqwest::header::ORIGIN,
                HeaderValue::from_str(&origin).context("origin header")?,
            );
        }
        let cookie = self.session.cookie_header();
        if !cookie.is_empty() {
            headers.insert(
                reqwest::header::COOKIE,
                HeaderValue::from_str(&cookie).context("cookie header")?,
            );
        }

        reqwest::Client::builder()
            .default_headers(headers)
            // The portal frequently serves a self-signed certificate.
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(self.cfg.concurrent_requests)
            .connect_timeout(Duration::from_secs(3))
            .build()
            .context("build http client")
    }

    async fn fetch_one(
        client: &reqwest::Client,
        endpoint: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> FetchOutcome {
        let resp = client.post(endpoint).json(&body).timeout(timeout).send().await;
        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status == 200 {
                    // A 200 with an undecodable body degrades to an empty
                    // response (no offers), same as the portal's own "null".
                    let d = resp
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("d").and_then(|d| d.as_str()).map(str::to_string))
                        .unwrap_or_default();
                    FetchOutcome::Ok { d }
                } else {
                    let kind = if status == 401 || status == 403 {
                        TransportErrorKind::Auth
                    } else {
                        TransportErrorKind::Http
                    };
                    FetchOutcome::Err {
                        status,
                        kind,
                        message: format!("HTTP {status}"),
                    }
                }
            }
            Err(e) => {
                let (kind, message) = if e.is_timeout() {
                    (TransportErrorKind::Timeout, "timeout".to_string())
                } else if e.is_connect() {
                    (TransportErrorKind::Network, format!("network: {e}"))
                } else {
                    (TransportErrorKind::Unknown, format!("request: {e}"))
                };
                FetchOutcome::Err {
                    status: 0,
                    kind,
                    message,
                }
            }
        }
    }

    async fn run(
        cfg: HttpCollectorConfig,
        session: CapturedSession,
        out: UnboundedSender<Event>,
        signals: Arc<CollectorSignals>,
        client: reqwest::Client,
    ) {
        let endpoint = Self::endpoint_url(&session.auction_url);
        let mut tracker = ChangeTracker::default();
        let mut auth = AuthTracker::new(cfg.auth_failures_max);
        let mut cursor = 0usize;
        let mut tick = 0u64;

        Self::emit(
            &out,
            info(
                EventKind::Heartbeat,
                format!(
                    "direct monitor started: id_cot={} items={} cadence={:.1}s concurrency={}",
                    session.id_cot,
                    session.items.len(),
                    signals.cadence_s(),
                    cfg.concurrent_requests
                ),
            ),
        );

        'outer: while !signals.stop_requested() {
            let cycle_start = Instant::now();
            tick += 1;

            if tick % 10 == 1 {
                Self::emit(
                    &out,
                    info(
                        EventKind::Heartbeat,
                        format!("direct monitor tick={tick} items={}", session.items.len()),
                    ),
                );
            }

            let intensive = signals.intensive();
            let (cycle_items, timeout) = if intensive {
                (
                    session.items.clone(),
                    Duration::from_secs_f64(cfg.timeout_intensive_s),
                )
            } else {
                let item = session.items[cursor % session.items.len()].clone();
                cursor += 1;
                (vec![item], Duration::from_secs_f64(cfg.timeout_relaxed_s))
            };

            let semaphore = Arc::new(Semaphore::new(cfg.concurrent_requests));
            let fetches = cycle_items.iter().map(|item| {
                let client = &client;
                let endpoint = &endpoint;
                let semaphore = Arc::clone(&semaphore);
                let body =
                    protocol::offers_request_body(&session.id_cot, &item.local_id, &session.margin);
                async move {
                    let _permit = semaphore.acquire().await;
                    Self::fetch_one(client, endpoint, body, timeout).await
                }
            });
            let results = join_all(fetches).await;

            let mut updates = 0usize;
            let mut errors = 0usize;
            let mut timeouts = 0usize;

            for (item, outcome) in cycle_items.iter().zip(results) {
                if signals.stop_requested() {
                    break 'outer;
                }

                match outcome {
                    FetchOutcome::Ok { d } => {
                        auth.observe_status(200);
                        let parsed = protocol::parse_d_field(&d);
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

                        let finished = parsed
                            .message
                            .to_lowercase()
                            .contains(sbm_events::END_TOKEN);
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
                                .with_payload(EventPayload::End(sbm_events::EndPayload {
                                    auction_ext_id: session.id_cot.clone(),
                                    local_id: Some(item.local_id.clone()),
                                    reason: Some(parsed.message.clone()),
                                })),
                            );
                            break 'outer;
                        }
                    }
                    FetchOutcome::Err {
                        status,
                        kind,
                        message,
                    } => {
                        errors += 1;
                        if kind == TransportErrorKind::Timeout {
                            timeouts += 1;
                        }

                        Self::emit(
                            &out,
                            warn(
                                EventKind::HttpError,
                                format!("transport {status} item={} ({})", item.local_id, kind.as_str()),
                            )
                            .with_payload(EventPayload::HttpError(HttpErrorPayload {
                                auction_ext_id: session.id_cot.clone(),
                                local_id: Some(item.local_id.clone()),
                                transport_status: status,
                                error_kind: kind,
                                message: message.clone(),
                            })),
                        );

                        if auth.observe_status(status) == AuthObservation::Expired {
                            Self::emit(
                                &out,
                                warn(
                                    EventKind::Exception,
                                    format!(
                                        "session expired ({} consecutive auth failures); \
                                         re-capture with the browser collector",
                                        cfg.auth_failures_max
                                    ),
                                ),
                            );
                            break 'outer;
                        }
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
                        "cycle={tick} items={} updates={updates} errors={errors} timeouts={timeouts} \
                         dur={elapsed:.3}s cadence={effective:.2}s mode={}",
                        cycle_items.len(),
                        if intensive { "intensive" } else { "relaxed" }
                    ),
                ),
            );

            // Sliced sleep so a stop request never waits out a backed-off
            // cadence.
            let mut remaining = sleep_for;
            while remaining > 0.0 && !signals.stop_requested() {
                let step = remaining.min(0.1);
                tokio::time::sleep(Duration::from_secs_f64(step)).await;
                remaining -= step;
            }
        }

        signals.set_running(false);
        Self::emit(&out, info(EventKind::Stop, "direct monitor stopped"));
    }
}

impl Collector for HttpCollector {
    fn name(&self) -> &'static str {
        "direct-http"
    }

    fn start(&self) -> Result<()> {
        if self.signals.is_running() {
            return Ok(());
        }
        if self.session.id_cot.is_empty() || self.session.items.is_empty() {
            anyhow::bail!("direct monitor needs a captured session (id_cot + items)");
        }

        let client = self.build_client()?;
        self.signals.reset_for_start();

        let cfg = self.cfg.clone();
        let session = self.session.clone();
        let out = self.out.clone();
        let signals = Arc::clone(&self.signals);

        Self::emit(&self.out, info(EventKind::Start, "direct monitor starting"));
        tokio::spawn(Self::run(cfg, session, out, signals, client));
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
