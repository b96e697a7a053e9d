//! Runtime orchestration: collector -> engine -> consumer, wired through
//! queues, plus the control path back to the collector.
//!
//! Three concurrent roles: the collector owns its own worker concurrency;
//! the engine loop is a single task pulling one event at a time; the control
//! router services BACKOFF/STOP actions. The stop signal is observed between
//! events, and `stop()` joins the engine loop, so nothing writes to the
//! event log after it returns.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::SqlitePool;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sbm_collector::browser::{BrowserCollector, BrowserCollectorConfig};
use sbm_collector::http::{HttpCollector, HttpCollectorConfig};
use sbm_collector::mock::{MockCollector, Scenario};
use sbm_collector::Collector;
use sbm_db as db;
use sbm_engine::{Engine, EngineConfig};
use sbm_events::{info, ControlAction, Event, EventKind};
use sbm_util::{now_iso, now_naive};

/// Poll timeout of the engine loop between stop-signal checks.
const ENGINE_POLL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    Logs,
    States,
    All,
}

impl FromStr for CleanupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "logs" => Ok(CleanupMode::Logs),
            "states" => Ok(CleanupMode::States),
            "all" => Ok(CleanupMode::All),
            other => Err(anyhow!("invalid cleanup mode: {other}")),
        }
    }
}

enum EngineCommand {
    SetBaseCadence(f64),
    SetCurrentCadence(f64),
    RefreshProviderId(i64),
}

/// Everything the engine loop owns; handed back when the loop exits so a
/// later `start()` can resume with state and queues intact.
struct EngineLoopParts {
    engine: Engine,
    in_rx: UnboundedReceiver<Event>,
    cmd_rx: UnboundedReceiver<EngineCommand>,
}

struct ControlLoopParts {
    control_rx: UnboundedReceiver<ControlAction>,
}

pub struct Runtime {
    pool: SqlitePool,
    base_cadence_s: f64,

    collector_out_tx: UnboundedSender<Event>,
    engine_out_tx: UnboundedSender<Event>,
    engine_out_rx: Option<UnboundedReceiver<Event>>,
    engine_cmd_tx: UnboundedSender<EngineCommand>,

    collector: Arc<Mutex<Option<Arc<dyn Collector>>>>,
    browser: Option<Arc<BrowserCollector>>,

    stop_tx: watch::Sender<bool>,
    engine_parts: Option<EngineLoopParts>,
    control_parts: Option<ControlLoopParts>,
    engine_task: Option<JoinHandle<EngineLoopParts>>,
    control_task: Option<JoinHandle<ControlLoopParts>>,
}

impl Runtime {
    pub fn new(pool: SqlitePool, engine_cfg: EngineConfig, base_cadence_s: f64) -> Self {
        let (collector_out_tx, collector_out_rx) = mpsc::unbounded_channel();
        let (engine_out_tx, engine_out_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (engine_cmd_tx, engine_cmd_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        let mut engine = Engine::new(pool.clone(), engine_out_tx.clone(), control_tx, engine_cfg);
        engine.set_base_cadence(base_cadence_s);
        engine.set_current_cadence(base_cadence_s);

        Self {
            pool,
            base_cadence_s,
            collector_out_tx,
            engine_out_tx,
            engine_out_rx: Some(engine_out_rx),
            engine_cmd_tx,
            collector: Arc::new(Mutex::new(None)),
            browser: None,
            stop_tx,
            engine_parts: Some(EngineLoopParts {
                engine,
                in_rx: collector_out_rx,
                cmd_rx: engine_cmd_rx,
            }),
            control_parts: Some(ControlLoopParts { control_rx }),
            engine_task: None,
            control_task: None,
        }
    }

    /// Sender the collectors publish into; used when wiring a collector
    /// that the runtime did not build itself.
    pub fn collector_sender(&self) -> UnboundedSender<Event> {
        self.collector_out_tx.clone()
    }

    /// The processed event stream for the operator surface. Single consumer.
    pub fn take_output(&mut self) -> Option<UnboundedReceiver<Event>> {
        self.engine_out_rx.take()
    }

    pub fn install_collector(&self, collector: Arc<dyn Collector>) {
        *self.collector.lock().expect("collector slot poisoned") = Some(collector);
    }

    pub fn install_mock(&self, scenario: Scenario) -> Arc<MockCollector> {
        let mock = Arc::new(MockCollector::new(scenario, self.collector_sender()));
        self.install_collector(mock.clone());
        mock
    }

    pub fn install_browser(&mut self, cfg: BrowserCollectorConfig) -> Arc<BrowserCollector> {
        let browser = Arc::new(BrowserCollector::new(cfg, self.collector_sender()));
        self.browser = Some(browser.clone());
        self.install_collector(browser.clone());
        browser
    }

    fn active_collector(&self) -> Option<Arc<dyn Collector>> {
        self.collector.lock().expect("collector slot poisoned").clone()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Spawn the engine loop and the control router, then start the
    /// collector. Idempotent while running; restartable after `stop()`.
    pub fn start(&mut self) -> Result<()> {
        if self.engine_task.is_some() {
            return Ok(());
        }
        let engine_parts = self
            .engine_parts
            .take()
            .ok_or_else(|| anyhow!("engine loop already running"))?;
        let control_parts = self
            .control_parts
            .take()
            .ok_or_else(|| anyhow!("control loop already running"))?;

        let _ = self.stop_tx.send(false);

        self.engine_task = Some(tokio::spawn(Self::engine_loop(
            engine_parts,
            self.stop_tx.subscribe(),
            self.engine_out_tx.clone(),
        )));
        self.control_task = Some(tokio::spawn(Self::control_loop(
            control_parts,
            self.stop_tx.subscribe(),
            Arc::clone(&self.collector),
        )));

        let _ = self
            .engine_out_tx
            .send(info(EventKind::Start, "runtime started"));

        self.start_collector();
        Ok(())
    }

    /// Signal stop, halt the collector, and join both loops. After this
    /// returns the engine has written its last event-log row.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);

        if let Some(collector) = self.active_collector() {
            collector.stop();
        }

        if let Some(task) = self.engine_task.take() {
            if let Ok(parts) = task.await {
                self.engine_parts = Some(parts);
            }
        }
        if let Some(task) = self.control_task.take() {
            if let Ok(parts) = task.await {
                self.control_parts = Some(parts);
            }
        }

        let _ = self
            .engine_out_tx
            .send(info(EventKind::Stop, "runtime stopped"));
    }

    async fn engine_loop(
        mut parts: EngineLoopParts,
        stop_rx: watch::Receiver<bool>,
        engine_out_tx: UnboundedSender<Event>,
    ) -> EngineLoopParts {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            while let Ok(cmd) = parts.cmd_rx.try_recv() {
                match cmd {
                    EngineCommand::SetBaseCadence(s) => parts.engine.set_base_cadence(s),
                    EngineCommand::SetCurrentCadence(s) => parts.engine.set_current_cadence(s),
                    EngineCommand::RefreshProviderId(pk) => parts.engine.refresh_provider_id(pk),
                }
            }

            match tokio::time::timeout(
                Duration::from_millis(ENGINE_POLL_MS),
                parts.in_rx.recv(),
            )
            .await
            {
                Ok(Some(ev)) => parts.engine.handle(ev).await,
                Ok(None) => break,
                Err(_) => {}
            }

            parts.engine.maybe_emit_aggregate(now_naive());
        }

        let _ = engine_out_tx.send(info(EventKind::Stop, "engine loop stopped"));
        parts
    }

    async fn control_loop(
        mut parts: ControlLoopParts,
        mut stop_rx: watch::Receiver<bool>,
        collector: Arc<Mutex<Option<Arc<dyn Collector>>>>,
    ) -> ControlLoopParts {
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                action = parts.control_rx.recv() => {
                    let Some(action) = action else { break };
                    let active = collector.lock().expect("collector slot poisoned").clone();
                    match action {
                        ControlAction::Backoff { seconds } => {
                            tracing::info!("control: cadence -> {seconds:.2}s");
                            if let Some(c) = active {
                                c.set_cadence(seconds);
                            }
                        }
                        ControlAction::Stop { reason } => {
                            tracing::warn!("control: stop collector ({reason})");
                            if let Some(c) = active {
                                c.stop();
                            }
                        }
                    }
                }
            }
        }
        parts
    }

    // -----------------------------------------------------------------
    // Operator controls
    // -----------------------------------------------------------------

    pub fn start_collector(&self) {
        if let Some(collector) = self.active_collector() {
            if let Err(e) = collector.start() {
                let _ = self.engine_out_tx.send(info(
                    EventKind::Exception,
                    format!("collector could not start: {e:#}"),
                ));
            }
        }
    }

    pub fn stop_collector(&self) {
        if let Some(collector) = self.active_collector() {
            collector.stop();
        }
    }

    pub fn collector_running(&self) -> bool {
        self.active_collector().map(|c| c.is_running()).unwrap_or(false)
    }

    /// Browser-mode only: capture the auction currently open.
    pub fn capture_current(&self) -> Result<()> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| anyhow!("capture requires the browser collector"))?;
        browser.capture_current();
        Ok(())
    }

    /// Operator-set cadence: collector and engine both track the new base.
    pub fn set_cadence(&mut self, seconds: f64) {
        self.base_cadence_s = seconds.max(0.2);
        if let Some(collector) = self.active_collector() {
            collector.set_cadence(seconds);
        }
        let _ = self.engine_cmd_tx.send(EngineCommand::SetBaseCadence(seconds));
        let _ = self
            .engine_cmd_tx
            .send(EngineCommand::SetCurrentCadence(seconds));
    }

    pub fn base_cadence(&self) -> f64 {
        self.base_cadence_s
    }

    pub fn set_intensive(&self, enabled: bool) {
        if let Some(collector) = self.active_collector() {
            collector.set_intensive(enabled);
        }
    }

    /// Hand the polling loop to the direct-HTTP collector using the session
    /// the browser captured. The browser keeps running for re-capture.
    pub fn set_direct_http_mode(&self, cfg: HttpCollectorConfig) -> Result<()> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| anyhow!("direct mode requires a prior browser capture"))?;
        let session = browser
            .captured_session()
            .ok_or_else(|| anyhow!("no captured session yet; run capture first"))?;

        browser.stop_monitor();

        let http = Arc::new(HttpCollector::new(cfg, session, self.collector_sender()));
        http.start().context("start direct monitor")?;
        self.install_collector(http);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Store-backed operator API
    // -----------------------------------------------------------------

    async fn resolve_auction_pk(&self, auction_ext_id: Option<&str>) -> Result<i64> {
        match auction_ext_id {
            Some(ext) => db::get_auction_id_by_ext(&self.pool, ext)
                .await?
                .ok_or_else(|| anyhow!("unknown auction {ext}")),
            None => match db::get_running_auction_id(&self.pool).await? {
                Some(pk) => Ok(pk),
                None => db::get_latest_auction_id(&self.pool)
                    .await?
                    .ok_or_else(|| anyhow!("no auctions in the store")),
            },
        }
    }

    pub async fn set_mi_id_proveedor(
        &self,
        auction_ext_id: Option<&str>,
        provider_id: Option<&str>,
    ) -> Result<()> {
        let pk = self.resolve_auction_pk(auction_ext_id).await?;
        db::set_mi_id_proveedor(&self.pool, pk, provider_id).await?;
        let _ = self.engine_cmd_tx.send(EngineCommand::RefreshProviderId(pk));
        Ok(())
    }

    pub async fn get_mi_id_proveedor(
        &self,
        auction_ext_id: Option<&str>,
    ) -> Result<Option<String>> {
        let pk = self.resolve_auction_pk(auction_ext_id).await?;
        db::get_mi_id_proveedor(&self.pool, pk).await
    }

    /// Read-merge-write so operator edits never clobber portal fields.
    pub async fn update_item_commercial(
        &self,
        item_id: i64,
        patch: db::CommercialPatch,
    ) -> Result<()> {
        let patch = db::CommercialPatch {
            updated_at: now_iso(),
            ..patch
        };
        db::upsert_item_commercial(&self.pool, item_id, &patch).await
    }

    pub async fn update_item_config(&self, item_id: i64, patch: db::ConfigPatch) -> Result<()> {
        let patch = db::ConfigPatch {
            updated_at: now_iso(),
            ..patch
        };
        db::upsert_item_config(&self.pool, item_id, &patch).await
    }

    pub async fn get_ui_pref(&self, key: &str) -> Result<Option<String>> {
        db::get_ui_pref(&self.pool, key).await
    }

    pub async fn set_ui_pref(&self, key: &str, value: &str) -> Result<()> {
        db::set_ui_pref(&self.pool, key, value).await
    }

    /// Purge store data. State-destroying modes pause a running collector
    /// and restart it afterwards.
    pub async fn cleanup(&self, mode: CleanupMode) -> Result<()> {
        let was_running = matches!(mode, CleanupMode::States | CleanupMode::All)
            && self.collector_running();
        if was_running {
            self.stop_collector();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let result = match mode {
            CleanupMode::Logs => db::purge_logs(&self.pool).await,
            CleanupMode::States => db::purge_states(&self.pool).await,
            CleanupMode::All => db::purge_all(&self.pool).await,
        };

        if was_running {
            self.start_collector();
        }
        result
    }
}
