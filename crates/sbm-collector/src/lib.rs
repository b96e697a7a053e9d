//! Collectors: the data sources of the monitoring pipeline.
//!
//! A collector extracts auction identity and item lists from the portal and
//! rotates items through the "best offer" endpoint, emitting normalized
//! events into the outbound queue. Collectors never touch the store; the
//! engine owns persistence.
//!
//! Implementations:
//! - [`browser::BrowserCollector`] drives a real browser over WebDriver;
//!   handles capture and can monitor from inside the page so the portal's
//!   session state is reused.
//! - [`http::HttpCollector`] takes over the polling loop with a direct
//!   HTTP/2 client once the browser has captured a session.
//! - [`mock::MockCollector`] replays a JSON scenario for tests and demos.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;

pub mod browser;
pub mod http;
pub mod matching;
pub mod mock;
pub mod protocol;

/// Minimum cadence the portal tolerates without tripping its own defenses.
pub const MIN_CADENCE_S: f64 = 0.2;

/// Common collector contract. Lifecycle is non-blocking: `start` launches
/// worker activity and returns; `stop` signals and returns (idempotent).
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self) -> Result<()>;

    fn stop(&self);

    /// Base cadence in seconds, applied from the next cycle.
    fn set_cadence(&self, seconds: f64);

    /// Intensive mode polls every item per cycle; relaxed rotates one.
    fn set_intensive(&self, enabled: bool);

    fn is_running(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Shared signal block
// ---------------------------------------------------------------------------

/// Lock-free control block shared between a collector facade and its worker
/// task. Cadences are stored in milliseconds so they fit an atomic.
#[derive(Debug)]
pub struct CollectorSignals {
    stop: AtomicBool,
    running: AtomicBool,
    intensive: AtomicBool,
    cadence_ms: AtomicU64,
    relaxed_cadence_ms: AtomicU64,
}

impl CollectorSignals {
    pub fn new(base_cadence_s: f64, relaxed_cadence_s: f64, intensive: bool) -> Self {
        let s = Self {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            intensive: AtomicBool::new(intensive),
            cadence_ms: AtomicU64::new(0),
            relaxed_cadence_ms: AtomicU64::new(0),
        };
        s.set_cadence(base_cadence_s);
        s.set_relaxed_cadence(relaxed_cadence_s);
        s
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Re-arm for a fresh `start` after a full stop.
    pub fn reset_for_start(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn set_running(&self, v: bool) {
        self.running.store(v, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_intensive(&self, v: bool) {
        self.intensive.store(v, Ordering::SeqCst);
    }

    pub fn intensive(&self) -> bool {
        self.intensive.load(Ordering::SeqCst)
    }

    pub fn set_cadence(&self, seconds: f64) {
        let clamped = seconds.max(MIN_CADENCE_S);
        self.cadence_ms
            .store((clamped * 1000.0) as u64, Ordering::SeqCst);
        // Relaxed cadence tracks the base but never drops under a second.
        self.relaxed_cadence_ms
            .store((clamped.max(1.0) * 1000.0) as u64, Ordering::SeqCst);
    }

    pub fn set_relaxed_cadence(&self, seconds: f64) {
        self.relaxed_cadence_ms
            .store((seconds.max(1.0) * 1000.0) as u64, Ordering::SeqCst);
    }

    pub fn cadence_s(&self) -> f64 {
        self.cadence_ms.load(Ordering::SeqCst) as f64 / 1000.0
    }

    pub fn relaxed_cadence_s(&self) -> f64 {
        self.relaxed_cadence_ms.load(Ordering::SeqCst) as f64 / 1000.0
    }

    /// Cadence for the current mode.
    pub fn effective_cadence_s(&self) -> f64 {
        if self.intensive() {
            self.cadence_s()
        } else {
            self.relaxed_cadence_s()
        }
    }
}

// ---------------------------------------------------------------------------
// Captured session (browser -> direct-HTTP handover)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedItem {
    pub local_id: String,
    pub text: String,
}

/// Everything the direct-HTTP collector needs to take over phase 2:
/// identity, the item rotation list, and the browser's session cookies.
#[derive(Debug, Clone, Default)]
pub struct CapturedSession {
    pub id_cot: String,
    pub margin: String,
    pub auction_url: String,
    pub items: Vec<CapturedItem>,
    pub cookies: Vec<(String, String)>,
}

impl CapturedSession {
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Slot the browser collector fills after a successful capture; the runtime
/// reads it to hand the polling loop to the direct-HTTP collector.
#[derive(Debug, Default)]
pub struct SessionSlot(Mutex<Option<CapturedSession>>);

impl SessionSlot {
    pub fn put(&self, session: CapturedSession) {
        *self.0.lock().expect("session slot poisoned") = Some(session);
    }

    pub fn get(&self) -> Option<CapturedSession> {
        self.0.lock().expect("session slot poisoned").clone()
    }
}
