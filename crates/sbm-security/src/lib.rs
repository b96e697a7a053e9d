//! Operational safety policy.
//!
//! Pure decision logic: no requests, no store access, no clock reads. The
//! engine feeds it observed metrics (error streak, last-ok timestamp,
//! current cadence, last transport status) and applies whatever action comes
//! back: keep going, raise the cadence, pause, alert, or cut the auction.

use chrono::NaiveDateTime;

use sbm_events::END_TOKEN;

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Consecutive transport errors tolerated before a hard STOP.
    pub max_streak: u32,
    /// Streaks below this only alert; backoff starts at this count.
    pub min_streak_for_backoff: u32,
    /// Cadence multiplier per backoff step.
    pub backoff_factor: f64,
    /// Cadence ceiling in seconds.
    pub cadence_ceiling_s: f64,
    /// Minutes without a valid response before PAUSE.
    pub inactivity_ceiling_min: i64,
    /// Status-0 timeouts are usually transient network/browser hiccups;
    /// when true they alert without raising the cadence.
    pub ignore_transient_timeout: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_streak: 10,
            min_streak_for_backoff: 2,
            backoff_factor: 2.0,
            cadence_ceiling_s: 30.0,
            inactivity_ceiling_min: 5,
            ignore_transient_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityAction {
    Continue,
    Backoff,
    Pause,
    Stop,
    Alert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityDecision {
    pub action: SecurityAction,
    pub message: String,
    pub new_cadence: Option<f64>,
}

/// Observed metrics for one auction at evaluation time. `now` is an input so
/// the evaluation stays deterministic.
#[derive(Debug, Clone)]
pub struct SecurityInput<'a> {
    pub current_cadence: f64,
    pub error_streak: u32,
    pub last_ok_at: Option<NaiveDateTime>,
    pub now: NaiveDateTime,
    pub transport_status: u16,
    pub message: &'a str,
}

/// Evaluate the policy. First matching rule wins.
pub fn evaluate(cfg: &SecurityConfig, input: &SecurityInput<'_>) -> SecurityDecision {
    // 1) Portal says the auction is over.
    if input.message.to_lowercase().contains(END_TOKEN) {
        return SecurityDecision {
            action: SecurityAction::Stop,
            message: "auction finished (portal message)".into(),
            new_cadence: None,
        };
    }

    // 2) Current transport error.
    if input.transport_status != 200 {
        let msg = input.message.to_lowercase();
        let transient_timeout =
            input.transport_status == 0 && (msg.contains("timeout") || msg.contains("abort"));

        if input.error_streak >= cfg.max_streak {
            return SecurityDecision {
                action: SecurityAction::Stop,
                message: format!("too many consecutive transport errors ({})", input.error_streak),
                new_cadence: None,
            };
        }

        if transient_timeout && cfg.ignore_transient_timeout {
            return SecurityDecision {
                action: SecurityAction::Alert,
                message: "transient status-0 timeout (no backoff)".into(),
                new_cadence: None,
            };
        }

        if input.error_streak < cfg.min_streak_for_backoff {
            return SecurityDecision {
                action: SecurityAction::Alert,
                message: format!(
                    "transport error {} (streak {}/{})",
                    input.transport_status, input.error_streak, cfg.min_streak_for_backoff
                ),
                new_cadence: None,
            };
        }

        let new_cadence =
            (input.current_cadence * cfg.backoff_factor).min(cfg.cadence_ceiling_s);
        return SecurityDecision {
            action: SecurityAction::Backoff,
            message: format!("transport error {} - backing off", input.transport_status),
            new_cadence: Some(new_cadence),
        };
    }

    // 3) No current error, but nothing valid for too long.
    if let Some(last_ok) = input.last_ok_at {
        let idle = input.now.signed_duration_since(last_ok);
        if idle > chrono::Duration::minutes(cfg.inactivity_ceiling_min) {
            return SecurityDecision {
                action: SecurityAction::Pause,
                message: format!("no valid data for {} minutes", idle.num_minutes()),
                new_cadence: None,
            };
        }
    }

    // 4) Normal.
    SecurityDecision {
        action: SecurityAction::Continue,
        message: "normal".into(),
        new_cadence: None,
    }
}
