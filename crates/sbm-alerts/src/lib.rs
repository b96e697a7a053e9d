//! Per-item alert decisions.
//!
//! Consumes the consolidated tick state (portal status + operator config)
//! and returns what the operator surface should do: logical row style,
//! sound cue, temporary highlight, visibility. It never plays sounds or
//! paints widgets itself.

use sbm_events::END_TOKEN;

/// Logical row styles; the rendering surface maps them to actual colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStyle {
    Normal,
    /// Item is followed but there is nothing to evaluate yet.
    Tracked,
    Warning,
    Danger,
    Success,
    /// Best offer is the operator's own (auto-detected by provider id).
    MyOffer,
    Outbid,
}

impl RowStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStyle::Normal => "NORMAL",
            RowStyle::Tracked => "TRACKED",
            RowStyle::Warning => "WARNING",
            RowStyle::Danger => "DANGER",
            RowStyle::Success => "SUCCESS",
            RowStyle::MyOffer => "MY_OFFER",
            RowStyle::Outbid => "OUTBID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    None,
    Alert,
    Success,
    Error,
}

impl SoundCue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundCue::None => "NONE",
            SoundCue::Alert => "ALERT",
            SoundCue::Success => "SUCCESS",
            SoundCue::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDecision {
    pub style: RowStyle,
    pub sound: SoundCue,
    pub highlight: bool,
    pub hide: bool,
    pub message: String,
}

/// Consolidated tick state for one item.
#[derive(Debug, Clone)]
pub struct AlertInput<'a> {
    /// Followed explicitly or has a cost loaded.
    pub tracked: bool,
    /// Operator marked the best offer as their own (manual or merged auto).
    pub my_bid: bool,
    /// Auto-detected via provider-id match this tick.
    pub my_bid_auto: bool,
    /// Was best last tick, is not anymore, and the offer actually changed.
    pub outbid: bool,
    /// Margin over cost at the current offer-to-beat, in percent points.
    pub margin_pct: Option<f64>,
    pub min_margin_pct: f64,
    pub hide_below_threshold: bool,
    pub changed: bool,
    pub transport_status: u16,
    pub portal_message: &'a str,
}

/// Margin band above the minimum that still counts as merely acceptable;
/// anything at or past it is comfortable.
const SUCCESS_BAND_PCT: f64 = 5.0;

fn margin_style(margin_pct: f64, min_margin_pct: f64) -> RowStyle {
    if margin_pct >= min_margin_pct + SUCCESS_BAND_PCT {
        RowStyle::Success
    } else if margin_pct >= min_margin_pct {
        RowStyle::Warning
    } else {
        RowStyle::Danger
    }
}

/// Decide style/sound/visibility for one item tick. First matching rule wins.
pub fn decide(input: &AlertInput<'_>) -> AlertDecision {
    // 1) Transport trouble beats everything else.
    if input.transport_status != 200 {
        return AlertDecision {
            style: RowStyle::Danger,
            sound: if input.tracked { SoundCue::Error } else { SoundCue::None },
            highlight: input.tracked,
            hide: false,
            message: format!(
                "HTTP {} {}",
                input.transport_status,
                input.portal_message.trim()
            )
            .trim()
            .to_string(),
        };
    }

    // 2) Auction finished per portal message.
    if input.portal_message.to_lowercase().contains(END_TOKEN) {
        return AlertDecision {
            style: RowStyle::Warning,
            sound: SoundCue::None,
            highlight: false,
            hide: false,
            message: "auction finished".into(),
        };
    }

    // 3a) Own offer beaten this tick. Keep the color tied to margin so the
    //     operator can judge whether re-bidding still pays; the sound and
    //     highlight always fire.
    if input.outbid {
        let style = match input.margin_pct {
            Some(pct) => margin_style(pct, input.min_margin_pct),
            None if input.tracked => RowStyle::Tracked,
            None => RowStyle::Normal,
        };
        return AlertDecision {
            style,
            sound: SoundCue::Alert,
            highlight: true,
            hide: false,
            message: "your offer was beaten".into(),
        };
    }

    // 3b) Best offer is ours, detected automatically.
    if input.my_bid && input.my_bid_auto {
        let active = input.changed && input.tracked;
        return AlertDecision {
            style: RowStyle::MyOffer,
            sound: if active { SoundCue::Success } else { SoundCue::None },
            highlight: active,
            hide: false,
            message: "best offer is yours".into(),
        };
    }

    // 3c) Manual "my bid" mark.
    if input.my_bid {
        let active = input.changed && input.tracked;
        return AlertDecision {
            style: RowStyle::Success,
            sound: if active { SoundCue::Success } else { SoundCue::None },
            highlight: active,
            hide: false,
            message: "offer marked as yours".into(),
        };
    }

    // 4) Margin bands.
    if let Some(pct) = input.margin_pct {
        let delta = pct - input.min_margin_pct;
        return match margin_style(pct, input.min_margin_pct) {
            RowStyle::Success => AlertDecision {
                style: RowStyle::Success,
                sound: if input.changed && input.tracked { SoundCue::Alert } else { SoundCue::None },
                highlight: input.changed && input.tracked,
                hide: false,
                message: format!("margin {pct:.2}% (comfortable, +{delta:.2}%)"),
            },
            RowStyle::Warning => AlertDecision {
                style: RowStyle::Warning,
                sound: SoundCue::None,
                highlight: input.changed && input.tracked,
                hide: false,
                message: format!("margin {pct:.2}% (tight, +{delta:.2}%)"),
            },
            _ => AlertDecision {
                style: RowStyle::Danger,
                sound: if input.tracked { SoundCue::Error } else { SoundCue::None },
                highlight: input.tracked,
                hide: input.hide_below_threshold,
                message: format!("margin {pct:.2}% (insufficient, {delta:.2}%)"),
            },
        };
    }

    // 5) No computable margin.
    if input.tracked && input.changed {
        return AlertDecision {
            style: RowStyle::Warning,
            sound: SoundCue::Alert,
            highlight: true,
            hide: false,
            message: "change on a followed item".into(),
        };
    }

    if input.tracked {
        return AlertDecision {
            style: RowStyle::Tracked,
            sound: SoundCue::None,
            highlight: false,
            hide: false,
            message: "followed (no margin data)".into(),
        };
    }

    AlertDecision {
        style: RowStyle::Normal,
        sound: SoundCue::None,
        highlight: false,
        hide: false,
        message: String::new(),
    }
}
