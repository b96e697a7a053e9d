//! Commercial math for one item tick. Pure functions over optional inputs:
//! absent data yields `None`, never an invented zero.

pub fn safe_mul(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? * b?)
}

pub fn safe_div(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match b {
        Some(b) if b != 0.0 => Some(a? / b),
        _ => None,
    }
}

/// Resolve the unit/total ARS cost pair against the quantity.
///
/// TOTAL is the authoritative figure when both are supplied: the unit cost
/// is recomputed as `total / quantity`. With only one side present the other
/// derives from the quantity; with no quantity the pair passes through.
pub fn resolve_costs(
    unit_cost_ars: Option<f64>,
    total_cost_ars: Option<f64>,
    quantity: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    match (unit_cost_ars, total_cost_ars) {
        (Some(unit), Some(total)) => match quantity {
            Some(q) if q != 0.0 => (Some(total / q), Some(total)),
            _ => (Some(unit), Some(total)),
        },
        (None, Some(total)) => (safe_div(Some(total), quantity), Some(total)),
        (Some(unit), None) => (Some(unit), safe_mul(Some(unit), quantity)),
        (None, None) => (None, None),
    }
}

/// Unit reference price: official budget divided by quantity when both are
/// known, otherwise the published reference unit as-is.
pub fn resolve_reference_unit(
    quantity: Option<f64>,
    reference_unit: Option<f64>,
    budget_total: Option<f64>,
) -> Option<f64> {
    safe_div(budget_total, quantity).or(reference_unit)
}

/// Inputs to the per-tick derivation, already merged from the commercial row
/// and the live portal state.
#[derive(Debug, Clone, Default)]
pub struct DeriveInput {
    pub quantity: Option<f64>,
    pub unit_cost_ars: Option<f64>,
    pub total_cost_ars: Option<f64>,
    pub usd_rate: Option<f64>,
    /// Canonical fraction in [0, 1].
    pub min_margin: Option<f64>,
    pub reference_total: Option<f64>,
    pub reference_unit: Option<f64>,
    pub offer_to_beat_value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedCosts {
    pub unit_cost_ars: Option<f64>,
    pub total_cost_ars: Option<f64>,
    pub unit_cost_usd: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub acceptable_unit_price: Option<f64>,
    pub acceptable_total_price: Option<f64>,
    pub reference_unit_price: Option<f64>,
    pub reference_margin: Option<f64>,
    pub unit_improvement_price: Option<f64>,
    pub improvement_margin: Option<f64>,
    /// Margin driving alert decisions, in percent points.
    pub margin_pct: Option<f64>,
}

pub fn derive(input: &DeriveInput) -> DerivedCosts {
    let (unit_cost_ars, total_cost_ars) =
        resolve_costs(input.unit_cost_ars, input.total_cost_ars, input.quantity);

    // USD costs track the ARS figures whenever a conversion is loaded.
    let usd = input.usd_rate.filter(|r| *r > 0.0);
    let unit_cost_usd = safe_div(unit_cost_ars, usd);
    let total_cost_usd = safe_div(total_cost_ars, usd);

    // acceptable = (1 + margin) × cost.
    let factor = input.min_margin.map(|m| 1.0 + m);
    let acceptable_unit_price = safe_mul(factor, unit_cost_ars);
    let acceptable_total_price = safe_mul(factor, total_cost_ars);

    // Unit reference: prefer the stored unit value, derive from the total
    // only when it is missing.
    let reference_unit_price = input
        .reference_unit
        .or_else(|| safe_div(input.reference_total, input.quantity));

    // Reference margin: total vs total is the robust comparison; unit vs
    // unit is the fallback.
    let reference_margin = safe_div(input.reference_total, total_cost_ars)
        .map(|r| r - 1.0)
        .or_else(|| safe_div(reference_unit_price, unit_cost_ars).map(|r| r - 1.0));

    let unit_improvement_price = safe_div(input.offer_to_beat_value, input.quantity);
    let improvement_margin =
        safe_div(unit_improvement_price, unit_cost_ars).map(|r| r - 1.0);

    // The offer-to-beat is a total, so the percent fallback compares against
    // the total cost first.
    let base_cost = total_cost_ars
        .or_else(|| safe_mul(unit_cost_ars, input.quantity))
        .or(unit_cost_ars);
    let margin_pct = improvement_margin.map(|m| m * 100.0).or_else(|| {
        match (base_cost, input.offer_to_beat_value) {
            (Some(cost), Some(offer)) if cost > 0.0 => Some((offer - cost) / cost * 100.0),
            _ => None,
        }
    });

    DerivedCosts {
        unit_cost_ars,
        total_cost_ars,
        unit_cost_usd,
        total_cost_usd,
        acceptable_unit_price,
        acceptable_total_price,
        reference_unit_price,
        reference_margin,
        unit_improvement_price,
        improvement_margin,
        margin_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.map(|v| (v - b).abs() < 1e-9).unwrap_or(false)
    }

    #[test]
    fn total_wins_when_both_costs_present() {
        let (unit, total) = resolve_costs(Some(999.0), Some(10_000.0), Some(10.0));
        assert_eq!(unit, Some(1000.0));
        assert_eq!(total, Some(10_000.0));
    }

    #[test]
    fn unit_only_derives_total() {
        let (unit, total) = resolve_costs(Some(1000.0), None, Some(10.0));
        assert_eq!(unit, Some(1000.0));
        assert_eq!(total, Some(10_000.0));
    }

    #[test]
    fn total_only_derives_unit() {
        let (unit, total) = resolve_costs(None, Some(10_000.0), Some(10.0));
        assert_eq!(unit, Some(1000.0));
        assert_eq!(total, Some(10_000.0));
    }

    #[test]
    fn zero_quantity_passes_pair_through() {
        let (unit, total) = resolve_costs(Some(5.0), Some(7.0), Some(0.0));
        assert_eq!((unit, total), (Some(5.0), Some(7.0)));
        let (unit, total) = resolve_costs(None, Some(7.0), Some(0.0));
        assert_eq!((unit, total), (None, Some(7.0)));
    }

    #[test]
    fn reference_unit_prefers_budget_over_published() {
        assert_eq!(
            resolve_reference_unit(Some(293_700.0), Some(1.0), Some(2_320_230_000.0)),
            Some(7900.0)
        );
        assert_eq!(resolve_reference_unit(None, Some(42.0), Some(100.0)), Some(42.0));
        assert_eq!(resolve_reference_unit(Some(2.0), None, None), None);
    }

    #[test]
    fn margin_scenario_exact() {
        // unit_cost=1000, qty=10, margin=0.30, offer_to_beat=13000:
        // acceptable_unit=1300, improvement=0.30 exactly, 30.0 pct.
        let d = derive(&DeriveInput {
            quantity: Some(10.0),
            unit_cost_ars: Some(1000.0),
            min_margin: Some(0.30),
            offer_to_beat_value: Some(13_000.0),
            ..Default::default()
        });
        assert!(close(d.acceptable_unit_price, 1300.0));
        assert!(close(d.acceptable_total_price, 13_000.0));
        assert!(close(d.unit_improvement_price, 1300.0));
        assert!(close(d.improvement_margin, 0.30));
        assert!(close(d.margin_pct, 30.0));
    }

    #[test]
    fn usd_costs_follow_conversion() {
        let d = derive(&DeriveInput {
            quantity: Some(2.0),
            unit_cost_ars: Some(2000.0),
            usd_rate: Some(1000.0),
            ..Default::default()
        });
        assert!(close(d.unit_cost_usd, 2.0));
        assert!(close(d.total_cost_usd, 4.0));

        // Zero or missing rate leaves USD empty.
        let d = derive(&DeriveInput {
            unit_cost_ars: Some(2000.0),
            usd_rate: Some(0.0),
            ..Default::default()
        });
        assert_eq!(d.unit_cost_usd, None);
    }

    #[test]
    fn reference_margin_prefers_totals() {
        let d = derive(&DeriveInput {
            quantity: Some(10.0),
            total_cost_ars: Some(10_000.0),
            reference_total: Some(12_000.0),
            reference_unit: Some(9999.0),
            ..Default::default()
        });
        assert!(close(d.reference_margin, 0.2));
    }

    #[test]
    fn reference_margin_unit_fallback() {
        let d = derive(&DeriveInput {
            unit_cost_ars: Some(100.0),
            reference_unit: Some(150.0),
            ..Default::default()
        });
        assert!(close(d.reference_margin, 0.5));
    }

    #[test]
    fn margin_pct_fallback_uses_total_cost_base() {
        // No quantity -> no improvement margin; fallback compares the
        // offer-to-beat against the total cost.
        let d = derive(&DeriveInput {
            total_cost_ars: Some(10_000.0),
            offer_to_beat_value: Some(11_000.0),
            ..Default::default()
        });
        assert_eq!(d.improvement_margin, None);
        assert!(close(d.margin_pct, 10.0));
    }

    #[test]
    fn no_inputs_no_outputs() {
        let d = derive(&DeriveInput::default());
        assert_eq!(d, DerivedCosts::default());
    }
}
