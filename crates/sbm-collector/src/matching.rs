//! Capture-time matching between the item selector options and the detail
//! table rows.
//!
//! The portal renders the selector and the detail grid independently, and on
//! consolidated auctions the grid holds "summary" rows (description starting
//! with `RENGLON `) that aggregate several selector options. The cascade:
//! exact normalized description, then prefix-stripped key, then token
//! overlap, then position. Positional matching applies only when the grid has no
//! summary rows. When summary rows exist, options that cannot be matched are
//! phantoms and get discarded.

use sbm_events::SnapshotItem;
use sbm_util::{money_to_f64, parse_quantity};

/// One parsed row of the detail grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub idx: usize,
    pub description: String,
    pub is_summary: bool,
    pub quantity: Option<f64>,
    /// Unit reference usable for internal math: column 3 on detail rows,
    /// total/quantity on summary rows (their column 3 is not a unit price).
    pub reference_unit: Option<f64>,
    /// Official budget total (column 4).
    pub reference_total: Option<f64>,
}

/// Selector option as read from the page.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

/// Parse the cell-text matrix of the detail grid.
pub fn parse_detail_rows(rows: &[Vec<String>]) -> Vec<DetailRow> {
    let mut out = Vec::new();
    for (idx, cells) in rows.iter().enumerate() {
        if cells.len() < 4 {
            continue;
        }
        let description = cells[0].clone();
        let is_summary = description.trim().to_uppercase().starts_with("RENGLON ");
        let quantity = parse_quantity(&cells[1]);
        let col3_unit = money_to_f64(&cells[2]);
        let reference_total = money_to_f64(&cells[3]);

        let reference_unit = if is_summary {
            match (reference_total, quantity) {
                (Some(total), Some(q)) if q != 0.0 => Some(total / q),
                _ => None,
            }
        } else {
            col3_unit
        };

        out.push(DetailRow {
            idx,
            description,
            is_summary,
            quantity,
            reference_unit,
            reference_total,
        });
    }
    out
}

/// Lowercase, collapse whitespace, strip diacritics.
pub fn normalize_desc(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Reduce an item label to its comparable key: drop the `renglon` prefix and
/// a leading ordinal (`"Renglón 1 - Insumos"` and `"RENGLON INSUMOS"` both
/// key on `"insumos"`).
pub fn normalize_item_key(text: &str) -> String {
    let mut key = normalize_desc(text);
    if let Some(rest) = key.strip_prefix("renglon") {
        key = rest.trim_start().to_string();
    }
    // Leading ordinal with optional separator.
    let digits = key.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = key[digits..].trim_start();
        let rest = rest
            .strip_prefix(&['-', ':', '.'][..])
            .map(str::trim_start)
            .unwrap_or(rest);
        key = rest.to_string();
    }
    key
}

fn tokens(text: &str) -> Vec<String> {
    normalize_item_key(text)
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

/// Number of shared (len ≥ 3) tokens between two labels.
pub fn token_overlap_score(a: &str, b: &str) -> usize {
    let ta = tokens(a);
    let tb = tokens(b);
    ta.iter().filter(|t| tb.contains(t)).count()
}

fn match_summary_row<'a>(
    option_text: &str,
    summary_rows: &'a [DetailRow],
    used: &mut Vec<bool>,
) -> Option<&'a DetailRow> {
    let option_norm = normalize_desc(option_text);
    let option_key = normalize_item_key(option_text);

    // Exact normalized description.
    for (i, row) in summary_rows.iter().enumerate() {
        if !used[i] && normalize_desc(&row.description) == option_norm {
            used[i] = true;
            return Some(row);
        }
    }

    // Prefix-stripped key, allowing containment either way.
    for (i, row) in summary_rows.iter().enumerate() {
        if used[i] {
            continue;
        }
        let row_key = normalize_item_key(&row.description);
        if !row_key.is_empty()
            && !option_key.is_empty()
            && (row_key == option_key
                || row_key.contains(&option_key)
                || option_key.contains(&row_key))
        {
            used[i] = true;
            return Some(row);
        }
    }

    // Best token overlap.
    let mut best: Option<(usize, usize)> = None;
    for (i, row) in summary_rows.iter().enumerate() {
        if used[i] {
            continue;
        }
        let score = token_overlap_score(option_text, &row.description);
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((i, score));
        }
    }
    if let Some((i, _)) = best {
        used[i] = true;
        return Some(&summary_rows[i]);
    }

    None
}

/// Enrich selector options with detail-table data. Options that cannot be
/// matched while summary rows exist are phantoms and are dropped.
pub fn enrich_options(options: &[SelectOption], detail_rows: &[DetailRow]) -> Vec<SnapshotItem> {
    let detail_only: Vec<&DetailRow> = detail_rows.iter().filter(|r| !r.is_summary).collect();
    let summary_rows: Vec<DetailRow> = detail_rows
        .iter()
        .filter(|r| r.is_summary)
        .cloned()
        .collect();

    let mut used_summary = vec![false; summary_rows.len()];
    // Direct matches consume duplicate-description detail rows in order.
    let mut next_for_key: std::collections::HashMap<String, usize> = Default::default();
    let mut rows_by_key: std::collections::HashMap<String, Vec<&DetailRow>> = Default::default();
    for row in &detail_only {
        rows_by_key
            .entry(normalize_desc(&row.description))
            .or_default()
            .push(row);
    }

    let mut out = Vec::new();
    for (idx, opt) in options.iter().enumerate() {
        let key = normalize_desc(&opt.text);
        let mut matched: Option<&DetailRow> = None;

        if let Some(rows) = rows_by_key.get(&key) {
            let cursor = next_for_key.entry(key.clone()).or_insert(0);
            let use_idx = (*cursor).min(rows.len() - 1);
            matched = Some(rows[use_idx]);
            *cursor += 1;
        }

        if matched.is_none() {
            matched = match_summary_row(&opt.text, &summary_rows, &mut used_summary);
        }

        // Order-based fallback when option count equals summary count.
        if matched.is_none()
            && !summary_rows.is_empty()
            && options.len() == summary_rows.len()
            && idx < summary_rows.len()
            && !used_summary[idx]
        {
            used_summary[idx] = true;
            matched = Some(&summary_rows[idx]);
        }

        // Positional fallback only when the grid has no summary rows at all.
        if matched.is_none()
            && summary_rows.is_empty()
            && options.len() == detail_only.len()
            && idx < detail_only.len()
        {
            matched = Some(detail_only[idx]);
        }

        // With a summary grid present, an unmatched option is a phantom: the
        // portal exposes per-sub-item options but the auction runs on the
        // consolidated line.
        if matched.is_none() && !summary_rows.is_empty() {
            continue;
        }

        let det = matched;
        out.push(SnapshotItem {
            local_id: opt.value.clone(),
            text: opt.text.clone(),
            quantity: det.and_then(|d| d.quantity),
            reference_total: det.and_then(|d| d.reference_total),
            reference_unit: det.and_then(|d| d.reference_unit),
            budget: det.and_then(|d| d.reference_total),
        });
    }
    out
}
