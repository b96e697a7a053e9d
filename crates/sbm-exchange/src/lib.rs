//! Spreadsheet exchange: the column contract of the operator's sheet,
//! rendered as CSV.
//!
//! Export writes every column; import reads only the operator-supplied ones
//! (the seven user fields plus the two identifiers). Calculated and
//! portal-sourced columns are ignored on import, so an export/import round
//! trip changes nothing but operator data.
//!
//! `RENTA MINIMA %` carries the canonical margin fraction in [0, 1]. Any
//! other magnitude is a unit error that aborts the row; values are never
//! silently rescaled.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sqlx::SqlitePool;

use sbm_db as db;
use sbm_util::{money_to_f64, now_iso};

/// Column order of the exported sheet.
pub const COLUMNS: [&str; 23] = [
    "ID SUBASTA",
    "ITEM",
    "DESCRIPCION",
    "UNIDAD DE MEDIDA",
    "CANTIDAD",
    "MARCA",
    "OBS USUARIO",
    "CONVERSION USD",
    "COSTO UNIT USD",
    "COSTO TOTAL USD",
    "COSTO UNIT ARS",
    "COSTO TOTAL ARS",
    "RENTA MINIMA %",
    "PRECIO UNIT ACEPTABLE",
    "PRECIO TOTAL ACEPTABLE",
    "PRECIO DE REFERENCIA",
    "PRECIO REF UNITARIO",
    "RENTA REFERENCIA %",
    "MEJOR OFERTA ACTUAL",
    "OFERTA PARA MEJORAR",
    "PRECIO UNIT MEJORA",
    "RENTA PARA MEJORAR %",
    "OBS / CAMBIO",
];

/// Operator-supplied columns read back on import.
pub const USER_COLUMNS: [&str; 7] = [
    "UNIDAD DE MEDIDA",
    "MARCA",
    "OBS USUARIO",
    "CONVERSION USD",
    "COSTO UNIT ARS",
    "COSTO TOTAL ARS",
    "RENTA MINIMA %",
];

#[derive(Debug)]
pub enum ExchangeError {
    MissingColumns(Vec<String>),
    /// `RENTA MINIMA %` outside [0, 1]; legacy multiplier sheets must be
    /// converted explicitly.
    MarginOutOfRange { item: String, value: f64 },
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::MissingColumns(cols) => {
                write!(f, "missing required columns: {}", cols.join(", "))
            }
            ExchangeError::MarginOutOfRange { item, value } => write!(
                f,
                "item {item}: RENTA MINIMA % must be a fraction in [0, 1], got {value}"
            ),
        }
    }
}

impl std::error::Error for ExchangeError {}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub updated: usize,
    /// Rows whose (auction, item) pair is not in the store.
    pub skipped: usize,
    /// Rows aborted by a validation error.
    pub rejected: Vec<(String, ExchangeError)>,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v}")).unwrap_or_default()
}

/// Export one auction to CSV. Returns the number of data rows written.
pub async fn export_csv(pool: &SqlitePool, auction_id: i64, path: &Path) -> Result<usize> {
    let rows = db::fetch_export_rows(pool, auction_id).await?;

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("create export {}", path.display()))?;
    writer.write_record(COLUMNS).context("write header")?;

    for row in &rows {
        writer
            .write_record([
                row.id_subasta.clone(),
                row.item.clone(),
                row.descripcion.clone(),
                row.unidad_medida.clone().unwrap_or_default(),
                fmt_opt(row.cantidad),
                row.marca.clone().unwrap_or_default(),
                row.obs_usuario.clone().unwrap_or_default(),
                fmt_opt(row.conversion_usd),
                fmt_opt(row.costo_unit_usd),
                fmt_opt(row.costo_total_usd),
                fmt_opt(row.costo_unit_ars),
                fmt_opt(row.costo_total_ars),
                fmt_opt(row.renta_minima),
                fmt_opt(row.precio_unit_aceptable),
                fmt_opt(row.precio_total_aceptable),
                fmt_opt(row.precio_referencia),
                fmt_opt(row.precio_ref_unitario),
                fmt_opt(row.renta_referencia),
                row.mejor_oferta_actual.clone().unwrap_or_default(),
                fmt_opt(row.oferta_para_mejorar),
                fmt_opt(row.precio_unit_mejora),
                fmt_opt(row.renta_para_mejorar),
                row.obs_cambio.clone().unwrap_or_default(),
            ])
            .context("write row")?;
    }

    writer.flush().context("flush export")?;
    Ok(rows.len())
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Uppercase, collapse whitespace, strip the accents the sheet tends to
/// carry, so hand-edited headers still match.
fn normalize_header(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    let collapsed = upper.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .chars()
        .map(|c| match c {
            'Á' => 'A',
            'É' => 'E',
            'Í' => 'I',
            'Ó' => 'O',
            'Ú' | 'Ü' => 'U',
            'Ñ' => 'N',
            other => other,
        })
        .collect()
}

fn parse_cell_number(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    // Plain decimal first, AR-formatted fallback.
    s.parse::<f64>().ok().or_else(|| money_to_f64(s))
}

fn non_empty(raw: &str) -> Option<String> {
    let s = raw.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Import operator columns from a CSV sheet. Rows resolve by
/// (`ID SUBASTA`, `ITEM`); unknown rows are skipped, invalid margins abort
/// their row with a typed error.
pub async fn import_csv(pool: &SqlitePool, path: &Path) -> Result<ImportReport> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("open import {}", path.display()))?;

    let headers = reader.headers().context("read header")?.clone();
    let index_of = |name: &str| -> Option<usize> {
        headers
            .iter()
            .position(|h| normalize_header(h) == normalize_header(name))
    };

    let mut required: Vec<&str> = vec!["ID SUBASTA", "ITEM"];
    required.extend(USER_COLUMNS);
    let missing: Vec<String> = required
        .iter()
        .filter(|c| index_of(c).is_none())
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(ExchangeError::MissingColumns(missing)));
    }

    let col = |name: &str| index_of(name).expect("checked above");
    let id_subasta_idx = col("ID SUBASTA");
    let item_idx = col("ITEM");
    let unit_idx = col("UNIDAD DE MEDIDA");
    let brand_idx = col("MARCA");
    let notes_idx = col("OBS USUARIO");
    let usd_idx = col("CONVERSION USD");
    let unit_cost_idx = col("COSTO UNIT ARS");
    let total_cost_idx = col("COSTO TOTAL ARS");
    let margin_idx = col("RENTA MINIMA %");

    let mut report = ImportReport::default();

    for record in reader.records() {
        let record = record.context("read record")?;
        let cell = |idx: usize| record.get(idx).unwrap_or("");

        let id_cot = cell(id_subasta_idx).trim().to_string();
        let local_id = cell(item_idx).trim().to_string();
        if id_cot.is_empty() || local_id.is_empty() {
            continue;
        }

        let Some(auction_id) = db::get_auction_id_by_ext(pool, &id_cot).await? else {
            report.skipped += 1;
            continue;
        };
        let Some(item_id) = db::get_item_id_by_keys(pool, auction_id, &local_id).await? else {
            report.skipped += 1;
            continue;
        };

        let min_margin = parse_cell_number(cell(margin_idx));
        if let Some(m) = min_margin {
            if !(0.0..=1.0).contains(&m) {
                report.rejected.push((
                    local_id.clone(),
                    ExchangeError::MarginOutOfRange {
                        item: local_id,
                        value: m,
                    },
                ));
                continue;
            }
        }

        let patch = db::CommercialPatch {
            unit: non_empty(cell(unit_idx)),
            brand: non_empty(cell(brand_idx)),
            notes: non_empty(cell(notes_idx)),
            usd_rate: parse_cell_number(cell(usd_idx)),
            unit_cost_ars: parse_cell_number(cell(unit_cost_idx)),
            total_cost_ars: parse_cell_number(cell(total_cost_idx)),
            min_margin,
            updated_at: now_iso(),
            ..Default::default()
        };
        db::upsert_item_commercial(pool, item_id, &patch).await?;
        report.updated += 1;
    }

    Ok(report)
}
