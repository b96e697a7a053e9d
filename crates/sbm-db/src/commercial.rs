//! Commercial data, per-item operator config and the export projection.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

// ---------------------------------------------------------------------------
// Commercial data
// ---------------------------------------------------------------------------

/// Partial write: every field optional, `None` preserves the stored value.
/// Operator edits and engine recalculations go through the same patch so
/// neither side can clobber what the other owns.
#[derive(Debug, Clone, Default)]
pub struct CommercialPatch {
    pub unit: Option<String>,
    pub quantity: Option<f64>,
    pub brand: Option<String>,
    pub notes: Option<String>,
    pub usd_rate: Option<f64>,
    pub unit_cost_usd: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub unit_cost_ars: Option<f64>,
    pub total_cost_ars: Option<f64>,
    pub min_margin: Option<f64>,
    pub reference_total: Option<f64>,
    pub reference_unit: Option<f64>,
    pub reference_margin: Option<f64>,
    pub acceptable_unit_price: Option<f64>,
    pub acceptable_total_price: Option<f64>,
    pub unit_improvement_price: Option<f64>,
    pub improvement_margin: Option<f64>,
    pub offer_to_beat: Option<f64>,
    pub best_offer_text: Option<String>,
    pub change_note: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommercialRow {
    pub item_id: i64,
    pub unit: Option<String>,
    pub quantity: Option<f64>,
    pub brand: Option<String>,
    pub notes: Option<String>,
    pub usd_rate: Option<f64>,
    pub unit_cost_usd: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub unit_cost_ars: Option<f64>,
    pub total_cost_ars: Option<f64>,
    pub min_margin: Option<f64>,
    pub reference_total: Option<f64>,
    pub reference_unit: Option<f64>,
    pub reference_margin: Option<f64>,
    pub acceptable_unit_price: Option<f64>,
    pub acceptable_total_price: Option<f64>,
    pub unit_improvement_price: Option<f64>,
    pub improvement_margin: Option<f64>,
    pub offer_to_beat: Option<f64>,
    pub best_offer_text: Option<String>,
    pub change_note: Option<String>,
    pub updated_at: Option<String>,
}

pub async fn upsert_item_commercial(
    pool: &SqlitePool,
    item_id: i64,
    patch: &CommercialPatch,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO item_commercial (
            item_id, unit, quantity, brand, notes, usd_rate,
            unit_cost_usd, total_cost_usd, unit_cost_ars, total_cost_ars,
            min_margin, reference_total, reference_unit, reference_margin,
            acceptable_unit_price, acceptable_total_price,
            unit_improvement_price, improvement_margin,
            offer_to_beat, best_offer_text, change_note, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
        ON CONFLICT (item_id) DO UPDATE SET
            unit                   = COALESCE(excluded.unit, item_commercial.unit),
            quantity               = COALESCE(excluded.quantity, item_commercial.quantity),
            brand                  = COALESCE(excluded.brand, item_commercial.brand),
            notes                  = COALESCE(excluded.notes, item_commercial.notes),
            usd_rate               = COALESCE(excluded.usd_rate, item_commercial.usd_rate),
            unit_cost_usd          = COALESCE(excluded.unit_cost_usd, item_commercial.unit_cost_usd),
            total_cost_usd         = COALESCE(excluded.total_cost_usd, item_commercial.total_cost_usd),
            unit_cost_ars          = COALESCE(excluded.unit_cost_ars, item_commercial.unit_cost_ars),
            total_cost_ars         = COALESCE(excluded.total_cost_ars, item_commercial.total_cost_ars),
            min_margin             = COALESCE(excluded.min_margin, item_commercial.min_margin),
            reference_total        = COALESCE(excluded.reference_total, item_commercial.reference_total),
            reference_unit         = COALESCE(excluded.reference_unit, item_commercial.reference_unit),
            reference_margin       = COALESCE(excluded.reference_margin, item_commercial.reference_margin),
            acceptable_unit_price  = COALESCE(excluded.acceptable_unit_price, item_commercial.acceptable_unit_price),
            acceptable_total_price = COALESCE(excluded.acceptable_total_price, item_commercial.acceptable_total_price),
            unit_improvement_price = COALESCE(excluded.unit_improvement_price, item_commercial.unit_improvement_price),
            improvement_margin     = COALESCE(excluded.improvement_margin, item_commercial.improvement_margin),
            offer_to_beat          = COALESCE(excluded.offer_to_beat, item_commercial.offer_to_beat),
            best_offer_text        = COALESCE(excluded.best_offer_text, item_commercial.best_offer_text),
            change_note            = COALESCE(excluded.change_note, item_commercial.change_note),
            updated_at             = excluded.updated_at
        "#,
    )
    .bind(item_id)
    .bind(&patch.unit)
    .bind(patch.quantity)
    .bind(&patch.brand)
    .bind(&patch.notes)
    .bind(patch.usd_rate)
    .bind(patch.unit_cost_usd)
    .bind(patch.total_cost_usd)
    .bind(patch.unit_cost_ars)
    .bind(patch.total_cost_ars)
    .bind(patch.min_margin)
    .bind(patch.reference_total)
    .bind(patch.reference_unit)
    .bind(patch.reference_margin)
    .bind(patch.acceptable_unit_price)
    .bind(patch.acceptable_total_price)
    .bind(patch.unit_improvement_price)
    .bind(patch.improvement_margin)
    .bind(patch.offer_to_beat)
    .bind(&patch.best_offer_text)
    .bind(&patch.change_note)
    .bind(&patch.updated_at)
    .execute(pool)
    .await
    .context("upsert_item_commercial failed")?;
    Ok(())
}

pub async fn get_item_commercial(
    pool: &SqlitePool,
    item_id: i64,
) -> Result<Option<CommercialRow>> {
    let row = sqlx::query(
        "SELECT item_id, unit, quantity, brand, notes, usd_rate, \
                unit_cost_usd, total_cost_usd, unit_cost_ars, total_cost_ars, \
                min_margin, reference_total, reference_unit, reference_margin, \
                acceptable_unit_price, acceptable_total_price, \
                unit_improvement_price, improvement_margin, \
                offer_to_beat, best_offer_text, change_note, updated_at \
         FROM item_commercial WHERE item_id = ?1",
    )
    .bind(item_id)
    .fetch_optional(pool)
    .await
    .context("get_item_commercial failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(CommercialRow {
        item_id: row.try_get("item_id")?,
        unit: row.try_get("unit")?,
        quantity: row.try_get("quantity")?,
        brand: row.try_get("brand")?,
        notes: row.try_get("notes")?,
        usd_rate: row.try_get("usd_rate")?,
        unit_cost_usd: row.try_get("unit_cost_usd")?,
        total_cost_usd: row.try_get("total_cost_usd")?,
        unit_cost_ars: row.try_get("unit_cost_ars")?,
        total_cost_ars: row.try_get("total_cost_ars")?,
        min_margin: row.try_get("min_margin")?,
        reference_total: row.try_get("reference_total")?,
        reference_unit: row.try_get("reference_unit")?,
        reference_margin: row.try_get("reference_margin")?,
        acceptable_unit_price: row.try_get("acceptable_unit_price")?,
        acceptable_total_price: row.try_get("acceptable_total_price")?,
        unit_improvement_price: row.try_get("unit_improvement_price")?,
        improvement_margin: row.try_get("improvement_margin")?,
        offer_to_beat: row.try_get("offer_to_beat")?,
        best_offer_text: row.try_get("best_offer_text")?,
        change_note: row.try_get("change_note")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

// ---------------------------------------------------------------------------
// Item config (operator flags)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub follow: Option<bool>,
    pub my_bid: Option<bool>,
    pub min_margin_pct: Option<f64>,
    pub hide_below_threshold: Option<bool>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ConfigRow {
    pub item_id: i64,
    pub follow: bool,
    pub my_bid: bool,
    pub min_margin_pct: Option<f64>,
    pub hide_below_threshold: bool,
}

pub async fn upsert_item_config(
    pool: &SqlitePool,
    item_id: i64,
    patch: &ConfigPatch,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO item_config (item_id, follow, my_bid, min_margin_pct,
                                 hide_below_threshold, updated_at)
        VALUES (?1, COALESCE(?2, 0), COALESCE(?3, 0), ?4, COALESCE(?5, 0), ?6)
        ON CONFLICT (item_id) DO UPDATE SET
            follow               = COALESCE(?2, item_config.follow),
            my_bid               = COALESCE(?3, item_config.my_bid),
            min_margin_pct       = COALESCE(?4, item_config.min_margin_pct),
            hide_below_threshold = COALESCE(?5, item_config.hide_below_threshold),
            updated_at           = excluded.updated_at
        "#,
    )
    .bind(item_id)
    .bind(patch.follow.map(i64::from))
    .bind(patch.my_bid.map(i64::from))
    .bind(patch.min_margin_pct)
    .bind(patch.hide_below_threshold.map(i64::from))
    .bind(&patch.updated_at)
    .execute(pool)
    .await
    .context("upsert_item_config failed")?;
    Ok(())
}

pub async fn get_item_config(pool: &SqlitePool, item_id: i64) -> Result<Option<ConfigRow>> {
    let row = sqlx::query(
        "SELECT item_id, follow, my_bid, min_margin_pct, hide_below_threshold \
         FROM item_config WHERE item_id = ?1",
    )
    .bind(item_id)
    .fetch_optional(pool)
    .await
    .context("get_item_config failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(ConfigRow {
        item_id: row.try_get("item_id")?,
        follow: row.try_get::<i64, _>("follow")? != 0,
        my_bid: row.try_get::<i64, _>("my_bid")? != 0,
        min_margin_pct: row.try_get("min_margin_pct")?,
        hide_below_threshold: row.try_get::<i64, _>("hide_below_threshold")? != 0,
    }))
}

// ---------------------------------------------------------------------------
// Export projection
// ---------------------------------------------------------------------------

/// Stable, human-readable projection of one item for the spreadsheet
/// interface. Field names follow the external column contract.
#[derive(Debug, Clone, Default)]
pub struct ExportRow {
    pub id_subasta: String,
    pub item: String,
    pub descripcion: String,
    pub unidad_medida: Option<String>,
    pub cantidad: Option<f64>,
    pub marca: Option<String>,
    pub obs_usuario: Option<String>,
    pub conversion_usd: Option<f64>,
    pub costo_unit_usd: Option<f64>,
    pub costo_total_usd: Option<f64>,
    pub costo_unit_ars: Option<f64>,
    pub costo_total_ars: Option<f64>,
    pub renta_minima: Option<f64>,
    pub precio_unit_aceptable: Option<f64>,
    pub precio_total_aceptable: Option<f64>,
    pub precio_referencia: Option<f64>,
    pub precio_ref_unitario: Option<f64>,
    pub renta_referencia: Option<f64>,
    pub mejor_oferta_actual: Option<String>,
    pub oferta_para_mejorar: Option<f64>,
    pub precio_unit_mejora: Option<f64>,
    pub renta_para_mejorar: Option<f64>,
    pub obs_cambio: Option<String>,
}

pub async fn fetch_export_rows(pool: &SqlitePool, auction_id: i64) -> Result<Vec<ExportRow>> {
    let rows = sqlx::query(
        r#"
        SELECT
            a.id_cot                 AS id_subasta,
            i.id_renglon             AS item,
            i.description            AS descripcion,
            c.unit                   AS unidad_medida,
            c.quantity               AS cantidad,
            c.brand                  AS marca,
            c.notes                  AS obs_usuario,
            c.usd_rate               AS conversion_usd,
            c.unit_cost_usd          AS costo_unit_usd,
            c.total_cost_usd         AS costo_total_usd,
            c.unit_cost_ars          AS costo_unit_ars,
            c.total_cost_ars         AS costo_total_ars,
            c.min_margin             AS renta_minima,
            c.acceptable_unit_price  AS precio_unit_aceptable,
            c.acceptable_total_price AS precio_total_aceptable,
            c.reference_total        AS precio_referencia,
            c.reference_unit         AS precio_ref_unitario,
            c.reference_margin       AS renta_referencia,
            s.best_offer_text        AS mejor_oferta_actual,
            s.offer_to_beat          AS oferta_para_mejorar,
            c.unit_improvement_price AS precio_unit_mejora,
            c.improvement_margin     AS renta_para_mejorar,
            c.change_note            AS obs_cambio
        FROM item i
        JOIN auction a        ON a.id = i.auction_id
        LEFT JOIN item_commercial c ON c.item_id = i.id
        LEFT JOIN item_state s      ON s.item_id = i.id
        WHERE i.auction_id = ?1
        ORDER BY i.id_renglon
        "#,
    )
    .bind(auction_id)
    .fetch_all(pool)
    .await
    .context("fetch_export_rows failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ExportRow {
            id_subasta: row.try_get("id_subasta")?,
            item: row.try_get("item")?,
            descripcion: row.try_get("descripcion")?,
            unidad_medida: row.try_get("unidad_medida")?,
            cantidad: row.try_get("cantidad")?,
            marca: row.try_get("marca")?,
            obs_usuario: row.try_get("obs_usuario")?,
            conversion_usd: row.try_get("conversion_usd")?,
            costo_unit_usd: row.try_get("costo_unit_usd")?,
            costo_total_usd: row.try_get("costo_total_usd")?,
            costo_unit_ars: row.try_get("costo_unit_ars")?,
            costo_total_ars: row.try_get("costo_total_ars")?,
            renta_minima: row.try_get("renta_minima")?,
            precio_unit_aceptable: row.try_get("precio_unit_aceptable")?,
            precio_total_aceptable: row.try_get("precio_total_aceptable")?,
            precio_referencia: row.try_get("precio_referencia")?,
            precio_ref_unitario: row.try_get("precio_ref_unitario")?,
            renta_referencia: row.try_get("renta_referencia")?,
            mejor_oferta_actual: row.try_get("mejor_oferta_actual")?,
            oferta_para_mejorar: row.try_get("oferta_para_mejorar")?,
            precio_unit_mejora: row.try_get("precio_unit_mejora")?,
            renta_para_mejorar: row.try_get("renta_para_mejorar")?,
            obs_cambio: row.try_get("obs_cambio")?,
        });
    }
    Ok(out)
}
