//! SQLite store for the auction monitor.
//!
//! Single-writer by construction: the pool holds exactly one connection, so
//! every statement serializes through the pool's queue. Readers share that
//! connection. PRAGMAs applied on connect: foreign_keys ON, WAL,
//! synchronous NORMAL, 5 s busy timeout.
//!
//! The engine is the only component that writes item/auction state; the
//! operator surface writes commercial data, config and preferences through
//! the same API.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

mod commercial;
mod schema;

pub use commercial::{
    fetch_export_rows, get_item_commercial, get_item_config, upsert_item_commercial,
    upsert_item_config, CommercialPatch, CommercialRow, ConfigPatch, ConfigRow, ExportRow,
};

// ---------------------------------------------------------------------------
// Open / migrate
// ---------------------------------------------------------------------------

/// Open (creating if missing) the store at `path` and bring its schema up to
/// date. Fails if the file holds non-canonical margin values (fractions must
/// be within [0, 1]; legacy multiplier stores need an explicit migration).
pub async fn open(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
    }

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = pool_with(opts).await?;
    init(&pool).await?;
    Ok(pool)
}

/// In-memory store for tests. Same schema path, memory journal (WAL has no
/// meaning without a file).
pub async fn open_in_memory() -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("in-memory options")?
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Memory);

    let pool = pool_with(opts).await?;
    init(&pool).await?;
    Ok(pool)
}

async fn pool_with(opts: SqliteConnectOptions) -> Result<SqlitePool> {
    // One connection: all writes serialize through the pool queue. The
    // single in-memory database also lives and dies with this connection,
    // hence no idle reaping.
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .context("failed to open sqlite store")
}

async fn init(pool: &SqlitePool) -> Result<()> {
    for stmt in schema::SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("schema statement failed")?;
    }
    ensure_columns(pool).await?;
    assert_margins_canonical(pool).await?;
    Ok(())
}

/// Additive migration: add any column from the versioned list that an older
/// file is missing. Never drops or renames.
async fn ensure_columns(pool: &SqlitePool) -> Result<()> {
    for (table, column, ty) in schema::VERSIONED_COLUMNS {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(pool)
            .await
            .with_context(|| format!("table_info({table}) failed"))?;

        let present = rows.iter().any(|r| {
            r.try_get::<String, _>("name")
                .map(|n| n == *column)
                .unwrap_or(false)
        });

        if !present {
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ty}"))
                .execute(pool)
                .await
                .with_context(|| format!("add column {table}.{column}"))?;
        }
    }
    Ok(())
}

/// Margins are canonical fractions in [0, 1]. A legacy store holding
/// multiplier-format values (e.g. 1.3 for 30%) must be migrated explicitly;
/// refusing to open beats silently rescaling someone's cost sheet.
async fn assert_margins_canonical(pool: &SqlitePool) -> Result<()> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM item_commercial \
         WHERE min_margin IS NOT NULL AND (min_margin < 0.0 OR min_margin > 1.0)",
    )
    .fetch_one(pool)
    .await
    .context("margin range check failed")?;

    let n: i64 = row.try_get("n")?;
    if n > 0 {
        return Err(anyhow!(
            "store holds {n} item(s) with min_margin outside [0, 1]; \
             run the margin migration before opening this file"
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Auction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuctionRow {
    pub id: i64,
    pub id_cot: String,
    pub url: String,
    pub state: String,
    pub mi_id_proveedor: Option<String>,
    pub err_streak: i64,
    pub last_ok_at: Option<String>,
    pub last_http_code: Option<i64>,
    pub ended_at: Option<String>,
}

/// Create (or refresh the URL of) an auction keyed by its external id.
/// Returns the primary key.
pub async fn upsert_auction(pool: &SqlitePool, id_cot: &str, url: &str) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO auction (id_cot, url)
        VALUES (?1, ?2)
        ON CONFLICT (id_cot) DO UPDATE
            SET url = CASE WHEN excluded.url != '' THEN excluded.url ELSE auction.url END
        RETURNING id
        "#,
    )
    .bind(id_cot)
    .bind(url)
    .fetch_one(pool)
    .await
    .context("upsert_auction failed")?;

    Ok(row.try_get("id")?)
}

/// Update operational fields; `None` leaves a field untouched.
pub async fn set_auction_state(
    pool: &SqlitePool,
    auction_id: i64,
    state: &str,
    last_ok_at: Option<&str>,
    last_http_code: Option<i64>,
    err_streak: Option<i64>,
    ended_at: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE auction
           SET state          = ?2,
               last_ok_at     = COALESCE(?3, last_ok_at),
               last_http_code = COALESCE(?4, last_http_code),
               err_streak     = COALESCE(?5, err_streak),
               ended_at       = COALESCE(?6, ended_at)
         WHERE id = ?1
        "#,
    )
    .bind(auction_id)
    .bind(state)
    .bind(last_ok_at)
    .bind(last_http_code)
    .bind(err_streak)
    .bind(ended_at)
    .execute(pool)
    .await
    .context("set_auction_state failed")?;
    Ok(())
}

pub async fn fetch_auction(pool: &SqlitePool, auction_id: i64) -> Result<AuctionRow> {
    let row = sqlx::query(
        "SELECT id, id_cot, url, state, mi_id_proveedor, err_streak, last_ok_at, \
                last_http_code, ended_at \
         FROM auction WHERE id = ?1",
    )
    .bind(auction_id)
    .fetch_one(pool)
    .await
    .context("fetch_auction failed")?;

    Ok(AuctionRow {
        id: row.try_get("id")?,
        id_cot: row.try_get("id_cot")?,
        url: row.try_get("url")?,
        state: row.try_get("state")?,
        mi_id_proveedor: row.try_get("mi_id_proveedor")?,
        err_streak: row.try_get("err_streak")?,
        last_ok_at: row.try_get("last_ok_at")?,
        last_http_code: row.try_get("last_http_code")?,
        ended_at: row.try_get("ended_at")?,
    })
}

pub async fn get_auction_id_by_ext(pool: &SqlitePool, id_cot: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM auction WHERE id_cot = ?1")
        .bind(id_cot)
        .fetch_optional(pool)
        .await
        .context("get_auction_id_by_ext failed")?;
    Ok(row.map(|r| r.try_get("id")).transpose()?)
}

/// The single RUNNING auction the operator is watching (latest wins if a
/// stale file holds several).
pub async fn get_running_auction_id(pool: &SqlitePool) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM auction WHERE state = 'RUNNING' ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("get_running_auction_id failed")?;
    Ok(row.map(|r| r.try_get("id")).transpose()?)
}

pub async fn get_latest_auction_id(pool: &SqlitePool) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM auction ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("get_latest_auction_id failed")?;
    Ok(row.map(|r| r.try_get("id")).transpose()?)
}

pub async fn set_mi_id_proveedor(
    pool: &SqlitePool,
    auction_id: i64,
    provider_id: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE auction SET mi_id_proveedor = ?2 WHERE id = ?1")
        .bind(auction_id)
        .bind(provider_id)
        .execute(pool)
        .await
        .context("set_mi_id_proveedor failed")?;
    Ok(())
}

pub async fn get_mi_id_proveedor(pool: &SqlitePool, auction_id: i64) -> Result<Option<String>> {
    let row = sqlx::query("SELECT mi_id_proveedor FROM auction WHERE id = ?1")
        .bind(auction_id)
        .fetch_optional(pool)
        .await
        .context("get_mi_id_proveedor failed")?;
    Ok(row.and_then(|r| r.try_get("mi_id_proveedor").ok()))
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Create an item if missing; refresh description (the portal occasionally
/// rewrites option texts) and keep the margin text unless a new one arrives.
pub async fn upsert_item(
    pool: &SqlitePool,
    auction_id: i64,
    id_renglon: &str,
    description: &str,
    min_margin_text: Option<&str>,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO item (auction_id, id_renglon, description, min_margin_text)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (auction_id, id_renglon) DO UPDATE
            SET description     = excluded.description,
                min_margin_text = COALESCE(excluded.min_margin_text, item.min_margin_text)
        RETURNING id
        "#,
    )
    .bind(auction_id)
    .bind(id_renglon)
    .bind(description)
    .bind(min_margin_text)
    .fetch_one(pool)
    .await
    .context("upsert_item failed")?;

    Ok(row.try_get("id")?)
}

pub async fn get_item_id_by_keys(
    pool: &SqlitePool,
    auction_id: i64,
    id_renglon: &str,
) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM item WHERE auction_id = ?1 AND id_renglon = ?2")
        .bind(auction_id)
        .bind(id_renglon)
        .fetch_optional(pool)
        .await
        .context("get_item_id_by_keys failed")?;
    Ok(row.map(|r| r.try_get("id")).transpose()?)
}

// ---------------------------------------------------------------------------
// Item state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ItemStateWrite {
    pub best_offer_text: String,
    pub best_offer: Option<f64>,
    pub offer_to_beat_text: String,
    pub offer_to_beat: Option<f64>,
    pub budget_text: String,
    pub budget: Option<f64>,
    pub portal_message: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ItemStateRow {
    pub item_id: i64,
    pub best_offer_text: Option<String>,
    pub best_offer: Option<f64>,
    pub offer_to_beat_text: Option<String>,
    pub offer_to_beat: Option<f64>,
    pub budget_text: Option<String>,
    pub budget: Option<f64>,
    pub portal_message: Option<String>,
    pub updated_at: Option<String>,
}

/// One state row per item; full overwrite on every UPDATE event.
pub async fn upsert_item_state(
    pool: &SqlitePool,
    item_id: i64,
    state: &ItemStateWrite,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO item_state (
            item_id, best_offer_text, best_offer, offer_to_beat_text, offer_to_beat,
            budget_text, budget, portal_message, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (item_id) DO UPDATE SET
            best_offer_text    = excluded.best_offer_text,
            best_offer         = excluded.best_offer,
            offer_to_beat_text = excluded.offer_to_beat_text,
            offer_to_beat      = excluded.offer_to_beat,
            budget_text        = excluded.budget_text,
            budget             = excluded.budget,
            portal_message     = excluded.portal_message,
            updated_at         = excluded.updated_at
        "#,
    )
    .bind(item_id)
    .bind(&state.best_offer_text)
    .bind(state.best_offer)
    .bind(&state.offer_to_beat_text)
    .bind(state.offer_to_beat)
    .bind(&state.budget_text)
    .bind(state.budget)
    .bind(&state.portal_message)
    .bind(&state.updated_at)
    .execute(pool)
    .await
    .context("upsert_item_state failed")?;
    Ok(())
}

pub async fn get_item_state(pool: &SqlitePool, item_id: i64) -> Result<Option<ItemStateRow>> {
    let row = sqlx::query(
        "SELECT item_id, best_offer_text, best_offer, offer_to_beat_text, offer_to_beat, \
                budget_text, budget, portal_message, updated_at \
         FROM item_state WHERE item_id = ?1",
    )
    .bind(item_id)
    .fetch_optional(pool)
    .await
    .context("get_item_state failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(ItemStateRow {
        item_id: row.try_get("item_id")?,
        best_offer_text: row.try_get("best_offer_text")?,
        best_offer: row.try_get("best_offer")?,
        offer_to_beat_text: row.try_get("offer_to_beat_text")?,
        offer_to_beat: row.try_get("offer_to_beat")?,
        budget_text: row.try_get("budget_text")?,
        budget: row.try_get("budget")?,
        portal_message: row.try_get("portal_message")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Append-only observability log. Returns the row id.
pub async fn append_event(
    pool: &SqlitePool,
    level: &str,
    kind: &str,
    message: &str,
    auction_id: Option<i64>,
    item_id: Option<i64>,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO event_log (auction_id, item_id, level, kind, message)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING id
        "#,
    )
    .bind(auction_id)
    .bind(item_id)
    .bind(level)
    .bind(kind)
    .bind(message)
    .fetch_one(pool)
    .await
    .context("append_event failed")?;

    Ok(row.try_get("id")?)
}

#[derive(Debug, Clone)]
pub struct EventLogRow {
    pub id: i64,
    pub auction_id: Option<i64>,
    pub item_id: Option<i64>,
    pub level: String,
    pub kind: String,
    pub message: String,
    pub created_at: String,
}

/// Most recent log entries, newest first.
pub async fn fetch_recent_events(pool: &SqlitePool, limit: i64) -> Result<Vec<EventLogRow>> {
    let rows = sqlx::query(
        "SELECT id, auction_id, item_id, level, kind, message, created_at \
         FROM event_log ORDER BY id DESC LIMIT ?1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetch_recent_events failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(EventLogRow {
            id: row.try_get("id")?,
            auction_id: row.try_get("auction_id")?,
            item_id: row.try_get("item_id")?,
            level: row.try_get("level")?,
            kind: row.try_get("kind")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

pub async fn count_events(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM event_log")
        .fetch_one(pool)
        .await
        .context("count_events failed")?;
    Ok(row.try_get("n")?)
}

// ---------------------------------------------------------------------------
// UI preferences
// ---------------------------------------------------------------------------

pub async fn get_ui_pref(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM ui_preference WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("get_ui_pref failed")?;
    Ok(row.map(|r| r.try_get("value")).transpose()?)
}

pub async fn set_ui_pref(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ui_preference (key, value, updated_at)
        VALUES (?1, ?2, datetime('now'))
        ON CONFLICT (key) DO UPDATE
            SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("set_ui_pref failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

/// Delete the event log only.
pub async fn purge_logs(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM event_log")
        .execute(pool)
        .await
        .context("purge_logs failed")?;
    Ok(())
}

/// Delete all monitoring state: children before parents, FK enforcement
/// suspended for the duration of the cascade.
pub async fn purge_states(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(pool)
        .await
        .context("purge_states: fk off failed")?;

    let result = async {
        for table in [
            "item_state",
            "item_config",
            "item_commercial",
            "event_log",
            "item",
            "auction",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(pool)
                .await
                .with_context(|| format!("purge_states: delete {table} failed"))?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await
        .context("purge_states: fk on failed")?;

    result
}

/// States plus UI preferences.
pub async fn purge_all(pool: &SqlitePool) -> Result<()> {
    purge_states(pool).await?;
    sqlx::query("DELETE FROM ui_preference")
        .execute(pool)
        .await
        .context("purge_all: delete ui_preference failed")?;
    Ok(())
}
