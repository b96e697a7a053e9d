//! Embedded schema plus the versioned column list used for additive
//! migrations.
//!
//! Migration policy: never drop or rename a column in place. New columns are
//! appended to [`VERSIONED_COLUMNS`] with a conservative type and added by
//! name on open, so older store files keep working.

/// Initial schema. Idempotent via IF NOT EXISTS; one statement per entry
/// because the sqlite driver executes single statements.
pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS auction (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        id_cot          TEXT NOT NULL UNIQUE,
        url             TEXT NOT NULL DEFAULT '',
        state           TEXT NOT NULL DEFAULT 'RUNNING',
        mi_id_proveedor TEXT,
        err_streak      INTEGER NOT NULL DEFAULT 0,
        last_ok_at      TEXT,
        last_http_code  INTEGER,
        ended_at        TEXT,
        created_at      TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        auction_id      INTEGER NOT NULL REFERENCES auction(id),
        id_renglon      TEXT NOT NULL,
        description     TEXT NOT NULL DEFAULT '',
        min_margin_text TEXT,
        UNIQUE (auction_id, id_renglon)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_state (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id            INTEGER NOT NULL UNIQUE REFERENCES item(id),
        best_offer_text    TEXT,
        best_offer         REAL,
        offer_to_beat_text TEXT,
        offer_to_beat      REAL,
        budget_text        TEXT,
        budget             REAL,
        portal_message     TEXT,
        updated_at         TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_commercial (
        id                     INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id                INTEGER NOT NULL UNIQUE REFERENCES item(id),
        unit                   TEXT,
        quantity               REAL,
        brand                  TEXT,
        notes                  TEXT,
        usd_rate               REAL,
        unit_cost_usd          REAL,
        total_cost_usd         REAL,
        unit_cost_ars          REAL,
        total_cost_ars         REAL,
        min_margin             REAL,
        reference_total        REAL,
        reference_unit         REAL,
        reference_margin       REAL,
        acceptable_unit_price  REAL,
        acceptable_total_price REAL,
        unit_improvement_price REAL,
        improvement_margin     REAL,
        offer_to_beat          REAL,
        best_offer_text        TEXT,
        change_note            TEXT,
        updated_at             TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_config (
        id                   INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id              INTEGER NOT NULL UNIQUE REFERENCES item(id),
        follow               INTEGER NOT NULL DEFAULT 0,
        my_bid               INTEGER NOT NULL DEFAULT 0,
        min_margin_pct       REAL,
        hide_below_threshold INTEGER NOT NULL DEFAULT 0,
        updated_at           TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_log (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        auction_id INTEGER REFERENCES auction(id),
        item_id    INTEGER REFERENCES item(id),
        level      TEXT NOT NULL,
        kind       TEXT NOT NULL,
        message    TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ui_preference (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_item_auction ON item(auction_id)",
    "CREATE INDEX IF NOT EXISTS idx_event_log_auction ON event_log(auction_id)",
];

/// Full expected column set per table, in append order. `ensure_columns`
/// adds any that are missing from an older file.
///
/// `reference_auction_price` is a legacy column kept for read compatibility
/// with pre-split stores; new writes never touch it.
pub(crate) const VERSIONED_COLUMNS: &[(&str, &str, &str)] = &[
    ("auction", "mi_id_proveedor", "TEXT"),
    ("auction", "err_streak", "INTEGER"),
    ("auction", "last_ok_at", "TEXT"),
    ("auction", "last_http_code", "INTEGER"),
    ("auction", "ended_at", "TEXT"),
    ("item", "min_margin_text", "TEXT"),
    ("item_state", "budget_text", "TEXT"),
    ("item_state", "budget", "REAL"),
    ("item_state", "portal_message", "TEXT"),
    ("item_commercial", "usd_rate", "REAL"),
    ("item_commercial", "unit_cost_usd", "REAL"),
    ("item_commercial", "total_cost_usd", "REAL"),
    ("item_commercial", "unit_cost_ars", "REAL"),
    ("item_commercial", "total_cost_ars", "REAL"),
    ("item_commercial", "min_margin", "REAL"),
    ("item_commercial", "reference_total", "REAL"),
    ("item_commercial", "reference_unit", "REAL"),
    ("item_commercial", "reference_margin", "REAL"),
    ("item_commercial", "acceptable_unit_price", "REAL"),
    ("item_commercial", "acceptable_total_price", "REAL"),
    ("item_commercial", "unit_improvement_price", "REAL"),
    ("item_commercial", "improvement_margin", "REAL"),
    ("item_commercial", "offer_to_beat", "REAL"),
    ("item_commercial", "best_offer_text", "TEXT"),
    ("item_commercial", "change_note", "TEXT"),
    ("item_commercial", "reference_auction_price", "REAL"),
    ("item_config", "min_margin_pct", "REAL"),
    ("item_config", "hide_below_threshold", "INTEGER"),
];
