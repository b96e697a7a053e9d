use std::str::FromStr;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};

use sbm_db::CommercialPatch;

async fn seed(pool: &SqlitePool) -> (i64, i64) {
    let auction_id = sbm_db::upsert_auction(pool, "22053", "u").await.unwrap();
    let item_id = sbm_db::upsert_item(pool, auction_id, "1", "R1", None)
        .await
        .unwrap();
    sbm_db::upsert_item_commercial(
        pool,
        item_id,
        &CommercialPatch {
            unit_cost_ars: Some(1.0),
            updated_at: "t".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    sbm_db::append_event(pool, "INFO", "UPDATE", "m", Some(auction_id), Some(item_id))
        .await
        .unwrap();
    sbm_db::set_ui_pref(pool, "k", "v").await.unwrap();
    (auction_id, item_id)
}

#[tokio::test]
async fn scenario_purge_logs_keeps_state() {
    let pool = sbm_db::open_in_memory().await.unwrap();
    let (auction_id, item_id) = seed(&pool).await;

    sbm_db::purge_logs(&pool).await.unwrap();

    assert_eq!(sbm_db::count_events(&pool).await.unwrap(), 0);
    assert!(sbm_db::get_item_commercial(&pool, item_id).await.unwrap().is_some());
    assert_eq!(
        sbm_db::get_auction_id_by_ext(&pool, "22053").await.unwrap(),
        Some(auction_id)
    );
}

#[tokio::test]
async fn scenario_purge_states_cascades_children_first() {
    let pool = sbm_db::open_in_memory().await.unwrap();
    let (_, item_id) = seed(&pool).await;

    sbm_db::purge_states(&pool).await.unwrap();

    assert_eq!(sbm_db::count_events(&pool).await.unwrap(), 0);
    assert!(sbm_db::get_item_commercial(&pool, item_id).await.unwrap().is_none());
    assert_eq!(sbm_db::get_auction_id_by_ext(&pool, "22053").await.unwrap(), None);
    // ui_preference survives a states purge.
    assert_eq!(
        sbm_db::get_ui_pref(&pool, "k").await.unwrap().as_deref(),
        Some("v")
    );
}

#[tokio::test]
async fn scenario_purge_all_clears_preferences_too() {
    let pool = sbm_db::open_in_memory().await.unwrap();
    seed(&pool).await;

    sbm_db::purge_all(&pool).await.unwrap();

    assert_eq!(sbm_db::get_ui_pref(&pool, "k").await.unwrap(), None);
}

#[tokio::test]
async fn scenario_additive_migration_adds_missing_columns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.db");

    // Fabricate an old-generation file: item_commercial without the USD and
    // derived columns.
    {
        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let raw = SqlitePool::connect_with(opts).await.unwrap();
        sqlx::query(
            "CREATE TABLE item_commercial (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 item_id INTEGER NOT NULL UNIQUE,
                 unit TEXT, quantity REAL, brand TEXT, notes TEXT,
                 updated_at TEXT
             )",
        )
        .execute(&raw)
        .await
        .unwrap();
        raw.close().await;
    }

    let pool = sbm_db::open(&path).await.unwrap();

    let cols = sqlx::query("PRAGMA table_info(item_commercial)")
        .fetch_all(&pool)
        .await
        .unwrap();
    let names: Vec<String> = cols
        .iter()
        .map(|r| r.try_get::<String, _>("name").unwrap())
        .collect();

    for expected in [
        "usd_rate",
        "unit_cost_usd",
        "min_margin",
        "improvement_margin",
        "reference_auction_price",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }

    // The migrated file is fully usable.
    let auction_id = sbm_db::upsert_auction(&pool, "1", "").await.unwrap();
    let item_id = sbm_db::upsert_item(&pool, auction_id, "1", "R", None)
        .await
        .unwrap();
    sbm_db::upsert_item_commercial(
        &pool,
        item_id,
        &CommercialPatch {
            min_margin: Some(0.1),
            updated_at: "t".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn scenario_legacy_multiplier_margin_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.db");

    {
        let pool = sbm_db::open(&path).await.unwrap();
        let auction_id = sbm_db::upsert_auction(&pool, "1", "").await.unwrap();
        let item_id = sbm_db::upsert_item(&pool, auction_id, "1", "R", None)
            .await
            .unwrap();
        // Bypass the API to plant a legacy multiplier value.
        sqlx::query("INSERT INTO item_commercial (item_id, min_margin, updated_at) VALUES (?1, 1.3, 't')")
            .bind(item_id)
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let err = sbm_db::open(&path).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("min_margin"), "unexpected error: {msg}");

    // A separate handle confirms the canonical path is unchanged: SQLite
    // never rescaled anything behind the operator's back.
    let opts = SqliteConnectOptions::from_str(path.to_str().unwrap()).unwrap();
    let raw = SqlitePool::connect_with(opts).await.unwrap();
    let row = sqlx::query("SELECT min_margin FROM item_commercial")
        .fetch_one(&raw)
        .await
        .unwrap();
    assert_eq!(row.try_get::<f64, _>("min_margin").unwrap(), 1.3);
}
