//! `sbm` entry point.
//!
//! Thin on purpose: parse arguments, load the layered configuration, open
//! the store, wire the runtime, and print the processed event stream until
//! Ctrl-C. Everything interesting lives in the library crates.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use sbm_collector::browser::BrowserCollectorConfig;
use sbm_collector::http::HttpCollectorConfig;
use sbm_config::{AppConfig, Mode};
use sbm_engine::EngineConfig;
use sbm_events::{Event, EventKind, EventLevel};
use sbm_runtime::{CleanupMode, Runtime};
use sbm_security::SecurityConfig;

#[derive(Parser)]
#[command(name = "sbm")]
#[command(about = "Subasta monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring pipeline until Ctrl-C.
    Run {
        /// Layered YAML config paths in merge order.
        #[arg(long = "config")]
        config_paths: Vec<String>,

        /// Override the configured mode (mock | browser | direct-http).
        #[arg(long)]
        mode: Option<String>,

        /// Override the store path.
        #[arg(long)]
        db: Option<String>,

        /// Scenario file for mock mode.
        #[arg(long)]
        scenario: Option<String>,
    },

    /// Store commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Export the current (or given) auction to CSV.
    Export {
        #[arg(long, default_value = "data/subastas.db")]
        db: String,
        /// External auction id; defaults to the running/latest auction.
        #[arg(long)]
        auction: Option<String>,
        #[arg(long)]
        out: String,
    },

    /// Import operator columns from a CSV sheet.
    Import {
        #[arg(long, default_value = "data/subastas.db")]
        db: String,
        #[arg(long)]
        file: String,
    },

    /// Purge store data (logs | states | all).
    Cleanup {
        #[arg(long, default_value = "data/subastas.db")]
        db: String,
        mode: String,
    },

    /// Compute the layered config hash and print the canonical JSON.
    ConfigHash {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status {
        #[arg(long, default_value = "data/subastas.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production sets real env vars.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Run {
            config_paths,
            mode,
            db,
            scenario,
        } => run(config_paths, mode, db, scenario).await,

        Commands::Db { cmd } => match cmd {
            DbCmd::Status { db } => {
                let pool = sbm_db::open(Path::new(&db)).await?;
                let running = sbm_db::get_running_auction_id(&pool).await?;
                let events = sbm_db::count_events(&pool).await?;
                println!("store={db} running_auction={running:?} events={events}");
                Ok(())
            }
        },

        Commands::Export { db, auction, out } => {
            let pool = sbm_db::open(Path::new(&db)).await?;
            let auction_id = match auction {
                Some(ext) => sbm_db::get_auction_id_by_ext(&pool, &ext)
                    .await?
                    .ok_or_else(|| anyhow!("unknown auction {ext}"))?,
                None => match sbm_db::get_running_auction_id(&pool).await? {
                    Some(pk) => pk,
                    None => sbm_db::get_latest_auction_id(&pool)
                        .await?
                        .ok_or_else(|| anyhow!("no auctions in the store"))?,
                },
            };
            let rows = sbm_exchange::export_csv(&pool, auction_id, Path::new(&out)).await?;
            println!("exported_rows={rows} path={out}");
            Ok(())
        }

        Commands::Import { db, file } => {
            let pool = sbm_db::open(Path::new(&db)).await?;
            let report = sbm_exchange::import_csv(&pool, Path::new(&file)).await?;
            println!(
                "updated={} skipped={} rejected={}",
                report.updated,
                report.skipped,
                report.rejected.len()
            );
            for (item, err) in &report.rejected {
                eprintln!("rejected item {item}: {err}");
            }
            Ok(())
        }

        Commands::Cleanup { db, mode } => {
            let pool = sbm_db::open(Path::new(&db)).await?;
            match mode.parse::<CleanupMode>()? {
                CleanupMode::Logs => sbm_db::purge_logs(&pool).await?,
                CleanupMode::States => sbm_db::purge_states(&pool).await?,
                CleanupMode::All => sbm_db::purge_all(&pool).await?,
            }
            println!("cleanup={mode} done");
            Ok(())
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = sbm_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
            Ok(())
        }
    }
}

async fn run(
    config_paths: Vec<String>,
    mode_override: Option<String>,
    db_override: Option<String>,
    scenario_override: Option<String>,
) -> Result<()> {
    let mut cfg = if config_paths.is_empty() {
        AppConfig::default()
    } else {
        let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
        let loaded = sbm_config::load_layered_yaml(&path_refs)?;
        tracing::info!("config_hash={}", loaded.config_hash);
        loaded.config
    };

    if let Some(mode) = mode_override {
        cfg.mode = match mode.as_str() {
            "mock" => Mode::Mock,
            "browser" => Mode::Browser,
            "direct-http" => Mode::DirectHttp,
            other => return Err(anyhow!("invalid mode: {other}")),
        };
    }
    if let Some(db) = db_override {
        cfg.db_path = db;
    }
    if let Some(scenario) = scenario_override {
        cfg.scenario_path = Some(scenario);
    }
    let cfg = cfg.validated()?;

    let pool = sbm_db::open(Path::new(&cfg.db_path))
        .await
        .context("open store")?;

    let engine_cfg = EngineConfig {
        default_min_margin_pct: cfg.default_min_margin_pct,
        default_hide_below_threshold: cfg.default_hide_below_threshold,
        agg_window_seconds: cfg.agg_window_seconds,
        security: SecurityConfig {
            max_streak: cfg.security.max_streak,
            min_streak_for_backoff: cfg.security.min_streak_for_backoff,
            backoff_factor: cfg.security.backoff_factor,
            cadence_ceiling_s: cfg.security.cadence_ceiling_s,
            inactivity_ceiling_min: cfg.security.inactivity_ceiling_min,
            ignore_transient_timeout: cfg.security.ignore_transient_timeout,
        },
    };

    let mut runtime = Runtime::new(pool, engine_cfg, cfg.base_cadence_seconds);

    match cfg.mode {
        Mode::Mock => {
            let path = cfg.scenario_path.as_ref().expect("validated");
            let scenario = sbm_collector::mock::load_scenario(Path::new(path))?;
            runtime.install_mock(scenario);
        }
        Mode::Browser | Mode::DirectHttp => {
            runtime.install_browser(BrowserCollectorConfig {
                webdriver_url: cfg.webdriver_url.clone(),
                listing_url: cfg.listing_url.clone(),
                base_cadence_s: cfg.base_cadence_seconds,
                relaxed_cadence_s: cfg.relaxed_cadence(),
                ..Default::default()
            });
        }
    }

    let mut out = runtime
        .take_output()
        .ok_or_else(|| anyhow!("output already taken"))?;

    runtime.start()?;

    if matches!(cfg.mode, Mode::Browser | Mode::DirectHttp) {
        // The operator logs in and opens the auction in the driven browser;
        // capture waits for them.
        runtime.capture_current()?;
        tracing::info!("waiting for capture: open the auction in the browser");
    }

    let http_cfg = HttpCollectorConfig {
        base_cadence_s: cfg.base_cadence_seconds,
        relaxed_cadence_s: cfg.relaxed_cadence(),
        intensive: true,
        concurrent_requests: cfg.concurrent_requests,
        timeout_intensive_s: cfg.request_timeout_intensive_s,
        timeout_relaxed_s: cfg.request_timeout_relaxed_s,
        auth_failures_max: cfg.auth_failures_max,
    };
    let mut direct_active = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            ev = out.recv() => {
                let Some(ev) = ev else { break };
                render_event(&ev);

                // Direct mode: hand the polling loop over once the browser
                // has captured a session.
                if cfg.mode == Mode::DirectHttp
                    && ev.kind == EventKind::Snapshot
                    && !direct_active
                {
                    match runtime.set_direct_http_mode(http_cfg.clone()) {
                        Ok(()) => {
                            direct_active = true;
                            tracing::info!("direct-http monitor took over polling");
                        }
                        Err(e) => tracing::warn!("direct takeover failed: {e:#}"),
                    }
                }
            }
        }
    }

    runtime.stop().await;
    Ok(())
}

fn render_event(ev: &Event) {
    let kind = ev.kind.as_str();
    match ev.level {
        EventLevel::Debug => tracing::debug!(kind, "{}", ev.message),
        EventLevel::Info => tracing::info!(kind, "{}", ev.message),
        EventLevel::Warn => tracing::warn!(kind, "{}", ev.message),
        EventLevel::Error => tracing::error!(kind, "{}", ev.message),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
