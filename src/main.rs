//! 15-minute Polymarket edge bot entry point.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use polymarket_edge::api::{create_router, AppState};
use polymarket_edge::audit::spawn_audit_writer;
use polymarket_edge::config::Config;
use polymarket_edge::feed::{load_watchlist, spawn_polling_feed};
use polymarket_edge::market::client::{ClobClient, ExchangeApi};
use polymarket_edge::metrics;
use polymarket_edge::redemption::{
    PolygonChain, RedemptionEngine, SettlementChain, MIN_NATIVE_GAS_WEI,
};
use polymarket_edge::signing::address_from_private_key;
use polymarket_edge::strategy::model::{PriceModel, TableModel};
use polymarket_edge::strategy::{KillSwitch, StrategyEngine};
use polymarket_edge::trading::ExecutionClient;
use polymarket_edge::utils::{short_id, shutdown_signal};

/// 15-minute Polymarket Up/Down edge bot.
#[derive(Parser, Debug)]
#[command(name = "polymarket-edge")]
#[command(about = "Edge-trading and claim-redemption bot for 15-minute Up/Down markets")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Run in dry-run mode (no real orders).
    #[arg(long)]
    dry_run: Option<bool>,

    /// HTTP server port for health/status.
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the trading and redemption engines (default).
    Run {
        /// Run in dry-run mode (no real orders).
        #[arg(long)]
        dry_run: Option<bool>,

        /// HTTP server port for health/status.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Check wallet balance and connection.
    CheckBalance,

    /// Run one redemption cycle and exit.
    Claim,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("polymarket_edge=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    metrics::init_metrics();

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config().await,
        Some(Command::CheckBalance) => cmd_check_balance().await,
        Some(Command::Claim) => cmd_claim().await,
        Some(Command::Run { dry_run, port }) => cmd_run(dry_run, port).await,
        None => cmd_run(args.dry_run, args.port).await,
    }
}

fn load_validated_config() -> anyhow::Result<Config> {
    let config = Config::load()?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

/// Check configuration validity.
async fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("POLYMARKET EDGE BOT - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    print!("Checking private key... ");
    match address_from_private_key(&config.polymarket_private_key) {
        Ok(addr) => {
            println!("OK");
            println!("  Wallet address: {}", addr);
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Private key invalid"));
        }
    }

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Dry Run: {}", config.dry_run);
    println!("  Exposure Cap: {} shares/side", config.exposure_cap_shares);
    println!("  Entry Size: {} shares", config.entry_size);
    println!("  Min Entry Edge: {}", config.min_entry_edge);
    println!(
        "  Entry Window: {}s - {}s",
        config.entry_window_start_secs, config.entry_window_end_secs
    );
    println!("  Hedge Dwell: {}s", config.hedge_dwell_secs);
    println!("  API Credentials: {}", if config.has_api_credentials() {
        "pre-generated"
    } else {
        "derived from wallet"
    });
    println!("  Claim Interval: {}s", config.claim_interval_secs);
    match &config.watchlist_path {
        Some(path) => println!("  Watchlist: {}", path),
        None => println!("  WARNING: WATCHLIST_PATH is not set, run will fail"),
    }
    match &config.price_model_path {
        Some(path) => println!("  Price Model: {}", path),
        None => println!("  WARNING: PRICE_MODEL_PATH is not set, no entries will trigger"),
    }
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Check wallet balance and connection.
async fn cmd_check_balance() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("POLYMARKET EDGE BOT - BALANCE CHECK");
    println!("======================================================================");

    let config = load_validated_config()?;

    println!("Host: {}", config.polymarket_clob_url);
    println!("Private Key: present");
    println!("======================================================================");

    print!("\n1. Creating client... ");
    let exchange = Arc::new(ClobClient::new(&config)?);
    println!("OK");
    println!("   Address: {}", exchange.wallet_address());

    let chain = PolygonChain::new(
        config.polygon_rpc_url.clone(),
        config.polymarket_private_key.clone(),
    );

    print!("\n2. Getting USDC balance... ");
    let exec = ExecutionClient::new(exchange.clone(), config);
    match exec.balance().await {
        Ok(balance) => {
            println!("OK");
            println!("   USDC Balance: ${}", balance);
        }
        Err(e) => {
            println!("FAILED");
            println!("   Error: {}", e);
        }
    }

    print!("\n3. Getting native gas balance... ");
    match chain.native_balance().await {
        Ok(wei) => {
            println!("OK");
            println!("   POL Balance: {} wei", wei);
            if wei < MIN_NATIVE_GAS_WEI {
                println!("   WARNING: below the redemption gas floor ({} wei)", MIN_NATIVE_GAS_WEI);
            }
        }
        Err(e) => {
            println!("FAILED");
            println!("   Error: {}", e);
        }
    }

    print!("\n4. Getting positions... ");
    match exchange.fetch_positions(None).await {
        Ok(page) => {
            println!("OK");
            println!("   Positions on first page: {}", page.positions.len());
            for position in page.positions.iter().take(5) {
                println!(
                    "   - Condition: {} Value: ${} Redeemable: {}",
                    short_id(&position.condition_id),
                    position.value,
                    position.redeemable
                );
            }
        }
        Err(e) => {
            println!("FAILED");
            println!("   Error: {}", e);
        }
    }

    println!("\n======================================================================");
    println!("BALANCE CHECK COMPLETED");
    println!("======================================================================");

    Ok(())
}

/// Run one redemption cycle and exit.
async fn cmd_claim() -> anyhow::Result<()> {
    let config = load_validated_config()?;
    info!(
        dry_run = config.dry_run,
        "running a single redemption cycle"
    );

    let exchange: Arc<dyn ExchangeApi> = Arc::new(ClobClient::new(&config)?);
    let chain = Arc::new(PolygonChain::new(
        config.polygon_rpc_url.clone(),
        config.polymarket_private_key.clone(),
    ));
    let (audit, audit_task) = spawn_audit_writer(config.audit_log_path.clone());

    let engine = RedemptionEngine::new(exchange, chain, config, audit);
    let report = engine.run_cycle().await;

    println!("Redemption cycle report:");
    println!("  Considered: {}", report.considered);
    println!("  Submitted:  {}", report.submitted);
    println!("  Confirmed:  {}", report.confirmed);
    println!("  Retried:    {}", report.retried);
    println!("  Failed:     {}", report.failed);

    drop(engine);
    audit_task.abort();
    Ok(())
}

/// Run the trading and redemption engines.
async fn cmd_run(dry_run_override: Option<bool>, port_override: Option<u16>) -> anyhow::Result<()> {
    info!("Loading configuration...");
    let mut config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if let Some(dry_run) = dry_run_override {
        config.dry_run = dry_run;
    }
    if let Some(port) = port_override {
        config.port = port;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    info!(
        "Mode: {}",
        if config.dry_run { "SIMULATION" } else { "LIVE TRADING" }
    );

    if config.metrics_enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("prometheus exporter: {}", e))?;
        info!("Prometheus exporter on {}", addr);
    }

    // inputs
    let watchlist_path = config
        .watchlist_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("WATCHLIST_PATH is required to run"))?;
    let markets = load_watchlist(&watchlist_path)?;
    if markets.is_empty() {
        return Err(anyhow::anyhow!("watchlist is empty"));
    }

    let model: Arc<dyn PriceModel> = match &config.price_model_path {
        Some(path) => Arc::new(TableModel::load(path)?),
        None => {
            warn!("no price model configured, every cell is untrusted");
            Arc::new(TableModel::empty())
        }
    };

    // shared plumbing
    let exchange: Arc<dyn ExchangeApi> = Arc::new(ClobClient::new(&config)?);
    let exec = Arc::new(ExecutionClient::new(exchange.clone(), config.clone()));
    let kill_switch = Arc::new(Mutex::new(KillSwitch::new(&config)));
    let (audit, _audit_task) = spawn_audit_writer(config.audit_log_path.clone());

    let mut engine = StrategyEngine::new(
        config.clone(),
        Arc::clone(&exec),
        model,
        Arc::clone(&kill_switch),
        audit.clone(),
    );

    // redemption engine
    let chain = Arc::new(PolygonChain::new(
        config.polygon_rpc_url.clone(),
        config.polymarket_private_key.clone(),
    ));
    let redemption = Arc::new(RedemptionEngine::new(
        exchange.clone(),
        chain,
        config.clone(),
        audit.clone(),
    ));

    // HTTP server
    let app_state = AppState::new(
        Arc::clone(&kill_switch),
        engine.status_handle(),
        redemption.report_handle(),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state.clone());
    let _server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    let _redemption_handle = tokio::spawn(Arc::clone(&redemption).run());

    // market data feed
    let (tx, rx) = mpsc::channel(64);
    let _feed_handle = spawn_polling_feed(
        exchange.clone(),
        markets,
        config.feed_poll_interval_ms,
        tx,
    );

    app_state.set_ready(true);
    info!("engines running");

    tokio::select! {
        _ = engine.run(rx) => {
            info!("strategy engine finished, shutting down");
        }
        _ = shutdown_signal() => {}
    }

    app_state.set_ready(false);
    if config.cancel_on_shutdown {
        info!("cancelling in-flight orders");
        engine.cancel_live_orders().await;
    }

    info!("shutdown complete");
    Ok(())
}
