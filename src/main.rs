// src/main.rs
//
// Thin session harness: load the config, pick the venue, wire the queues
// and run the adapter tasks until Ctrl-C. The trading engine proper lives
// on the other side of the rings; this binary just drains them so a
// session can be observed end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tradelink::auth;
use tradelink::config::TradingMode;
use tradelink::instruments::{TokenManager, TokenManagerConfig};
use tradelink::registry::{self, VenueKind};
use tradelink::runtime::{join_with_grace, ShutdownFlag};
use tradelink::spsc;
use tradelink::venues::kestrel::adapter::{KestrelAdapter, KestrelAdapterConfig};
use tradelink::venues::kestrel::gateway::KestrelOrderGateway;
use tradelink::venues::kestrel::wire::KestrelTick;
use tradelink::venues::kestrel::ws::{KestrelWsClient, KestrelWsConfig};
use tradelink::venues::octane::gateway::{OctaneGatewayConfig, OctaneOrderGateway};
use tradelink::venues::octane::md::{OctaneMarketData, OctaneMdConfig};
use tradelink::{ClientRequest, ClientResponse, MarketEvent, SessionConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const REQUEST_QUEUE_CAPACITY: usize = 1024;
const RESPONSE_QUEUE_CAPACITY: usize = 1024;
const EVENT_QUEUE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Parser)]
#[command(name = "tradelink", about = "Multi-venue trading adapter session")]
struct Args {
    /// Path to the session config JSON.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Override the venue selected from the config (OCTANE or KESTREL).
    #[arg(long)]
    venue: Option<String>,
    /// Instrument catalog cache directory.
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,
    /// Engine client id tagged onto every request/response.
    #[arg(long, default_value_t = 1)]
    client_id: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = SessionConfig::load(&args.config)?;
    let venue = match &args.venue {
        Some(name) => registry::VenueKind::parse(name)
            .with_context(|| format!("unknown venue {name}"))?,
        None => registry::select_venue(&cfg)?,
    };
    info!(%venue, mode = ?cfg.trading_system.trading_mode, "session starting");

    let shutdown = ShutdownFlag::new();
    let (req_tx, req_rx) = spsc::channel::<ClientRequest>(REQUEST_QUEUE_CAPACITY);
    let (resp_tx, mut resp_rx) = spsc::channel::<ClientResponse>(RESPONSE_QUEUE_CAPACITY);
    let (event_tx, mut event_rx) = spsc::channel::<MarketEvent>(EVENT_QUEUE_CAPACITY);
    // The engine owns the request producer; this harness only drains.
    let _engine_requests = req_tx;

    let mut tasks = Vec::new();
    match venue {
        VenueKind::Kestrel => {
            let exchange = cfg
                .exchange("KESTREL")
                .context("config is missing the KESTREL exchange section")?
                .clone();
            let creds = exchange.api_credentials.clone();

            // The interactive login flow runs out of process; by session
            // start a bearer token must be present in the cache.
            let now_unix = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let access_token = auth::TokenCache::new(&args.cache_dir, &creds.user_id)
                .load(now_unix)
                .context("no valid access token cached; run the login flow first")?;

            let mut tm_cfg = TokenManagerConfig::new(
                "https://api.kestrel.trade/instruments".to_string(),
                creds.api_key.clone(),
                access_token.clone(),
                args.cache_dir.clone(),
            );
            tm_cfg.use_futures_for_indices =
                cfg.instruments.iter().any(|instrument| instrument.is_futures);
            let tokens = Arc::new(TokenManager::new(tm_cfg));
            tokens.initialize().await.context("token manager init")?;

            let (tick_tx, tick_rx) = spsc::channel::<KestrelTick>(65_536);
            let index_tokens = Arc::clone(&tokens);
            let parts = KestrelWsClient::new(
                KestrelWsConfig {
                    host: "ws.kestrel.trade".to_string(),
                    api_key: creds.api_key.clone(),
                    access_token,
                },
                shutdown.clone(),
                tick_tx,
                Arc::new(move |token| index_tokens.is_index_token(token)),
            );
            let adapter = KestrelAdapter::new(
                KestrelAdapterConfig::default(),
                Arc::clone(&tokens),
                parts.handle.clone(),
            );
            for instrument in &cfg.instruments {
                if let Err(err) = adapter.subscribe(&instrument.symbol, instrument.ticker_id) {
                    warn!(symbol = %instrument.symbol, error = %err, "subscribe failed");
                }
            }

            tasks.push((
                "kestrel-ws",
                tokio::spawn(parts.client.run()),
            ));
            // Surface order postbacks and venue notices from the text
            // channel.
            let mut control_rx = parts.control_rx;
            let control_shutdown = shutdown.clone();
            tasks.push((
                "kestrel-control",
                tokio::spawn(async move {
                    while !control_shutdown.is_requested() {
                        match tokio::time::timeout(Duration::from_millis(250), control_rx.recv())
                            .await
                        {
                            Ok(Some(event)) => info!(?event, "control event"),
                            Ok(None) => break,
                            Err(_) => {}
                        }
                    }
                }),
            ));
            tasks.push((
                "kestrel-md-pump",
                tokio::spawn(Arc::clone(&adapter).run_pump(
                    tick_rx,
                    event_tx,
                    parts.connected_rx,
                    shutdown.clone(),
                )),
            ));

            let gateway =
                KestrelOrderGateway::new(args.client_id, cfg.paper_config("KESTREL"));
            for instrument in &cfg.instruments {
                gateway.register_instrument(&instrument.symbol, instrument.ticker_id);
            }
            tasks.push((
                "kestrel-gateway",
                tokio::spawn(gateway.run(req_rx, resp_tx, shutdown.clone())),
            ));
        }
        VenueKind::Octane => {
            let exchange = cfg
                .exchange("OCTANE")
                .context("config is missing the OCTANE exchange section")?
                .clone();
            let creds = exchange.api_credentials.clone();
            let instruments: Vec<(String, u32)> = cfg
                .instruments
                .iter()
                .map(|instrument| (instrument.symbol.clone(), instrument.ticker_id))
                .collect();

            let md = OctaneMarketData::new(
                OctaneMdConfig {
                    ws_url: "wss://stream.octane.exchange:9443/ws".to_string(),
                    rest_url: "https://api.octane.exchange".to_string(),
                    depth_limit: 1000,
                },
                &instruments,
            );
            let feed_rx = md.spawn_streams(&shutdown);
            tasks.push((
                "octane-md-pump",
                tokio::spawn(Arc::clone(&md).run_pump(feed_rx, event_tx, shutdown.clone())),
            ));

            let mut gw_cfg = OctaneGatewayConfig::new(
                "https://api.octane.exchange".to_string(),
                creds.api_key.clone(),
                creds.api_secret.clone(),
            );
            if cfg.trading_system.trading_mode == TradingMode::Paper {
                gw_cfg.paper = Some(cfg.paper_config("OCTANE"));
            }
            let gateway = OctaneOrderGateway::new(
                gw_cfg,
                args.client_id,
                &cfg.instruments
                    .iter()
                    .map(|instrument| (instrument.ticker_id, instrument.symbol.clone()))
                    .collect::<Vec<_>>(),
            );
            let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
            tasks.push((
                "octane-poller",
                tokio::spawn(Arc::clone(&gateway).run_poller(status_tx, shutdown.clone())),
            ));
            tasks.push((
                "octane-gateway",
                tokio::spawn(gateway.run(req_rx, resp_tx, status_rx, shutdown.clone())),
            ));
        }
    }

    // Harness-side drains standing in for the engine.
    let drain_shutdown = shutdown.clone();
    tasks.push((
        "drain",
        tokio::spawn(async move {
            let mut events: u64 = 0;
            while !drain_shutdown.is_requested() {
                let mut idle = true;
                while let Some(event) = event_rx.pop() {
                    events += 1;
                    if events % 10_000 == 0 {
                        info!(events, last = %event, "market events drained");
                    }
                    idle = false;
                }
                while let Some(response) = resp_rx.pop() {
                    info!(%response, "lifecycle response");
                    idle = false;
                }
                if idle {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }),
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown.request();
    for (name, handle) in tasks {
        join_with_grace(handle, name, SHUTDOWN_GRACE).await;
    }
    info!("session stopped");
    Ok(())
}
