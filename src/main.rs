mod config;
mod engine;
mod exec;
mod fair;
mod feeds;
mod gateway;
mod market;
mod orchestrator;
mod telemetry;
mod types;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use feeds::price::price_feed;
use gateway::clob::ClobExchange;
use gateway::paper::PaperExchange;
use gateway::Exchange;
use orchestrator::Orchestrator;
use telemetry::writer::event_writer;
use types::FillEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!("╔══════════════════════════════════════════════════╗");
    info!(
        "║  Polymarket {} 15m pair trader | dry_run={}",
        config.asset.label(),
        config.dry_run
    );
    info!(
        "║  entry: edge≥{:.0}¢ spread≤{:.0}¢ depth≥{:.0} | cap ${:.0}/market",
        config.edge_entry_min * 100.0,
        config.max_spread * 100.0,
        config.min_depth,
        config.max_notional_usd_per_market
    );
    info!(
        "║  hedge: ratio {:.2} oppAsk≤{:.0}¢ cpp≤{:.0}¢ | breaker {}/min",
        config.hedge_ratio,
        config.max_opp_ask * 100.0,
        config.max_cpp_approx * 100.0,
        config.failures_per_min
    );
    info!("╚══════════════════════════════════════════════════╝");

    let (fill_tx, fill_rx) = mpsc::channel::<FillEvent>(1_024);

    // Exchange capability: paper simulator by default, live CLOB when armed.
    let (exchange, paper_mirror): (Arc<dyn Exchange>, Option<Arc<PaperExchange>>) =
        if config.dry_run {
            let paper = Arc::new(PaperExchange::new(fill_tx));
            let exchange: Arc<dyn Exchange> = paper.clone();
            (exchange, Some(paper))
        } else {
            let clob = ClobExchange::connect(&config, fill_tx).await?;
            (Arc::new(clob) as Arc<dyn Exchange>, None)
        };

    let (orchestrator, events_rx, subscribers_rx) = Orchestrator::new(config.clone());

    let writer_handle = tokio::spawn(event_writer(events_rx, config.clone()));

    // Persistent spot feed, fanned out to whichever market is live.
    let (spot_tx, mut spot_rx) = watch::channel(0.0_f64);
    tokio::spawn(price_feed(
        config.asset,
        config.binance_ws.clone(),
        config.binance_ws_fallback.clone(),
        subscribers_rx,
        spot_tx,
    ));

    info!("waiting for first spot price...");
    while *spot_rx.borrow() == 0.0 {
        if spot_rx.changed().await.is_err() {
            anyhow::bail!("spot feed died before first price");
        }
    }
    info!(spot = *spot_rx.borrow(), "spot online");

    orchestrator.run(exchange, fill_rx, paper_mirror).await?;

    writer_handle.abort();
    Ok(())
}
