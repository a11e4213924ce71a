//! Orchestrator: process-wide ownership and the market cycle.
//!
//! Owns the intent queue, circuit breaker, fair surface, and parked
//! intents; everything else reaches them through capability handles. Runs
//! one market at a time for the configured asset: discover → arm feeds →
//! run the controller to expiry → tear down → repeat. Shutdown drains the
//! execution queue and cancels open orders before exiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::controller::{ControllerHandles, MarketController};
use crate::engine::readiness::ParkedIntents;
use crate::exec::breaker::CircuitBreaker;
use crate::exec::queue::IntentQueue;
use crate::exec::worker::ExecutionWorker;
use crate::fair::surface::FairSurface;
use crate::feeds::book::book_feed;
use crate::gateway::paper::PaperExchange;
use crate::gateway::Exchange;
use crate::market::discovery::{discover_next_market, fetch_strike};
use crate::types::{EngineEvent, FeedEvent, FillEvent};

/// Seconds before the window opens at which feeds are armed.
const PRE_WAKE_SECS: i64 = 10;
/// Grace period after expiry for terminal fills to land.
const POST_END_BUFFER_MS: i64 = 3_000;
/// Surface checkpoint cadence.
const CHECKPOINT_INTERVAL_SECS: u64 = 60;

pub struct Orchestrator {
    config: Arc<Config>,
    queue: Arc<Mutex<IntentQueue>>,
    queue_notify: Arc<Notify>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    parked: Arc<Mutex<ParkedIntents>>,
    surface: Arc<RwLock<FairSurface>>,
    events_tx: mpsc::Sender<EngineEvent>,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<FeedEvent>>>>,
    intent_seq: Arc<AtomicU64>,
    asset_live: Arc<AtomicUsize>,
    price_subscribers: watch::Sender<Vec<mpsc::Sender<FeedEvent>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Build the orchestrator and its shared state. Returns the event
    /// receiver for the telemetry writer and the subscriber watch the
    /// price feed consumes.
    pub fn new(
        config: Config,
    ) -> (
        Self,
        mpsc::Receiver<EngineEvent>,
        watch::Receiver<Vec<mpsc::Sender<FeedEvent>>>,
    ) {
        let config = Arc::new(config);
        let queue = Arc::new(Mutex::new(IntentQueue::new(
            config.max_pending_per_market,
            config.max_pending_global,
            config.queue_stress_size,
        )));
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            config.failures_per_min,
            config.breaker_window_ms,
            config.breaker_auto_reset_ms,
        )));

        let mut surface = FairSurface::new(
            config.ewma_alpha,
            config.min_samples_to_trade,
            config.max_fair_age_ms,
            config.time_bucket_edges_sec.clone(),
        );
        match surface.load(&config.surface_checkpoint_path) {
            Ok(n) => info!(cells = n, "fair surface checkpoint restored"),
            Err(e) => info!(error = %e, "no usable surface checkpoint, starting empty"),
        }

        let (events_tx, events_rx) = mpsc::channel(8_192);
        let (price_subscribers, subscribers_rx) = watch::channel(Vec::new());
        let (shutdown_tx, _) = watch::channel(false);

        (
            Self {
                config,
                queue,
                queue_notify: Arc::new(Notify::new()),
                breaker,
                parked: Arc::new(Mutex::new(ParkedIntents::new())),
                surface: Arc::new(RwLock::new(surface)),
                events_tx,
                routes: Arc::new(Mutex::new(HashMap::new())),
                intent_seq: Arc::new(AtomicU64::new(1)),
                asset_live: Arc::new(AtomicUsize::new(0)),
                price_subscribers,
                shutdown_tx,
            },
            events_rx,
            subscribers_rx,
        )
    }

    fn handles(&self) -> ControllerHandles {
        ControllerHandles {
            queue: self.queue.clone(),
            queue_notify: self.queue_notify.clone(),
            parked: self.parked.clone(),
            surface: self.surface.clone(),
            events: self.events_tx.clone(),
            intent_seq: self.intent_seq.clone(),
        }
    }

    /// Main loop: execution worker + surface checkpointing + market cycle,
    /// until ctrl-c.
    pub async fn run(
        self,
        exchange: Arc<dyn Exchange>,
        fills_rx: mpsc::Receiver<FillEvent>,
        paper_mirror: Option<Arc<PaperExchange>>,
    ) -> anyhow::Result<()> {
        let http = reqwest::Client::new();

        let worker = ExecutionWorker::new(
            self.config.clone(),
            self.queue.clone(),
            self.queue_notify.clone(),
            self.breaker.clone(),
            self.parked.clone(),
            exchange,
            self.events_tx.clone(),
            self.routes.clone(),
        );
        let worker_handle = tokio::spawn(worker.run(fills_rx, self.shutdown_tx.subscribe()));

        let checkpoint_handle = tokio::spawn(checkpoint_loop(
            self.surface.clone(),
            self.config.surface_checkpoint_path.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let cycle = self.market_cycle(&http, paper_mirror);
        tokio::select! {
            _ = cycle => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining");
            }
        }

        let _ = self.shutdown_tx.send(true);
        let _ = worker_handle.await;
        checkpoint_handle.abort();
        if let Err(e) = self.surface.read().save(&self.config.surface_checkpoint_path) {
            warn!(error = %e, "final surface checkpoint failed");
        }
        info!("orchestrator stopped");
        Ok(())
    }

    /// Discover and run markets back to back.
    async fn market_cycle(
        &self,
        http: &reqwest::Client,
        paper_mirror: Option<Arc<PaperExchange>>,
    ) {
        loop {
            let mut market = match discover_next_market(http, &self.config).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "discovery failed, retrying in 10s");
                    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
                    continue;
                }
            };

            // Arm shortly before the window opens
            let now_ms = chrono::Utc::now().timestamp_millis();
            let wait_ms = market.start_ms - PRE_WAKE_SECS * 1000 - now_ms;
            if wait_ms > 0 {
                info!(slug = %market.slug, wait_s = wait_ms / 1000, "waiting for window");
                tokio::time::sleep(tokio::time::Duration::from_millis(wait_ms as u64)).await;
            }

            market.strike = match fetch_strike(http, &self.config).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "strike fetch failed, skipping market");
                    continue;
                }
            };
            info!(slug = %market.slug, strike = market.strike, "market armed");

            // Per-market wiring
            let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(4_096);
            self.routes
                .lock()
                .insert(market.market_id.clone(), feed_tx.clone());
            self.price_subscribers.send_replace(vec![feed_tx.clone()]);

            let book_handle = tokio::spawn(book_feed(
                self.config.clob_ws.clone(),
                vec![market.up_token_id.clone(), market.down_token_id.clone()],
                feed_tx.clone(),
                paper_mirror.clone(),
            ));

            let tick_tx = feed_tx.clone();
            let tick_handle = tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(tokio::time::Duration::from_millis(500));
                loop {
                    interval.tick().await;
                    if tick_tx.send(FeedEvent::Tick).await.is_err() {
                        break;
                    }
                }
            });

            self.asset_live.fetch_add(1, Ordering::SeqCst);
            let controller = MarketController::new(
                market.clone(),
                self.config.clone(),
                self.handles(),
                self.asset_live.clone(),
            );
            drop(feed_tx);

            // Run the market to completion (controller exits at expiry)
            controller.run(feed_rx, self.shutdown_tx.subscribe()).await;

            // Let terminal fills land before tearing the routes down
            tokio::time::sleep(tokio::time::Duration::from_millis(
                POST_END_BUFFER_MS as u64,
            ))
            .await;

            self.price_subscribers.send_replace(Vec::new());
            self.routes.lock().remove(&market.market_id);
            book_handle.abort();
            tick_handle.abort();

            if *self.shutdown_tx.subscribe().borrow() {
                break;
            }
            info!(slug = %market.slug, "market completed, discovering next");
        }
    }
}

async fn checkpoint_loop(
    surface: Arc<RwLock<FairSurface>>,
    path: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(CHECKPOINT_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot_result = { surface.read().save(&path) };
                if let Err(e) = snapshot_result {
                    warn!(error = %e, "surface checkpoint failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
