//! Per-market controller.
//!
//! One task per live market, sole owner of that market's inventory,
//! phase, book cache, and micro-hedge accumulator. Every feed event runs
//! the same pipeline: snapshot → risk → surface → builder → gate →
//! enqueue. Fills are applied before the next builder pass, so a hedge is
//! never re-emitted against stale inventory.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::intent::{self, BuildInput, HedgePending, IntentDraft};
use crate::engine::inventory::{DegradedChange, Inventory};
use crate::engine::readiness::{self, ParkedIntents};
use crate::exec::queue::{Enqueued, IntentQueue};
use crate::fair::surface::FairSurface;
use crate::types::{
    BookTop, EngineEvent, FeedEvent, Intent, IntentType, MarketInfo, MarketPhase, RoutedFill,
    Side, SkipReason, Snapshot,
};

/// Capability handles into orchestrator-owned state.
#[derive(Clone)]
pub struct ControllerHandles {
    pub queue: Arc<Mutex<IntentQueue>>,
    pub queue_notify: Arc<Notify>,
    pub parked: Arc<Mutex<ParkedIntents>>,
    pub surface: Arc<RwLock<FairSurface>>,
    pub events: mpsc::Sender<EngineEvent>,
    /// Monotonic intent id sequence, shared across controllers.
    pub intent_seq: Arc<AtomicU64>,
}

pub struct MarketController {
    info: MarketInfo,
    config: Arc<Config>,
    handles: ControllerHandles,
    /// Live-market count for this asset (concurrency cap input).
    asset_live: Arc<AtomicUsize>,

    inv: Inventory,
    phase: MarketPhase,
    pending: HedgePending,
    up_book: Option<BookTop>,
    down_book: Option<BookTop>,
    spot: f64,
    /// Last marketable (emergency-priced) submission, for rate limiting.
    last_emergency_ms: i64,
}

impl MarketController {
    pub fn new(
        info: MarketInfo,
        config: Arc<Config>,
        handles: ControllerHandles,
        asset_live: Arc<AtomicUsize>,
    ) -> Self {
        let inv = Inventory::new(info.market_id.clone(), info.start_ms);
        Self {
            info,
            config,
            handles,
            asset_live,
            inv,
            phase: MarketPhase::Idle,
            pending: HedgePending::default(),
            up_book: None,
            down_book: None,
            spot: 0.0,
            last_emergency_ms: 0,
        }
    }

    pub fn phase(&self) -> MarketPhase {
        self.phase
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inv
    }

    /// Event loop. Exits at market end or on shutdown; drains this
    /// market's queued and parked intents on the way out.
    pub async fn run(
        mut self,
        mut feed_rx: mpsc::Receiver<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            market = %self.info.market_id,
            slug = %self.info.slug,
            strike = self.info.strike,
            "controller started"
        );

        loop {
            tokio::select! {
                ev = feed_rx.recv() => {
                    let Some(ev) = ev else { break };
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    self.handle_event(ev, now_ms).await;
                    if now_ms >= self.info.end_ms {
                        self.phase = MarketPhase::Done;
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        let drained = {
            let mut q = self.handles.queue.lock();
            q.drain_market(&self.info.market_id)
        };
        for intent in &drained {
            self.emit(EngineEvent::ActionSkipped {
                ts_ms: chrono::Utc::now().timestamp_millis(),
                market_id: self.info.market_id.clone(),
                correlation_id: Some(intent.correlation_id),
                intent_type: Some(intent.kind),
                reason: SkipReason::StaleMarket,
                detail: "market ended".into(),
            })
            .await;
        }
        self.handles.parked.lock().drain_market(&self.info.market_id);
        self.asset_live.fetch_sub(1, Ordering::SeqCst);
        info!(
            market = %self.info.market_id,
            fills = self.inv.fills,
            pair_cost = self.inv.pair_cost(),
            invested = self.inv.total_invested(),
            "controller stopped"
        );
    }

    /// Dispatch one feed event and, when state moved, re-evaluate intents.
    pub async fn handle_event(&mut self, ev: FeedEvent, now_ms: i64) {
        match ev {
            FeedEvent::Price(tick) => {
                if tick.asset == self.info.asset && tick.price > 0.0 {
                    self.spot = tick.price;
                    self.evaluate(now_ms).await;
                }
            }
            FeedEvent::Book(update) => {
                let top = update.to_top();
                match self.info.side_for_token(&update.token_id) {
                    Some(Side::Up) => self.up_book = Some(top),
                    Some(Side::Down) => self.down_book = Some(top),
                    None => return,
                }
                self.evaluate(now_ms).await;
            }
            FeedEvent::Fill(fill) => {
                self.apply_fill(fill, now_ms).await;
                self.evaluate(now_ms).await;
            }
            FeedEvent::Placed(placed) => {
                // "Hedge placed" advances the state machine even before the
                // fill lands.
                if self.phase == MarketPhase::HasEntry && placed.kind.is_protective() {
                    self.phase = MarketPhase::HedgeInProgress;
                }
            }
            FeedEvent::Tick => {
                self.evaluate(now_ms).await;
            }
        }
    }

    /// Apply a fill to inventory and drive the phase machine:
    /// IDLE →(entry fill)→ HAS_ENTRY; hedge-class fill → DONE when the
    /// book pairs up, back to HAS_ENTRY while partial; expiry → DONE.
    async fn apply_fill(&mut self, fill: RoutedFill, now_ms: i64) {
        let Some(side) = self.info.side_for_token(&fill.token_id) else {
            return;
        };
        self.inv
            .update_on_fill(side, fill.qty, fill.price, fill.ts_ms);

        self.emit(EngineEvent::Fill {
            ts_ms: now_ms,
            market_id: self.info.market_id.clone(),
            order_id: fill.order_id.clone(),
            kind: fill.kind,
            side,
            qty: fill.qty,
            price: fill.price,
        })
        .await;

        let paired = self.inv.unpaired_shares <= 1e-9;
        if paired {
            self.pending.on_paired();
        }

        self.phase = match (self.phase, fill.kind) {
            (MarketPhase::Idle, IntentType::Entry | IntentType::Accumulate) => {
                MarketPhase::HasEntry
            }
            (
                MarketPhase::HasEntry | MarketPhase::HedgeInProgress,
                IntentType::Hedge | IntentType::MicroHedge | IntentType::Unwind,
            ) => {
                if paired {
                    MarketPhase::Done
                } else {
                    MarketPhase::HasEntry
                }
            }
            (phase, _) => phase,
        };

        self.emit_inventory(now_ms).await;
        debug!(
            market = %self.info.market_id,
            kind = %fill.kind,
            side = %side,
            qty = fill.qty,
            price = fill.price,
            phase = ?self.phase,
            "fill applied"
        );
    }

    /// The per-tick pipeline: snapshot → risk/degraded → surface →
    /// builder → gate/park → enqueue.
    async fn evaluate(&mut self, now_ms: i64) {
        if self.spot <= 0.0 {
            return;
        }
        let snap = self.build_snapshot(now_ms);

        // Risk + degraded mode
        self.inv.recalc_risk(&snap);
        match self.inv.evaluate_degraded(now_ms, &self.config) {
            Some(DegradedChange::Entered) => {
                self.emit(EngineEvent::DegradedModeEnter {
                    ts_ms: now_ms,
                    market_id: self.info.market_id.clone(),
                    unpaired_notional: self.inv.unpaired_notional,
                    unpaired_age_sec: self.inv.unpaired_age_sec,
                    risk_score: self.inv.risk_score,
                })
                .await;
            }
            Some(DegradedChange::Exited) => {
                self.emit(EngineEvent::DegradedModeExit {
                    ts_ms: now_ms,
                    market_id: self.info.market_id.clone(),
                })
                .await;
            }
            None => {}
        }

        // Micro-hedge accumulator mirrors sub-threshold imbalance
        if self.inv.unpaired_shares <= 1e-9 {
            self.pending.on_paired();
        } else if self.inv.unpaired_shares < self.config.hedge_min_shares {
            self.pending.note_unpaired(self.inv.unpaired_shares);
        } else {
            self.pending.note_unpaired(0.0);
        }

        // Feed the empirical surface with the observed UP mid
        if let Some(mid) = snap.up.as_ref().and_then(|b| b.mid()) {
            self.handles.surface.write().observe(
                snap.asset,
                snap.delta_abs(),
                snap.secs_to_expiry,
                mid,
                now_ms,
            );
        }

        let fair_up = self.handles.surface.read().fair_up(
            snap.asset,
            snap.delta_abs(),
            snap.secs_to_expiry,
            now_ms,
        );

        let outcome = intent::build(
            &BuildInput {
                snap: &snap,
                inv: &self.inv,
                phase: self.phase,
                fair_up,
                pending: &self.pending,
                open_markets_for_asset: self.asset_live.load(Ordering::SeqCst),
            },
            &self.config,
        );

        for skip in &outcome.skips {
            self.emit(EngineEvent::ActionSkipped {
                ts_ms: now_ms,
                market_id: self.info.market_id.clone(),
                correlation_id: None,
                intent_type: Some(skip.kind),
                reason: skip.reason,
                detail: skip.detail.clone(),
            })
            .await;
        }

        for draft in outcome.intents {
            self.admit_draft(draft, &snap, now_ms).await;
        }

        // Reconsider parked intents: a passing fresh gate discards the
        // parked copy (the builder re-emits anything still wanted).
        self.reconsider_parked(now_ms);

        // SNAPSHOT records may shed under backpressure; order events never do.
        let _ = self.handles.events.try_send(EngineEvent::Snapshot {
            ts_ms: now_ms,
            market_id: snap.market_id.clone(),
            asset: snap.asset,
            secs_to_expiry: snap.secs_to_expiry,
            spot: snap.spot,
            strike: snap.strike,
            up_bid: snap.up.as_ref().and_then(|b| b.bid),
            up_ask: snap.up.as_ref().and_then(|b| b.ask),
            down_bid: snap.down.as_ref().and_then(|b| b.bid),
            down_ask: snap.down.as_ref().and_then(|b| b.ask),
            ready_up: snap.ready_up,
            ready_down: snap.ready_down,
            queue_len: snap.queue_len,
        });
    }

    /// Gate, materialize, and enqueue one draft.
    async fn admit_draft(&mut self, draft: IntentDraft, snap: &Snapshot, now_ms: i64) {
        if draft.marketable {
            if now_ms - self.last_emergency_ms < self.config.emergency_rate_limit_ms {
                self.emit(EngineEvent::ActionSkipped {
                    ts_ms: now_ms,
                    market_id: self.info.market_id.clone(),
                    correlation_id: None,
                    intent_type: Some(draft.kind),
                    reason: SkipReason::RateLimit,
                    detail: "emergency submission rate limit".into(),
                })
                .await;
                return;
            }
            self.last_emergency_ms = now_ms;
        }

        let gate = readiness::gate_for_intent(
            draft.kind,
            draft.side,
            snap.up.as_ref(),
            snap.down.as_ref(),
            now_ms,
            self.config.min_levels,
            self.config.max_snapshot_age_ms,
        );

        let intent = self.materialize(draft, now_ms);

        if let Err(failure) = gate {
            let retries = self
                .handles
                .parked
                .lock()
                .park(intent.clone(), failure, now_ms);
            self.emit(EngineEvent::ActionSkipped {
                ts_ms: now_ms,
                market_id: intent.market_id.clone(),
                correlation_id: Some(intent.correlation_id),
                intent_type: Some(intent.kind),
                reason: failure.skip_reason(),
                detail: format!("parked ({} retries): {}", retries, failure),
            })
            .await;
            return;
        }

        // A fresh pass supersedes any parked copy of this key.
        self.handles
            .parked
            .lock()
            .discard(&intent.market_id, intent.kind);

        if intent.kind == IntentType::MicroHedge {
            self.pending
                .on_emitted(now_ms, self.config.micro_hedge_cooldown_ms);
        }

        self.emit(EngineEvent::IntentCreated {
            ts_ms: now_ms,
            market_id: intent.market_id.clone(),
            correlation_id: intent.correlation_id,
            intent_id: intent.id,
            kind: intent.kind,
            side: intent.side,
            shares: intent.shares,
            price: intent.price,
            priority: intent.priority,
            reason: intent.reason.clone(),
        })
        .await;

        let result = {
            let mut q = self.handles.queue.lock();
            q.enqueue(intent)
        };
        match result {
            Enqueued::Admitted { displaced } => {
                for victim in displaced {
                    self.emit(EngineEvent::ActionSkipped {
                        ts_ms: now_ms,
                        market_id: victim.market_id.clone(),
                        correlation_id: Some(victim.correlation_id),
                        intent_type: Some(victim.kind),
                        reason: SkipReason::QueueStress,
                        detail: "displaced by higher-priority intent".into(),
                    })
                    .await;
                }
                self.handles.queue_notify.notify_one();
            }
            Enqueued::Rejected(intent) => {
                self.emit(EngineEvent::ActionSkipped {
                    ts_ms: now_ms,
                    market_id: intent.market_id.clone(),
                    correlation_id: Some(intent.correlation_id),
                    intent_type: Some(intent.kind),
                    reason: SkipReason::QueueStress,
                    detail: "queue full".into(),
                })
                .await;
            }
        }
    }

    fn reconsider_parked(&mut self, now_ms: i64) {
        let kinds = {
            let parked = self.handles.parked.lock();
            parked.kinds_for_market(&self.info.market_id)
        };
        for kind in kinds {
            // The hedged side is whichever the parked copy targets.
            let side = {
                let parked = self.handles.parked.lock();
                match parked.get(&self.info.market_id, kind) {
                    Some(p) => p.intent.side,
                    None => continue,
                }
            };
            let pass = readiness::gate_for_intent(
                kind,
                side,
                self.up_book.as_ref(),
                self.down_book.as_ref(),
                now_ms,
                self.config.min_levels,
                self.config.max_snapshot_age_ms,
            )
            .is_ok();
            if pass {
                self.handles.parked.lock().discard(&self.info.market_id, kind);
            }
        }
    }

    fn materialize(&self, draft: IntentDraft, now_ms: i64) -> Intent {
        Intent {
            id: self.handles.intent_seq.fetch_add(1, Ordering::SeqCst),
            created_ms: now_ms,
            correlation_id: Uuid::new_v4(),
            market_id: self.info.market_id.clone(),
            asset: self.info.asset,
            kind: draft.kind,
            side: draft.side,
            token_id: self.info.token_for(draft.side).to_string(),
            shares: draft.shares,
            price: draft.price,
            marketable: draft.marketable,
            reason: draft.reason,
            priority: draft.priority,
            market_end_ms: self.info.end_ms,
        }
    }

    fn build_snapshot(&self, now_ms: i64) -> Snapshot {
        let ready_up = readiness::token_ready(
            self.up_book.as_ref(),
            now_ms,
            self.config.min_levels,
            self.config.max_snapshot_age_ms,
        )
        .is_ok();
        let ready_down = readiness::token_ready(
            self.down_book.as_ref(),
            now_ms,
            self.config.min_levels,
            self.config.max_snapshot_age_ms,
        )
        .is_ok();

        let (queue_len, queue_stressed) = {
            let q = self.handles.queue.lock();
            (q.len(), q.is_stressed())
        };

        Snapshot {
            market_id: self.info.market_id.clone(),
            asset: self.info.asset,
            ts_ms: now_ms,
            secs_to_expiry: ((self.info.end_ms - now_ms).max(0)) as f64 / 1000.0,
            strike: self.info.strike,
            spot: self.spot,
            up: self.up_book,
            down: self.down_book,
            ready_up,
            ready_down,
            queue_len,
            queue_stressed,
        }
    }

    async fn emit_inventory(&self, now_ms: i64) {
        self.emit(EngineEvent::Inventory {
            ts_ms: now_ms,
            market_id: self.info.market_id.clone(),
            up_shares: self.inv.up_shares,
            down_shares: self.inv.down_shares,
            up_invested: self.inv.up_invested,
            down_invested: self.inv.down_invested,
            unpaired_shares: self.inv.unpaired_shares,
            unpaired_notional: self.inv.unpaired_notional,
            unpaired_age_sec: self.inv.unpaired_age_sec,
            risk_score: self.inv.risk_score,
            pair_cost: self.inv.pair_cost(),
            degraded: self.inv.degraded,
        })
        .await;
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.handles.events.send(event).await;
    }
}
