//! Execution worker.
//!
//! Single consumer of the intent queue: pops the highest-priority intent,
//! applies the circuit-breaker gate (protective intents pass while open),
//! and routes it through the execution adapter. Fill events from the
//! exchange stream are matched to their slot here and forwarded to the
//! owning controller. Once per second it prunes stale intents, expires
//! parked ones, and evicts orphaned order slots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::readiness::ParkedIntents;
use crate::exec::adapter::{ExecutionAdapter, FailureClass};
use crate::exec::breaker::CircuitBreaker;
use crate::exec::queue::IntentQueue;
use crate::gateway::Exchange;
use crate::types::{
    EngineEvent, FeedEvent, FillEvent, Intent, OrderPlaced, RoutedFill, SkipReason,
};

pub struct ExecutionWorker {
    config: Arc<Config>,
    queue: Arc<Mutex<IntentQueue>>,
    queue_notify: Arc<Notify>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    parked: Arc<Mutex<ParkedIntents>>,
    adapter: ExecutionAdapter,
    exchange: Arc<dyn Exchange>,
    events: mpsc::Sender<EngineEvent>,
    /// market id → controller feed channel.
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<FeedEvent>>>>,
    breaker_was_open: bool,
}

impl ExecutionWorker {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<Mutex<IntentQueue>>,
        queue_notify: Arc<Notify>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        parked: Arc<Mutex<ParkedIntents>>,
        exchange: Arc<dyn Exchange>,
        events: mpsc::Sender<EngineEvent>,
        routes: Arc<Mutex<HashMap<String, mpsc::Sender<FeedEvent>>>>,
    ) -> Self {
        let adapter = ExecutionAdapter::new(&config);
        Self {
            config,
            queue,
            queue_notify,
            breaker,
            parked,
            adapter,
            exchange,
            events,
            routes,
            breaker_was_open: false,
        }
    }

    pub async fn run(
        mut self,
        mut fills_rx: mpsc::Receiver<FillEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("execution worker started");
        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
        let notify = self.queue_notify.clone();

        loop {
            tokio::select! {
                _ = notify.notified() => {
                    self.drain_queue().await;
                }
                fill = fills_rx.recv() => {
                    match fill {
                        Some(fill) => self.route_fill(fill).await,
                        None => break,
                    }
                }
                _ = housekeeping.tick() => {
                    self.housekeeping().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Shutdown: drain what is queued, then cancel everything open.
        self.drain_queue().await;
        let cancelled = self.adapter.cancel_all(&*self.exchange).await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        for ((market_id, _, _), open) in cancelled {
            let _ = self
                .events
                .send(EngineEvent::OrderCancel {
                    ts_ms: now_ms,
                    market_id,
                    order_id: open.order_id,
                    reason: "shutdown".into(),
                })
                .await;
        }
        info!("execution worker stopped");
    }

    async fn drain_queue(&mut self) {
        loop {
            let intent = {
                let mut q = self.queue.lock();
                q.dequeue()
            };
            let Some(intent) = intent else { break };
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.process_intent(intent, now_ms).await;
        }
    }

    /// Execute a single intent end to end. Public within the crate so the
    /// pipeline is testable without a live queue loop.
    pub(crate) async fn process_intent(&mut self, intent: Intent, now_ms: i64) {
        // Breaker gate: while open, only protective intents go out.
        let open = {
            let mut b = self.breaker.lock();
            b.is_open(now_ms)
        };
        self.note_breaker_state(open, now_ms).await;
        if open && !intent.kind.is_protective() {
            let _ = self
                .events
                .send(EngineEvent::ActionSkipped {
                    ts_ms: now_ms,
                    market_id: intent.market_id.clone(),
                    correlation_id: Some(intent.correlation_id),
                    intent_type: Some(intent.kind),
                    reason: SkipReason::CircuitOpen,
                    detail: "circuit breaker open".into(),
                })
                .await;
            return;
        }

        let _ = self
            .events
            .send(EngineEvent::OrderSubmitted {
                ts_ms: now_ms,
                market_id: intent.market_id.clone(),
                correlation_id: intent.correlation_id,
                kind: intent.kind,
                side: intent.side,
                token_id: intent.token_id.clone(),
                shares: intent.shares,
                price: intent.price,
            })
            .await;

        match self
            .adapter
            .place_limit(&intent, &*self.exchange, now_ms)
            .await
        {
            Ok(placed) => {
                {
                    let mut b = self.breaker.lock();
                    b.record_success();
                }
                let ack_ms = chrono::Utc::now().timestamp_millis();
                let _ = self
                    .events
                    .send(EngineEvent::OrderAck {
                        ts_ms: ack_ms,
                        market_id: intent.market_id.clone(),
                        correlation_id: intent.correlation_id,
                        order_id: placed.order_id.clone(),
                        latency_ms: (ack_ms - now_ms) as f64,
                    })
                    .await;
                self.notify_controller(
                    &intent.market_id,
                    FeedEvent::Placed(OrderPlaced {
                        order_id: placed.order_id,
                        kind: intent.kind,
                        side: intent.side,
                        price: placed.price,
                        shares: intent.shares,
                        ts_ms: ack_ms,
                    }),
                )
                .await;
            }
            Err(err) => match err.classify() {
                FailureClass::Exchange => {
                    let opened = {
                        let mut b = self.breaker.lock();
                        b.record_failure(now_ms)
                    };
                    let _ = self
                        .events
                        .send(EngineEvent::OrderFail {
                            ts_ms: now_ms,
                            market_id: intent.market_id.clone(),
                            correlation_id: intent.correlation_id,
                            kind: intent.kind,
                            error: err.to_string(),
                        })
                        .await;
                    if opened {
                        self.breaker_was_open = true;
                        let failures = self.breaker.lock().failures_in_window();
                        let _ = self
                            .events
                            .send(EngineEvent::CircuitBreakerEnter {
                                ts_ms: now_ms,
                                failures_in_window: failures,
                            })
                            .await;
                        warn!(failures, "circuit breaker opened");
                    }
                }
                FailureClass::Invariant(reason) => {
                    // Typed invariant violation: never retried, documented.
                    let _ = self
                        .events
                        .send(EngineEvent::ActionSkipped {
                            ts_ms: now_ms,
                            market_id: intent.market_id.clone(),
                            correlation_id: Some(intent.correlation_id),
                            intent_type: Some(intent.kind),
                            reason,
                            detail: err.to_string(),
                        })
                        .await;
                }
            },
        }
    }

    /// Match an exchange fill to its slot and forward it to the owning
    /// controller.
    async fn route_fill(&mut self, fill: FillEvent) {
        let Some(key) = self.adapter.slot_for_order(&fill.order_id).cloned() else {
            warn!(order_id = %fill.order_id, "fill for unknown order");
            return;
        };
        let (market_id, _token, kind) = key;
        self.adapter.on_order_complete(&fill.order_id);

        self.notify_controller(
            &market_id,
            FeedEvent::Fill(RoutedFill {
                order_id: fill.order_id,
                kind,
                token_id: fill.token_id,
                qty: fill.qty,
                price: fill.price,
                ts_ms: fill.ts_ms,
            }),
        )
        .await;
    }

    async fn housekeeping(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let pruned = {
            let mut q = self.queue.lock();
            q.prune_stale(now_ms, self.config.stale_intent_max_age_ms)
        };
        for intent in pruned {
            let _ = self
                .events
                .send(EngineEvent::ActionSkipped {
                    ts_ms: now_ms,
                    market_id: intent.market_id.clone(),
                    correlation_id: Some(intent.correlation_id),
                    intent_type: Some(intent.kind),
                    reason: SkipReason::TooLate,
                    detail: "intent aged out of the queue".into(),
                })
                .await;
        }

        let expired = {
            let mut p = self.parked.lock();
            p.expire(now_ms, self.config.park_max_age_ms)
        };
        for parked in expired {
            let _ = self
                .events
                .send(EngineEvent::ActionSkipped {
                    ts_ms: now_ms,
                    market_id: parked.intent.market_id.clone(),
                    correlation_id: Some(parked.intent.correlation_id),
                    intent_type: Some(parked.intent.kind),
                    reason: SkipReason::TooLate,
                    detail: format!("parked intent expired after {} retries", parked.retries),
                })
                .await;
        }

        let evicted = self
            .adapter
            .cleanup_stale_orders(now_ms, self.config.order_slot_timeout_ms, &*self.exchange)
            .await;
        for ((market_id, _, _), open) in evicted {
            let _ = self
                .events
                .send(EngineEvent::OrderCancel {
                    ts_ms: now_ms,
                    market_id,
                    order_id: open.order_id,
                    reason: "no terminal event before slot timeout".into(),
                })
                .await;
        }

        let open = {
            let mut b = self.breaker.lock();
            b.is_open(now_ms)
        };
        self.note_breaker_state(open, now_ms).await;
    }

    async fn note_breaker_state(&mut self, open: bool, now_ms: i64) {
        if self.breaker_was_open && !open {
            let opened_at = self.breaker.lock().opened_at_ms();
            let _ = self
                .events
                .send(EngineEvent::CircuitBreakerExit {
                    ts_ms: now_ms,
                    open_for_ms: now_ms - opened_at,
                })
                .await;
            info!("circuit breaker closed");
        }
        self.breaker_was_open = open;
    }

    async fn notify_controller(&self, market_id: &str, event: FeedEvent) {
        let sender = {
            let routes = self.routes.lock();
            routes.get(market_id).cloned()
        };
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}
