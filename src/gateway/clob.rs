//! Live CLOB exchange.
//!
//! Build → sign → post against the Polymarket CLOB. Matched orders are
//! reported on the shared fill stream the moment the venue acks them;
//! resting orders that never match are evicted by the adapter's stale
//! slot cleanup.

use std::str::FromStr;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use polymarket_client_sdk::auth::state::Authenticated;
use polymarket_client_sdk::auth::{LocalSigner, Normal, Signer};
use polymarket_client_sdk::clob::types::{
    OrderType as ClobOrderType, OrderStatusType, Side as ClobSide, SignatureType,
};
use polymarket_client_sdk::clob::{Client as ClobClient, Config as ClobConfig};
use polymarket_client_sdk::types::{Decimal, U256};
use polymarket_client_sdk::POLYGON;

use crate::config::Config;
use crate::gateway::{Exchange, OrderType, PlaceOrderRequest, PlaceOrderResponse};
use crate::types::{BookTop, FillEvent, OrderSide};

const CLOB_REST: &str = "https://clob.polymarket.com";

pub struct ClobExchange {
    client: ClobClient<Authenticated<Normal>>,
    signer: Box<dyn Signer + Send + Sync>,
    http: reqwest::Client,
    fill_tx: mpsc::Sender<FillEvent>,
}

impl ClobExchange {
    /// Authenticate against the CLOB. Requires POLYMARKET_PRIVATE_KEY.
    pub async fn connect(
        config: &Config,
        fill_tx: mpsc::Sender<FillEvent>,
    ) -> anyhow::Result<Self> {
        let pk = config
            .polymarket_private_key
            .as_ref()
            .ok_or_else(|| anyhow!("POLYMARKET_PRIVATE_KEY required when DRY_RUN=false"))?;
        let signer: Box<dyn Signer + Send + Sync> = Box::new(
            LocalSigner::from_str(pk)
                .map_err(|e| anyhow!("invalid POLYMARKET_PRIVATE_KEY: {e}"))?
                .with_chain_id(Some(POLYGON)),
        );

        let sig_type = match config.polymarket_signature_type {
            1 => SignatureType::Proxy,
            2 => SignatureType::GnosisSafe,
            _ => SignatureType::Eoa,
        };

        let mut auth_builder = ClobClient::new(CLOB_REST, ClobConfig::default())
            .context("create CLOB client")?
            .authentication_builder(&signer)
            .signature_type(sig_type);

        if let Some(ref funder) = config.polymarket_funder_address {
            auth_builder = auth_builder.funder(
                funder
                    .parse()
                    .map_err(|_| anyhow!("invalid POLYMARKET_FUNDER_ADDRESS"))?,
            );
        }

        let client = auth_builder
            .authenticate()
            .await
            .context("CLOB authentication")?;

        info!(address = %client.address(), "CLOB client authenticated");

        Ok(Self {
            client,
            signer,
            http: reqwest::Client::new(),
            fill_tx,
        })
    }
}

#[async_trait]
impl Exchange for ClobExchange {
    async fn place_order(&self, req: PlaceOrderRequest) -> anyhow::Result<PlaceOrderResponse> {
        let token_id =
            U256::from_str(&req.token_id).map_err(|e| anyhow!("bad token_id: {e}"))?;
        let price_dec = Decimal::from_str(&format!("{:.2}", req.price))
            .map_err(|e| anyhow!("bad price: {e}"))?;
        let size_dec = Decimal::from_str(&format!("{:.2}", req.size))
            .map_err(|e| anyhow!("bad size: {e}"))?;

        let side = match req.side {
            OrderSide::Buy => ClobSide::Buy,
            OrderSide::Sell => ClobSide::Sell,
        };
        // GTD rests like GTC here; the adapter's slot timeout enforces the
        // effective TTL by cancelling.
        let order_type = match req.order_type {
            OrderType::Fok => ClobOrderType::FOK,
            OrderType::Gtc | OrderType::Gtd => ClobOrderType::GTC,
        };

        let signable = self
            .client
            .limit_order()
            .token_id(token_id)
            .price(price_dec)
            .size(size_dec)
            .side(side)
            .order_type(order_type)
            .build()
            .await
            .map_err(|e| anyhow!("build: {e}"))?;

        let signed = self
            .client
            .sign(&self.signer, signable)
            .await
            .map_err(|e| anyhow!("sign: {e}"))?;

        let resp = self
            .client
            .post_order(signed)
            .await
            .map_err(|e| anyhow!("post: {e}"))?;

        if !resp.success {
            return Ok(PlaceOrderResponse {
                success: false,
                order_id: None,
                avg_price: None,
                filled_size: None,
                error: Some(resp.error_msg.unwrap_or_else(|| "unknown error".to_string())),
            });
        }

        let matched = matches!(resp.status, OrderStatusType::Matched);
        if matched {
            let fill = FillEvent {
                order_id: resp.order_id.clone(),
                token_id: req.token_id.clone(),
                side: req.side,
                qty: req.size,
                price: req.price,
                ts_ms: chrono::Utc::now().timestamp_millis(),
            };
            let _ = self.fill_tx.send(fill).await;
        }

        Ok(PlaceOrderResponse {
            success: true,
            order_id: Some(resp.order_id),
            avg_price: matched.then_some(req.price),
            filled_size: matched.then_some(req.size),
            error: None,
        })
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> anyhow::Result<()> {
        if order_ids.is_empty() {
            return Ok(());
        }
        let order_ids_ref: Vec<&str> = order_ids.iter().map(String::as_str).collect();
        if let Err(e) = self.client.cancel_orders(&order_ids_ref).await {
            warn!(error = %e, count = order_ids.len(), "cancel_orders failed");
        }
        Ok(())
    }

    async fn get_book(&self, token_id: &str) -> anyhow::Result<Option<BookTop>> {
        let url = format!("{}/book?token_id={}", CLOB_REST, token_id);
        let resp = self.http.get(&url).send().await.context("book fetch")?;
        let body: serde_json::Value = resp.json().await.context("book parse")?;

        let parse_levels = |key: &str| -> Vec<(f64, f64)> {
            body.get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|lvl| {
                            let p = lvl.get("price")?.as_str()?.parse().ok()?;
                            let s = lvl.get("size")?.as_str()?.parse().ok()?;
                            Some((p, s))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let bids = parse_levels("bids");
        let asks = parse_levels("asks");
        if bids.is_empty() && asks.is_empty() {
            return Ok(None);
        }

        let ts_ms = body
            .get("timestamp")
            .and_then(|t| {
                t.as_i64()
                    .or_else(|| t.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let update = crate::types::BookUpdate {
            token_id: token_id.to_string(),
            bids,
            asks,
            ts_ms,
        };
        Ok(Some(update.to_top()))
    }
}
