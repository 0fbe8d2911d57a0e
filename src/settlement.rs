//! # Settlement Notifier: Billing Events for the External Ledger
//!
//! After a ledger row commits, the metering engine publishes one
//! [`BillingMessage`] so the account service can deduct the amount. Delivery
//! is at-least-once; consumers dedupe on `request_id`
//! (`"{prefix}-{worker_id}-{unix_period_start}"`).
//!
//! A failed publish never touches the local ledger.
//!
//! Publishers:
//! - [`RedisStreamPublisher`]: `XADD {stream} MAXLEN ~ {max_len} * request_id … payload …`
//! - [`LogPublisher`]: logs the message; used when no Redis URL is configured

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::SettlementConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingMessage {
    pub user_id: String,
    pub org_id: String,
    /// Idempotency key.
    pub request_id: String,
    pub endpoint_id: i64,
    pub worker_id: String,
    /// Micro-units.
    pub amount: i64,
    pub duration_sec: i64,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait SettlementPublisher: Send + Sync {
    async fn publish(&self, message: &BillingMessage) -> Result<()>;
}

pub struct LogPublisher;

#[async_trait]
impl SettlementPublisher for LogPublisher {
    async fn publish(&self, message: &BillingMessage) -> Result<()> {
        info!(
            request_id = %message.request_id,
            org_id = %message.org_id,
            worker_id = %message.worker_id,
            amount = message.amount,
            duration_sec = message.duration_sec,
            "settlement message (no broker configured)"
        );
        Ok(())
    }
}

pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    stream: String,
    max_len: usize,
}

impl RedisStreamPublisher {
    pub async fn connect(redis_url: &str, stream: &str, max_len: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        info!(stream, "settlement stream publisher connected");
        Ok(RedisStreamPublisher {
            conn,
            stream: stream.to_string(),
            max_len,
        })
    }
}

#[async_trait]
impl SettlementPublisher for RedisStreamPublisher {
    async fn publish(&self, message: &BillingMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[
                    ("request_id", message.request_id.as_str()),
                    ("org_id", message.org_id.as_str()),
                    ("payload", payload.as_str()),
                ],
            )
            .await
            .with_context(|| format!("XADD {} failed", self.stream))?;
        Ok(())
    }
}

/// Redis stream publisher when `redis_url` is set, log-only otherwise.
pub async fn from_config(config: &SettlementConfig) -> Result<Arc<dyn SettlementPublisher>> {
    match config.redis_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Ok(Arc::new(
            RedisStreamPublisher::connect(url, &config.stream, config.max_len).await?,
        )),
        None => Ok(Arc::new(LogPublisher)),
    }
}
