//! # Metering Engine: Worker Uptime → Ledger Rows
//!
//! Each cycle walks every worker with `billing_status = active` and a
//! `pod_started_at`, and charges the slice since its billing cursor:
//!
//! ```text
//! start = last_billed_at (pod_started_at if never billed)
//! end   = pod_terminated_at                 terminated
//!       | last_heartbeat or now, if OFFLINE  terminated
//!       | now                                running
//! ```
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | `end < start` | skip, logged as a clock anomaly |
//! | running and slice < `min_billing_secs` | skip, cursor unchanged |
//! | terminated and slice = 0 | `final_billed`, no ledger row |
//! | `price · secs / 3600 ≤ 0` | skip |
//! | otherwise | ledger row + cursor advance (+ `final_billed` if terminated) in one transaction |
//!
//! After the transaction commits, a settlement message is published (best
//! effort) and, for running workers, the tenant balance is checked; a
//! negative balance scales the endpoint to zero through [`EndpointScaler`].
//!
//! Every worker is isolated: an error aborts that worker's cycle only.
//! The cycle also runs on demand for single workers reported terminated
//! through [`MeteringTrigger`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balance::BalanceAuthority;
use crate::config::BillingConfig;
use crate::db::{
    ChargeOutcome, EndpointRow, LedgerCharge, NewBillingTransaction, WorkerRow,
};
use crate::lifecycle::EndpointScaler;
use crate::prom_metrics::Metrics;
use crate::settlement::{BillingMessage, SettlementPublisher};
use crate::store::FleetStore;

const SECONDS_PER_HOUR: i128 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotBillable,
    ClockAnomaly,
    BelowMinimum,
    ZeroDuration,
    ZeroAmount,
    Superseded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotBillable => "not_billable",
            SkipReason::ClockAnomaly => "clock_anomaly",
            SkipReason::BelowMinimum => "below_minimum",
            SkipReason::ZeroDuration => "zero_duration",
            SkipReason::ZeroAmount => "zero_amount",
            SkipReason::Superseded => "superseded",
        }
    }
}

/// A billable slice `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
    pub terminated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePlan {
    Skip(SkipReason),
    /// Terminated with nothing left to charge.
    Finalize,
    Charge(Slice),
}

/// Decide what a cycle does with `worker` at `now`. Pure; the price is
/// applied separately by [`compute_amount`].
pub fn plan_charge(worker: &WorkerRow, now: DateTime<Utc>, min_billing_secs: i64) -> ChargePlan {
    if !worker.is_billable() {
        return ChargePlan::Skip(SkipReason::NotBillable);
    }
    let Some(start) = worker.last_billed_at.or(worker.pod_started_at) else {
        return ChargePlan::Skip(SkipReason::NotBillable);
    };

    let (end, terminated) = match worker.pod_terminated_at {
        Some(t) => (t, true),
        None if worker.is_offline() => (worker.last_heartbeat.unwrap_or(now), true),
        None => (now, false),
    };

    if end < start {
        return ChargePlan::Skip(SkipReason::ClockAnomaly);
    }

    let duration_secs = (end - start).num_seconds();
    if !terminated && duration_secs < min_billing_secs {
        return ChargePlan::Skip(SkipReason::BelowMinimum);
    }
    if duration_secs <= 0 {
        return if terminated {
            ChargePlan::Finalize
        } else {
            ChargePlan::Skip(SkipReason::ZeroDuration)
        };
    }

    // Whole seconds only; the sub-second remainder stays in the next slice.
    ChargePlan::Charge(Slice {
        start,
        end: start + chrono::Duration::seconds(duration_secs),
        duration_secs,
        terminated,
    })
}

/// `price_per_hour · seconds / 3600`, truncated, in micro-units.
pub fn compute_amount(price_per_hour: i64, duration_secs: i64) -> i64 {
    let amount = i128::from(price_per_hour) * i128::from(duration_secs) / SECONDS_PER_HOUR;
    i64::try_from(amount).unwrap_or(if amount < 0 { i64::MIN } else { i64::MAX })
}

/// Settlement idempotency key: `"{prefix}-{worker_id}-{unix_start}"`.
pub fn idempotency_key(prefix: &str, worker_id: &str, start: DateTime<Utc>) -> String {
    format!("{prefix}-{worker_id}-{}", start.timestamp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Skipped { reason: SkipReason },
    Finalized,
    Charged {
        transaction_id: i64,
        amount: i64,
        duration_secs: i64,
        terminated: bool,
        scaled_down: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub workers: usize,
    pub charged: usize,
    pub finalized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub amount: i64,
    pub seconds: i64,
    pub scaled_down: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: &WorkerOutcome) {
        match outcome {
            WorkerOutcome::Skipped { .. } => self.skipped += 1,
            WorkerOutcome::Finalized => self.finalized += 1,
            WorkerOutcome::Charged {
                amount,
                duration_secs,
                scaled_down,
                ..
            } => {
                self.charged += 1;
                self.amount = self.amount.saturating_add(*amount);
                self.seconds += duration_secs;
                if *scaled_down {
                    self.scaled_down += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeteringSettings {
    pub min_billing_secs: i64,
    pub idempotency_prefix: String,
    pub service_tag: String,
}

impl From<&BillingConfig> for MeteringSettings {
    fn from(config: &BillingConfig) -> Self {
        MeteringSettings {
            min_billing_secs: config.min_billing_secs,
            idempotency_prefix: config.idempotency_prefix.clone(),
            service_tag: config.service_tag.clone(),
        }
    }
}

impl Default for MeteringSettings {
    fn default() -> Self {
        Self::from(&BillingConfig::default())
    }
}

/// Sender half of the on-demand billing channel.
#[derive(Clone)]
pub struct MeteringTrigger {
    tx: mpsc::Sender<String>,
}

impl MeteringTrigger {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (MeteringTrigger { tx }, rx)
    }

    /// Queue `worker_id` for immediate metering. Returns false when the
    /// queue is full or the engine has stopped; the next periodic cycle
    /// still picks the worker up.
    pub fn request(&self, worker_id: &str) -> bool {
        self.tx.try_send(worker_id.to_string()).is_ok()
    }
}

pub struct MeteringEngine {
    store: Arc<dyn FleetStore>,
    scaler: Arc<dyn EndpointScaler>,
    balance: Option<Arc<dyn BalanceAuthority>>,
    publisher: Arc<dyn SettlementPublisher>,
    metrics: Arc<Metrics>,
    settings: MeteringSettings,
}

impl MeteringEngine {
    pub fn new(
        store: Arc<dyn FleetStore>,
        scaler: Arc<dyn EndpointScaler>,
        balance: Option<Arc<dyn BalanceAuthority>>,
        publisher: Arc<dyn SettlementPublisher>,
        metrics: Arc<Metrics>,
        settings: MeteringSettings,
    ) -> Self {
        MeteringEngine {
            store,
            scaler,
            balance,
            publisher,
            metrics,
            settings,
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let workers = self
            .store
            .list_billable_workers()
            .await
            .context("listing billable workers")?;
        let now = Utc::now();
        let mut summary = CycleSummary {
            workers: workers.len(),
            ..Default::default()
        };

        for worker in &workers {
            match self.bill_worker(worker, now).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    summary.failed += 1;
                    warn!(worker_id = %worker.worker_id, error = %e, "billing aborted for worker");
                }
            }
        }

        self.metrics.billing_cycles.inc();
        info!(
            workers = summary.workers,
            charged = summary.charged,
            finalized = summary.finalized,
            skipped = summary.skipped,
            failed = summary.failed,
            amount = summary.amount,
            "billing cycle complete"
        );
        Ok(summary)
    }

    /// Bill one worker by id, reloading its row first.
    pub async fn bill_worker_id(&self, worker_id: &str) -> Result<WorkerOutcome> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .with_context(|| format!("worker {worker_id} not found"))?;
        self.bill_worker(&worker, Utc::now()).await
    }

    pub async fn bill_worker(&self, worker: &WorkerRow, now: DateTime<Utc>) -> Result<WorkerOutcome> {
        let slice = match plan_charge(worker, now, self.settings.min_billing_secs) {
            ChargePlan::Skip(reason) => return Ok(self.skip(worker, reason)),
            ChargePlan::Finalize => {
                if self.store.finalize_worker(&worker.worker_id).await? {
                    self.metrics.workers_finalized.inc();
                    info!(worker_id = %worker.worker_id, "worker closed out with nothing owed");
                }
                return Ok(WorkerOutcome::Finalized);
            }
            ChargePlan::Charge(slice) => slice,
        };

        let endpoint = self
            .store
            .get_endpoint(worker.endpoint_id)
            .await?
            .with_context(|| format!("endpoint {} of worker {} not found", worker.endpoint_id, worker.worker_id))?;

        let amount = compute_amount(endpoint.price_per_hour, slice.duration_secs);
        if amount <= 0 {
            return Ok(self.skip(worker, SkipReason::ZeroAmount));
        }

        let charge = LedgerCharge {
            transaction: NewBillingTransaction {
                user_id: worker.user_id.clone(),
                org_id: endpoint.org_id.clone(),
                endpoint_id: worker.endpoint_id,
                cluster_id: worker.cluster_id.clone(),
                worker_id: worker.worker_id.clone(),
                gpu_type: endpoint.gpu_type.clone(),
                gpu_count: endpoint.gpu_count,
                billing_period_start: slice.start,
                billing_period_end: slice.end,
                duration_seconds: slice.duration_secs,
                price_per_hour: endpoint.price_per_hour,
                amount,
            },
            expected_last_billed_at: worker.last_billed_at,
            finalize: slice.terminated,
        };

        let transaction_id = match self.store.record_charge(&charge).await? {
            ChargeOutcome::Recorded { transaction_id } => transaction_id,
            ChargeOutcome::Superseded => return Ok(self.skip(worker, SkipReason::Superseded)),
        };

        self.metrics.billing_charges.inc();
        self.metrics.billed_amount_micros.inc_by(amount.unsigned_abs());
        self.metrics.billed_seconds.inc_by(slice.duration_secs.unsigned_abs());
        if slice.terminated {
            self.metrics.workers_finalized.inc();
        }
        info!(
            worker_id = %worker.worker_id,
            transaction_id,
            amount,
            duration_secs = slice.duration_secs,
            terminated = slice.terminated,
            "worker billed"
        );

        self.publish(worker, &endpoint, &slice, amount).await;

        let scaled_down = if slice.terminated {
            false
        } else {
            self.enforce_balance(&endpoint).await
        };

        Ok(WorkerOutcome::Charged {
            transaction_id,
            amount,
            duration_secs: slice.duration_secs,
            terminated: slice.terminated,
            scaled_down,
        })
    }

    fn skip(&self, worker: &WorkerRow, reason: SkipReason) -> WorkerOutcome {
        self.metrics.billing_skip(reason.as_str());
        match reason {
            SkipReason::ClockAnomaly => warn!(
                worker_id = %worker.worker_id,
                last_billed_at = ?worker.last_billed_at,
                pod_terminated_at = ?worker.pod_terminated_at,
                last_heartbeat = ?worker.last_heartbeat,
                "billing end precedes start, skipped"
            ),
            SkipReason::Superseded => info!(
                worker_id = %worker.worker_id,
                "billing cursor moved concurrently, slice skipped"
            ),
            _ => debug!(worker_id = %worker.worker_id, reason = reason.as_str(), "billing skipped"),
        }
        WorkerOutcome::Skipped { reason }
    }

    async fn publish(&self, worker: &WorkerRow, endpoint: &EndpointRow, slice: &Slice, amount: i64) {
        let message = BillingMessage {
            user_id: worker.user_id.clone(),
            org_id: endpoint.org_id.clone(),
            request_id: idempotency_key(
                &self.settings.idempotency_prefix,
                &worker.worker_id,
                slice.start,
            ),
            endpoint_id: worker.endpoint_id,
            worker_id: worker.worker_id.clone(),
            amount,
            duration_sec: slice.duration_secs,
            service: self.settings.service_tag.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.publisher.publish(&message).await {
            self.metrics.settlement_publish_failures.inc();
            error!(
                request_id = %message.request_id,
                worker_id = %worker.worker_id,
                error = %e,
                "settlement publish failed, ledger row kept"
            );
        }
    }

    /// Scale the endpoint to zero when its organization's balance is
    /// negative. Returns true if a scale-down was issued.
    async fn enforce_balance(&self, endpoint: &EndpointRow) -> bool {
        let Some(authority) = &self.balance else {
            return false;
        };
        let balance = match authority.total_available(&endpoint.org_id).await {
            Ok(b) => b,
            Err(e) => {
                self.metrics.balance_check_failures.inc();
                warn!(org_id = %endpoint.org_id, error = %e, "balance check failed");
                return false;
            }
        };
        if balance >= 0 {
            return false;
        }

        warn!(
            org_id = %endpoint.org_id,
            endpoint_id = endpoint.id,
            balance,
            "balance negative, scaling endpoint to zero"
        );
        match self.scaler.scale_endpoint(endpoint, 0).await {
            Ok(()) => {
                self.metrics.forced_scale_downs.inc();
                true
            }
            Err(e) => {
                error!(endpoint_id = endpoint.id, error = %e, "forced scale-down failed");
                false
            }
        }
    }

    /// Periodic cycles plus on-demand single-worker billing until `cancel`.
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        mut triggers: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first cycle runs one period in.
        ticker.tick().await;
        info!(period_secs = period.as_secs(), "metering engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "billing cycle failed");
                    }
                }
                Some(worker_id) = triggers.recv() => {
                    match self.bill_worker_id(&worker_id).await {
                        Ok(outcome) => debug!(worker_id = %worker_id, ?outcome, "on-demand billing"),
                        Err(e) => warn!(worker_id = %worker_id, error = %e, "on-demand billing failed"),
                    }
                }
            }
        }
        info!("metering engine stopped");
    }
}
