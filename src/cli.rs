//! # CLI Execution Functions
//!
//! Execution logic for each subcommand, kept out of `main.rs`. Every
//! subcommand builds only the components it needs from [`Config`].

use anyhow::Result;
use fleetmeter::api::{self, AppState};
use fleetmeter::balance::{BalanceAuthority, HttpBalanceAuthority};
use fleetmeter::cluster_client::ClientRegistry;
use fleetmeter::config::Config;
use fleetmeter::db::Database;
use fleetmeter::endpoint_sync::EndpointSync;
use fleetmeter::health::HealthMonitor;
use fleetmeter::jobs::JobRunner;
use fleetmeter::lifecycle::{EndpointManager, EndpointScaler};
use fleetmeter::metering::{MeteringEngine, MeteringSettings, MeteringTrigger};
use fleetmeter::prom_metrics::Metrics;
use fleetmeter::reconciler::WorkerReconciler;
use fleetmeter::store::FleetStore;
use fleetmeter::{scheduler, settlement};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::Cli;

const TRIGGER_QUEUE: usize = 256;

pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.config)?;
    if let Some(url) = cli.database_url.as_deref().filter(|u| !u.is_empty()) {
        config.database.url = Some(url.to_string());
    }
    Ok(config)
}

/// Components shared by every subcommand that touches clusters.
struct Core {
    store: Arc<dyn FleetStore>,
    metrics: Arc<Metrics>,
    clients: Arc<ClientRegistry>,
    manager: Arc<EndpointManager>,
}

impl Core {
    async fn connect(config: &Config) -> Result<Self> {
        let database =
            Database::connect(config.database_url()?, config.database.max_connections).await?;
        let store: Arc<dyn FleetStore> = Arc::new(database.clone());
        let metrics = Arc::new(Metrics::new());
        let clients = Arc::new(ClientRegistry::http(Duration::from_secs(
            config.remote.timeout_secs,
        ))?);
        let manager = Arc::new(EndpointManager::new(
            store.clone(),
            clients.clone(),
            metrics.clone(),
        ));
        Ok(Core {
            store,
            metrics,
            clients,
            manager,
        })
    }

    fn reconciler(&self) -> WorkerReconciler {
        WorkerReconciler::new(self.store.clone(), self.clients.clone(), self.metrics.clone())
    }

    fn endpoint_sync(&self) -> EndpointSync {
        EndpointSync::new(self.store.clone(), self.clients.clone(), self.metrics.clone())
    }

    fn health(&self, config: &Config) -> HealthMonitor {
        HealthMonitor::new(
            self.store.clone(),
            self.metrics.clone(),
            Duration::from_secs(config.health.offline_timeout_secs),
        )
    }

    async fn metering(&self, config: &Config) -> Result<MeteringEngine> {
        let publisher = settlement::from_config(&config.settlement).await?;
        let balance = HttpBalanceAuthority::from_config(&config.balance)?
            .map(|b| Arc::new(b) as Arc<dyn BalanceAuthority>);
        if balance.is_none() {
            warn!("no balance authority configured, negative balances will not stop endpoints");
        }
        let scaler: Arc<dyn EndpointScaler> = self.manager.clone();
        Ok(MeteringEngine::new(
            self.store.clone(),
            scaler,
            balance,
            publisher,
            self.metrics.clone(),
            MeteringSettings::from(&config.billing),
        ))
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── serve ───────────────────────────────────────────────────────

pub async fn run_serve(config: Config, port: Option<u16>) -> Result<()> {
    let core = Core::connect(&config).await?;
    let port = port.unwrap_or(config.server.port);
    info!(port, "fleetmeter starting");

    let reconciler = core.reconciler();
    let endpoint_sync = core.endpoint_sync();
    let health = core.health(&config);
    let engine = Arc::new(core.metering(&config).await?);
    let (trigger, trigger_rx) = MeteringTrigger::channel(TRIGGER_QUEUE);

    let mut runner = JobRunner::new();

    let r = reconciler.clone();
    runner.spawn_periodic_immediate(
        "reconciler",
        Duration::from_secs(config.reconciler.interval_secs),
        move || {
            let r = r.clone();
            async move {
                if let Err(e) = r.run_pass().await {
                    warn!(error = %e, "reconciliation pass failed");
                }
            }
        },
    );

    if config.endpoint_sync.enabled {
        let s = endpoint_sync.clone();
        runner.spawn_periodic(
            "endpoint_sync",
            Duration::from_secs(config.endpoint_sync.interval_secs),
            move || {
                let s = s.clone();
                async move {
                    if let Err(e) = s.run_pass().await {
                        warn!(error = %e, "endpoint sync pass failed");
                    }
                }
            },
        );
    }

    runner.spawn_periodic(
        "health",
        Duration::from_secs(config.health.interval_secs),
        move || {
            let h = health.clone();
            async move {
                if let Err(e) = h.sweep(chrono::Utc::now()).await {
                    warn!(error = %e, "cluster health sweep failed");
                }
            }
        },
    );

    if config.billing.enabled {
        let cancel = runner.token();
        runner.spawn(
            "metering",
            engine.run(
                Duration::from_secs(config.billing.interval_secs),
                trigger_rx,
                cancel,
            ),
        );
    } else {
        warn!("billing disabled, worker uptime is not being metered");
        drop(trigger_rx);
    }
    info!(jobs = runner.len(), "background jobs started");

    let state = Arc::new(AppState {
        store: core.store.clone(),
        manager: core.manager.clone(),
        reconciler,
        endpoint_sync,
        metering: trigger,
        prom_metrics: core.metrics.clone(),
    });

    let served = api::serve(state, port, api::shutdown_signal()).await;
    runner.shutdown(config.shutdown_timeout()).await;
    served
}

// ── one-shot commands ───────────────────────────────────────────

pub async fn run_migrate(config: &Config) -> Result<()> {
    let database =
        Database::connect(config.database_url()?, config.database.max_connections).await?;
    database.migrate().await?;
    info!("schema applied");
    Ok(())
}

pub async fn run_select_cluster(config: &Config, spec: &str, region: &str) -> Result<()> {
    let core = Core::connect(config).await?;
    let selection = scheduler::select_cluster(core.store.as_ref(), spec, region).await?;
    info!(
        cluster_id = %selection.candidate.cluster.cluster_id,
        score = selection.candidate.score,
        "cluster selected"
    );
    print_json(&selection)
}

pub async fn run_reconcile(config: &Config) -> Result<()> {
    let core = Core::connect(config).await?;
    let summary = core.reconciler().run_pass().await?;
    print_json(&summary)
}

pub async fn run_bill(config: &Config, worker_id: Option<&str>) -> Result<()> {
    let core = Core::connect(config).await?;
    let engine = core.metering(config).await?;
    match worker_id {
        Some(id) => print_json(&engine.bill_worker_id(id).await?),
        None => print_json(&engine.run_cycle().await?),
    }
}

pub async fn run_sweep_clusters(config: &Config) -> Result<()> {
    let core = Core::connect(config).await?;
    let offline = core.health(config).sweep(chrono::Utc::now()).await?;
    print_json(&serde_json::json!({ "marked_offline": offline }))
}
