//! # fleetmeter
//!
//! Control plane for tenant endpoints leased on a fleet of remote execution
//! clusters. It places endpoints on clusters, mirrors the workers the
//! clusters run, and meters their uptime into an append-only ledger.
//!
//! | Loop | Module | Default period |
//! |------|--------|----------------|
//! | Worker reconciliation | [`reconciler`] | 10s |
//! | Endpoint state sync | [`endpoint_sync`] | 10s |
//! | Metering | [`metering`] | 60s |
//! | Cluster health sweep | [`health`] | 60s |
//!
//! Request-path operations ([`scheduler`], [`lifecycle`]) are exposed over
//! HTTP by [`api`] and return [`error::FleetError`]. Everything reads and
//! writes through the [`store::FleetStore`] contract, implemented for
//! PostgreSQL by [`db::Database`].

pub mod api;
pub mod balance;
pub mod cluster_client;
pub mod config;
pub mod db;
pub mod endpoint_sync;
pub mod error;
pub mod health;
pub mod jobs;
pub mod lifecycle;
pub mod metering;
pub mod prom_metrics;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod settlement;
pub mod store;
