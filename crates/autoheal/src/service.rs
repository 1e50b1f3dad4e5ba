//! Service orchestration.
//!
//! [`Service::run`] wires the shared state together and runs the background tasks
//! until the cancellation token fires:
//! - the rules worker, applying rule changes to the store
//! - the alerts worker, feeding alerts to the engine
//! - the active jobs poller
//! - the configuration watcher, when reloading is enabled
//! - the HTTP server

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::active_jobs::{ActiveJobPoller, ActiveJobs};
use crate::alert::Alert;
use crate::config::{Config, ConfigLoader, ConfigWatcher, DEFAULT_CONFIG_RELOAD_INTERVAL};
use crate::engine::Engine;
use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::queue::WorkQueue;
use crate::rules::{RuleChange, RuleStore};
use crate::runner::{BatchJobCreator, Disabled, JobLauncher, JobStatusQuerier};
use crate::server::{run_server, ServerState, DEFAULT_LISTEN_ADDR};

/// Runtime settings that aren't part of the configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub listen: SocketAddr,
    pub throttle_interval: Duration,
    pub job_status_interval: Duration,
    /// Interval between configuration reloads; zero disables reloading
    pub config_reload_interval: Duration,
}

impl ServiceOptions {
    /// Options taking their intervals from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9099))),
            throttle_interval: config.throttling.interval,
            job_status_interval: config.awx.job_status_check_interval,
            config_reload_interval: DEFAULT_CONFIG_RELOAD_INTERVAL,
        }
    }
}

/// Backends used to run actions.
#[derive(Clone)]
pub struct Runners {
    pub launcher: Arc<dyn JobLauncher>,
    pub querier: Arc<dyn JobStatusQuerier>,
    pub creator: Arc<dyn BatchJobCreator>,
}

impl Runners {
    /// Runners that refuse every action.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            launcher: Arc::new(Disabled("AWX")),
            querier: Arc::new(Disabled("AWX")),
            creator: Arc::new(Disabled("Kubernetes")),
        }
    }
}

/// The autoheal service.
pub struct Service {
    config: Config,
    loader: ConfigLoader,
    options: ServiceOptions,
    runners: Runners,
    metrics: Arc<PrometheusMetrics>,
}

impl Service {
    #[must_use]
    pub fn new(config: Config, loader: ConfigLoader, options: ServiceOptions, runners: Runners) -> Self {
        Self {
            config,
            loader,
            options,
            runners,
            metrics: Arc::new(PrometheusMetrics::new()),
        }
    }

    /// Run until `cancel` fires or the HTTP server fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            config,
            loader,
            options,
            runners,
            metrics,
        } = self;
        let sink: Arc<dyn MetricsSink> = Arc::clone(&metrics) as Arc<dyn MetricsSink>;

        let rules = Arc::new(RuleStore::new());
        let active_jobs = Arc::new(ActiveJobs::new());
        let rule_changes: WorkQueue<RuleChange> = WorkQueue::new();
        let alerts: WorkQueue<Alert> = WorkQueue::new();

        for rule in &config.rules {
            rule_changes.add(RuleChange::added(rule.clone()));
        }
        info!(
            rules = config.rules.len(),
            throttle_secs = options.throttle_interval.as_secs(),
            "Starting autoheal service"
        );

        let engine = Arc::new(Engine::new(
            Arc::clone(&rules),
            options.throttle_interval,
            Arc::clone(&runners.launcher),
            Arc::clone(&runners.creator),
            Arc::clone(&active_jobs),
            Arc::clone(&sink),
        ));

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(run_rules_worker(rule_changes.clone(), Arc::clone(&rules))),
            tokio::spawn(run_alerts_worker(alerts.clone(), engine)),
        ];

        let poller = ActiveJobPoller::new(
            Arc::clone(&active_jobs),
            Arc::clone(&runners.querier),
            Arc::clone(&sink),
            options.job_status_interval,
        );
        tasks.push(tokio::spawn(poller.run(cancel.clone())));

        if options.config_reload_interval.is_zero() {
            debug!("Configuration reloading is disabled");
        } else {
            let watcher = ConfigWatcher::new(
                loader,
                options.config_reload_interval,
                rule_changes.clone(),
                &config.rules,
            );
            tasks.push(tokio::spawn(watcher.run(cancel.clone())));
        }

        let state = Arc::new(ServerState {
            alerts: alerts.clone(),
            metrics,
        });
        let result = run_server(state, options.listen, cancel.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "HTTP server stopped with an error, shutting down");
        }

        // Stop everything else and let the workers drain their queues
        cancel.cancel();
        alerts.shut_down();
        rule_changes.shut_down();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }

        info!("Autoheal service stopped");
        result
    }
}

/// Apply rule changes to the store until the queue is shut down.
pub async fn run_rules_worker(queue: WorkQueue<RuleChange>, rules: Arc<RuleStore>) {
    debug!("Rules worker started");
    while let Some(queued) = queue.get().await {
        rules.apply(queued.item).await;
    }
    debug!("Rules worker stopped");
}

/// Process alerts until the queue is shut down. Alerts whose processing fails are
/// requeued with backoff.
pub async fn run_alerts_worker(queue: WorkQueue<Alert>, engine: Arc<Engine>) {
    debug!("Alerts worker started");
    while let Some(queued) = queue.get().await {
        match engine.process_alert(&queued.item).await {
            Ok(report) => {
                debug!(
                    alert = %report.alert,
                    activated = report.rules.len(),
                    dispatched = report.dispatched(),
                    "Alert processed"
                );
            }
            Err(e) => {
                error!(
                    alert = %queued.item.name(),
                    attempts = queued.attempts(),
                    error = %e,
                    "Failed to process alert, requeuing"
                );
                queue.requeue(queued);
            }
        }
    }
    debug!("Alerts worker stopped");
}
